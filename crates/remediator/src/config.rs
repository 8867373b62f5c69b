//! Remediator configuration
//!
//! Loaded from an optional file (TOML/YAML/JSON, chosen by extension) layered
//! under `REMEDIATOR_*` environment variables, where `__` separates nested
//! keys: `REMEDIATOR_POLICY__CPU_THRESHOLD=85`.

use anyhow::{bail, Context, Result};
use remediator_lib::{
    orchestrator::LoopConfig,
    policy::Thresholds,
    provider::{GatewayConfig, IncidentTemplate, TicketingConfig},
    recorder::{
        PendingConfig, PendingIncidents, RecorderConfig, DEFAULT_MAX_PENDING,
        DEFAULT_PENDING_BATCH,
    },
    retry::RetryPolicy,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

const ENV_PREFIX: &str = "REMEDIATOR";

/// Remediator configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RemediatorConfig {
    /// Name attached to every structured log event
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// Port for the health/metrics server
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default, rename = "loop")]
    pub polling: PollingSection,
    #[serde(default)]
    pub policy: PolicySection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub timeouts: TimeoutSection,
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub ticketing: TicketingSection,
    #[serde(default)]
    pub pending: PendingSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollingSection {
    pub interval_secs: u64,
    pub concurrency: usize,
    pub degraded_interval_secs: u64,
    pub degraded_after_failures: u32,
}

impl Default for PollingSection {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            concurrency: 5,
            degraded_interval_secs: 300,
            degraded_after_failures: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PolicySection {
    pub cpu_threshold: f64,
    pub memory_threshold: f64,
    pub cooldown_secs: u64,
}

impl Default for PolicySection {
    fn default() -> Self {
        Self {
            cpu_threshold: 90.0,
            memory_threshold: 90.0,
            cooldown_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 10_000,
        }
    }
}

/// Per-call timeouts, in seconds
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutSection {
    pub inventory_secs: u64,
    pub metrics_secs: u64,
    pub action_secs: u64,
    pub record_secs: u64,
}

impl Default for TimeoutSection {
    fn default() -> Self {
        Self {
            inventory_secs: 30,
            metrics_secs: 15,
            action_secs: 30,
            record_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GatewaySection {
    pub base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TicketingSection {
    pub base_url: String,
    pub api_version: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub template: IncidentTemplate,
}

impl Default for TicketingSection {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_version: "now".to_string(),
            username: None,
            password: None,
            template: IncidentTemplate::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PendingSection {
    /// Where queued incidents survive a restart; in-memory only when unset
    pub path: Option<PathBuf>,
    pub max_entries: usize,
    /// Queued incidents retried per cycle
    pub batch_size: usize,
}

impl Default for PendingSection {
    fn default() -> Self {
        Self {
            path: None,
            max_entries: DEFAULT_MAX_PENDING,
            batch_size: DEFAULT_PENDING_BATCH,
        }
    }
}

fn default_node_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "fleet-remediator".to_string())
}

fn default_api_port() -> u16 {
    8080
}

impl RemediatorConfig {
    /// Load and validate configuration from the optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_from(path, None)
    }

    /// Like [`load`](Self::load), with an explicit environment map instead of
    /// the process environment
    pub fn load_from(path: Option<&Path>, env: Option<config::Map<String, String>>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .source(env),
        );

        let config: Self = builder
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the remediator cannot safely run with
    pub fn validate(&self) -> Result<()> {
        check_url("gateway.base_url", &self.gateway.base_url)?;
        check_url("ticketing.base_url", &self.ticketing.base_url)?;

        for (name, value) in [
            ("policy.cpu_threshold", self.policy.cpu_threshold),
            ("policy.memory_threshold", self.policy.memory_threshold),
        ] {
            if !(value > 0.0 && value <= 100.0) {
                bail!("{} must be in (0, 100], got {}", name, value);
            }
        }

        if self.polling.interval_secs == 0 {
            bail!("loop.interval_secs must be greater than zero");
        }
        if self.polling.concurrency == 0 {
            bail!("loop.concurrency must be greater than zero");
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be greater than zero");
        }
        if self.pending.max_entries == 0 || self.pending.batch_size == 0 {
            bail!("pending.max_entries and pending.batch_size must be greater than zero");
        }
        if self.policy.cooldown_secs < self.polling.interval_secs {
            bail!(
                "policy.cooldown_secs ({}) must not be shorter than loop.interval_secs ({})",
                self.policy.cooldown_secs,
                self.polling.interval_secs
            );
        }
        if self.ticketing.api_version.trim().is_empty() {
            bail!("ticketing.api_version must not be empty");
        }

        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.polling.interval_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.policy.cooldown_secs)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.action_secs)
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            cpu_percent: self.policy.cpu_threshold,
            memory_percent: self.policy.memory_threshold,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_attempts,
            Duration::from_millis(self.retry.base_delay_ms),
            Duration::from_millis(self.retry.max_delay_ms),
        )
    }

    pub fn loop_config(&self) -> LoopConfig {
        LoopConfig {
            interval: self.interval(),
            concurrency: self.polling.concurrency,
            degraded_interval: Duration::from_secs(self.polling.degraded_interval_secs),
            degraded_after_failures: self.polling.degraded_after_failures,
            inventory_timeout: Duration::from_secs(self.timeouts.inventory_secs),
            metrics_timeout: Duration::from_secs(self.timeouts.metrics_secs),
        }
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            base_url: self.gateway.base_url.clone(),
            // The gateway client's own timeout backs up the per-call ones
            request_timeout: Duration::from_secs(
                self.timeouts
                    .inventory_secs
                    .max(self.timeouts.metrics_secs)
                    .max(self.timeouts.action_secs),
            ),
        }
    }

    pub fn ticketing_config(&self) -> TicketingConfig {
        TicketingConfig {
            base_url: self.ticketing.base_url.clone(),
            api_version: self.ticketing.api_version.clone(),
            username: self.ticketing.username.clone(),
            password: self.ticketing.password.clone(),
            request_timeout: Duration::from_secs(self.timeouts.record_secs),
            template: self.ticketing.template.clone(),
        }
    }

    /// Dedup covers the cooldown window; keys are bucketed by the polling interval
    pub fn recorder_config(&self) -> RecorderConfig {
        RecorderConfig {
            retry: self.retry_policy(),
            call_timeout: Duration::from_secs(self.timeouts.record_secs),
            dedup_window: self.cooldown(),
            key_bucket: self.interval(),
            pending_batch: self.pending.batch_size,
        }
    }

    /// Pending queue, reloaded from disk when a path is configured
    pub fn pending_incidents(&self) -> PendingIncidents {
        match self.pending.path {
            Some(ref path) => PendingIncidents::with_persistence(path.clone(), self.pending.max_entries),
            None => PendingIncidents::new(PendingConfig {
                max_entries: self.pending.max_entries,
                persistence_path: None,
            }),
        }
    }
}

fn check_url(name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        bail!("{} is required", name);
    }
    let url = Url::parse(value).with_context(|| format!("{} is not a valid URL: {}", name, value))?;
    if !matches!(url.scheme(), "http" | "https") {
        bail!("{} must use http or https, got {}", name, url.scheme());
    }
    Ok(())
}
