//! Remediation control loop
//!
//! Each cycle retries a batch of queued incidents, fetches the inventory, and fans the
//! running instances out over a bounded number of concurrent pipelines
//! (metrics → decide → restart → record). Between cycles the loop sleeps for
//! the polling interval, or the degraded interval after repeated inventory
//! failures. The sleep, the pending retry pass and in-flight metrics fetches
//! are interrupted by the cancellation token; a dispatched restart always runs through to its
//! incident recording.

use super::report::{CycleReport, InstanceOutcome, Stage};
use crate::error::{CycleError, InventoryError, MetricsError};
use crate::executor::ActionExecutor;
use crate::health::{components, HealthRegistry};
use crate::models::{
    ActionResult, Instance, IncidentRequest, RemediationDecision, RemediationEvent,
    UtilizationSample,
};
use crate::observability::{RemediatorMetrics, StructuredLogger};
use crate::policy::{Evaluation, RemediationPolicy};
use crate::provider::{InventorySource, MetricsSource};
use crate::recorder::IncidentRecorder;
use anyhow::Result;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Configuration for the control loop
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Polling interval (default: 60 seconds)
    pub interval: Duration,
    /// Maximum number of instance pipelines in flight (default: 5)
    pub concurrency: usize,
    /// Polling interval after repeated inventory failures (default: 300 seconds)
    pub degraded_interval: Duration,
    /// Consecutive failed cycles before switching to the degraded interval
    pub degraded_after_failures: u32,
    pub inventory_timeout: Duration,
    pub metrics_timeout: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            concurrency: 5,
            degraded_interval: Duration::from_secs(300),
            degraded_after_failures: 3,
            inventory_timeout: Duration::from_secs(30),
            metrics_timeout: Duration::from_secs(15),
        }
    }
}

/// The monitor → decide → act → record loop
pub struct ControlLoop {
    inventory: Arc<dyn InventorySource>,
    metrics: Arc<dyn MetricsSource>,
    policy: Arc<RemediationPolicy>,
    executor: Arc<ActionExecutor>,
    recorder: Arc<IncidentRecorder>,
    health: HealthRegistry,
    config: LoopConfig,
    logger: StructuredLogger,
    prometheus: RemediatorMetrics,
    cycles: AtomicU64,
    consecutive_failures: u32,
}

impl ControlLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        inventory: Arc<dyn InventorySource>,
        metrics: Arc<dyn MetricsSource>,
        policy: Arc<RemediationPolicy>,
        executor: Arc<ActionExecutor>,
        recorder: Arc<IncidentRecorder>,
        health: HealthRegistry,
        config: LoopConfig,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            inventory,
            metrics,
            policy,
            executor,
            recorder,
            health,
            config,
            logger,
            prometheus: RemediatorMetrics::new(),
            cycles: AtomicU64::new(0),
            consecutive_failures: 0,
        }
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    /// Run cycles until `cancel` fires
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            concurrency = self.config.concurrency,
            "Starting remediation loop"
        );

        loop {
            match self.run_cycle(&cancel).await {
                Ok(_) => self.note_cycle_result(true),
                Err(CycleError::Cancelled) => break,
                Err(_) => self.note_cycle_result(false),
            }

            if cancel.is_cancelled() {
                break;
            }

            let pause = self.current_interval();
            debug!(sleep_secs = pause.as_secs(), "Waiting for next cycle");

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = cancel.cancelled() => break,
            }
        }

        self.health.set_ready(false).await;
        self.health
            .set_degraded(components::CONTROL_LOOP, "remediation loop stopped")
            .await;
        info!("Remediation loop stopped");
    }

    /// Run a single polling cycle.
    ///
    /// Only an inventory failure (or cancellation before the inventory was
    /// fetched) is returned as an error; every per-instance failure is folded
    /// into the report.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleReport, CycleError> {
        if cancel.is_cancelled() {
            return Err(CycleError::Cancelled);
        }

        let cycle = self.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        let start = Instant::now();
        let mut report = CycleReport::new(cycle);

        let pending = self.recorder.retry_pending(cancel).await;
        report.absorb_pending(pending);
        if cancel.is_cancelled() {
            return Err(CycleError::Cancelled);
        }

        let instances = match self.fetch_inventory(cancel).await {
            Ok(instances) => instances,
            Err(CycleError::Cancelled) => return Err(CycleError::Cancelled),
            Err(e) => {
                self.prometheus.inc_cycle_failures();
                self.health
                    .set_degraded(components::INVENTORY, e.to_string())
                    .await;
                self.logger
                    .log_cycle_failed(cycle, &e.to_string(), self.consecutive_failures + 1);
                return Err(e);
            }
        };
        self.health.set_healthy(components::INVENTORY).await;

        let (running, idle): (Vec<Instance>, Vec<Instance>) =
            instances.into_iter().partition(Instance::is_running);

        report.skipped = idle.len();
        for instance in &idle {
            debug!(
                instance_id = %instance.id,
                state = %instance.lifecycle_state,
                "Skipping non-running instance"
            );
        }

        let outcomes: Vec<(String, InstanceOutcome)> = stream::iter(running)
            .map(|instance| async move {
                let outcome = self.process_instance(&instance, cancel).await;
                (instance.id, outcome)
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        for (instance_id, outcome) in outcomes {
            report.absorb(&instance_id, outcome);
        }

        self.recorder.cleanup_dedup_cache();
        report.elapsed = start.elapsed();

        self.publish(&report).await;
        Ok(report)
    }

    async fn fetch_inventory(&self, cancel: &CancellationToken) -> Result<Vec<Instance>, CycleError> {
        let timeout = self.config.inventory_timeout;

        tokio::select! {
            _ = cancel.cancelled() => Err(CycleError::Cancelled),
            result = tokio::time::timeout(timeout, self.inventory.list_instances()) => match result {
                Ok(Ok(instances)) => Ok(instances),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(InventoryError::ProviderUnavailable(format!(
                    "inventory request timed out after {}s",
                    timeout.as_secs()
                ))
                .into()),
            },
        }
    }

    /// One instance's pipeline; never returns an error
    async fn process_instance(&self, instance: &Instance, cancel: &CancellationToken) -> InstanceOutcome {
        if cancel.is_cancelled() {
            return InstanceOutcome::Cancelled;
        }

        let sample = match self.fetch_metrics(&instance.id, cancel).await {
            Some(Ok(sample)) => sample,
            Some(Err(e)) => {
                warn!(instance_id = %instance.id, error = %e, "Failed to fetch metrics");
                return InstanceOutcome::Failed {
                    stage: Stage::Metrics,
                    error: e.to_string(),
                    event: None,
                };
            }
            None => return InstanceOutcome::Cancelled,
        };

        match self.policy.evaluate(&sample) {
            Evaluation::Healthy(decision) => {
                debug!(instance_id = %instance.id, reason = %decision.reason, "Instance healthy");
                InstanceOutcome::Healthy
            }
            Evaluation::InsufficientData => {
                info!(instance_id = %instance.id, "No recent datapoints, skipping");
                InstanceOutcome::InsufficientData
            }
            Evaluation::CoolingDown { decision, remaining } => {
                info!(
                    instance_id = %instance.id,
                    reason = %decision.reason,
                    remaining_secs = remaining.as_secs(),
                    "Threshold exceeded but instance is cooling down"
                );
                InstanceOutcome::CoolingDown { remaining }
            }
            Evaluation::Remediate(decision) => {
                // Last point at which the pipeline may stop without leaving
                // an unrecorded restart behind
                if cancel.is_cancelled() {
                    return InstanceOutcome::Cancelled;
                }
                self.remediate(instance, &sample, &decision).await
            }
        }
    }

    /// `None` when cancelled while waiting for the provider
    async fn fetch_metrics(
        &self,
        instance_id: &str,
        cancel: &CancellationToken,
    ) -> Option<Result<UtilizationSample, MetricsError>> {
        let timeout = self.config.metrics_timeout;

        tokio::select! {
            _ = cancel.cancelled() => None,
            result = tokio::time::timeout(timeout, self.metrics.get_metrics(instance_id)) => Some(
                result.unwrap_or_else(|_| Err(MetricsError::Timeout(timeout.as_secs())))
            ),
        }
    }

    async fn remediate(
        &self,
        instance: &Instance,
        sample: &UtilizationSample,
        decision: &RemediationDecision,
    ) -> InstanceOutcome {
        let mut event = RemediationEvent {
            instance_id: instance.id.clone(),
            display_name: instance.name().to_string(),
            cpu_percent: sample.cpu_percent,
            memory_percent: sample.memory_percent,
            triggered_at: Utc::now(),
            action_result: ActionResult::Failed,
            incident_ref: None,
        };

        if let Err(e) = self.executor.restart(&instance.id).await {
            self.prometheus.inc_action_failures();
            self.logger.log_restart_failed(&instance.id, &e.to_string());
            return InstanceOutcome::Failed {
                stage: Stage::Action,
                error: e.to_string(),
                event: Some(event),
            };
        }

        self.policy.record_remediation(&instance.id);
        self.prometheus.inc_remediations();
        event.action_result = ActionResult::Succeeded;
        self.logger.log_remediation(&event, &decision.reason);

        let request = IncidentRequest::from_event(&event, instance);
        match self.recorder.record(&request).await {
            Ok(incident) => {
                self.logger.log_incident_recorded(&instance.id, &incident);
                event.incident_ref = Some(incident);
                InstanceOutcome::Remediated(event)
            }
            Err(e) => InstanceOutcome::Failed {
                stage: Stage::Record,
                error: e.to_string(),
                event: Some(event),
            },
        }
    }

    /// Push the cycle's results to metrics, health, and the log
    async fn publish(&self, report: &CycleReport) {
        self.prometheus
            .observe_cycle_duration(report.elapsed.as_secs_f64());
        self.prometheus
            .set_instances_evaluated(report.evaluated as i64);

        let stage_health = [
            (components::METRICS, Stage::Metrics),
            (components::EXECUTOR, Stage::Action),
        ];
        for (component, stage) in stage_health {
            match report.errors_at(stage) {
                0 => self.health.set_healthy(component).await,
                n => {
                    self.health
                        .set_degraded(component, format!("{} failure(s) in cycle {}", n, report.cycle))
                        .await
                }
            }
        }

        match self.recorder.pending_count() {
            0 => self.health.set_healthy(components::RECORDER).await,
            n => {
                self.health
                    .set_degraded(components::RECORDER, format!("{} incident(s) pending", n))
                    .await
            }
        }

        self.health.set_healthy(components::CONTROL_LOOP).await;
        self.health.set_ready(true).await;

        self.logger.log_cycle_completed(
            report.cycle,
            report.evaluated,
            report.triggered,
            report.remediated,
            report.failed,
            report.elapsed.as_millis(),
        );
    }

    fn note_cycle_result(&mut self, succeeded: bool) {
        let was_degraded = self.is_degraded();

        if succeeded {
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        }

        match (was_degraded, self.is_degraded()) {
            (false, true) => warn!(
                consecutive_failures = self.consecutive_failures,
                degraded_interval_secs = self.config.degraded_interval.as_secs(),
                "Entering degraded polling after repeated inventory failures"
            ),
            (true, false) => info!("Inventory recovered, resuming normal polling"),
            _ => {}
        }
    }

    fn is_degraded(&self) -> bool {
        self.config.degraded_after_failures > 0
            && self.consecutive_failures >= self.config.degraded_after_failures
    }

    /// Sleep between cycles, accounting for degraded polling
    fn current_interval(&self) -> Duration {
        if self.is_degraded() {
            self.config.degraded_interval
        } else {
            self.config.interval
        }
    }
}

/// Builder for the control loop
pub struct ControlLoopBuilder {
    inventory: Option<Arc<dyn InventorySource>>,
    metrics: Option<Arc<dyn MetricsSource>>,
    policy: Option<Arc<RemediationPolicy>>,
    executor: Option<Arc<ActionExecutor>>,
    recorder: Option<Arc<IncidentRecorder>>,
    health: Option<HealthRegistry>,
    node_name: String,
    config: LoopConfig,
}

impl ControlLoopBuilder {
    pub fn new() -> Self {
        Self {
            inventory: None,
            metrics: None,
            policy: None,
            executor: None,
            recorder: None,
            health: None,
            node_name: "fleet-remediator".to_string(),
            config: LoopConfig::default(),
        }
    }

    pub fn inventory(mut self, inventory: Arc<dyn InventorySource>) -> Self {
        self.inventory = Some(inventory);
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsSource>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn policy(mut self, policy: Arc<RemediationPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn executor(mut self, executor: Arc<ActionExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn recorder(mut self, recorder: Arc<IncidentRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Defaults to a fresh registry when unset
    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn node_name(mut self, node_name: impl Into<String>) -> Self {
        self.node_name = node_name.into();
        self
    }

    pub fn config(mut self, config: LoopConfig) -> Self {
        self.config = config;
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.config.interval = interval;
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.config.concurrency = concurrency;
        self
    }

    pub fn build(self) -> Result<ControlLoop> {
        let inventory = self
            .inventory
            .ok_or_else(|| anyhow::anyhow!("Inventory source is required"))?;
        let metrics = self
            .metrics
            .ok_or_else(|| anyhow::anyhow!("Metrics source is required"))?;
        let executor = self
            .executor
            .ok_or_else(|| anyhow::anyhow!("Action executor is required"))?;
        let recorder = self
            .recorder
            .ok_or_else(|| anyhow::anyhow!("Incident recorder is required"))?;

        if self.config.concurrency == 0 {
            anyhow::bail!("Concurrency must be at least 1");
        }

        Ok(ControlLoop::new(
            inventory,
            metrics,
            self.policy.unwrap_or_default(),
            executor,
            recorder,
            self.health.unwrap_or_default(),
            self.config,
            StructuredLogger::new(self.node_name),
        ))
    }
}

impl Default for ControlLoopBuilder {
    fn default() -> Self {
        Self::new()
    }
}
