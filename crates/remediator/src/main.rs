//! Fleet Remediator - restarts unhealthy instances and records incidents
//!
//! Polls the instance gateway for inventory and utilization, restarts
//! instances that stay above the CPU/memory thresholds, and opens an
//! incident in the ticketing system for every restart.

use anyhow::{Context, Result};
use clap::Parser;
use remediator_lib::{
    executor::ActionExecutor,
    health::{components, HealthRegistry},
    observability::StructuredLogger,
    orchestrator::ControlLoopBuilder,
    policy::RemediationPolicy,
    provider::{GatewayClient, TicketingClient},
    recorder::IncidentRecorder,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const REMEDIATOR_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "fleet-remediator")]
#[command(author, version, about = "Restart unhealthy instances and record incidents", long_about = None)]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(long, short, env = "REMEDIATOR_CONFIG_FILE")]
    config: Option<PathBuf>,

    /// Run a single cycle and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let cli = Cli::parse();

    let config = config::RemediatorConfig::load(cli.config.as_deref())?;
    info!(
        node_name = %config.node_name,
        gateway = %config.gateway.base_url,
        ticketing = %config.ticketing.base_url,
        "Remediator configured"
    );

    let health_registry = HealthRegistry::with_default_components().await;

    let logger = StructuredLogger::new(&config.node_name);
    logger.log_startup(
        REMEDIATOR_VERSION,
        config.polling.interval_secs,
        config.polling.concurrency,
    );

    let gateway = Arc::new(
        GatewayClient::new(config.gateway_config()).context("Failed to create gateway client")?,
    );
    let ticketing = Arc::new(
        TicketingClient::new(config.ticketing_config())
            .context("Failed to create ticketing client")?,
    );

    let policy = Arc::new(RemediationPolicy::new(config.thresholds(), config.cooldown()));
    let executor = Arc::new(ActionExecutor::new(
        gateway.clone(),
        config.retry_policy(),
        config.action_timeout(),
    ));
    let recorder = Arc::new(IncidentRecorder::with_pending(
        ticketing,
        config.recorder_config(),
        config.pending_incidents(),
    ));

    let control_loop = ControlLoopBuilder::new()
        .inventory(gateway.clone())
        .metrics(gateway)
        .policy(policy)
        .executor(executor)
        .recorder(recorder)
        .health(health_registry.clone())
        .node_name(&config.node_name)
        .config(config.loop_config())
        .build()?;

    if cli.once {
        let report = control_loop.run_cycle(&CancellationToken::new()).await?;
        info!(
            report = %serde_json::to_string(&report)?,
            "Single cycle finished"
        );
        logger.log_shutdown("single cycle complete");
        return Ok(());
    }

    // Start health and metrics server
    let app_state = Arc::new(api::AppState::new(health_registry.clone()));
    let mut api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    let cancel = CancellationToken::new();
    let loop_handle = tokio::spawn(control_loop.run(cancel.clone()));

    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            logger.log_shutdown("SIGINT received");
            signal.context("Failed to listen for shutdown signal")
        }
        served = &mut api_handle => {
            let e = match served {
                Ok(Ok(())) => anyhow::anyhow!("API server exited unexpectedly"),
                Ok(Err(e)) => e,
                Err(e) => e.into(),
            };
            error!(error = %e, "API server stopped");
            health_registry
                .set_unhealthy(components::CONTROL_LOOP, "API server stopped")
                .await;
            logger.log_shutdown("API server stopped");
            Err(e)
        }
    };

    // Let the in-flight cycle finish its dispatched restarts and records
    cancel.cancel();
    if let Err(e) = loop_handle.await {
        error!(error = %e, "Remediation loop task failed");
    }
    api_handle.abort();

    info!("Shutting down");
    outcome
}
