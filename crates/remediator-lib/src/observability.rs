//! Observability infrastructure for the remediator
//!
//! Provides:
//! - Prometheus metrics (cycle latency, remediation and recording counters,
//!   pending incident gauge)
//! - Structured JSON logging with tracing for remediation events

use crate::models::{IncidentRef, RemediationEvent};
use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Histogram, IntCounter, IntGauge,
};
use std::sync::OnceLock;
use tracing::{error, info, warn};

/// Histogram buckets for cycle duration (in seconds)
const CYCLE_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<RemediatorMetricsInner> = OnceLock::new();

/// Inner metrics structure that holds the actual Prometheus metrics
struct RemediatorMetricsInner {
    cycle_duration_seconds: Histogram,
    cycles_total: IntCounter,
    cycle_failures_total: IntCounter,
    instances_evaluated: IntGauge,
    remediations_total: IntCounter,
    action_failures_total: IntCounter,
    restarts_coalesced_total: IntCounter,
    incidents_recorded_total: IntCounter,
    incidents_suppressed_total: IntCounter,
    record_failures_total: IntCounter,
    pending_incidents: IntGauge,
}

impl RemediatorMetricsInner {
    fn new() -> Self {
        Self {
            cycle_duration_seconds: register_histogram!(
                "remediator_cycle_duration_seconds",
                "Time spent on one monitor-decide-act-record cycle",
                CYCLE_BUCKETS.to_vec()
            )
            .expect("Failed to register cycle_duration_seconds"),

            cycles_total: register_int_counter!(
                "remediator_cycles_total",
                "Total number of completed polling cycles"
            )
            .expect("Failed to register cycles_total"),

            cycle_failures_total: register_int_counter!(
                "remediator_cycle_failures_total",
                "Total number of cycles aborted by an inventory failure"
            )
            .expect("Failed to register cycle_failures_total"),

            instances_evaluated: register_int_gauge!(
                "remediator_instances_evaluated",
                "Number of running instances evaluated in the last cycle"
            )
            .expect("Failed to register instances_evaluated"),

            remediations_total: register_int_counter!(
                "remediator_remediations_total",
                "Total number of successful restarts"
            )
            .expect("Failed to register remediations_total"),

            action_failures_total: register_int_counter!(
                "remediator_action_failures_total",
                "Total number of restarts that failed after retries"
            )
            .expect("Failed to register action_failures_total"),

            restarts_coalesced_total: register_int_counter!(
                "remediator_restarts_coalesced_total",
                "Total number of restart requests joined to an in-flight restart"
            )
            .expect("Failed to register restarts_coalesced_total"),

            incidents_recorded_total: register_int_counter!(
                "remediator_incidents_recorded_total",
                "Total number of incidents created in the ticketing system"
            )
            .expect("Failed to register incidents_recorded_total"),

            incidents_suppressed_total: register_int_counter!(
                "remediator_incidents_suppressed_total",
                "Total number of duplicate incident records suppressed"
            )
            .expect("Failed to register incidents_suppressed_total"),

            record_failures_total: register_int_counter!(
                "remediator_record_failures_total",
                "Total number of incident creations that failed after retries"
            )
            .expect("Failed to register record_failures_total"),

            pending_incidents: register_int_gauge!(
                "remediator_pending_incidents",
                "Number of incidents waiting for a later recording attempt"
            )
            .expect("Failed to register pending_incidents"),
        }
    }
}

/// Remediator metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct RemediatorMetrics {
    _private: (),
}

impl Default for RemediatorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RemediatorMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(RemediatorMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &RemediatorMetricsInner {
        GLOBAL_METRICS.get_or_init(RemediatorMetricsInner::new)
    }

    pub fn observe_cycle_duration(&self, duration_secs: f64) {
        self.inner().cycle_duration_seconds.observe(duration_secs);
        self.inner().cycles_total.inc();
    }

    pub fn inc_cycle_failures(&self) {
        self.inner().cycle_failures_total.inc();
    }

    pub fn set_instances_evaluated(&self, count: i64) {
        self.inner().instances_evaluated.set(count);
    }

    pub fn inc_remediations(&self) {
        self.inner().remediations_total.inc();
    }

    pub fn inc_action_failures(&self) {
        self.inner().action_failures_total.inc();
    }

    pub fn inc_restarts_coalesced(&self) {
        self.inner().restarts_coalesced_total.inc();
    }

    pub fn inc_incidents_recorded(&self) {
        self.inner().incidents_recorded_total.inc();
    }

    pub fn inc_incidents_suppressed(&self) {
        self.inner().incidents_suppressed_total.inc();
    }

    pub fn inc_record_failures(&self) {
        self.inner().record_failures_total.inc();
    }

    pub fn set_pending_incidents(&self, count: i64) {
        self.inner().pending_incidents.set(count);
    }
}

/// Structured logger for remediation events
///
/// Provides consistent JSON-formatted logging for remediations, incident
/// recording and cycle summaries.
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    /// Log a successful restart
    pub fn log_remediation(&self, event: &RemediationEvent, reason: &str) {
        warn!(
            event = "instance_remediated",
            node = %self.node_name,
            instance_id = %event.instance_id,
            display_name = %event.display_name,
            cpu_percent = event.cpu_percent,
            memory_percent = event.memory_percent,
            triggered_at = %event.triggered_at.to_rfc3339(),
            reason = %reason,
            "Restarted unhealthy instance"
        );
    }

    /// Log a restart that could not be performed
    pub fn log_restart_failed(&self, instance_id: &str, error: &str) {
        error!(
            event = "restart_failed",
            node = %self.node_name,
            instance_id = %instance_id,
            error = %error,
            "Failed to restart unhealthy instance"
        );
    }

    /// Log an incident recorded for a remediation
    pub fn log_incident_recorded(&self, instance_id: &str, incident: &IncidentRef) {
        info!(
            event = "incident_recorded",
            node = %self.node_name,
            instance_id = %instance_id,
            incident_id = %incident.id,
            incident_number = ?incident.number,
            "Incident recorded for remediation"
        );
    }

    /// Log a cycle summary
    pub fn log_cycle_completed(
        &self,
        cycle: u64,
        evaluated: usize,
        triggered: usize,
        remediated: usize,
        failed: usize,
        elapsed_ms: u128,
    ) {
        if failed > 0 {
            warn!(
                event = "cycle_completed",
                node = %self.node_name,
                cycle = cycle,
                evaluated = evaluated,
                triggered = triggered,
                remediated = remediated,
                failed = failed,
                elapsed_ms = elapsed_ms as u64,
                "Cycle completed with failures"
            );
        } else {
            info!(
                event = "cycle_completed",
                node = %self.node_name,
                cycle = cycle,
                evaluated = evaluated,
                triggered = triggered,
                remediated = remediated,
                failed = failed,
                elapsed_ms = elapsed_ms as u64,
                "Cycle completed"
            );
        }
    }

    /// Log a cycle aborted by an inventory failure
    pub fn log_cycle_failed(&self, cycle: u64, error: &str, consecutive_failures: u32) {
        warn!(
            event = "cycle_failed",
            node = %self.node_name,
            cycle = cycle,
            error = %error,
            consecutive_failures = consecutive_failures,
            "Cycle aborted, inventory unavailable"
        );
    }

    /// Log remediator startup
    pub fn log_startup(&self, version: &str, interval_secs: u64, concurrency: usize) {
        info!(
            event = "remediator_started",
            node = %self.node_name,
            version = %version,
            interval_secs = interval_secs,
            concurrency = concurrency,
            "Fleet remediator started"
        );
    }

    /// Log remediator shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "remediator_shutdown",
            node = %self.node_name,
            reason = %reason,
            "Fleet remediator shutting down"
        );
    }
}
