//! Per-instance outcomes and the per-cycle report

use crate::models::RemediationEvent;
use crate::recorder::PendingReport;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Pipeline stage at which an instance failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Metrics,
    Action,
    Record,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Metrics => "metrics",
            Stage::Action => "action",
            Stage::Record => "record",
        };
        f.write_str(s)
    }
}

/// Result of one instance's metrics → decide → act → record pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum InstanceOutcome {
    /// Below both thresholds
    Healthy,
    /// Provider had no datapoints; nothing was done
    InsufficientData,
    /// Above threshold but still inside the cooldown window
    CoolingDown { remaining: Duration },
    /// Restarted and recorded
    Remediated(RemediationEvent),
    /// Failed at `stage`; `event` is present once a restart was attempted
    Failed {
        stage: Stage,
        error: String,
        event: Option<RemediationEvent>,
    },
    /// Cancellation observed before any action was dispatched
    Cancelled,
}

impl InstanceOutcome {
    pub fn event(&self) -> Option<&RemediationEvent> {
        match self {
            InstanceOutcome::Remediated(event) => Some(event),
            InstanceOutcome::Failed { event, .. } => event.as_ref(),
            _ => None,
        }
    }
}

/// A failure attributed to one instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceError {
    pub instance_id: String,
    pub stage: Stage,
    pub error: String,
}

/// Summary of one polling cycle
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub started_at: DateTime<Utc>,
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
    /// Running instances whose pipeline was started
    pub evaluated: usize,
    /// Instances whose policy decision led to a restart attempt
    pub triggered: usize,
    /// Instances restarted successfully
    pub remediated: usize,
    /// Entries in `errors`
    pub failed: usize,
    /// Non-running instances, never queried for metrics
    pub skipped: usize,
    pub insufficient_data: usize,
    pub cooling_down: usize,
    pub cancelled: usize,
    /// Queued incidents recorded at the start of this cycle
    pub pending_recovered: usize,
    /// Queued incidents not attempted this cycle
    pub pending_deferred: usize,
    pub events: Vec<RemediationEvent>,
    pub errors: Vec<InstanceError>,
}

impl CycleReport {
    pub fn new(cycle: u64) -> Self {
        Self {
            cycle,
            started_at: Utc::now(),
            elapsed: Duration::ZERO,
            evaluated: 0,
            triggered: 0,
            remediated: 0,
            failed: 0,
            skipped: 0,
            insufficient_data: 0,
            cooling_down: 0,
            cancelled: 0,
            pending_recovered: 0,
            pending_deferred: 0,
            events: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Fold one instance outcome into the counters
    pub fn absorb(&mut self, instance_id: &str, outcome: InstanceOutcome) {
        if outcome != InstanceOutcome::Cancelled {
            self.evaluated += 1;
        }

        match outcome {
            InstanceOutcome::Healthy => {}
            InstanceOutcome::InsufficientData => self.insufficient_data += 1,
            InstanceOutcome::CoolingDown { .. } => self.cooling_down += 1,
            InstanceOutcome::Cancelled => self.cancelled += 1,
            InstanceOutcome::Remediated(event) => {
                self.triggered += 1;
                self.remediated += 1;
                self.events.push(event);
            }
            InstanceOutcome::Failed {
                stage,
                error,
                event,
            } => {
                if let Some(event) = event {
                    self.triggered += 1;
                    // The restart went through; only the ticket is missing
                    if stage == Stage::Record {
                        self.remediated += 1;
                    }
                    self.events.push(event);
                }
                self.push_error(instance_id, stage, error);
            }
        }
    }

    /// Fold the result of retrying queued incidents
    pub fn absorb_pending(&mut self, pending: PendingReport) {
        self.pending_recovered = pending.recovered.len();
        self.pending_deferred = pending.deferred;
        for (instance_id, error) in pending.rejected {
            self.push_error(&instance_id, Stage::Record, error.to_string());
        }
    }

    pub fn errors_at(&self, stage: Stage) -> usize {
        self.errors.iter().filter(|e| e.stage == stage).count()
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    fn push_error(&mut self, instance_id: &str, stage: Stage, error: String) {
        self.failed += 1;
        self.errors.push(InstanceError {
            instance_id: instance_id.to_string(),
            stage,
            error,
        });
    }
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}
