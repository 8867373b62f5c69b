//! Remediation policy
//!
//! Maps a utilization sample to a remediation decision. The threshold check
//! is a pure function; hysteresis is layered on top with a per-instance
//! cooldown so a restart cannot trigger another restart on the next cycle.

mod cooldown;

pub use cooldown::CooldownTracker;

use crate::models::{RemediationDecision, UtilizationSample};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default CPU threshold in percent
pub const DEFAULT_CPU_THRESHOLD: f64 = 90.0;

/// Default memory threshold in percent
pub const DEFAULT_MEMORY_THRESHOLD: f64 = 90.0;

/// Default cooldown after a remediation (10 minutes)
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(10 * 60);

/// Utilization thresholds above which an instance is remediated
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            cpu_percent: DEFAULT_CPU_THRESHOLD,
            memory_percent: DEFAULT_MEMORY_THRESHOLD,
        }
    }
}

/// Decide whether a sample warrants remediation.
///
/// A sample with no usable values (both zero, or non-finite) is treated as
/// insufficient data and never triggers.
pub fn decide(cpu_percent: f64, memory_percent: f64, thresholds: &Thresholds) -> RemediationDecision {
    if !cpu_percent.is_finite() || !memory_percent.is_finite() {
        return RemediationDecision::hold("insufficient data: non-finite sample");
    }
    if cpu_percent == 0.0 && memory_percent == 0.0 {
        return RemediationDecision::hold("insufficient data: no datapoints");
    }

    if cpu_percent > thresholds.cpu_percent {
        RemediationDecision::act(format!(
            "cpu {:.2}% above threshold {:.2}%",
            cpu_percent, thresholds.cpu_percent
        ))
    } else if memory_percent > thresholds.memory_percent {
        RemediationDecision::act(format!(
            "memory {:.2}% above threshold {:.2}%",
            memory_percent, thresholds.memory_percent
        ))
    } else {
        RemediationDecision::hold("within thresholds")
    }
}

/// Same as [`decide`] but honours the explicit no-datapoints marker
pub fn decide_sample(sample: &UtilizationSample, thresholds: &Thresholds) -> RemediationDecision {
    if sample.insufficient_data {
        return RemediationDecision::hold("insufficient data: no datapoints");
    }
    decide(sample.cpu_percent, sample.memory_percent, thresholds)
}

/// Policy evaluation result including hysteresis
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    /// Thresholds not exceeded
    Healthy(RemediationDecision),
    /// Provider had no recent datapoints
    InsufficientData,
    /// Thresholds exceeded but the instance was remediated recently
    CoolingDown {
        decision: RemediationDecision,
        remaining: Duration,
    },
    /// Remediation should proceed
    Remediate(RemediationDecision),
}

/// Threshold policy with per-instance cooldown
#[derive(Debug)]
pub struct RemediationPolicy {
    thresholds: Thresholds,
    cooldown: CooldownTracker,
}

impl RemediationPolicy {
    pub fn new(thresholds: Thresholds, cooldown: Duration) -> Self {
        Self {
            thresholds,
            cooldown: CooldownTracker::new(cooldown),
        }
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    pub fn cooldown(&self) -> &CooldownTracker {
        &self.cooldown
    }

    /// Evaluate a sample for one instance
    pub fn evaluate(&self, sample: &UtilizationSample) -> Evaluation {
        if sample.insufficient_data || (sample.cpu_percent == 0.0 && sample.memory_percent == 0.0)
        {
            return Evaluation::InsufficientData;
        }

        let decision = decide_sample(sample, &self.thresholds);
        if !decision.should_act {
            return Evaluation::Healthy(decision);
        }

        match self.cooldown.remaining(&sample.instance_id) {
            Some(remaining) => Evaluation::CoolingDown {
                decision,
                remaining,
            },
            None => Evaluation::Remediate(decision),
        }
    }

    /// Arm the cooldown after a successful remediation
    pub fn record_remediation(&self, instance_id: &str) {
        self.cooldown.arm(instance_id);
    }
}

impl Default for RemediationPolicy {
    fn default() -> Self {
        Self::new(Thresholds::default(), DEFAULT_COOLDOWN)
    }
}
