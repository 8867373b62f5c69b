//! Polling control loop for fleet remediation
//!
//! Drives the monitor → decide → act → record pipeline across the fleet and
//! aggregates per-instance results into a [`CycleReport`].

mod r#loop;
mod report;


pub use r#loop::{ControlLoop, ControlLoopBuilder, LoopConfig};
pub use report::{CycleReport, InstanceError, InstanceOutcome, Stage};
