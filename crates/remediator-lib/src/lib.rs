//! Core library for the fleet remediator
//!
//! This crate provides the core functionality for:
//! - Threshold policy with per-instance cooldown
//! - Restart execution with coalescing and bounded retry
//! - Incident recording with idempotency keys, dedup and a pending queue
//! - The polling control loop and its cycle report
//! - HTTP clients for the instance gateway and the ticketing system
//! - Health checks and observability

pub mod error;
pub mod executor;
pub mod health;
pub mod models;
pub mod observability;
pub mod orchestrator;
pub mod policy;
pub mod provider;
pub mod recorder;
pub mod retry;

pub use error::{ActionError, CycleError, InventoryError, MetricsError, RecordError};
pub use executor::ActionExecutor;
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{RemediatorMetrics, StructuredLogger};
pub use orchestrator::{ControlLoop, ControlLoopBuilder, CycleReport, LoopConfig, Stage};
pub use policy::{RemediationPolicy, Thresholds};
pub use recorder::{IncidentRecorder, PendingIncidents, RecorderConfig};
pub use retry::RetryPolicy;
