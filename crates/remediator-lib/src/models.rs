//! Core data models for the remediator

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state reported by the inventory provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Running,
    Stopped,
    #[serde(other)]
    Other,
}

impl LifecycleState {
    /// Parse a provider state string; anything unrecognised is `Other`
    pub fn from_provider(state: &str) -> Self {
        match state.to_ascii_lowercase().as_str() {
            "running" => LifecycleState::Running,
            "stopped" => LifecycleState::Stopped,
            _ => LifecycleState::Other,
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::Running => write!(f, "running"),
            LifecycleState::Stopped => write!(f, "stopped"),
            LifecycleState::Other => write!(f, "other"),
        }
    }
}

/// Snapshot of a managed compute instance from one inventory poll
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub display_name: Option<String>,
    pub lifecycle_state: LifecycleState,
    pub instance_type: Option<String>,
    pub availability_zone: Option<String>,
}

impl Instance {
    pub fn new(id: impl Into<String>, lifecycle_state: LifecycleState) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            lifecycle_state,
            instance_type: None,
            availability_zone: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Display name, falling back to the instance id
    pub fn name(&self) -> &str {
        self.display_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or(&self.id)
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle_state == LifecycleState::Running
    }
}

/// Recent utilization sample for one instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UtilizationSample {
    pub instance_id: String,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub sampled_at: DateTime<Utc>,
    /// Set when the provider had no recent datapoints
    #[serde(default)]
    pub insufficient_data: bool,
}

impl UtilizationSample {
    pub fn new(instance_id: impl Into<String>, cpu_percent: f64, memory_percent: f64) -> Self {
        Self {
            instance_id: instance_id.into(),
            cpu_percent,
            memory_percent,
            sampled_at: Utc::now(),
            insufficient_data: false,
        }
    }

    /// Zero-valued sample marked as having no datapoints
    pub fn no_datapoints(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            cpu_percent: 0.0,
            memory_percent: 0.0,
            sampled_at: Utc::now(),
            insufficient_data: true,
        }
    }
}

/// Outcome of evaluating the remediation policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemediationDecision {
    pub should_act: bool,
    pub reason: String,
}

impl RemediationDecision {
    pub fn act(reason: impl Into<String>) -> Self {
        Self {
            should_act: true,
            reason: reason.into(),
        }
    }

    pub fn hold(reason: impl Into<String>) -> Self {
        Self {
            should_act: false,
            reason: reason.into(),
        }
    }
}

/// Result of the remediation action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionResult {
    Succeeded,
    Failed,
}

/// A remediation that was triggered for one instance in one cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemediationEvent {
    pub instance_id: String,
    pub display_name: String,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub triggered_at: DateTime<Utc>,
    pub action_result: ActionResult,
    pub incident_ref: Option<IncidentRef>,
}

/// Acknowledgement of an accepted restart
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub instance_id: String,
    pub status: String,
}

/// Reference to an incident persisted by the ticketing provider
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IncidentRef {
    /// Provider record id (e.g. sys_id)
    pub id: String,
    /// Human-facing ticket number when the provider returns one
    pub number: Option<String>,
}

impl std::fmt::Display for IncidentRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.number {
            Some(number) => write!(f, "{} ({})", number, self.id),
            None => write!(f, "{}", self.id),
        }
    }
}

/// Fields describing a remediation incident to be recorded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentRequest {
    pub instance_id: String,
    pub display_name: String,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub triggered_at: DateTime<Utc>,
    pub instance_type: Option<String>,
    pub availability_zone: Option<String>,
}

impl IncidentRequest {
    pub fn from_event(event: &RemediationEvent, instance: &Instance) -> Self {
        Self {
            instance_id: event.instance_id.clone(),
            display_name: event.display_name.clone(),
            cpu_percent: event.cpu_percent,
            memory_percent: event.memory_percent,
            triggered_at: event.triggered_at,
            instance_type: instance.instance_type.clone(),
            availability_zone: instance.availability_zone.clone(),
        }
    }
}

/// Payload handed to the ticketing provider, including the idempotency key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentFields {
    pub idempotency_key: String,
    pub short_description: String,
    pub description: String,
    pub instance_id: String,
}

impl IncidentFields {
    pub fn for_request(request: &IncidentRequest, idempotency_key: impl Into<String>) -> Self {
        let mut description = format!(
            "Instance '{}' ({}) restarted due to CPU={:.2}% Memory={:.2}%",
            request.display_name, request.instance_id, request.cpu_percent, request.memory_percent
        );
        if let Some(ref instance_type) = request.instance_type {
            description.push_str(&format!(". Type: {}", instance_type));
        }
        if let Some(ref az) = request.availability_zone {
            description.push_str(&format!(". Availability zone: {}", az));
        }
        description.push_str(&format!(". Triggered at {}", request.triggered_at.to_rfc3339()));

        Self {
            idempotency_key: idempotency_key.into(),
            short_description: format!("EC2 Auto-Restart: {}", request.instance_id),
            description,
            instance_id: request.instance_id.clone(),
        }
    }
}
