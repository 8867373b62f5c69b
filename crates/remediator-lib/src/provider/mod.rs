//! External collaborators
//!
//! The control loop talks to the outside world only through these traits:
//! an inventory source, a metrics source, a remote restart action and an
//! incident sink. HTTP implementations live in [`gateway`] and [`ticketing`];
//! tests substitute in-memory doubles.

pub mod gateway;
pub mod ticketing;

pub use gateway::{GatewayClient, GatewayConfig};
pub use ticketing::{IncidentTemplate, TicketingClient, TicketingConfig};

use crate::error::{ActionError, InventoryError, MetricsError, RecordError};
use crate::models::{Ack, IncidentFields, IncidentRef, Instance, UtilizationSample};
use async_trait::async_trait;

/// Lists the current fleet
#[async_trait]
pub trait InventorySource: Send + Sync {
    /// Full instance list or an error; never a partial list
    async fn list_instances(&self) -> Result<Vec<Instance>, InventoryError>;
}

/// Queries recent utilization for an instance
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Returns a zero-valued sample marked `insufficient_data` when the
    /// provider has no recent datapoints
    async fn get_metrics(&self, instance_id: &str) -> Result<UtilizationSample, MetricsError>;
}

/// Issues the remote restart
#[async_trait]
pub trait ActionProvider: Send + Sync {
    async fn restart(&self, instance_id: &str) -> Result<Ack, ActionError>;
}

/// Persists incidents in the ticketing system
#[async_trait]
pub trait IncidentSink: Send + Sync {
    async fn create_incident(&self, fields: &IncidentFields) -> Result<IncidentRef, RecordError>;

    /// Look up an incident previously created with this idempotency key.
    /// Providers that cannot search return `Ok(None)`.
    async fn find_incident(&self, _idempotency_key: &str) -> Result<Option<IncidentRef>, RecordError> {
        Ok(None)
    }
}
