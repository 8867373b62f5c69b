//! Error taxonomy for the remediation pipeline

use thiserror::Error;

/// Inventory fetch failure; aborts the current cycle only
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InventoryError {
    #[error("inventory provider unavailable: {0}")]
    ProviderUnavailable(String),
}

/// Metrics fetch failure for a single instance
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MetricsError {
    #[error("metrics provider unavailable: {0}")]
    Unavailable(String),
    #[error("metrics request timed out after {0}s")]
    Timeout(u64),
    #[error("malformed metrics response: {0}")]
    Malformed(String),
}

/// Restart failure
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ActionError {
    #[error("transient restart failure: {0}")]
    Transient(String),
    #[error("instance not found: {0}")]
    NotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("restart rejected by provider: {0}")]
    Rejected(String),
}

impl ActionError {
    /// Only transient failures are worth another attempt
    pub fn is_retriable(&self) -> bool {
        matches!(self, ActionError::Transient(_))
    }
}

/// Incident creation failure
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("transient incident creation failure: {0}")]
    Transient(String),
    #[error("incident rejected by provider: {0}")]
    RejectedByProvider(String),
}

impl RecordError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, RecordError::Transient(_))
    }
}

/// Cycle-level failure; per-instance errors never surface here
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CycleError {
    #[error(transparent)]
    Inventory(#[from] InventoryError),
    #[error("cycle cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_error_classification() {
        assert!(ActionError::Transient("503".into()).is_retriable());
        assert!(!ActionError::NotFound("i-1".into()).is_retriable());
        assert!(!ActionError::PermissionDenied("denied".into()).is_retriable());
        assert!(!ActionError::Rejected("bad request".into()).is_retriable());
    }

    #[test]
    fn test_record_error_classification() {
        assert!(RecordError::Transient("timeout".into()).is_retriable());
        assert!(!RecordError::RejectedByProvider("malformed".into()).is_retriable());
    }

    #[test]
    fn test_cycle_error_display() {
        let err: CycleError = InventoryError::ProviderUnavailable("connection refused".into()).into();
        assert_eq!(
            err.to_string(),
            "inventory provider unavailable: connection refused"
        );
    }
}
