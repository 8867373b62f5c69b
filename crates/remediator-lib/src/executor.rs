//! Restart execution with coalescing and retry
//!
//! Concurrent restart requests for the same instance share one in-flight
//! remote call: the second caller awaits the pending result instead of
//! issuing another restart. Transient failures are retried with bounded
//! exponential backoff; terminal failures return immediately.

use crate::error::ActionError;
use crate::models::Ack;
use crate::observability::RemediatorMetrics;
use crate::provider::ActionProvider;
use crate::retry::RetryPolicy;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

type PendingRestart = Shared<BoxFuture<'static, Result<Ack, ActionError>>>;

/// Default per-call timeout for restart requests
pub const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Executes restarts against an [`ActionProvider`]
pub struct ActionExecutor {
    provider: Arc<dyn ActionProvider>,
    retry: RetryPolicy,
    call_timeout: Duration,
    in_flight: Arc<DashMap<String, PendingRestart>>,
    coalesced: AtomicU64,
    metrics: RemediatorMetrics,
}

impl ActionExecutor {
    pub fn new(provider: Arc<dyn ActionProvider>, retry: RetryPolicy, call_timeout: Duration) -> Self {
        Self {
            provider,
            retry,
            call_timeout,
            in_flight: Arc::new(DashMap::new()),
            coalesced: AtomicU64::new(0),
            metrics: RemediatorMetrics::new(),
        }
    }

    /// Restart an instance, joining any restart already in flight for it
    pub async fn restart(&self, instance_id: &str) -> Result<Ack, ActionError> {
        let pending = match self.in_flight.entry(instance_id.to_string()) {
            Entry::Occupied(entry) => {
                self.coalesced.fetch_add(1, Ordering::Relaxed);
                self.metrics.inc_restarts_coalesced();
                debug!(instance_id = %instance_id, "Restart already in flight, joining");
                entry.get().clone()
            }
            Entry::Vacant(entry) => {
                let pending = self.dispatch(instance_id.to_string());
                entry.insert(pending.clone());
                pending
            }
        };

        pending.await
    }

    /// Number of instances with a restart currently in flight
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Number of restart requests that joined an in-flight call
    pub fn coalesced_count(&self) -> u64 {
        self.coalesced.load(Ordering::Relaxed)
    }

    fn dispatch(&self, instance_id: String) -> PendingRestart {
        let provider = Arc::clone(&self.provider);
        let in_flight = Arc::clone(&self.in_flight);
        let retry = self.retry;
        let call_timeout = self.call_timeout;

        async move {
            let result = restart_with_retry(provider.as_ref(), &instance_id, retry, call_timeout).await;
            in_flight.remove(&instance_id);
            result
        }
        .boxed()
        .shared()
    }
}

async fn restart_with_retry(
    provider: &dyn ActionProvider,
    instance_id: &str,
    retry: RetryPolicy,
    call_timeout: Duration,
) -> Result<Ack, ActionError> {
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let result = match tokio::time::timeout(call_timeout, provider.restart(instance_id)).await {
            Ok(result) => result,
            Err(_) => Err(ActionError::Transient(format!(
                "restart timed out after {}ms",
                call_timeout.as_millis()
            ))),
        };

        match result {
            Ok(ack) => {
                info!(
                    instance_id = %instance_id,
                    attempt = attempt,
                    status = %ack.status,
                    "Restart accepted"
                );
                return Ok(ack);
            }
            Err(e) if e.is_retriable() && retry.should_retry(attempt) => {
                let delay = retry.delay_after(attempt);
                warn!(
                    instance_id = %instance_id,
                    attempt = attempt,
                    max_attempts = retry.max_attempts,
                    backoff_ms = delay.as_millis() as u64,
                    error = %e,
                    "Restart failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                warn!(
                    instance_id = %instance_id,
                    attempt = attempt,
                    error = %e,
                    "Restart failed"
                );
                return Err(e);
            }
        }
    }
}
