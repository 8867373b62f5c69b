//! Incident recording with duplicate suppression
//!
//! Handles:
//! - Deterministic idempotency keys per remediation event
//! - Lookup-before-retry so a lost acknowledgement does not create a second ticket
//! - A per-instance dedup cache covering the cooldown window, measured
//!   between event trigger times
//! - Queueing of recordings that ultimately failed for a later attempt,
//!   retried in bounded batches

mod pending;

pub use pending::{PendingConfig, PendingIncident, PendingIncidents, DEFAULT_MAX_PENDING};

use crate::error::RecordError;
use crate::models::{IncidentFields, IncidentRef, IncidentRequest};
use crate::observability::RemediatorMetrics;
use crate::provider::IncidentSink;
use crate::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default number of queued incidents retried per cycle
pub const DEFAULT_PENDING_BATCH: usize = 100;

/// Configuration for the incident recorder
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    pub retry: RetryPolicy,
    /// Per-call timeout for create and lookup requests
    pub call_timeout: Duration,
    /// Window in which a second record for the same instance is suppressed
    pub dedup_window: Duration,
    /// Granularity used to round `triggered_at` into the idempotency key
    pub key_bucket: Duration,
    /// Queued incidents attempted per cycle; the rest wait for the next one
    pub pending_batch: usize,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            call_timeout: Duration::from_secs(30),
            dedup_window: Duration::from_secs(10 * 60),
            key_bucket: Duration::from_secs(60),
            pending_batch: DEFAULT_PENDING_BATCH,
        }
    }
}

/// Idempotency key for a remediation event.
///
/// SHA-256 over the instance id and `triggered_at` rounded down to the
/// bucket, so retries of the same event always map to the same key.
pub fn idempotency_key(instance_id: &str, triggered_at: DateTime<Utc>, bucket: Duration) -> String {
    let bucket_ms = (bucket.as_millis() as i64).max(1);
    let slot = triggered_at.timestamp_millis().div_euclid(bucket_ms);

    let mut hasher = Sha256::new();
    hasher.update(instance_id.as_bytes());
    hasher.update(b":");
    hasher.update(slot.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
struct RecentIncident {
    key: String,
    incident: IncidentRef,
    triggered_at: DateTime<Utc>,
}

/// Absolute distance between two trigger times
fn trigger_gap(a: DateTime<Utc>, b: DateTime<Utc>) -> Duration {
    let delta = if a >= b { a - b } else { b - a };
    delta.to_std().unwrap_or_default()
}

/// Result of retrying the pending queue
#[derive(Debug, Default, Clone)]
pub struct PendingReport {
    /// Incidents recorded on this pass, keyed by instance id
    pub recovered: Vec<(String, IncidentRef)>,
    /// Entries put back for the next pass
    pub requeued: usize,
    /// Entries the provider refused outright
    pub rejected: Vec<(String, RecordError)>,
    /// Entries left untouched this pass (batch limit or cancellation)
    pub deferred: usize,
}

/// Records remediation incidents through an [`IncidentSink`]
pub struct IncidentRecorder {
    sink: Arc<dyn IncidentSink>,
    config: RecorderConfig,
    recent: DashMap<String, RecentIncident>,
    instance_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    pending: Mutex<PendingIncidents>,
    suppressed: AtomicU64,
    metrics: RemediatorMetrics,
}

impl IncidentRecorder {
    pub fn new(sink: Arc<dyn IncidentSink>, config: RecorderConfig) -> Self {
        Self::with_pending(sink, config, PendingIncidents::new(PendingConfig::default()))
    }

    /// Create a recorder around an existing (possibly reloaded) pending queue
    pub fn with_pending(
        sink: Arc<dyn IncidentSink>,
        config: RecorderConfig,
        pending: PendingIncidents,
    ) -> Self {
        let metrics = RemediatorMetrics::new();
        metrics.set_pending_incidents(pending.len() as i64);

        Self {
            sink,
            config,
            recent: DashMap::new(),
            instance_locks: DashMap::new(),
            pending: Mutex::new(pending),
            suppressed: AtomicU64::new(0),
            metrics,
        }
    }

    pub fn key_for(&self, request: &IncidentRequest) -> String {
        idempotency_key(&request.instance_id, request.triggered_at, self.config.key_bucket)
    }

    /// Record an incident for a remediation event.
    ///
    /// A transient failure that survives all retries is queued for the next
    /// cycle before the error is returned; a rejection is escalated in the
    /// log and returned without queueing.
    pub async fn record(&self, request: &IncidentRequest) -> Result<IncidentRef, RecordError> {
        match self.record_serialized(request, false, self.config.retry).await {
            Ok(incident) => Ok(incident),
            Err(e) if e.is_retriable() => {
                self.enqueue(PendingIncident::new(request.clone(), e.to_string()));
                Err(e)
            }
            Err(e) => {
                self.escalate(request, &e);
                Err(e)
            }
        }
    }

    /// Retry up to one batch of queued incidents, one attempt each.
    ///
    /// Stops between entries once `cancel` fires; untouched entries stay at
    /// the front of the queue.
    pub async fn retry_pending(&self, cancel: &CancellationToken) -> PendingReport {
        let (batch, backlog) = {
            let mut pending = self.lock_pending();
            let batch = pending.take_front(self.config.pending_batch.max(1));
            (batch, pending.len())
        };
        let mut report = PendingReport {
            deferred: backlog,
            ..PendingReport::default()
        };

        if batch.is_empty() {
            return report;
        }

        info!(entries = batch.len(), backlog = backlog, "Retrying pending incidents");

        // Backoff is left to the cycle interval
        let single = RetryPolicy {
            max_attempts: 1,
            ..self.config.retry
        };

        let mut entries = batch.into_iter();
        while let Some(mut entry) = entries.next() {
            if cancel.is_cancelled() {
                let untouched: Vec<PendingIncident> =
                    std::iter::once(entry).chain(entries).collect();
                report.deferred += untouched.len();
                self.lock_pending().restore_front(untouched);
                break;
            }

            match self.record_serialized(&entry.request, true, single).await {
                Ok(incident) => {
                    report
                        .recovered
                        .push((entry.request.instance_id.clone(), incident));
                }
                Err(e) if e.is_retriable() => {
                    entry.attempts += 1;
                    entry.last_error = e.to_string();
                    report.requeued += 1;
                    self.enqueue(entry);
                }
                Err(e) => {
                    self.escalate(&entry.request, &e);
                    report.rejected.push((entry.request.instance_id.clone(), e));
                }
            }
        }

        self.persist_pending();
        report
    }

    pub fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    /// Number of records answered from the dedup cache
    pub fn suppressed_count(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }

    /// Drop expired dedup entries and idle per-instance locks
    pub fn cleanup_dedup_cache(&self) {
        let window = self.config.dedup_window;
        let now = Utc::now();
        self.recent
            .retain(|_, recent| trigger_gap(now, recent.triggered_at) < window);
        self.instance_locks
            .retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    /// Serialize records per instance so the dedup cache is consulted after
    /// any concurrent record for the same instance has finished
    async fn record_serialized(
        &self,
        request: &IncidentRequest,
        lookup_first: bool,
        retry: RetryPolicy,
    ) -> Result<IncidentRef, RecordError> {
        let lock = self
            .instance_locks
            .entry(request.instance_id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let key = self.key_for(request);

        if let Some(incident) = self.cached(request, &key) {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            self.metrics.inc_incidents_suppressed();
            info!(
                instance_id = %request.instance_id,
                incident = %incident,
                "Incident already recorded, suppressing duplicate"
            );
            return Ok(incident);
        }

        let fields = IncidentFields::for_request(request, key.clone());
        let incident = self.create_with_retry(&fields, lookup_first, retry).await?;

        self.metrics.inc_incidents_recorded();
        let recent = RecentIncident {
            key,
            incident: incident.clone(),
            triggered_at: request.triggered_at,
        };
        // A late recovery of an older event must not displace a newer one
        match self.recent.entry(request.instance_id.clone()) {
            Entry::Occupied(mut slot) => {
                if slot.get().triggered_at <= request.triggered_at {
                    slot.insert(recent);
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(recent);
            }
        }

        Ok(incident)
    }

    /// Same event, or another event triggered within the dedup window of the
    /// last recorded one
    fn cached(&self, request: &IncidentRequest, key: &str) -> Option<IncidentRef> {
        let recent = self.recent.get(&request.instance_id)?;
        if recent.key == key
            || trigger_gap(request.triggered_at, recent.triggered_at) < self.config.dedup_window
        {
            Some(recent.incident.clone())
        } else {
            None
        }
    }

    async fn create_with_retry(
        &self,
        fields: &IncidentFields,
        lookup_first: bool,
        retry: RetryPolicy,
    ) -> Result<IncidentRef, RecordError> {
        let mut ack_uncertain = lookup_first;
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            // A previous attempt may have been persisted without us seeing
            // the acknowledgement
            if ack_uncertain {
                if let Some(existing) = self.lookup(&fields.idempotency_key).await {
                    info!(
                        instance_id = %fields.instance_id,
                        incident = %existing,
                        "Found incident from earlier attempt"
                    );
                    return Ok(existing);
                }
            }

            let result = match tokio::time::timeout(
                self.config.call_timeout,
                self.sink.create_incident(fields),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(RecordError::Transient(format!(
                    "incident creation timed out after {}ms",
                    self.config.call_timeout.as_millis()
                ))),
            };

            match result {
                Ok(incident) => return Ok(incident),
                Err(e) if e.is_retriable() && retry.should_retry(attempt) => {
                    let delay = retry.delay_after(attempt);
                    warn!(
                        instance_id = %fields.instance_id,
                        attempt = attempt,
                        max_attempts = retry.max_attempts,
                        backoff_ms = delay.as_millis() as u64,
                        error = %e,
                        "Incident creation failed, retrying"
                    );
                    ack_uncertain = true;
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    self.metrics.inc_record_failures();
                    return Err(e);
                }
            }
        }
    }

    async fn lookup(&self, key: &str) -> Option<IncidentRef> {
        match tokio::time::timeout(self.config.call_timeout, self.sink.find_incident(key)).await {
            Ok(Ok(found)) => found,
            Ok(Err(e)) => {
                debug!(error = %e, "Incident lookup failed, creating instead");
                None
            }
            Err(_) => {
                debug!("Incident lookup timed out, creating instead");
                None
            }
        }
    }

    fn enqueue(&self, entry: PendingIncident) {
        let instance_id = entry.request.instance_id.clone();
        let (evicted, len) = {
            let mut pending = self.lock_pending();
            let evicted = pending.push(entry);
            (evicted, pending.len())
        };

        self.metrics.set_pending_incidents(len as i64);

        if let Some(evicted) = evicted {
            error!(
                event = "incident_dropped",
                instance_id = %evicted.request.instance_id,
                triggered_at = %evicted.request.triggered_at.to_rfc3339(),
                cpu_percent = evicted.request.cpu_percent,
                memory_percent = evicted.request.memory_percent,
                attempts = evicted.attempts,
                "Pending incident queue full, oldest remediation evicted without a ticket"
            );
        }

        warn!(
            event = "incident_queued",
            instance_id = %instance_id,
            pending = len,
            "Incident queued for a later recording attempt"
        );
        self.persist_pending();
    }

    fn escalate(&self, request: &IncidentRequest, e: &RecordError) {
        error!(
            event = "incident_record_failed",
            instance_id = %request.instance_id,
            display_name = %request.display_name,
            triggered_at = %request.triggered_at.to_rfc3339(),
            cpu_percent = request.cpu_percent,
            memory_percent = request.memory_percent,
            error = %e,
            "Incident rejected by provider; remediation needs a manual ticket"
        );
    }

    fn persist_pending(&self) {
        let pending = self.lock_pending();
        self.metrics.set_pending_incidents(pending.len() as i64);
        if let Err(e) = pending.flush() {
            warn!(error = %e, "Failed to persist pending incidents");
        }
    }

    fn lock_pending(&self) -> MutexGuard<'_, PendingIncidents> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
