//! Queue of incidents whose recording failed
//!
//! Entries are retried at the start of each cycle. When a persistence path is
//! configured the queue is written to disk on every change (temp file +
//! rename) and reloaded at startup, so a restart of the remediator does not
//! lose remediations that still need a ticket.

use crate::models::IncidentRequest;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Default maximum number of queued incidents
pub const DEFAULT_MAX_PENDING: usize = 10_000;

/// Configuration for the pending queue
#[derive(Debug, Clone)]
pub struct PendingConfig {
    pub max_entries: usize,
    pub persistence_path: Option<PathBuf>,
}

impl Default for PendingConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_PENDING,
            persistence_path: None,
        }
    }
}

/// An incident waiting for a later recording attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingIncident {
    pub request: IncidentRequest,
    pub queued_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: String,
}

impl PendingIncident {
    pub fn new(request: IncidentRequest, last_error: impl Into<String>) -> Self {
        Self {
            request,
            queued_at: Utc::now(),
            attempts: 1,
            last_error: last_error.into(),
        }
    }
}

/// FIFO queue of pending incidents
#[derive(Debug)]
pub struct PendingIncidents {
    queue: VecDeque<PendingIncident>,
    config: PendingConfig,
}

impl PendingIncidents {
    pub fn new(config: PendingConfig) -> Self {
        Self {
            queue: VecDeque::new(),
            config,
        }
    }

    /// Create the queue and reload anything persisted by a previous run
    pub fn with_persistence(path: PathBuf, max_entries: usize) -> Self {
        let mut pending = Self::new(PendingConfig {
            max_entries,
            persistence_path: Some(path.clone()),
        });

        if path.exists() {
            if let Err(e) = pending.load_from_disk() {
                warn!(error = %e, path = %path.display(), "Failed to load pending incidents, starting empty");
            }
        }

        pending
    }

    /// Queue an incident; returns the oldest entry if it had to be evicted
    pub fn push(&mut self, incident: PendingIncident) -> Option<PendingIncident> {
        let evicted = if self.queue.len() >= self.config.max_entries {
            self.queue.pop_front()
        } else {
            None
        };

        self.queue.push_back(incident);
        evicted
    }

    /// Take up to `limit` incidents from the front of the queue
    pub fn take_front(&mut self, limit: usize) -> Vec<PendingIncident> {
        let n = limit.min(self.queue.len());
        self.queue.drain(..n).collect()
    }

    /// Put incidents that were taken but not attempted back at the front,
    /// keeping their order
    pub fn restore_front(&mut self, entries: Vec<PendingIncident>) {
        for entry in entries.into_iter().rev() {
            self.queue.push_front(entry);
        }
    }

    pub fn peek(&self, limit: usize) -> Vec<&PendingIncident> {
        self.queue.iter().take(limit).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.config.max_entries
    }

    /// Persist the queue if a path is configured
    pub fn flush(&self) -> Result<()> {
        if let Some(ref path) = self.config.persistence_path {
            self.save_to_disk(path)?;
            debug!(path = %path.display(), entries = self.queue.len(), "Pending incidents flushed to disk");
        }
        Ok(())
    }

    fn save_to_disk(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }

        let entries: Vec<&PendingIncident> = self.queue.iter().collect();
        let json = serde_json::to_vec(&entries).context("Failed to serialize pending incidents")?;

        let temp_path = path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .with_context(|| format!("Failed to create temp file {:?}", temp_path))?;

        file.write_all(&json)
            .context("Failed to write pending incidents")?;
        file.sync_all().context("Failed to sync pending incidents file")?;

        std::fs::rename(&temp_path, path)
            .with_context(|| format!("Failed to rename {:?} to {:?}", temp_path, path))?;

        Ok(())
    }

    fn load_from_disk(&mut self) -> Result<()> {
        let path = self
            .config
            .persistence_path
            .clone()
            .ok_or_else(|| anyhow::anyhow!("No persistence path configured"))?;

        let mut file =
            File::open(&path).with_context(|| format!("Failed to open pending file {:?}", path))?;

        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .context("Failed to read pending file")?;

        let entries: Vec<PendingIncident> =
            serde_json::from_slice(&data).context("Failed to deserialize pending incidents")?;

        for entry in entries {
            self.push(entry);
        }

        info!(path = %path.display(), entries = self.queue.len(), "Loaded pending incidents from disk");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn request(id: &str) -> IncidentRequest {
        IncidentRequest {
            instance_id: id.to_string(),
            display_name: id.to_string(),
            cpu_percent: 95.0,
            memory_percent: 40.0,
            triggered_at: Utc::now(),
            instance_type: None,
            availability_zone: None,
        }
    }

    #[test]
    fn test_take_and_restore_front() {
        let mut pending = PendingIncidents::new(PendingConfig::default());

        for id in ["i-1", "i-2", "i-3"] {
            pending.push(PendingIncident::new(request(id), "timeout"));
        }

        let taken = pending.take_front(2);
        assert_eq!(taken.len(), 2);
        assert_eq!(taken[0].request.instance_id, "i-1");
        assert_eq!(pending.len(), 1);

        pending.restore_front(taken);
        let order: Vec<&str> = pending
            .peek(3)
            .iter()
            .map(|p| p.request.instance_id.as_str())
            .collect();
        assert_eq!(order, vec!["i-1", "i-2", "i-3"]);

        assert_eq!(pending.take_front(10).len(), 3);
        assert!(pending.is_empty());
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut pending = PendingIncidents::new(PendingConfig {
            max_entries: 2,
            persistence_path: None,
        });

        assert!(pending.push(PendingIncident::new(request("i-1"), "e")).is_none());
        assert!(pending.push(PendingIncident::new(request("i-2"), "e")).is_none());
        let evicted = pending.push(PendingIncident::new(request("i-3"), "e")).unwrap();

        assert_eq!(evicted.request.instance_id, "i-1");
        assert_eq!(pending.len(), 2);
        assert_eq!(pending.peek(1)[0].request.instance_id, "i-2");
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("pending.json");

        {
            let mut pending = PendingIncidents::with_persistence(path.clone(), 100);
            pending.push(PendingIncident::new(request("i-1"), "503"));
            pending.push(PendingIncident::new(request("i-2"), "503"));
            pending.flush().unwrap();
        }

        assert!(path.exists());
        let reloaded = PendingIncidents::with_persistence(path, 100);
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.peek(2)[1].request.instance_id, "i-2");
        assert_eq!(reloaded.peek(1)[0].last_error, "503");
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pending.json");
        std::fs::write(&path, b"not json").unwrap();

        let pending = PendingIncidents::with_persistence(path, 100);
        assert!(pending.is_empty());
    }
}
