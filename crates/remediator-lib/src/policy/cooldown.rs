//! Per-instance remediation cooldown

use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Tracks when each instance was last remediated
#[derive(Debug)]
pub struct CooldownTracker {
    window: Duration,
    last_remediated: DashMap<String, Instant>,
}

impl CooldownTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_remediated: DashMap::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Start the cooldown window for an instance
    pub fn arm(&self, instance_id: &str) {
        self.last_remediated
            .insert(instance_id.to_string(), Instant::now());

        // Drop expired entries so instances that left the fleet don't accumulate
        let window = self.window;
        self.last_remediated
            .retain(|_, at| at.elapsed() < window);
    }

    /// Time left in the cooldown window, if the instance is still cooling down
    pub fn remaining(&self, instance_id: &str) -> Option<Duration> {
        let at = self.last_remediated.get(instance_id)?;
        let elapsed = at.elapsed();
        if elapsed < self.window {
            Some(self.window - elapsed)
        } else {
            None
        }
    }

    pub fn is_cooling_down(&self, instance_id: &str) -> bool {
        self.remaining(instance_id).is_some()
    }

    /// Number of instances currently tracked
    pub fn len(&self) -> usize {
        self.last_remediated.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_remediated.is_empty()
    }
}
