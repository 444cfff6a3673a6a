//! Job manager configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for the lifecycle engine and its owning actor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// How long a batch stays open before it is committed.
    pub batch_timeout_ms: u64,
    /// Maximum outstanding alloc requests at the scheduler (None = unlimited).
    pub alloc_limit: Option<usize>,
    /// Number of inactive jobs retained for queries after they are reaped.
    pub inactive_num_limit: usize,
    /// Topic for state-transition announcements.
    pub state_topic: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            batch_timeout_ms: 10,
            alloc_limit: None,
            inactive_num_limit: 1000,
            state_topic: "job-state".to_string(),
        }
    }
}

impl ManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the batch window.
    pub fn with_batch_timeout_ms(mut self, ms: u64) -> Self {
        self.batch_timeout_ms = ms;
        self
    }

    /// Limit outstanding alloc requests.
    pub fn with_alloc_limit(mut self, limit: usize) -> Self {
        self.alloc_limit = Some(limit);
        self
    }

    /// Set the inactive retention limit.
    pub fn with_inactive_num_limit(mut self, limit: usize) -> Self {
        self.inactive_num_limit = limit;
        self
    }

    /// Set the state-transition topic.
    pub fn with_state_topic(mut self, topic: impl Into<String>) -> Self {
        self.state_topic = topic.into();
        self
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }
}
