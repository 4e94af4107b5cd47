use crate::error::SchedulerError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Worker pool sizing and crash recovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of worker threads
    pub workers: usize,
    /// Delay before a crashed worker is replaced
    pub respawn_backoff_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            respawn_backoff_ms: 250,
        }
    }
}

impl SchedulerConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn respawn_backoff(&self) -> Duration {
        Duration::from_millis(self.respawn_backoff_ms)
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.workers == 0 {
            return Err(SchedulerError::InvalidConfig("workers must be at least 1".into()));
        }
        Ok(())
    }
}

/// Half the logical cores, between 1 and 4. Each worker already fans out over rayon.
pub fn default_workers() -> usize {
    (num_cpus::get() / 2).clamp(1, 4)
}
