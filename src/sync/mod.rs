//! Synchronization across configured sources.
//!
//! The [`SyncCoordinator`] runs fetch → parse → store for every targeted
//! source on a bounded worker pool and records the result as a
//! [`SyncRun`](crate::domain::SyncRun).

pub mod coordinator;
pub mod retry;

#[cfg(test)]
pub(crate) mod testing;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::store::UpsertMode;

pub use coordinator::SyncCoordinator;
pub use retry::RetryPolicy;

/// Configuration for sync runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Sources processed in parallel (default: 4)
    pub workers: usize,

    /// Fetch attempts per source for transient failures (default: 3)
    pub max_attempts: u32,

    /// Delay before the first retry, doubled on each further one (default: 500)
    pub initial_backoff_ms: u64,

    /// Upper bound on a single retry delay (default: 8000)
    pub max_backoff_ms: u64,

    /// How a batch replaces a source's rows (default: full_replace)
    pub mode: UpsertMode,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 8000,
            mode: UpsertMode::FullReplace,
        }
    }
}

impl SyncConfig {
    pub fn retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms.max(self.initial_backoff_ms)),
        }
    }
}
