pub mod range;
pub mod sqlite;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::domain::{
    CacheEntry, CancelToken, Freshness, NormalizedEvent, SourceFailure, SourceState, SyncRun,
    Validators,
};

pub use range::{Cursor, EventRange, EventRangeIter, RangeQuery};
pub use sqlite::SqliteStore;

/// Configuration for the local cache database
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database file; defaults to the platform data directory
    pub path: Option<String>,

    /// Keep the raw ICS body alongside the batch it produced (default: false)
    pub retain_raw: bool,

    /// Sync run records kept for diagnostics (default: 50)
    pub run_history: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            retain_raw: false,
            run_history: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertMode {
    /// Rows of the source missing from the batch are removed.
    #[default]
    FullReplace,
    /// Rows are merged by stable id; nothing is removed.
    IncrementalMerge,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("transaction failure: {0}")]
    Transaction(#[from] rusqlite::Error),

    #[error("migration failed: {0}")]
    Migration(String),

    #[error("store lock poisoned")]
    Poisoned,

    #[error("batch aborted: sync was cancelled")]
    Aborted,

    #[error("invalid row: {0}")]
    InvalidRow(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Everything one successful fetch+parse commits for a source.
#[derive(Debug, Clone)]
pub struct EventBatch {
    pub source_id: String,
    pub events: Vec<NormalizedEvent>,
    pub fetched_at: DateTime<Utc>,
    pub ttl: Duration,
    /// Validators that advance together with this batch.
    pub validators: Validators,
    /// Raw body, stored only when raw retention is enabled.
    pub raw: Option<Vec<u8>>,
}

impl EventBatch {
    pub fn new(
        source_id: &str,
        events: Vec<NormalizedEvent>,
        fetched_at: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            source_id: source_id.to_string(),
            events,
            fetched_at,
            ttl,
            validators: Validators::default(),
            raw: None,
        }
    }

    pub fn with_validators(mut self, validators: Validators) -> Self {
        self.validators = validators;
        self
    }

    pub fn with_raw(mut self, raw: Vec<u8>) -> Self {
        self.raw = Some(raw);
        self
    }

    pub fn batch_id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.source_id.as_bytes());
        hasher.update([0x1f]);
        hasher.update(self.fetched_at.to_rfc3339().as_bytes());
        hasher.update([0x1f]);
        hasher.update(
            self.validators
                .content_hash
                .as_deref()
                .unwrap_or_default()
                .as_bytes(),
        );
        hex::encode(hasher.finalize())
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        expiry(self.fetched_at, self.ttl)
    }
}

/// `fetched_at + ttl`, saturating so expiry never precedes the fetch.
pub fn expiry(fetched_at: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| fetched_at.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertSummary {
    pub inserted: usize,
    pub updated: usize,
    pub removed: usize,
}

/// Durable event cache.
///
/// Writers are serialized; readers see the latest committed batch and never
/// a partially written one.
pub trait Store {
    // Write path
    fn upsert_batch(
        &self,
        batch: &EventBatch,
        mode: UpsertMode,
        cancel: Option<&CancelToken>,
    ) -> Result<UpsertSummary, StoreError>;
    fn extend_expiry(
        &self,
        source_id: &str,
        fetched_at: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<usize, StoreError>;
    fn record_failure(&self, source_id: &str, failure: &SourceFailure) -> Result<(), StoreError>;
    fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;
    fn record_sync_run(&self, run: &SyncRun) -> Result<(), StoreError>;

    // Read path
    fn events_page(
        &self,
        query: &RangeQuery,
        after: Option<&Cursor>,
        limit: usize,
    ) -> Result<Vec<NormalizedEvent>, StoreError>;
    fn events_for_source(&self, source_id: &str) -> Result<Vec<CacheEntry>, StoreError>;
    fn event_count(&self) -> Result<usize, StoreError>;
    fn freshness(&self, source_id: &str) -> Result<Freshness, StoreError>;
    fn source_state(&self, source_id: &str) -> Result<Option<SourceState>, StoreError>;
    fn source_states(&self) -> Result<Vec<SourceState>, StoreError>;
    fn recent_sync_runs(&self, limit: usize) -> Result<Vec<SyncRun>, StoreError>;
    fn raw_payload(&self, source_id: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Events overlapping `[start, end)`, ordered by start time.
    fn events_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        include_cancelled: bool,
    ) -> EventRange<'_, Self>
    where
        Self: Sized,
    {
        EventRange::new(
            self,
            RangeQuery {
                start,
                end,
                include_cancelled,
            },
        )
    }
}
