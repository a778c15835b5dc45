use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which sources a sync run covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncTargets {
    All,
    Only(Vec<String>),
}

/// `"all"` or a single source id, as accepted by `trigger_refresh`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshTarget {
    All,
    Source(String),
}

impl FromStr for RefreshTarget {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("all") {
            Ok(RefreshTarget::All)
        } else {
            Ok(RefreshTarget::Source(s.to_string()))
        }
    }
}

impl From<RefreshTarget> for SyncTargets {
    fn from(target: RefreshTarget) -> Self {
        match target {
            RefreshTarget::All => SyncTargets::All,
            RefreshTarget::Source(id) => SyncTargets::Only(vec![id]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OutcomeStatus {
    Updated {
        inserted: usize,
        updated: usize,
        removed: usize,
        warnings: usize,
    },
    Unchanged,
    Failed {
        error: String,
    },
    Skipped {
        reason: String,
    },
    Cancelled,
}

/// What happened to one source during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceOutcome {
    pub source_id: String,
    pub status: OutcomeStatus,
    pub attempts: u32,
    pub elapsed_ms: u64,
}

impl SourceOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(
            self.status,
            OutcomeStatus::Updated { .. } | OutcomeStatus::Unchanged
        )
    }

    /// `"<source_id>: <summary>"` for failed outcomes.
    pub fn error_summary(&self) -> Option<String> {
        match &self.status {
            OutcomeStatus::Failed { error } => Some(format!("{}: {}", self.source_id, error)),
            _ => None,
        }
    }
}

/// Record of one coordinator invocation. Immutable once finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRun {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcomes: Vec<SourceOutcome>,
    pub aggregate_success: bool,
    /// No targeted source succeeded; readers are served last-known-good data.
    pub stale: bool,
    pub cancelled: bool,
    pub errors: Vec<String>,
}

impl SyncRun {
    pub fn outcome(&self, source_id: &str) -> Option<&SourceOutcome> {
        self.outcomes.iter().find(|o| o.source_id == source_id)
    }

    pub fn succeeded_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.succeeded()).count()
    }
}

impl fmt::Display for SyncRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} sources succeeded ({:.1}s){}",
            self.succeeded_count(),
            self.outcomes.len(),
            (self.finished_at - self.started_at).num_milliseconds() as f64 / 1000.0,
            if self.stale { ", stale" } else { "" }
        )
    }
}
