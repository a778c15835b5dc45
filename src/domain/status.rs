use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::{CircuitState, NormalizedEvent};

/// Freshness of one source's cached rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Freshness {
    pub last_success_at: Option<DateTime<Utc>>,
    pub ttl: Duration,
    pub is_stale: bool,
}

impl Freshness {
    pub fn evaluate(last_success_at: Option<DateTime<Utc>>, ttl: Duration, now: DateTime<Utc>) -> Self {
        let is_stale = match last_success_at {
            Some(at) => chrono::Duration::from_std(ttl)
                .ok()
                .and_then(|ttl| at.checked_add_signed(ttl))
                .is_some_and(|expires| expires < now),
            None => true,
        };
        Self {
            last_success_at,
            ttl,
            is_stale,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceStatus {
    pub source_id: String,
    pub healthy: bool,
    pub circuit_state: CircuitState,
    pub consecutive_failures: u32,
    pub auth_blocked: bool,
    pub last_success_at: Option<DateTime<Utc>>,
    pub is_stale: bool,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub sources: Vec<SourceStatus>,
    /// At least one configured source is past its TTL.
    pub is_stale: bool,
}

/// Events returned to readers, flagged when any source is stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventsView {
    pub events: Vec<NormalizedEvent>,
    pub stale: bool,
}
