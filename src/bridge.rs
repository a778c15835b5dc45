//! Synchronous entry points into the async sync engine.
//!
//! The bridge owns one multi-threaded runtime for its whole lifetime. Calls
//! made from plain threads block on it directly; calls made from inside
//! another runtime hand the work to it and wait on a channel, so no runtime
//! is ever nested.

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::runtime::{Handle, Runtime};
use tracing::{debug, info, warn};

use crate::app::context::read_view;
use crate::app::{AlmanacError, Result};
use crate::domain::{CancelToken, EventsView, SyncRun, SyncTargets};
use crate::store::Store;
use crate::sync::SyncCoordinator;

/// Configuration for synchronous callers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Default deadline for a blocking refresh (default: 30)
    pub deadline_secs: u64,

    /// Threads of the bridge's own runtime (default: 2)
    pub worker_threads: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            deadline_secs: 30,
            worker_threads: 2,
        }
    }
}

impl BridgeConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }
}

#[derive(Debug)]
pub enum RefreshOutcome {
    Completed(SyncRun),
    /// The deadline passed first. The run was cancelled and readers keep the
    /// last committed cache state.
    TimedOut {
        deadline: Duration,
        cached_events: usize,
    },
}

pub struct SyncBridge<S: Store + Send + Sync + 'static> {
    runtime: Option<Runtime>,
    coordinator: Arc<SyncCoordinator<S>>,
    deadline: Duration,
}

impl<S: Store + Send + Sync + 'static> SyncBridge<S> {
    pub fn new(coordinator: Arc<SyncCoordinator<S>>, config: &BridgeConfig) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.worker_threads.max(1))
            .thread_name("almanac-sync")
            .enable_all()
            .build()?;
        debug!(threads = config.worker_threads, "bridge runtime started");

        Ok(Self {
            runtime: Some(runtime),
            coordinator,
            deadline: config.deadline(),
        })
    }

    fn runtime(&self) -> Result<&Runtime> {
        self.runtime
            .as_ref()
            .ok_or_else(|| AlmanacError::Other("bridge runtime already shut down".into()))
    }

    /// Run a sync and wait for it, at most `deadline` (or the configured default).
    ///
    /// On timeout the run is cancelled; if anything is cached the caller gets
    /// [`RefreshOutcome::TimedOut`], otherwise [`AlmanacError::DeadlineExceeded`].
    pub fn refresh_sync(
        &self,
        targets: SyncTargets,
        deadline: Option<Duration>,
    ) -> Result<RefreshOutcome> {
        let deadline = deadline.unwrap_or(self.deadline);
        let runtime = self.runtime()?;

        let cancel = CancelToken::new();
        let coordinator = self.coordinator.clone();
        let token = cancel.clone();
        let work = async move { coordinator.run_with_cancel(targets, &token).await };

        let finished = if Handle::try_current().is_ok() {
            debug!("caller is inside a runtime, handing refresh to the bridge runtime");
            let (tx, rx) = mpsc::sync_channel(1);
            runtime.spawn(async move {
                let _ = tx.send(work.await);
            });
            rx.recv_timeout(deadline).ok()
        } else {
            runtime
                .block_on(async { tokio::time::timeout(deadline, work).await })
                .ok()
        };

        if let Some(run) = finished {
            return Ok(RefreshOutcome::Completed(run));
        }

        cancel.cancel();
        let cached_events = self.coordinator.store().event_count()?;
        warn!(
            deadline_ms = deadline.as_millis() as u64,
            cached_events, "refresh deadline exceeded, run cancelled"
        );
        if cached_events == 0 {
            return Err(AlmanacError::DeadlineExceeded(deadline));
        }
        info!("serving last committed cache state");
        Ok(RefreshOutcome::TimedOut {
            deadline,
            cached_events,
        })
    }

    /// Read events overlapping `[start, end)` from the last committed state.
    pub fn read_sync(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<EventsView> {
        read_view(
            self.coordinator.store().as_ref(),
            self.coordinator.sources(),
            start,
            end,
        )
    }
}

impl<S: Store + Send + Sync + 'static> Drop for SyncBridge<S> {
    fn drop(&mut self) {
        // A blocking shutdown would panic when dropped inside another runtime.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
            debug!("bridge runtime shut down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::{CircuitBreakerConfig, CircuitBreakers};
    use crate::parser::FeedParser;
    use crate::store::SqliteStore;
    use crate::sync::testing::{feed, horizon, source, Reply, ScriptedFetcher};
    use crate::sync::SyncConfig;

    fn bridge(store: &Arc<SqliteStore>, fetcher: ScriptedFetcher) -> SyncBridge<SqliteStore> {
        let breakers = Arc::new(CircuitBreakers::new(CircuitBreakerConfig {
            failure_threshold: 3,
            cooldown: Duration::from_secs(300),
        }));
        let coordinator = SyncCoordinator::new(
            store.clone(),
            Arc::new(fetcher),
            breakers,
            FeedParser::default(),
            vec![source("a")],
            &SyncConfig::default(),
        );
        SyncBridge::new(Arc::new(coordinator), &BridgeConfig::default()).unwrap()
    }

    fn slow(delay_ms: u64, events: usize) -> ScriptedFetcher {
        ScriptedFetcher::new()
            .with_delay(Duration::from_millis(delay_ms))
            .script("a", vec![Reply::Body(feed("a", events))])
    }

    #[test]
    fn test_refresh_from_plain_thread() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let bridge = bridge(&store, slow(0, 3));

        let outcome = bridge.refresh_sync(SyncTargets::All, None).unwrap();
        match outcome {
            RefreshOutcome::Completed(run) => assert!(run.aggregate_success),
            other => panic!("unexpected {:?}", other),
        }

        let (start, end) = horizon();
        let view = bridge.read_sync(start, end).unwrap();
        assert_eq!(view.events.len(), 3);
        assert!(!view.stale);
    }

    #[tokio::test]
    async fn test_refresh_inside_runtime_does_not_nest() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let bridge = bridge(&store, slow(50, 2));

        let outcome = bridge
            .refresh_sync(SyncTargets::All, Some(Duration::from_secs(5)))
            .unwrap();
        assert!(matches!(outcome, RefreshOutcome::Completed(_)));
        assert_eq!(store.event_count().unwrap(), 2);
        // Dropped here, inside the test runtime.
    }

    #[tokio::test]
    async fn test_timeout_falls_back_to_cache() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        bridge(&store, slow(0, 2))
            .refresh_sync(SyncTargets::All, None)
            .unwrap();

        let bridge = bridge(&store, slow(500, 5));
        let outcome = bridge
            .refresh_sync(SyncTargets::All, Some(Duration::from_millis(50)))
            .unwrap();
        match outcome {
            RefreshOutcome::TimedOut { cached_events, .. } => assert_eq!(cached_events, 2),
            other => panic!("unexpected {:?}", other),
        }

        // The cancelled run never commits.
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(store.event_count().unwrap(), 2);
    }

    #[test]
    fn test_timeout_without_cache_is_an_error() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let bridge = bridge(&store, slow(500, 1));
        let err = bridge
            .refresh_sync(SyncTargets::All, Some(Duration::from_millis(20)))
            .unwrap_err();
        assert!(matches!(err, AlmanacError::DeadlineExceeded(_)));
    }

    #[test]
    fn test_read_before_any_sync_is_no_data() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let bridge = bridge(&store, slow(0, 1));
        let (start, end) = horizon();
        assert!(matches!(
            bridge.read_sync(start, end),
            Err(AlmanacError::NoData)
        ));
    }

    #[test]
    fn test_repeated_refreshes_reuse_one_runtime() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let bridge = bridge(&store, slow(0, 1));
        for _ in 0..20 {
            let outcome = bridge.refresh_sync(SyncTargets::All, None).unwrap();
            assert!(matches!(outcome, RefreshOutcome::Completed(_)));
        }
        assert_eq!(store.recent_sync_runs(100).unwrap().len(), 20);
    }
}
