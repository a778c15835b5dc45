use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

use crate::domain::{
    CancelToken, OutcomeStatus, PayloadContent, RawFeedPayload, SourceConfig, SourceFailure,
    SourceOutcome, SourceState, SyncRun, SyncTargets, Validators,
};
use crate::fetcher::{CircuitBreakers, FetchError, Fetcher, GuardedFetcher};
use crate::parser::{FeedParser, ParseError};
use crate::store::{EventBatch, Store, StoreError, UpsertMode};
use crate::sync::{RetryPolicy, SyncConfig};

/// Why one source's cycle stopped short.
#[derive(Debug, Error)]
enum StageError {
    #[error("{0}")]
    Fetch(#[from] FetchError),

    #[error("{0}")]
    Parse(#[from] ParseError),

    #[error("{0}")]
    Store(StoreError),

    #[error("store task failed: {0}")]
    Join(#[from] JoinError),

    #[error("auth failure (blocked until reconfigured)")]
    AuthBlocked,

    #[error("cancelled")]
    Cancelled,
}

impl From<StoreError> for StageError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Aborted => StageError::Cancelled,
            other => StageError::Store(other),
        }
    }
}

/// Orchestrates fetch → parse → store across sources.
///
/// Sources run concurrently on a pool of `workers` permits; a source that is
/// already in flight (from an overlapping run) is skipped rather than queued.
pub struct SyncCoordinator<S> {
    pipeline: Arc<Pipeline<S>>,
    sources: Vec<SourceConfig>,
    semaphore: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl<S: Store + Send + Sync + 'static> SyncCoordinator<S> {
    pub fn new(
        store: Arc<S>,
        fetcher: Arc<dyn Fetcher + Send + Sync>,
        breakers: Arc<CircuitBreakers>,
        parser: FeedParser,
        sources: Vec<SourceConfig>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            pipeline: Arc::new(Pipeline {
                store,
                fetcher: GuardedFetcher::new(fetcher, breakers),
                parser,
                retry: config.retry(),
                mode: config.mode,
            }),
            sources,
            semaphore: Arc::new(Semaphore::new(config.workers.max(1))),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn sources(&self) -> &[SourceConfig] {
        &self.sources
    }

    pub fn store(&self) -> &Arc<S> {
        &self.pipeline.store
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakers> {
        self.pipeline.fetcher.breakers()
    }

    /// Load persisted circuit state into the breaker registry.
    pub fn restore_breakers(&self) -> Result<usize, StoreError> {
        let states = self.pipeline.store.source_states()?;
        for state in &states {
            self.breakers().restore(
                &state.source_id,
                state.circuit_state,
                state.consecutive_failures,
            );
        }
        Ok(states.len())
    }

    pub async fn run(&self, targets: SyncTargets) -> SyncRun {
        self.run_with_cancel(targets, &CancelToken::new()).await
    }

    pub async fn run_with_cancel(&self, targets: SyncTargets, cancel: &CancelToken) -> SyncRun {
        let started_at = Utc::now();
        let (selected, order, mut outcomes) = self.resolve(&targets);
        let targeted: Vec<String> = selected.iter().map(|s| s.id.clone()).collect();

        let mut handles = Vec::with_capacity(selected.len());
        for source in selected {
            let Some(guard) = InFlightGuard::acquire(&self.in_flight, &source.id) else {
                debug!(source = %source.id, "already in flight, skipping");
                outcomes.push(outcome(
                    &source.id,
                    OutcomeStatus::Skipped {
                        reason: "already in flight".into(),
                    },
                    0,
                    Instant::now(),
                ));
                continue;
            };

            let pipeline = self.pipeline.clone();
            let semaphore = self.semaphore.clone();
            let cancel = cancel.clone();
            let source_id = source.id.clone();

            let handle = tokio::spawn(async move {
                let _guard = guard;
                let queued = Instant::now();
                let _permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return outcome(&source.id, OutcomeStatus::Cancelled, 0, queued);
                    }
                    permit = semaphore.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => {
                            let status = OutcomeStatus::Failed { error: "worker pool closed".into() };
                            return outcome(&source.id, status, 0, queued);
                        }
                    },
                };

                pipeline.sync_source(&source, &cancel).await
            });

            handles.push((source_id, handle));
        }

        for (source_id, handle) in handles {
            match handle.await {
                Ok(result) => outcomes.push(result),
                Err(e) => {
                    error!(source = %source_id, "sync task failed: {}", e);
                    let status = OutcomeStatus::Failed {
                        error: format!("task failed: {}", e),
                    };
                    outcomes.push(outcome(&source_id, status, 0, Instant::now()));
                }
            }
        }

        outcomes.sort_by_key(|o| order.iter().position(|id| *id == o.source_id));
        self.finish(started_at, &targeted, outcomes, cancel)
    }

    /// Split targets into known sources and ready-made outcomes for unknown ids.
    fn resolve(&self, targets: &SyncTargets) -> (Vec<SourceConfig>, Vec<String>, Vec<SourceOutcome>) {
        match targets {
            SyncTargets::All => {
                let order = self.sources.iter().map(|s| s.id.clone()).collect();
                (self.sources.clone(), order, Vec::new())
            }
            SyncTargets::Only(ids) => {
                let mut seen = HashSet::new();
                let mut selected = Vec::new();
                let mut order = Vec::new();
                let mut unknown = Vec::new();
                for id in ids.iter().filter(|id| seen.insert(id.as_str())) {
                    order.push(id.clone());
                    match self.sources.iter().find(|s| &s.id == id) {
                        Some(source) => selected.push(source.clone()),
                        None => {
                            warn!(source = %id, "refresh requested for unknown source");
                            let status = OutcomeStatus::Failed {
                                error: "unknown source".into(),
                            };
                            unknown.push(outcome(id, status, 0, Instant::now()));
                        }
                    }
                }
                (selected, order, unknown)
            }
        }
    }

    fn finish(
        &self,
        started_at: DateTime<Utc>,
        targeted: &[String],
        outcomes: Vec<SourceOutcome>,
        cancel: &CancelToken,
    ) -> SyncRun {
        let store = &self.pipeline.store;
        let any_success = outcomes.iter().any(SourceOutcome::succeeded);
        // Cached data within TTL keeps the run usable even if every fetch failed.
        let cache_usable = !targeted.is_empty()
            && targeted.iter().all(|id| match store.freshness(id) {
                Ok(freshness) => !freshness.is_stale,
                Err(e) => {
                    warn!(source = %id, "cannot read freshness: {}", e);
                    false
                }
            });

        let run = SyncRun {
            started_at,
            finished_at: Utc::now(),
            aggregate_success: any_success || outcomes.is_empty() || cache_usable,
            stale: !any_success && !outcomes.is_empty(),
            cancelled: cancel.is_cancelled(),
            errors: outcomes
                .iter()
                .filter_map(SourceOutcome::error_summary)
                .collect(),
            outcomes,
        };

        if let Err(e) = store.record_sync_run(&run) {
            error!("failed to record sync run: {}", e);
        }
        if run.stale {
            warn!(errors = ?run.errors, "sync run finished stale: {}", run);
        } else {
            info!("sync run finished: {}", run);
        }
        run
    }
}

/// Everything one source's cycle needs, shared by the worker tasks.
struct Pipeline<S> {
    store: Arc<S>,
    fetcher: GuardedFetcher,
    parser: FeedParser,
    retry: RetryPolicy,
    mode: UpsertMode,
}

impl<S: Store + Send + Sync + 'static> Pipeline<S> {
    async fn sync_source(&self, source: &SourceConfig, cancel: &CancelToken) -> SourceOutcome {
        let started = Instant::now();
        let mut attempts = 0;

        let status = match self.run_stages(source, cancel, &mut attempts).await {
            Ok(status) => status,
            Err(StageError::Cancelled) => {
                info!(source = %source.id, "sync cancelled, nothing committed");
                OutcomeStatus::Cancelled
            }
            Err(failure) => {
                let message = failure.to_string();
                warn!(source = %source.id, attempts, "sync failed: {}", message);
                self.record_failure(source, &failure, &message).await;
                OutcomeStatus::Failed { error: message }
            }
        };

        outcome(&source.id, status, attempts, started)
    }

    async fn run_stages(
        &self,
        source: &SourceConfig,
        cancel: &CancelToken,
        attempts: &mut u32,
    ) -> Result<OutcomeStatus, StageError> {
        let state = self
            .store
            .source_state(&source.id)?
            .unwrap_or_else(|| SourceState::new(&source.id));
        if state.is_auth_blocked(source) {
            return Err(StageError::AuthBlocked);
        }

        let payload = self
            .fetch_with_retry(source, &state.validators, cancel, attempts)
            .await?;
        if cancel.is_cancelled() {
            return Err(StageError::Cancelled);
        }

        if payload.is_unchanged() {
            let (id, fetched_at, ttl) = (source.id.clone(), payload.fetched_at, source.ttl);
            let touched = self
                .blocking(move |store| store.extend_expiry(&id, fetched_at, ttl))
                .await??;
            info!(source = %source.id, rows = touched, "feed unchanged, extended expiry");
            return Ok(OutcomeStatus::Unchanged);
        }

        let parsed = self.parser.parse(&payload)?;
        if cancel.is_cancelled() {
            return Err(StageError::Cancelled);
        }

        let warnings = parsed.warnings.len();
        let mode = if parsed.complete {
            self.mode
        } else {
            warn!(source = %source.id, "incomplete feed, merging without removing absent rows");
            UpsertMode::IncrementalMerge
        };
        let mut batch = EventBatch::new(&source.id, parsed.events, payload.fetched_at, source.ttl)
            .with_validators(payload.validators());
        if let PayloadContent::Bytes(body) = payload.content {
            batch = batch.with_raw(body);
        }

        let token = cancel.clone();
        let summary = self
            .blocking(move |store| store.upsert_batch(&batch, mode, Some(&token)))
            .await??;

        Ok(OutcomeStatus::Updated {
            inserted: summary.inserted,
            updated: summary.updated,
            removed: summary.removed,
            warnings,
        })
    }

    async fn fetch_with_retry(
        &self,
        source: &SourceConfig,
        previous: &Validators,
        cancel: &CancelToken,
        attempts: &mut u32,
    ) -> Result<RawFeedPayload, StageError> {
        loop {
            *attempts += 1;
            debug!(source = %source.id, attempt = *attempts, "fetching");

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StageError::Cancelled),
                result = self.fetcher.fetch(source, previous) => result,
            };

            match result {
                Ok(payload) => return Ok(payload),
                Err(e) if self.retry.should_retry(&e, *attempts) => {
                    let delay = self.retry.backoff(*attempts);
                    warn!(
                        source = %source.id,
                        attempt = *attempts,
                        delay_ms = delay.as_millis() as u64,
                        "fetch failed, retrying: {}",
                        e
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(StageError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn record_failure(&self, source: &SourceConfig, failure: &StageError, message: &str) {
        let (circuit_state, consecutive_failures) = self.fetcher.breakers().snapshot(&source.id);
        let auth_blocked = match failure {
            StageError::AuthBlocked | StageError::Fetch(FetchError::AuthFailure { .. }) => {
                Some(source.fingerprint())
            }
            _ => None,
        };
        let record = SourceFailure {
            attempted_at: Utc::now(),
            error: message.to_string(),
            circuit_state,
            consecutive_failures,
            auth_blocked,
        };

        let id = source.id.clone();
        match self
            .blocking(move |store| store.record_failure(&id, &record))
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(source = %source.id, "failed to record failure: {}", e),
            Err(e) => error!(source = %source.id, "failure bookkeeping task failed: {}", e),
        }
    }

    /// Run a store call off the async workers; commits may wait on the writer lock.
    async fn blocking<T, F>(&self, f: F) -> Result<Result<T, StoreError>, JoinError>
    where
        T: Send + 'static,
        F: FnOnce(&S) -> Result<T, StoreError> + Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(&store)).await
    }
}

fn outcome(source_id: &str, status: OutcomeStatus, attempts: u32, started: Instant) -> SourceOutcome {
    SourceOutcome {
        source_id: source_id.to_string(),
        status,
        attempts,
        elapsed_ms: started.elapsed().as_millis() as u64,
    }
}

/// Marks a source in flight until dropped.
struct InFlightGuard {
    set: Arc<Mutex<HashSet<String>>>,
    source_id: String,
}

impl InFlightGuard {
    fn acquire(set: &Arc<Mutex<HashSet<String>>>, source_id: &str) -> Option<Self> {
        let mut ids = set.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !ids.insert(source_id.to_string()) {
            return None;
        }
        Some(Self {
            set: set.clone(),
            source_id: source_id.to_string(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut ids = self.set.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        ids.remove(&self.source_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AuthConfig, CircuitState};
    use crate::fetcher::{CircuitBreakerConfig, TimeoutStage};
    use crate::store::SqliteStore;
    use crate::sync::testing::{feed, horizon, source, Reply, ScriptedFetcher};
    use std::time::Duration;

    fn config(workers: usize, max_attempts: u32) -> SyncConfig {
        SyncConfig {
            workers,
            max_attempts,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            mode: UpsertMode::FullReplace,
        }
    }

    fn coordinator(
        store: &Arc<SqliteStore>,
        fetcher: &Arc<ScriptedFetcher>,
        sources: Vec<SourceConfig>,
        config: SyncConfig,
    ) -> SyncCoordinator<SqliteStore> {
        let breakers = Arc::new(CircuitBreakers::new(CircuitBreakerConfig {
            failure_threshold: 3,
            cooldown: Duration::from_secs(300),
        }));
        SyncCoordinator::new(
            store.clone(),
            fetcher.clone(),
            breakers,
            FeedParser::default(),
            sources,
            &config,
        )
    }

    fn memory_store() -> Arc<SqliteStore> {
        Arc::new(SqliteStore::in_memory().unwrap())
    }

    fn cached(store: &SqliteStore, source_id: &str) -> Vec<String> {
        let (start, end) = horizon();
        store
            .events_in_range(start, end, false)
            .collect_all()
            .unwrap()
            .into_iter()
            .filter(|e| e.source_id == source_id)
            .map(|e| e.uid)
            .collect()
    }

    fn only(id: &str) -> SyncTargets {
        SyncTargets::Only(vec![id.to_string()])
    }

    #[tokio::test]
    async fn test_failure_isolation_keeps_last_known_good() {
        let store = memory_store();
        let first = Arc::new(ScriptedFetcher::new().script("B", vec![Reply::Body(feed("b", 2))]));
        coordinator(&store, &first, vec![source("B")], config(4, 3))
            .run(SyncTargets::All)
            .await;
        assert_eq!(cached(&store, "B").len(), 2);

        let second = Arc::new(
            ScriptedFetcher::new()
                .script("A", vec![Reply::Body(feed("a", 3))])
                .script(
                    "B",
                    vec![Reply::Fail(FetchError::Timeout {
                        stage: TimeoutStage::Read,
                    })],
                ),
        );
        let run = coordinator(&store, &second, vec![source("A"), source("B")], config(4, 3))
            .run(SyncTargets::All)
            .await;

        assert!(run.aggregate_success);
        assert!(!run.stale);
        assert_eq!(run.errors, vec!["B: timeout".to_string()]);
        assert_eq!(second.calls("B"), 1, "timeouts are not retried");
        assert_eq!(cached(&store, "A").len(), 3);
        assert_eq!(cached(&store, "B"), vec!["b-0".to_string(), "b-1".to_string()]);
    }

    #[tokio::test]
    async fn test_resync_is_idempotent() {
        let store = memory_store();
        let fetcher = Arc::new(ScriptedFetcher::new().script("a", vec![Reply::Body(feed("a", 4))]));
        let sync = coordinator(&store, &fetcher, vec![source("a")], config(4, 3));

        sync.run(SyncTargets::All).await;
        let before: Vec<String> = store
            .events_for_source("a")
            .unwrap()
            .into_iter()
            .map(|e| e.event.stable_id)
            .collect();
        let run = sync.run(SyncTargets::All).await;

        assert!(matches!(
            run.outcome("a").unwrap().status,
            OutcomeStatus::Updated { inserted: 0, updated: 4, removed: 0, .. }
        ));
        let after: Vec<String> = store
            .events_for_source("a")
            .unwrap()
            .into_iter()
            .map(|e| e.event.stable_id)
            .collect();
        assert_eq!(before, after);
        assert_eq!(store.event_count().unwrap(), 4);
    }

    #[tokio::test]
    async fn test_worker_limit_bounds_concurrency() {
        let store = memory_store();
        let ids = ["s1", "s2", "s3", "s4", "s5"];
        let fetcher = ids.iter().fold(
            ScriptedFetcher::new().with_delay(Duration::from_millis(30)),
            |f, id| f.script(id, vec![Reply::Body(feed(id, 1))]),
        );
        let fetcher = Arc::new(fetcher);
        let sources = ids.iter().map(|id| source(id)).collect();

        let run = coordinator(&store, &fetcher, sources, config(2, 1))
            .run(SyncTargets::All)
            .await;

        assert_eq!(run.succeeded_count(), 5);
        assert!(fetcher.peak_concurrency() <= 2);
        let order: Vec<&str> = run.outcomes.iter().map(|o| o.source_id.as_str()).collect();
        assert_eq!(order, ids);
    }

    #[tokio::test]
    async fn test_transient_failures_retry_with_backoff() {
        let store = memory_store();
        let fetcher = Arc::new(ScriptedFetcher::new().script(
            "a",
            vec![
                Reply::Fail(FetchError::transient("connection reset")),
                Reply::Fail(FetchError::from_status(503)),
                Reply::Body(feed("a", 2)),
            ],
        ));
        let run = coordinator(&store, &fetcher, vec![source("a")], config(4, 3))
            .run(only("a"))
            .await;

        let outcome = run.outcome("a").unwrap();
        assert!(outcome.succeeded());
        assert_eq!(outcome.attempts, 3);
        assert_eq!(cached(&store, "a").len(), 2);
        assert_eq!(
            store.source_state("a").unwrap().unwrap().circuit_state,
            CircuitState::Closed
        );
    }

    #[tokio::test]
    async fn test_open_circuit_makes_no_calls() {
        let store = memory_store();
        let fetcher = Arc::new(
            ScriptedFetcher::new().script("a", vec![Reply::Fail(FetchError::transient("down"))]),
        );
        let sync = coordinator(&store, &fetcher, vec![source("a")], config(4, 3));

        let run = sync.run(only("a")).await;
        assert_eq!(run.outcome("a").unwrap().attempts, 3);
        assert_eq!(fetcher.calls("a"), 3);

        let state = store.source_state("a").unwrap().unwrap();
        assert_eq!(state.circuit_state, CircuitState::Open);
        assert_eq!(state.consecutive_failures, 3);

        let run = sync.run(only("a")).await;
        assert_eq!(fetcher.calls("a"), 3, "open circuit short-circuits");
        assert!(run.errors[0].contains("circuit open"), "{:?}", run.errors);
    }

    #[tokio::test]
    async fn test_breakers_restored_from_store() {
        let store = memory_store();
        store
            .record_failure(
                "a",
                &SourceFailure {
                    attempted_at: Utc::now(),
                    error: "down".into(),
                    circuit_state: CircuitState::Open,
                    consecutive_failures: 3,
                    auth_blocked: None,
                },
            )
            .unwrap();

        let fetcher = Arc::new(ScriptedFetcher::new().script("a", vec![Reply::Body(feed("a", 1))]));
        let sync = coordinator(&store, &fetcher, vec![source("a")], config(4, 3));
        assert_eq!(sync.restore_breakers().unwrap(), 1);
        assert_eq!(sync.breakers().state("a"), CircuitState::Open);

        sync.run(only("a")).await;
        assert_eq!(fetcher.calls("a"), 0);
    }

    #[tokio::test]
    async fn test_auth_failure_blocks_until_reconfigured() {
        let store = memory_store();
        let fetcher = Arc::new(
            ScriptedFetcher::new().script("a", vec![Reply::Fail(FetchError::from_status(401))]),
        );

        let run = coordinator(&store, &fetcher, vec![source("a")], config(4, 3))
            .run(only("a"))
            .await;
        assert_eq!(run.outcome("a").unwrap().attempts, 1);
        assert_eq!(fetcher.calls("a"), 1);

        let run = coordinator(&store, &fetcher, vec![source("a")], config(4, 3))
            .run(only("a"))
            .await;
        assert_eq!(fetcher.calls("a"), 1);
        assert_eq!(
            run.errors,
            vec!["a: auth failure (blocked until reconfigured)".to_string()]
        );

        let mut reconfigured = source("a");
        reconfigured.auth = AuthConfig::Bearer {
            token: "rotated".into(),
        };
        coordinator(&store, &fetcher, vec![reconfigured], config(4, 3))
            .run(only("a"))
            .await;
        assert_eq!(fetcher.calls("a"), 2);
    }

    #[tokio::test]
    async fn test_too_large_not_retried() {
        let store = memory_store();
        let fetcher = Arc::new(
            ScriptedFetcher::new().script("a", vec![Reply::Fail(FetchError::TooLarge { limit: 10 })]),
        );
        let run = coordinator(&store, &fetcher, vec![source("a")], config(4, 3))
            .run(only("a"))
            .await;
        assert_eq!(run.outcome("a").unwrap().attempts, 1);
        assert!(!run.aggregate_success);
    }

    #[tokio::test]
    async fn test_malformed_feed_leaves_rows_untouched() {
        let store = memory_store();
        let fetcher = Arc::new(ScriptedFetcher::new().script(
            "a",
            vec![
                Reply::Body(feed("a", 2)),
                Reply::Body("<html>maintenance</html>".into()),
            ],
        ));
        let sync = coordinator(&store, &fetcher, vec![source("a")], config(4, 1));

        sync.run(only("a")).await;
        let run = sync.run(only("a")).await;

        assert!(run.errors[0].starts_with("a: malformed feed"), "{:?}", run.errors);
        assert_eq!(cached(&store, "a").len(), 2);
        assert!(run.aggregate_success, "cache is still within TTL");
        assert!(run.stale);
    }

    #[tokio::test]
    async fn test_cut_off_feed_keeps_absent_rows() {
        let store = memory_store();
        let full = feed("a", 3);
        let cut = full[..full.find("UID:a-1").unwrap()].to_string();
        let fetcher = Arc::new(ScriptedFetcher::new().script(
            "a",
            vec![Reply::Body(full), Reply::Body(cut)],
        ));
        let sync = coordinator(&store, &fetcher, vec![source("a")], config(4, 1));

        sync.run(only("a")).await;
        let run = sync.run(only("a")).await;

        assert!(matches!(
            run.outcome("a").unwrap().status,
            OutcomeStatus::Updated { removed: 0, updated: 1, .. }
        ));
        assert_eq!(cached(&store, "a").len(), 3);
    }

    #[tokio::test]
    async fn test_not_modified_extends_expiry() {
        let store = memory_store();
        let fetcher = Arc::new(
            ScriptedFetcher::new().script("a", vec![Reply::Body(feed("a", 2)), Reply::NotModified]),
        );
        let sync = coordinator(&store, &fetcher, vec![source("a")], config(4, 1));

        sync.run(only("a")).await;
        let before = store.events_for_source("a").unwrap()[0].expires_at;
        tokio::time::sleep(Duration::from_millis(1100)).await;
        let run = sync.run(only("a")).await;

        assert_eq!(run.outcome("a").unwrap().status, OutcomeStatus::Unchanged);
        let entries = store.events_for_source("a").unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].expires_at > before);
        assert_eq!(
            store.source_state("a").unwrap().unwrap().validators.etag.as_deref(),
            Some("\"v1\"")
        );
    }

    #[tokio::test]
    async fn test_cancelled_run_commits_nothing() {
        let store = memory_store();
        let fetcher = Arc::new(ScriptedFetcher::new().script("a", vec![Reply::Body(feed("a", 2))]));
        let token = CancelToken::new();
        token.cancel();

        let run = coordinator(&store, &fetcher, vec![source("a")], config(4, 3))
            .run_with_cancel(SyncTargets::All, &token)
            .await;

        assert!(run.cancelled);
        assert_eq!(run.outcome("a").unwrap().status, OutcomeStatus::Cancelled);
        assert_eq!(fetcher.calls("a"), 0);
        assert_eq!(store.event_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancel_during_fetch_keeps_previous_batch() {
        let store = memory_store();
        let fast = Arc::new(ScriptedFetcher::new().script("a", vec![Reply::Body(feed("a", 2))]));
        coordinator(&store, &fast, vec![source("a")], config(4, 3))
            .run(SyncTargets::All)
            .await;

        let slow = Arc::new(
            ScriptedFetcher::new()
                .with_delay(Duration::from_millis(500))
                .script("a", vec![Reply::Body(feed("a", 5))]),
        );
        let sync = coordinator(&store, &slow, vec![source("a")], config(4, 3));
        let token = CancelToken::new();
        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                token.cancel();
            })
        };

        let run = sync.run_with_cancel(SyncTargets::All, &token).await;
        canceller.await.unwrap();

        assert_eq!(run.outcome("a").unwrap().status, OutcomeStatus::Cancelled);
        assert_eq!(cached(&store, "a").len(), 2);
    }

    #[tokio::test]
    async fn test_overlapping_runs_skip_in_flight_source() {
        let store = memory_store();
        let fetcher = Arc::new(
            ScriptedFetcher::new()
                .with_delay(Duration::from_millis(100))
                .script("a", vec![Reply::Body(feed("a", 1))]),
        );
        let sync = coordinator(&store, &fetcher, vec![source("a")], config(4, 3));

        let (first, second) = tokio::join!(sync.run(only("a")), sync.run(only("a")));

        let statuses = [
            &first.outcome("a").unwrap().status,
            &second.outcome("a").unwrap().status,
        ];
        assert!(statuses
            .iter()
            .any(|s| matches!(s, OutcomeStatus::Skipped { .. })));
        assert!(statuses
            .iter()
            .any(|s| matches!(s, OutcomeStatus::Updated { .. })));
        assert_eq!(fetcher.calls("a"), 1);
    }

    #[tokio::test]
    async fn test_unknown_source_reported() {
        let store = memory_store();
        let fetcher = Arc::new(ScriptedFetcher::new());
        let run = coordinator(&store, &fetcher, Vec::new(), config(4, 3))
            .run(only("nope"))
            .await;

        assert!(!run.aggregate_success);
        assert!(run.stale);
        assert_eq!(run.errors, vec!["nope: unknown source".to_string()]);
    }

    #[tokio::test]
    async fn test_total_failure_without_cache_is_not_usable() {
        let store = memory_store();
        let fetcher = Arc::new(
            ScriptedFetcher::new()
                .script("a", vec![Reply::Fail(FetchError::transient("down"))])
                .script("b", vec![Reply::Fail(FetchError::transient("down"))]),
        );
        let run = coordinator(&store, &fetcher, vec![source("a"), source("b")], config(4, 1))
            .run(SyncTargets::All)
            .await;

        assert!(!run.aggregate_success);
        assert!(run.stale);
        assert_eq!(run.errors.len(), 2);
        assert_eq!(store.recent_sync_runs(1).unwrap()[0], run);
    }
}
