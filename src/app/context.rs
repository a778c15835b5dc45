use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::app::error::{AlmanacError, Result};
use crate::bridge::SyncBridge;
use crate::config::Config;
use crate::domain::{
    CircuitState, EventsView, NormalizedEvent, RefreshTarget, SourceConfig, SourceState, SourceStatus, SyncRun,
    SyncStatus, SyncTargets,
};
use crate::fetcher::{CircuitBreakers, Fetcher, SourceFetcher};
use crate::parser::FeedParser;
use crate::store::{SqliteStore, Store};
use crate::sync::SyncCoordinator;

/// Wires store, fetcher stack and coordinator together and exposes the
/// read and refresh operations other layers consume.
pub struct AppContext {
    pub config: Config,
    pub store: Arc<SqliteStore>,
    pub coordinator: Arc<SyncCoordinator<SqliteStore>>,
}

impl AppContext {
    pub fn new(config: Config) -> Result<Self> {
        let db_path = config.database_path()?;
        let store = Arc::new(SqliteStore::open(&db_path, &config.store)?);
        Self::with_store(config, store)
    }

    pub fn in_memory(config: Config) -> Result<Self> {
        let store = SqliteStore::in_memory()?.with_raw_retention(config.store.retain_raw);
        Self::with_store(config, Arc::new(store))
    }

    pub fn with_store(config: Config, store: Arc<SqliteStore>) -> Result<Self> {
        let fetcher: Arc<dyn Fetcher + Send + Sync> = Arc::new(SourceFetcher::new(&config.fetch)?);
        let sources = config.source_configs()?;
        Self::from_parts(config, sources, store, fetcher)
    }

    /// Assemble a context around an explicit fetcher and source list.
    pub fn from_parts(
        config: Config,
        sources: Vec<SourceConfig>,
        store: Arc<SqliteStore>,
        fetcher: Arc<dyn Fetcher + Send + Sync>,
    ) -> Result<Self> {
        let breakers = Arc::new(CircuitBreakers::new(config.fetch.circuit()));
        let parser = FeedParser::new(config.parser.clone());
        let coordinator = SyncCoordinator::new(
            store.clone(),
            fetcher,
            breakers,
            parser,
            sources,
            &config.sync,
        );
        let restored = coordinator.restore_breakers()?;
        tracing::debug!(sources = restored, "restored circuit state");

        Ok(Self {
            config,
            store,
            coordinator: Arc::new(coordinator),
        })
    }

    pub fn sources(&self) -> &[SourceConfig] {
        self.coordinator.sources()
    }

    /// Events overlapping `[start, end)`, ordered by start.
    pub fn events_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        include_cancelled: bool,
    ) -> Result<Vec<NormalizedEvent>> {
        Ok(self
            .store
            .events_in_range(start, end, include_cancelled)
            .collect_all()?)
    }

    /// Best available events, flagged stale when any source is past its TTL.
    pub fn read_events(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<EventsView> {
        read_view(self.store.as_ref(), self.sources(), start, end)
    }

    pub fn sync_status(&self) -> Result<SyncStatus> {
        let mut sources = Vec::with_capacity(self.sources().len());
        for source in self.sources() {
            let state = self
                .store
                .source_state(&source.id)?
                .unwrap_or_else(|| SourceState::new(&source.id));
            let freshness = self.store.freshness(&source.id)?;
            let auth_blocked = state.is_auth_blocked(source);

            sources.push(SourceStatus {
                source_id: source.id.clone(),
                healthy: !auth_blocked
                    && state.consecutive_failures == 0
                    && state.circuit_state == CircuitState::Closed,
                circuit_state: state.circuit_state,
                consecutive_failures: state.consecutive_failures,
                auth_blocked,
                last_success_at: freshness.last_success_at,
                is_stale: freshness.is_stale,
                last_error: state.last_error,
            });
        }

        Ok(SyncStatus {
            is_stale: sources.iter().any(|s| s.is_stale),
            sources,
        })
    }

    pub async fn trigger_refresh(&self, target: RefreshTarget) -> Result<SyncRun> {
        if let RefreshTarget::Source(ref id) = target {
            if !self.sources().iter().any(|s| &s.id == id) {
                return Err(AlmanacError::SourceNotFound(id.clone()));
            }
        }
        Ok(self.coordinator.run(SyncTargets::from(target)).await)
    }

    pub fn cleanup_expired(&self) -> Result<usize> {
        Ok(self.store.cleanup_expired(Utc::now())?)
    }

    pub fn recent_runs(&self, limit: usize) -> Result<Vec<SyncRun>> {
        Ok(self.store.recent_sync_runs(limit)?)
    }

    /// A bridge for synchronous callers, with its own runtime.
    pub fn bridge(&self) -> Result<SyncBridge<SqliteStore>> {
        SyncBridge::new(self.coordinator.clone(), &self.config.bridge)
    }
}

/// Events in range plus the stale flag, or [`AlmanacError::NoData`] when no
/// source has ever synced and nothing is cached.
pub(crate) fn read_view<S: Store>(
    store: &S,
    sources: &[SourceConfig],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<EventsView> {
    let events = store.events_in_range(start, end, false).collect_all()?;

    let mut stale = false;
    let mut ever_synced = false;
    for source in sources {
        let freshness = store.freshness(&source.id)?;
        stale |= freshness.is_stale;
        ever_synced |= freshness.last_success_at.is_some();
    }

    if events.is_empty() && !ever_synced && store.event_count()? == 0 {
        return Err(AlmanacError::NoData);
    }
    Ok(EventsView { events, stale })
}
