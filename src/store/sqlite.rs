use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row, Transaction, TransactionBehavior};
use rusqlite_migration::{Migrations, M};
use tracing::{debug, info};

use crate::domain::{
    CacheEntry, CancelToken, CircuitState, EventTime, Freshness, NormalizedEvent, ShowAs,
    SourceFailure, SourceState, SyncRun, Validators,
};
use crate::store::{
    expiry, Cursor, EventBatch, RangeQuery, Store, StoreConfig, StoreError, UpsertMode,
    UpsertSummary,
};

const EVENT_COLUMNS: &str = "stable_id, source_id, uid, recurrence_key, title,
    start_utc, start_offset, start_date, end_utc, end_offset, end_date,
    location, all_day, cancelled, show_as, last_modified,
    batch_id, fetched_at, expires_at";

const SOURCE_COLUMNS: &str = "source_id, last_success_at, last_attempt_at, ttl_secs,
    consecutive_failures, circuit_state, last_error, etag, last_modified, content_hash,
    auth_blocked";

const MAX_IDLE_READERS: usize = 4;

pub struct SqliteStore {
    writer: Mutex<Connection>,
    readers: Option<ReaderPool>,
    retain_raw: bool,
    run_history: usize,
}

impl SqliteStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Self::open(path, &StoreConfig::default())
    }

    pub fn open<P: AsRef<Path>>(path: P, config: &StoreConfig) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Migration(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }

        let conn = Connection::open(path)?;
        let store = Self {
            writer: Mutex::new(conn),
            readers: Some(ReaderPool::new(path.to_path_buf())),
            retain_raw: config.retain_raw,
            run_history: config.run_history,
        };
        store.run_migrations()?;
        debug!(path = %path.display(), "opened cache store");
        Ok(store)
    }

    /// Single-connection store; reads go through the writer connection.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            writer: Mutex::new(conn),
            readers: None,
            retain_raw: false,
            run_history: StoreConfig::default().run_history,
        };
        store.run_migrations()?;
        Ok(store)
    }

    pub fn with_raw_retention(mut self, retain_raw: bool) -> Self {
        self.retain_raw = retain_raw;
        self
    }

    fn run_migrations(&self) -> Result<(), StoreError> {
        let migrations = Migrations::new(vec![M::up(include_str!(
            "../../migrations/001-initial/up.sql"
        ))]);

        let mut conn = self.lock_writer()?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        migrations
            .to_latest(&mut conn)
            .map_err(|e| StoreError::Migration(e.to_string()))?;

        Ok(())
    }

    fn lock_writer(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.writer.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Run a read against a pooled read-only connection, or the writer for
    /// in-memory stores.
    fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T, StoreError>) -> Result<T, StoreError> {
        match &self.readers {
            Some(pool) => {
                let conn = pool.acquire()?;
                let result = f(&conn);
                pool.release(conn);
                result
            }
            None => {
                let conn = self.lock_writer()?;
                f(&conn)
            }
        }
    }

    fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| s.parse::<DateTime<Utc>>().ok())
    }

    fn write_event(tx: &Transaction, event: &NormalizedEvent, batch: &EventBatch, batch_id: &str) -> Result<(), StoreError> {
        let (start_utc, start_offset, start_date) = encode_time(&event.start);
        let (end_utc, end_offset, end_date) = encode_time(&event.end);

        tx.execute(
            "INSERT INTO events (stable_id, source_id, uid, recurrence_key, title,
                start_utc, start_offset, start_date, end_utc, end_offset, end_date,
                location, all_day, cancelled, show_as, last_modified,
                batch_id, fetched_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
             ON CONFLICT(stable_id) DO UPDATE SET
                source_id = excluded.source_id,
                uid = excluded.uid,
                recurrence_key = excluded.recurrence_key,
                title = excluded.title,
                start_utc = excluded.start_utc,
                start_offset = excluded.start_offset,
                start_date = excluded.start_date,
                end_utc = excluded.end_utc,
                end_offset = excluded.end_offset,
                end_date = excluded.end_date,
                location = excluded.location,
                all_day = excluded.all_day,
                cancelled = excluded.cancelled,
                show_as = excluded.show_as,
                last_modified = excluded.last_modified,
                batch_id = excluded.batch_id,
                fetched_at = excluded.fetched_at,
                expires_at = excluded.expires_at",
            params![
                event.stable_id,
                batch.source_id,
                event.uid,
                event.recurrence_key,
                event.title,
                start_utc,
                start_offset,
                start_date,
                end_utc,
                end_offset,
                end_date,
                event.location,
                event.all_day,
                event.cancelled,
                event.show_as.as_str(),
                event.last_modified.map(|dt| dt.to_rfc3339()),
                batch_id,
                batch.fetched_at.to_rfc3339(),
                expiry_timestamp(batch.expires_at()),
            ],
        )?;
        Ok(())
    }

    /// Drop raw payloads no event row references any more.
    fn delete_orphaned_raw(tx: &Transaction, keep: Option<&str>) -> Result<usize, StoreError> {
        let removed = tx.execute(
            "DELETE FROM raw_payloads
             WHERE batch_id NOT IN (SELECT DISTINCT batch_id FROM events)
               AND batch_id IS NOT ?1",
            params![keep],
        )?;
        Ok(removed)
    }

    fn source_from_row(row: &Row) -> rusqlite::Result<SourceState> {
        Ok(SourceState {
            source_id: row.get(0)?,
            last_success_at: row
                .get::<_, Option<String>>(1)?
                .and_then(|s| Self::parse_datetime(&s)),
            last_attempt_at: row
                .get::<_, Option<String>>(2)?
                .and_then(|s| Self::parse_datetime(&s)),
            ttl_secs: row.get::<_, i64>(3)?.max(0) as u64,
            consecutive_failures: row.get::<_, i64>(4)?.clamp(0, i64::from(u32::MAX)) as u32,
            circuit_state: CircuitState::parse(&row.get::<_, String>(5)?),
            last_error: row.get(6)?,
            validators: Validators {
                etag: row.get(7)?,
                last_modified: row.get(8)?,
                content_hash: row.get(9)?,
            },
            auth_blocked: row.get(10)?,
        })
    }
}

impl Store for SqliteStore {
    fn upsert_batch(
        &self,
        batch: &EventBatch,
        mode: UpsertMode,
        cancel: Option<&CancelToken>,
    ) -> Result<UpsertSummary, StoreError> {
        let mut conn = self.lock_writer()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let batch_id = batch.batch_id();

        let existing: HashSet<String> = {
            let mut stmt = tx.prepare("SELECT stable_id FROM events WHERE source_id = ?1")?;
            let ids = stmt
                .query_map(params![batch.source_id], |row| row.get(0))?
                .collect::<Result<HashSet<String>, _>>()?;
            ids
        };

        let mut summary = UpsertSummary::default();
        let mut incoming = HashSet::with_capacity(batch.events.len());
        for event in &batch.events {
            if !incoming.insert(event.stable_id.as_str()) {
                continue;
            }
            Self::write_event(&tx, event, batch, &batch_id)?;
            if existing.contains(&event.stable_id) {
                summary.updated += 1;
            } else {
                summary.inserted += 1;
            }
        }

        if mode == UpsertMode::FullReplace {
            let mut stmt = tx.prepare("DELETE FROM events WHERE stable_id = ?1")?;
            for stale in existing.iter().filter(|id| !incoming.contains(id.as_str())) {
                summary.removed += stmt.execute(params![stale])?;
            }
        }

        match (&batch.raw, self.retain_raw) {
            (Some(body), true) => {
                tx.execute(
                    "INSERT OR REPLACE INTO raw_payloads (batch_id, source_id, content_hash, body, fetched_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        batch_id,
                        batch.source_id,
                        batch.validators.content_hash.as_deref().unwrap_or_default(),
                        body,
                        batch.fetched_at.to_rfc3339(),
                    ],
                )?;
                Self::delete_orphaned_raw(&tx, Some(batch_id.as_str()))?;
            }
            _ => {
                Self::delete_orphaned_raw(&tx, None)?;
            }
        }

        tx.execute(
            "INSERT INTO sources (source_id, last_success_at, last_attempt_at, ttl_secs,
                consecutive_failures, circuit_state, last_error, etag, last_modified,
                content_hash, auth_blocked, batch_id)
             VALUES (?1, ?2, ?2, ?3, 0, 'closed', NULL, ?4, ?5, ?6, NULL, ?7)
             ON CONFLICT(source_id) DO UPDATE SET
                last_success_at = excluded.last_success_at,
                last_attempt_at = excluded.last_attempt_at,
                ttl_secs = excluded.ttl_secs,
                consecutive_failures = 0,
                circuit_state = 'closed',
                last_error = NULL,
                etag = excluded.etag,
                last_modified = excluded.last_modified,
                content_hash = excluded.content_hash,
                auth_blocked = NULL,
                batch_id = excluded.batch_id",
            params![
                batch.source_id,
                batch.fetched_at.to_rfc3339(),
                ttl_secs(batch.ttl),
                batch.validators.etag,
                batch.validators.last_modified,
                batch.validators.content_hash,
                batch_id,
            ],
        )?;

        // Last chance to observe cancellation; dropping the transaction rolls back.
        if cancel.is_some_and(CancelToken::is_cancelled) {
            debug!(source = %batch.source_id, "cancelled before commit, rolling back");
            return Err(StoreError::Aborted);
        }

        tx.commit()?;
        info!(
            source = %batch.source_id,
            inserted = summary.inserted,
            updated = summary.updated,
            removed = summary.removed,
            "committed batch"
        );
        Ok(summary)
    }

    fn extend_expiry(
        &self,
        source_id: &str,
        fetched_at: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<usize, StoreError> {
        let mut conn = self.lock_writer()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let touched = tx.execute(
            "UPDATE events SET expires_at = ?2, fetched_at = ?3 WHERE source_id = ?1",
            params![
                source_id,
                expiry_timestamp(expiry(fetched_at, ttl)),
                fetched_at.to_rfc3339()
            ],
        )?;
        tx.execute(
            "INSERT INTO sources (source_id, last_success_at, last_attempt_at, ttl_secs)
             VALUES (?1, ?2, ?2, ?3)
             ON CONFLICT(source_id) DO UPDATE SET
                last_success_at = excluded.last_success_at,
                last_attempt_at = excluded.last_attempt_at,
                ttl_secs = excluded.ttl_secs,
                consecutive_failures = 0,
                circuit_state = 'closed',
                last_error = NULL,
                auth_blocked = NULL",
            params![source_id, fetched_at.to_rfc3339(), ttl_secs(ttl)],
        )?;

        tx.commit()?;
        debug!(source = source_id, rows = touched, "extended expiry");
        Ok(touched)
    }

    fn record_failure(&self, source_id: &str, failure: &SourceFailure) -> Result<(), StoreError> {
        let conn = self.lock_writer()?;
        conn.execute(
            "INSERT INTO sources (source_id, last_attempt_at, consecutive_failures,
                circuit_state, last_error, auth_blocked)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(source_id) DO UPDATE SET
                last_attempt_at = excluded.last_attempt_at,
                consecutive_failures = excluded.consecutive_failures,
                circuit_state = excluded.circuit_state,
                last_error = excluded.last_error,
                auth_blocked = excluded.auth_blocked",
            params![
                source_id,
                failure.attempted_at.to_rfc3339(),
                i64::from(failure.consecutive_failures),
                failure.circuit_state.as_str(),
                failure.error,
                failure.auth_blocked,
            ],
        )?;
        Ok(())
    }

    fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut conn = self.lock_writer()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let removed = tx.execute(
            "DELETE FROM events WHERE expires_at < ?1",
            params![now.timestamp()],
        )?;
        let raw_removed = Self::delete_orphaned_raw(&tx, None)?;
        // A 304 must not vouch for rows that no longer exist.
        tx.execute(
            "UPDATE sources SET etag = NULL, last_modified = NULL, content_hash = NULL
             WHERE source_id NOT IN (SELECT DISTINCT source_id FROM events)",
            [],
        )?;

        tx.commit()?;
        info!(removed, raw_removed, "cleaned up expired events");
        Ok(removed)
    }

    fn record_sync_run(&self, run: &SyncRun) -> Result<(), StoreError> {
        let encoded = serde_json::to_string(run)?;
        let mut conn = self.lock_writer()?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO sync_runs (started_at, run) VALUES (?1, ?2)",
            params![run.started_at.to_rfc3339(), encoded],
        )?;
        tx.execute(
            "DELETE FROM sync_runs WHERE id NOT IN
                (SELECT id FROM sync_runs ORDER BY id DESC LIMIT ?1)",
            params![self.run_history.max(1) as i64],
        )?;

        tx.commit()?;
        Ok(())
    }

    fn events_page(
        &self,
        query: &RangeQuery,
        after: Option<&Cursor>,
        limit: usize,
    ) -> Result<Vec<NormalizedEvent>, StoreError> {
        // Zero-length events overlap when they start inside the range.
        let sql = format!(
            "SELECT {} FROM events
             WHERE start_utc < ?1
               AND MAX(end_utc, start_utc + 1) > ?2
               AND (?3 OR cancelled = 0)
               AND (?4 IS NULL OR start_utc > ?4 OR (start_utc = ?4 AND stable_id > ?5))
             ORDER BY start_utc, stable_id
             LIMIT ?6",
            EVENT_COLUMNS
        );

        self.read(|conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt
                .query_map(
                    params![
                        query.end.timestamp(),
                        query.start.timestamp(),
                        query.include_cancelled,
                        after.map(|c| c.start_utc),
                        after.map(|c| c.stable_id.as_str()),
                        limit as i64,
                    ],
                    EventRow::from_row,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter()
                .map(|row| row.into_entry().map(|entry| entry.event))
                .collect()
        })
    }

    fn events_for_source(&self, source_id: &str) -> Result<Vec<CacheEntry>, StoreError> {
        let sql = format!(
            "SELECT {} FROM events WHERE source_id = ?1 ORDER BY start_utc, stable_id",
            EVENT_COLUMNS
        );
        self.read(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![source_id], EventRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(EventRow::into_entry).collect()
        })
    }

    fn event_count(&self) -> Result<usize, StoreError> {
        self.read(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
            Ok(count.max(0) as usize)
        })
    }

    fn freshness(&self, source_id: &str) -> Result<Freshness, StoreError> {
        let state = self.source_state(source_id)?;
        let (last_success_at, ttl) = match state {
            Some(state) => (state.last_success_at, Duration::from_secs(state.ttl_secs)),
            None => (None, Duration::ZERO),
        };
        Ok(Freshness::evaluate(last_success_at, ttl, Utc::now()))
    }

    fn source_state(&self, source_id: &str) -> Result<Option<SourceState>, StoreError> {
        let sql = format!("SELECT {} FROM sources WHERE source_id = ?1", SOURCE_COLUMNS);
        self.read(|conn| {
            let state = conn
                .query_row(&sql, params![source_id], Self::source_from_row)
                .optional()?;
            Ok(state)
        })
    }

    fn source_states(&self) -> Result<Vec<SourceState>, StoreError> {
        let sql = format!("SELECT {} FROM sources ORDER BY source_id", SOURCE_COLUMNS);
        self.read(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let states = stmt
                .query_map([], Self::source_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(states)
        })
    }

    fn recent_sync_runs(&self, limit: usize) -> Result<Vec<SyncRun>, StoreError> {
        self.read(|conn| {
            let mut stmt = conn.prepare("SELECT run FROM sync_runs ORDER BY id DESC LIMIT ?1")?;
            let encoded = stmt
                .query_map(params![limit as i64], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            encoded
                .iter()
                .map(|s| serde_json::from_str(s).map_err(StoreError::from))
                .collect()
        })
    }

    fn raw_payload(&self, source_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.read(|conn| {
            let body = conn
                .query_row(
                    "SELECT r.body FROM raw_payloads r
                     JOIN sources s ON s.batch_id = r.batch_id
                     WHERE s.source_id = ?1",
                    params![source_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(body)
        })
    }
}

/// Storage form of an [`EventTime`]: UTC seconds, offset, and the date for
/// all-day values.
fn encode_time(time: &EventTime) -> (i64, i32, Option<String>) {
    let date = match time {
        EventTime::Date(d) => Some(d.format("%Y-%m-%d").to_string()),
        EventTime::DateTime(_) => None,
    };
    (time.sort_instant().timestamp(), time.offset_seconds(), date)
}

fn decode_time(utc: i64, offset: i32, date: Option<&str>) -> Result<EventTime, StoreError> {
    if let Some(date) = date {
        return NaiveDate::parse_from_str(date, "%Y-%m-%d")
            .map(EventTime::Date)
            .map_err(|e| StoreError::InvalidRow(format!("bad date '{}': {}", date, e)));
    }
    let offset = FixedOffset::east_opt(offset)
        .ok_or_else(|| StoreError::InvalidRow(format!("bad offset {}", offset)))?;
    let instant = DateTime::from_timestamp(utc, 0)
        .ok_or_else(|| StoreError::InvalidRow(format!("bad timestamp {}", utc)))?;
    Ok(EventTime::DateTime(instant.with_timezone(&offset)))
}

/// Raw column values of one `events` row.
struct EventRow {
    stable_id: String,
    source_id: String,
    uid: String,
    recurrence_key: String,
    title: String,
    start_utc: i64,
    start_offset: i32,
    start_date: Option<String>,
    end_utc: i64,
    end_offset: i32,
    end_date: Option<String>,
    location: Option<String>,
    all_day: bool,
    cancelled: bool,
    show_as: String,
    last_modified: Option<String>,
    batch_id: String,
    fetched_at: String,
    expires_at: i64,
}

impl EventRow {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            stable_id: row.get(0)?,
            source_id: row.get(1)?,
            uid: row.get(2)?,
            recurrence_key: row.get(3)?,
            title: row.get(4)?,
            start_utc: row.get(5)?,
            start_offset: row.get(6)?,
            start_date: row.get(7)?,
            end_utc: row.get(8)?,
            end_offset: row.get(9)?,
            end_date: row.get(10)?,
            location: row.get(11)?,
            all_day: row.get(12)?,
            cancelled: row.get(13)?,
            show_as: row.get(14)?,
            last_modified: row.get(15)?,
            batch_id: row.get(16)?,
            fetched_at: row.get(17)?,
            expires_at: row.get(18)?,
        })
    }

    fn into_entry(self) -> Result<CacheEntry, StoreError> {
        let event = NormalizedEvent {
            start: decode_time(self.start_utc, self.start_offset, self.start_date.as_deref())?,
            end: decode_time(self.end_utc, self.end_offset, self.end_date.as_deref())?,
            show_as: ShowAs::parse(&self.show_as).ok_or_else(|| {
                StoreError::InvalidRow(format!("unknown show_as '{}'", self.show_as))
            })?,
            last_modified: self
                .last_modified
                .as_deref()
                .and_then(SqliteStore::parse_datetime),
            stable_id: self.stable_id,
            source_id: self.source_id,
            uid: self.uid,
            recurrence_key: self.recurrence_key,
            title: self.title,
            location: self.location,
            all_day: self.all_day,
            cancelled: self.cancelled,
        };
        let fetched_at = SqliteStore::parse_datetime(&self.fetched_at)
            .ok_or_else(|| StoreError::InvalidRow(format!("bad fetched_at '{}'", self.fetched_at)))?;
        let expires_at = DateTime::from_timestamp(self.expires_at, 0)
            .ok_or_else(|| StoreError::InvalidRow(format!("bad expires_at {}", self.expires_at)))?;

        Ok(CacheEntry {
            event,
            batch_id: self.batch_id,
            fetched_at,
            expires_at,
        })
    }
}

/// Whole seconds, rounded up so a stored expiry never precedes the
/// sub-second `fetched_at` it was derived from.
fn expiry_timestamp(expires_at: DateTime<Utc>) -> i64 {
    let secs = expires_at.timestamp();
    if expires_at.timestamp_subsec_nanos() > 0 {
        secs.saturating_add(1).min(DateTime::<Utc>::MAX_UTC.timestamp())
    } else {
        secs
    }
}

fn ttl_secs(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX)
}

/// Read-only connections against the WAL database.
///
/// Each read gets its own connection and therefore its own snapshot; the
/// idle list lock is only held while a connection is handed out.
struct ReaderPool {
    path: PathBuf,
    idle: Mutex<Vec<Connection>>,
}

impl ReaderPool {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            idle: Mutex::new(Vec::new()),
        }
    }

    fn acquire(&self) -> Result<Connection, StoreError> {
        let pooled = self.idle.lock().map_err(|_| StoreError::Poisoned)?.pop();
        match pooled {
            Some(conn) => Ok(conn),
            None => {
                let conn = Connection::open_with_flags(
                    &self.path,
                    OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
                )?;
                conn.busy_timeout(Duration::from_secs(5))?;
                Ok(conn)
            }
        }
    }

    fn release(&self, conn: Connection) {
        if let Ok(mut idle) = self.idle.lock() {
            if idle.len() < MAX_IDLE_READERS {
                idle.push(conn);
            }
        }
    }
}
