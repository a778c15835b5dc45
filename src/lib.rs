//! # Almanac
//!
//! A durable, TTL-bounded cache of events synchronized from remote
//! iCalendar feeds.
//!
//! ## Architecture
//!
//! ```text
//! Source config → Fetcher → Parser → Store ← readers
//!                    ╰── SyncCoordinator ──╯
//! ```
//!
//! - [`fetcher`]: HTTP/file retrieval with conditional requests, connection
//!   limits, timeouts and per-source circuit breaking
//! - [`parser`]: ICS parsing, time zone normalization and recurrence expansion
//! - [`store`]: SQLite cache with WAL snapshot reads and TTL metadata
//! - [`sync`]: bounded, failure-isolated sync runs with retry and cancellation
//! - [`bridge`]: blocking entry points for callers outside the async runtime
//!
//! ## Quick Start
//!
//! ```bash
//! # Synchronize every configured source
//! almanac refresh
//!
//! # Next week's events
//! almanac events --days 7
//!
//! # Per-source health
//! almanac status
//! ```

/// Application context and error handling.
///
/// [`AppContext`](app::AppContext) wires store, fetcher stack and
/// coordinator together.
pub mod app;

/// Blocking facade over the sync engine with its own runtime.
pub mod bridge;

/// Command-line interface using clap.
pub mod cli;

/// Configuration loaded from `~/.config/almanac/config.toml`.
pub mod config;

/// Core domain models.
///
/// - [`NormalizedEvent`](domain::NormalizedEvent): one concrete occurrence
/// - [`SourceConfig`](domain::SourceConfig): a configured feed
/// - [`SyncRun`](domain::SyncRun): the record of one coordinator run
pub mod domain;

/// Feed retrieval.
pub mod fetcher;

/// ICS parsing and recurrence expansion.
pub mod parser;

/// Durable event cache.
pub mod store;

/// Sync orchestration.
pub mod sync;
