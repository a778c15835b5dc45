pub mod circuit;
pub mod config;
pub mod file_fetcher;
pub mod http_fetcher;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{RawFeedPayload, SourceConfig, SourceKind, Validators};

pub use circuit::{CircuitBreakerConfig, CircuitBreakers, GuardedFetcher};
pub use config::FetchConfig;
pub use file_fetcher::FileFetcher;
pub use http_fetcher::HttpFetcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutStage {
    Connect,
    Write,
    Read,
    Deadline,
}

impl fmt::Display for TimeoutStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TimeoutStage::Connect => "connect",
            TimeoutStage::Write => "write",
            TimeoutStage::Read => "read",
            TimeoutStage::Deadline => "deadline",
        })
    }
}

/// The four failure kinds callers reason about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    Transient,
    AuthFailure,
    TooLarge,
    Timeout,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("transient: {message}")]
    Transient { message: String },

    #[error("transient: HTTP {status}")]
    Status { status: u16 },

    #[error("transient: circuit open, next probe in {}s", retry_in.as_secs())]
    CircuitOpen { source_id: String, retry_in: Duration },

    #[error("auth failure (HTTP {status})")]
    AuthFailure { status: u16 },

    #[error("too large (limit {limit} bytes)")]
    TooLarge { limit: u64 },

    #[error("timeout")]
    Timeout { stage: TimeoutStage },
}

impl FetchError {
    pub fn transient(message: impl Into<String>) -> Self {
        FetchError::Transient {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> FetchErrorKind {
        match self {
            FetchError::Transient { .. }
            | FetchError::Status { .. }
            | FetchError::CircuitOpen { .. } => FetchErrorKind::Transient,
            FetchError::AuthFailure { .. } => FetchErrorKind::AuthFailure,
            FetchError::TooLarge { .. } => FetchErrorKind::TooLarge,
            FetchError::Timeout { .. } => FetchErrorKind::Timeout,
        }
    }

    /// Whether another attempt within the same run may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Transient { .. } => true,
            FetchError::Status { status } => *status == 408 || *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Whether this failure counts against the source's circuit.
    pub fn trips_circuit(&self) -> bool {
        !matches!(
            self,
            FetchError::CircuitOpen { .. } | FetchError::AuthFailure { .. }
        )
    }

    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => FetchError::AuthFailure { status },
            _ => FetchError::Status { status },
        }
    }
}

#[async_trait]
pub trait Fetcher {
    /// Retrieve the source's raw feed, sending `previous` validators for a
    /// conditional request when they belong to committed data.
    async fn fetch(
        &self,
        source: &SourceConfig,
        previous: &Validators,
    ) -> Result<RawFeedPayload, FetchError>;
}

/// Dispatches on [`SourceKind`] to the matching fetcher.
pub struct SourceFetcher {
    http: HttpFetcher,
    file: FileFetcher,
}

impl SourceFetcher {
    pub fn new(config: &FetchConfig) -> Result<Self, FetchError> {
        Ok(Self {
            http: HttpFetcher::new(config.clone())?,
            file: FileFetcher::new(config.max_body_bytes),
        })
    }
}

#[async_trait]
impl Fetcher for SourceFetcher {
    async fn fetch(
        &self,
        source: &SourceConfig,
        previous: &Validators,
    ) -> Result<RawFeedPayload, FetchError> {
        match &source.kind {
            SourceKind::Ics { .. } | SourceKind::Webcal { .. } => {
                self.http.fetch(source, previous).await
            }
            SourceKind::File { .. } => self.file.fetch(source, previous).await,
        }
    }
}
