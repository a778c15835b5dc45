use thiserror::Error;

use crate::config::ConfigError;
use crate::fetcher::FetchError;
use crate::parser::ParseError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum AlmanacError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Source not found: {0}")]
    SourceNotFound(String),

    /// Nothing has ever been synced and the cache is empty.
    #[error("No cached data available")]
    NoData,

    #[error("Deadline of {0:?} exceeded with no cached data to fall back on")]
    DeadlineExceeded(std::time::Duration),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, AlmanacError>;
