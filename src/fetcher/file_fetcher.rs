use std::io::ErrorKind;

use async_trait::async_trait;
use tracing::debug;

use crate::domain::{content_hash, RawFeedPayload, SourceConfig, SourceKind, Validators};
use crate::fetcher::{FetchError, Fetcher};

/// Reads ICS documents from the local filesystem.
///
/// There are no HTTP validators here, so "unchanged" means the content hash
/// matches the last committed one.
pub struct FileFetcher {
    max_body_bytes: u64,
}

impl FileFetcher {
    pub fn new(max_body_bytes: u64) -> Self {
        Self { max_body_bytes }
    }
}

#[async_trait]
impl Fetcher for FileFetcher {
    async fn fetch(
        &self,
        source: &SourceConfig,
        previous: &Validators,
    ) -> Result<RawFeedPayload, FetchError> {
        let SourceKind::File { path } = &source.kind else {
            return Err(FetchError::transient(format!(
                "{} is not a file source",
                source.id
            )));
        };

        let io_error = |e: std::io::Error| match e.kind() {
            ErrorKind::PermissionDenied => FetchError::AuthFailure { status: 403 },
            _ => FetchError::transient(format!("{}: {}", path.display(), e)),
        };

        let metadata = tokio::fs::metadata(path).await.map_err(io_error)?;
        if metadata.len() > self.max_body_bytes {
            return Err(FetchError::TooLarge {
                limit: self.max_body_bytes,
            });
        }

        let body = tokio::fs::read(path).await.map_err(io_error)?;
        if body.len() as u64 > self.max_body_bytes {
            return Err(FetchError::TooLarge {
                limit: self.max_body_bytes,
            });
        }

        if previous.content_hash.as_deref() == Some(content_hash(&body).as_str()) {
            debug!(source = %source.id, "file unchanged");
            return Ok(RawFeedPayload::unchanged(&source.id, previous));
        }

        Ok(RawFeedPayload::from_bytes(&source.id, body, None, None))
    }
}
