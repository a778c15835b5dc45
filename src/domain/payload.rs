use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::domain::Validators;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadContent {
    /// Body retrieved in this attempt.
    Bytes(Vec<u8>),
    /// Remote reported no change since the remembered validators.
    Unchanged,
}

/// Result of one successful fetch attempt.
#[derive(Debug, Clone)]
pub struct RawFeedPayload {
    pub source_id: String,
    pub content: PayloadContent,
    pub content_hash: String,
    pub fetched_at: DateTime<Utc>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl RawFeedPayload {
    pub fn from_bytes(
        source_id: &str,
        body: Vec<u8>,
        etag: Option<String>,
        last_modified: Option<String>,
    ) -> Self {
        Self {
            source_id: source_id.to_string(),
            content_hash: content_hash(&body),
            content: PayloadContent::Bytes(body),
            fetched_at: Utc::now(),
            etag,
            last_modified,
        }
    }

    /// Marker payload carrying the previous content hash forward.
    pub fn unchanged(source_id: &str, previous: &Validators) -> Self {
        Self {
            source_id: source_id.to_string(),
            content: PayloadContent::Unchanged,
            content_hash: previous.content_hash.clone().unwrap_or_default(),
            fetched_at: Utc::now(),
            etag: previous.etag.clone(),
            last_modified: previous.last_modified.clone(),
        }
    }

    pub fn is_unchanged(&self) -> bool {
        matches!(self.content, PayloadContent::Unchanged)
    }

    pub fn bytes(&self) -> Option<&[u8]> {
        match &self.content {
            PayloadContent::Bytes(b) => Some(b),
            PayloadContent::Unchanged => None,
        }
    }

    pub fn validators(&self) -> Validators {
        Validators {
            etag: self.etag.clone(),
            last_modified: self.last_modified.clone(),
            content_hash: Some(self.content_hash.clone()),
        }
    }
}

pub fn content_hash(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unchanged_carries_previous_hash() {
        let previous = Validators {
            etag: Some("\"v1\"".into()),
            last_modified: None,
            content_hash: Some("abc".into()),
        };
        let payload = RawFeedPayload::unchanged("work", &previous);
        assert!(payload.is_unchanged());
        assert!(payload.bytes().is_none());
        assert_eq!(payload.content_hash, "abc");
        assert_eq!(payload.validators(), previous);
    }

    #[test]
    fn test_hash_matches_body() {
        let payload = RawFeedPayload::from_bytes("work", b"BEGIN:VCALENDAR".to_vec(), None, None);
        assert_eq!(payload.content_hash, content_hash(b"BEGIN:VCALENDAR"));
        assert_eq!(payload.bytes(), Some(&b"BEGIN:VCALENDAR"[..]));
    }
}
