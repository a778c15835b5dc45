use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Where a source's calendar data comes from. Selected once at config load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceKind {
    /// ICS document over HTTP(S).
    Ics { url: String },
    /// `webcal://` subscription; fetched over HTTPS.
    Webcal { url: String },
    /// ICS document on the local filesystem.
    File { path: PathBuf },
}

impl SourceKind {
    /// URL to request for network kinds, with `webcal` rewritten to `https`.
    pub fn request_url(&self) -> Option<String> {
        match self {
            SourceKind::Ics { url } => Some(url.clone()),
            SourceKind::Webcal { url } => Some(match url.strip_prefix("webcal://") {
                Some(rest) => format!("https://{}", rest),
                None => url.clone(),
            }),
            SourceKind::File { .. } => None,
        }
    }

    /// Human-readable location used in logs and status output.
    pub fn location(&self) -> String {
        match self {
            SourceKind::Ics { url } | SourceKind::Webcal { url } => url.clone(),
            SourceKind::File { path } => path.display().to_string(),
        }
    }
}

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AuthConfig {
    #[default]
    None,
    Basic {
        username: String,
        #[serde(default)]
        password: Option<String>,
    },
    Bearer {
        token: String,
    },
}

// Secrets stay out of logs.
impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthConfig::None => write!(f, "None"),
            AuthConfig::Basic { username, .. } => write!(f, "Basic({}, ***)", username),
            AuthConfig::Bearer { .. } => write!(f, "Bearer(***)"),
        }
    }
}

/// A configured calendar source. Read-only input to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceConfig {
    pub id: String,
    pub kind: SourceKind,
    pub auth: AuthConfig,
    /// Overall deadline for one fetch attempt; `None` uses the fetcher default.
    pub fetch_timeout: Option<Duration>,
    pub ttl: Duration,
}

impl SourceConfig {
    pub fn new(id: &str, kind: SourceKind) -> Self {
        Self {
            id: id.to_string(),
            kind,
            auth: AuthConfig::None,
            fetch_timeout: None,
            ttl: Duration::from_secs(3600),
        }
    }

    /// Digest over everything that, when changed, counts as a reconfiguration.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.id.as_bytes());
        hasher.update([0x1f]);
        hasher.update(self.kind.location().as_bytes());
        hasher.update([0x1f]);
        match &self.auth {
            AuthConfig::None => hasher.update(b"none"),
            AuthConfig::Basic { username, password } => {
                hasher.update(b"basic");
                hasher.update(username.as_bytes());
                hasher.update([0x1f]);
                hasher.update(password.as_deref().unwrap_or("").as_bytes());
            }
            AuthConfig::Bearer { token } => {
                hasher.update(b"bearer");
                hasher.update(token.as_bytes());
            }
        }
        hex::encode(hasher.finalize())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "open" => CircuitState::Open,
            "half_open" => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Conditional-request validators remembered from the last committed fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validators {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub content_hash: Option<String>,
}

/// Persisted per-source sync metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceState {
    pub source_id: String,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub ttl_secs: u64,
    pub consecutive_failures: u32,
    pub circuit_state: CircuitState,
    pub last_error: Option<String>,
    pub validators: Validators,
    /// Fingerprint of the configuration that last failed authentication.
    pub auth_blocked: Option<String>,
}

impl SourceState {
    pub fn new(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            ..Default::default()
        }
    }

    pub fn is_auth_blocked(&self, source: &SourceConfig) -> bool {
        self.auth_blocked.as_deref() == Some(source.fingerprint().as_str())
    }
}

/// Failure bookkeeping written when a source's cycle fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFailure {
    pub attempted_at: DateTime<Utc>,
    pub error: String,
    pub circuit_state: CircuitState,
    pub consecutive_failures: u32,
    pub auth_blocked: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_webcal_rewritten_to_https() {
        let kind = SourceKind::Webcal {
            url: "webcal://example.com/cal.ics".into(),
        };
        assert_eq!(
            kind.request_url().as_deref(),
            Some("https://example.com/cal.ics")
        );
        let file = SourceKind::File {
            path: PathBuf::from("/tmp/cal.ics"),
        };
        assert!(file.request_url().is_none());
    }

    #[test]
    fn test_fingerprint_tracks_reconfiguration() {
        let mut source = SourceConfig::new(
            "work",
            SourceKind::Ics {
                url: "https://example.com/a.ics".into(),
            },
        );
        let before = source.fingerprint();
        assert_eq!(before, source.fingerprint());

        source.ttl = Duration::from_secs(60);
        assert_eq!(before, source.fingerprint(), "ttl is not part of identity");

        source.auth = AuthConfig::Bearer {
            token: "new".into(),
        };
        assert_ne!(before, source.fingerprint());
    }

    #[test]
    fn test_auth_debug_hides_secrets() {
        let auth = AuthConfig::Basic {
            username: "alice".into(),
            password: Some("hunter2".into()),
        };
        let shown = format!("{:?}", auth);
        assert!(shown.contains("alice"));
        assert!(!shown.contains("hunter2"));
    }

    #[test]
    fn test_circuit_state_string_round_trip() {
        for state in [CircuitState::Closed, CircuitState::Open, CircuitState::HalfOpen] {
            assert_eq!(CircuitState::parse(state.as_str()), state);
        }
    }
}
