use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::config::{expand, ConfigError};
use crate::domain::{AuthConfig, SourceConfig, SourceKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKindName {
    #[default]
    Ics,
    Webcal,
    File,
}

/// One `[[sources]]` table as written in the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceEntry {
    pub id: String,
    #[serde(default)]
    pub kind: SourceKindName,
    pub url: Option<String>,
    pub path: Option<String>,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub auth: AuthConfig,
}

fn default_ttl_secs() -> u64 {
    3600
}

impl SourceEntry {
    pub fn resolve(&self) -> Result<SourceConfig, ConfigError> {
        let id = self.id.trim();
        if id.is_empty() {
            return Err(ConfigError::Invalid("source id must not be empty".into()));
        }
        if id.eq_ignore_ascii_case("all") {
            return Err(ConfigError::Invalid(
                "'all' is reserved and cannot be a source id".into(),
            ));
        }

        let kind = match self.kind {
            SourceKindName::Ics => SourceKind::Ics {
                url: self.checked_url(&["http", "https"])?,
            },
            SourceKindName::Webcal => SourceKind::Webcal {
                url: self.checked_url(&["webcal", "http", "https"])?,
            },
            SourceKindName::File => {
                let path = self.path.as_deref().ok_or_else(|| {
                    ConfigError::Invalid(format!("source '{}' needs a path", id))
                })?;
                SourceKind::File {
                    path: PathBuf::from(expand(path)?),
                }
            }
        };

        let auth = match &self.auth {
            AuthConfig::None => AuthConfig::None,
            AuthConfig::Basic { username, password } => AuthConfig::Basic {
                username: expand(username)?,
                password: password.as_deref().map(expand).transpose()?,
            },
            AuthConfig::Bearer { token } => AuthConfig::Bearer {
                token: expand(token)?,
            },
        };

        Ok(SourceConfig {
            id: id.to_string(),
            kind,
            auth,
            fetch_timeout: self.timeout_secs.map(Duration::from_secs),
            ttl: Duration::from_secs(self.ttl_secs),
        })
    }

    fn checked_url(&self, schemes: &[&str]) -> Result<String, ConfigError> {
        let raw = self
            .url
            .as_deref()
            .ok_or_else(|| ConfigError::Invalid(format!("source '{}' needs a url", self.id)))?;
        let expanded = expand(raw)?;
        let parsed = Url::parse(&expanded).map_err(|e| {
            ConfigError::Invalid(format!("source '{}' has an invalid url: {}", self.id, e))
        })?;
        if !schemes.contains(&parsed.scheme()) {
            return Err(ConfigError::Invalid(format!(
                "source '{}' uses unsupported scheme '{}'",
                self.id,
                parsed.scheme()
            )));
        }
        Ok(expanded)
    }
}
