use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::fetcher::circuit::CircuitBreakerConfig;

/// Configuration for feed retrieval
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// TCP/TLS connect timeout in seconds (default: 10)
    pub connect_timeout_secs: u64,

    /// Idle timeout between body reads in seconds (default: 30)
    pub read_timeout_secs: u64,

    /// Timeout for sending the request until response headers arrive (default: 15)
    pub write_timeout_secs: u64,

    /// Overall deadline for one attempt in seconds (default: 60)
    pub deadline_secs: u64,

    /// Responses larger than this are rejected (default: 10 MiB)
    pub max_body_bytes: u64,

    /// Connections in flight across all hosts (default: 32)
    pub max_connections: usize,

    /// Connections in flight to a single host (default: 4)
    pub max_connections_per_host: usize,

    /// Idle pooled connections kept per host (default: 4)
    pub pool_idle_per_host: usize,

    /// Consecutive failures that open a source's circuit (default: 3)
    pub failure_threshold: u32,

    /// Seconds an open circuit waits before allowing a probe (default: 300)
    pub cooldown_secs: u64,

    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            read_timeout_secs: 30,
            write_timeout_secs: 15,
            deadline_secs: 60,
            max_body_bytes: 10 * 1024 * 1024,
            max_connections: 32,
            max_connections_per_host: 4,
            pool_idle_per_host: 4,
            failure_threshold: 3,
            cooldown_secs: 300,
            user_agent: concat!("almanac/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl FetchConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }

    pub fn circuit(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            cooldown: Duration::from_secs(self.cooldown_secs),
        }
    }
}
