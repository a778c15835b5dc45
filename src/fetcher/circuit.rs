//! Per-source circuit breaking.
//!
//! After `failure_threshold` consecutive failures a source's circuit opens
//! and fetches short-circuit without touching the network. Once the cooldown
//! elapses a single probe is let through: success closes the circuit,
//! failure reopens it for another cooldown.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{info, warn};

use crate::domain::{CircuitState, RawFeedPayload, SourceConfig, Validators};
use crate::fetcher::{FetchError, Fetcher};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

#[derive(Debug, Default)]
struct Breaker {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Probe,
    Rejected { retry_in: Duration },
}

/// Breaker registry keyed by source id.
#[derive(Debug)]
pub struct CircuitBreakers {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Breaker>>,
}

impl CircuitBreakers {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Breaker>> {
        self.breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Decide whether a fetch for `source_id` may proceed.
    pub fn admit(&self, source_id: &str) -> Admission {
        let mut breakers = self.lock();
        let breaker = breakers.entry(source_id.to_string()).or_default();

        match breaker.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => {
                let elapsed = breaker
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(self.config.cooldown);
                if elapsed >= self.config.cooldown {
                    info!(source = source_id, "circuit half-open, probing");
                    breaker.state = CircuitState::HalfOpen;
                    breaker.probing = true;
                    Admission::Probe
                } else {
                    Admission::Rejected {
                        retry_in: self.config.cooldown - elapsed,
                    }
                }
            }
            CircuitState::HalfOpen if breaker.probing => Admission::Rejected {
                retry_in: Duration::ZERO,
            },
            CircuitState::HalfOpen => {
                breaker.probing = true;
                Admission::Probe
            }
        }
    }

    pub fn record_success(&self, source_id: &str) {
        let mut breakers = self.lock();
        let breaker = breakers.entry(source_id.to_string()).or_default();
        if breaker.state != CircuitState::Closed {
            info!(source = source_id, "circuit closed");
        }
        *breaker = Breaker::default();
    }

    /// Count a failure and return the resulting state.
    pub fn record_failure(&self, source_id: &str) -> CircuitState {
        let mut breakers = self.lock();
        let breaker = breakers.entry(source_id.to_string()).or_default();
        breaker.consecutive_failures = breaker.consecutive_failures.saturating_add(1);
        breaker.probing = false;

        let should_open = match breaker.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => breaker.consecutive_failures >= self.config.failure_threshold,
            CircuitState::Open => false,
        };
        if should_open {
            warn!(
                source = source_id,
                failures = breaker.consecutive_failures,
                "circuit opened"
            );
            breaker.state = CircuitState::Open;
            breaker.opened_at = Some(Instant::now());
        }
        breaker.state
    }

    /// Give back a probe whose attempt ended without an outcome.
    pub fn release_probe(&self, source_id: &str) {
        if let Some(breaker) = self.lock().get_mut(source_id) {
            breaker.probing = false;
        }
    }

    pub fn state(&self, source_id: &str) -> CircuitState {
        self.snapshot(source_id).0
    }

    /// Current state and consecutive failure count.
    pub fn snapshot(&self, source_id: &str) -> (CircuitState, u32) {
        self.lock()
            .get(source_id)
            .map(|b| (b.state, b.consecutive_failures))
            .unwrap_or((CircuitState::Closed, 0))
    }

    /// Seed a breaker from persisted state. An open circuit restarts its
    /// cooldown from now.
    pub fn restore(&self, source_id: &str, state: CircuitState, consecutive_failures: u32) {
        let mut breakers = self.lock();
        let breaker = breakers.entry(source_id.to_string()).or_default();
        breaker.state = state;
        breaker.consecutive_failures = consecutive_failures;
        breaker.probing = false;
        breaker.opened_at = match state {
            CircuitState::Open => Some(Instant::now()),
            _ => None,
        };
    }
}

/// Fetcher decorator that consults the source's breaker before every call.
pub struct GuardedFetcher {
    inner: Arc<dyn Fetcher + Send + Sync>,
    breakers: Arc<CircuitBreakers>,
}

impl GuardedFetcher {
    pub fn new(inner: Arc<dyn Fetcher + Send + Sync>, breakers: Arc<CircuitBreakers>) -> Self {
        Self { inner, breakers }
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakers> {
        &self.breakers
    }
}

/// Releases a half-open probe if the fetch future is dropped mid-flight.
struct ProbeGuard<'a> {
    breakers: &'a CircuitBreakers,
    source_id: &'a str,
    armed: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breakers.release_probe(self.source_id);
        }
    }
}

#[async_trait]
impl Fetcher for GuardedFetcher {
    async fn fetch(
        &self,
        source: &SourceConfig,
        previous: &Validators,
    ) -> Result<RawFeedPayload, FetchError> {
        if let Admission::Rejected { retry_in } = self.breakers.admit(&source.id) {
            return Err(FetchError::CircuitOpen {
                source_id: source.id.clone(),
                retry_in,
            });
        }

        let mut guard = ProbeGuard {
            breakers: &self.breakers,
            source_id: &source.id,
            armed: true,
        };
        let result = self.inner.fetch(source, previous).await;
        guard.armed = false;

        match &result {
            Ok(_) => self.breakers.record_success(&source.id),
            Err(e) if e.trips_circuit() => {
                self.breakers.record_failure(&source.id);
            }
            Err(_) => self.breakers.release_probe(&source.id),
        }
        result
    }
}
