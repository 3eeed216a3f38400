//! Circuit breaker guarding the destination systems.
//!
//! Prevents hammering the database or the shared store while they are down.
//! One breaker is shared (behind an `Arc`) by every orchestration attempt in
//! the process.
//!
//! # States
//!
//! ```text
//!            N consecutive failures
//!   Closed ─────────────────────────► Open
//!     ▲                                │
//!     │ trial succeeds                 │ recovery_timeout elapsed
//!     │                                ▼
//!     └────────────────────────── HalfOpen ──trial fails──► Open
//! ```
//!
//! - **Closed**: requests pass through; consecutive failures are counted
//! - **Open**: requests are rejected without touching downstream
//! - **HalfOpen**: exactly one trial request is admitted; others are rejected
//!   until it reports back
//!
//! Callers report the outcome of every admitted call with
//! [`record_success`](CircuitBreaker::record_success),
//! [`record_failure`](CircuitBreaker::record_failure) or
//! [`record_neutral`](CircuitBreaker::record_neutral). Neutral outcomes
//! (bad input) say nothing about downstream health: they free the half-open
//! trial slot and leave the state alone.
//!
//! # Usage
//!
//! ```rust
//! use rfq_sync::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitState};
//!
//! let breaker = CircuitBreaker::new("rfq_sync", CircuitConfig::default());
//! if breaker.try_acquire() {
//!     // ... call downstream ...
//!     breaker.record_success();
//! }
//! assert_eq!(breaker.state(), CircuitState::Closed);
//! ```

use crate::config::CircuitSettings;
use crate::metrics;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker state for metrics/monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, requests pass through
    Closed = 0,
    /// Testing if service recovered
    HalfOpen = 1,
    /// Service unhealthy, fail-fast
    Open = 2,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::HalfOpen => write!(f, "half_open"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Configuration for a circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Number of consecutive failures to trip the circuit.
    pub failure_threshold: u32,
    /// How long to stay open before admitting a trial (half-open).
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

impl CircuitConfig {
    /// Fast recovery for testing.
    #[must_use]
    pub fn testing() -> Self {
        Self {
            failure_threshold: 2,
            recovery_timeout: Duration::from_millis(50),
        }
    }
}

impl From<&CircuitSettings> for CircuitConfig {
    fn from(settings: &CircuitSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold,
            recovery_timeout: Duration::from_secs(settings.recovery_timeout_sec),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// A named circuit breaker with metrics tracking.
///
/// The state lives behind a `std::sync::Mutex` that is only held for the
/// duration of a transition, never across an `.await`.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    inner: Mutex<Inner>,

    // Metrics
    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given name and config.
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    /// Create with default config.
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitConfig::default())
    }

    /// Get the circuit breaker name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Transitions never panic mid-update, so a poisoned guard is still consistent.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        if inner.state != to {
            debug!(circuit = %self.name, from = %inner.state, to = %to, "Circuit transition");
            inner.state = to;
            metrics::record_circuit_state(&self.name, to);
        }
    }

    /// Current state. An open breaker whose recovery window has elapsed
    /// still reports `Open` until the next [`try_acquire`](Self::try_acquire).
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Ask to make a call. `false` means rejected: do not touch downstream.
    pub fn try_acquire(&self) -> bool {
        self.calls_total.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.lock();

        let admitted = match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map_or(true, |at| at.elapsed() >= self.config.recovery_timeout);
                if elapsed {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.trial_in_flight = true;
                    info!(circuit = %self.name, "Circuit half-open, admitting trial call");
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    false
                } else {
                    inner.trial_in_flight = true;
                    true
                }
            }
        };

        if !admitted {
            self.rejections.fetch_add(1, Ordering::Relaxed);
            debug!(circuit = %self.name, state = %inner.state, "Circuit breaker rejected call");
        }
        admitted
    }

    /// The admitted call succeeded: close and reset.
    pub fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            info!(circuit = %self.name, "Trial call succeeded, circuit closed");
        }
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
        self.transition(&mut inner, CircuitState::Closed);
    }

    /// The admitted call failed in a way that reflects downstream health.
    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.trial_in_flight = false;
                inner.opened_at = Some(Instant::now());
                self.transition(&mut inner, CircuitState::Open);
                warn!(circuit = %self.name, "Trial call failed, circuit reopened");
            }
            CircuitState::Closed => {
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.opened_at = Some(Instant::now());
                    self.transition(&mut inner, CircuitState::Open);
                    warn!(
                        circuit = %self.name,
                        failures = inner.consecutive_failures,
                        recovery_timeout_ms = self.config.recovery_timeout.as_millis() as u64,
                        "Circuit breaker opened"
                    );
                }
            }
            CircuitState::Open => {}
        }
    }

    /// The admitted call ended with an outcome unrelated to downstream
    /// health. Frees the half-open trial slot; no state change.
    pub fn record_neutral(&self) {
        let mut inner = self.lock();
        inner.trial_in_flight = false;
    }

    /// Consecutive failures counted while closed.
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Get total number of calls.
    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    /// Get number of successful calls.
    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    /// Get number of failed calls.
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Get number of rejected calls (circuit open).
    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }
}
