//! Circuit breaker pattern implementation.
//!
//! The circuit breaker prevents cascading failures by stopping calls to a
//! failing backend and allowing it time to recover. After `reset_timeout`
//! in the open state a single trial call is let through; `success_threshold`
//! successful trials close the circuit again, any failed trial re-opens it.
//! A trial run through [`CircuitBreaker::call`] whose future is dropped
//! before it reports back frees the trial slot for the next caller.

use dashmap::DashMap;
use gateway_core::{GatewayError, GatewayResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Circuit is closed, requests flow normally
    Closed,
    /// Circuit is open, requests are rejected
    Open,
    /// Circuit is half-open, testing if the backend recovered
    HalfOpen,
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Successful trial calls required to close the circuit
    pub success_threshold: u32,
    /// Time to wait in the open state before probing
    #[serde(with = "humantime_serde")]
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_successes: u32,
    trial_in_flight: bool,
    /// Incremented for every admitted trial; survives resets
    trial_epoch: u64,
    rejected: u64,
}

impl BreakerState {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            half_open_successes: 0,
            trial_in_flight: false,
            trial_epoch: 0,
            rejected: 0,
        }
    }

    fn start_trial(&mut self) -> u64 {
        self.trial_in_flight = true;
        self.trial_epoch = self.trial_epoch.wrapping_add(1);
        self.trial_epoch
    }
}

/// How a call was let through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Rejected,
    Normal,
    /// Half-open trial with its epoch
    Trial(u64),
}

/// Circuit breaker for a single call site
#[derive(Debug)]
pub struct CircuitBreaker {
    /// Call-site identifier
    name: String,
    /// Configuration
    config: CircuitBreakerConfig,
    /// State, guarded as a unit so transitions stay atomic
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState::closed()),
        }
    }

    /// Create with default configuration
    #[must_use]
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    /// Get the call-site name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the current state
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Whether a call may proceed now
    pub fn allow_request(&self) -> bool {
        self.allow_request_at(Instant::now())
    }

    /// Whether a call may proceed at `now`
    ///
    /// An open circuit whose reset timeout has elapsed moves to half-open
    /// and admits exactly one trial at a time.
    pub fn allow_request_at(&self, now: Instant) -> bool {
        self.admit_at(now) != Admission::Rejected
    }

    fn admit_at(&self, now: Instant) -> Admission {
        let mut inner = self.inner.lock();
        let admission = match inner.state {
            CircuitState::Closed => Admission::Normal,
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    Admission::Rejected
                } else {
                    Admission::Trial(inner.start_trial())
                }
            }
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map_or(Duration::ZERO, |at| now.saturating_duration_since(at));
                if elapsed >= self.config.reset_timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_successes = 0;
                    info!(breaker = %self.name, "Circuit breaker half-open, testing");
                    Admission::Trial(inner.start_trial())
                } else {
                    Admission::Rejected
                }
            }
        };
        if admission == Admission::Rejected {
            inner.rejected += 1;
        }
        admission
    }

    /// Check if the circuit allows a call
    ///
    /// # Errors
    /// Returns `GatewayError::CircuitOpen` if the call is refused
    pub fn check(&self) -> GatewayResult<()> {
        if self.allow_request() {
            Ok(())
        } else {
            Err(GatewayError::circuit_open(&self.name))
        }
    }

    /// Record a successful call
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = inner.consecutive_failures.saturating_sub(1);
            }
            CircuitState::HalfOpen => {
                inner.trial_in_flight = false;
                inner.half_open_successes += 1;
                debug!(
                    breaker = %self.name,
                    successes = inner.half_open_successes,
                    threshold = self.config.success_threshold,
                    "Circuit breaker half-open success"
                );
                if inner.half_open_successes >= self.config.success_threshold {
                    *inner = BreakerState {
                        rejected: inner.rejected,
                        trial_epoch: inner.trial_epoch,
                        ..BreakerState::closed()
                    };
                    info!(breaker = %self.name, "Circuit breaker closed");
                }
            }
            CircuitState::Open => {
                // A call admitted before the circuit opened finished late.
            }
        }
    }

    /// Record a failed call
    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now());
    }

    /// Record a failed call at `now`
    pub fn record_failure_at(&self, now: Instant) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    debug!(
                        breaker = %self.name,
                        failures = inner.consecutive_failures,
                        threshold = self.config.failure_threshold,
                        "Circuit breaker failure threshold reached"
                    );
                    Self::open(&self.name, &mut inner, now);
                }
            }
            CircuitState::HalfOpen => {
                debug!(breaker = %self.name, "Circuit breaker half-open failure, reopening");
                Self::open(&self.name, &mut inner, now);
            }
            CircuitState::Open => {
                // Already open, nothing to do
            }
        }
    }

    /// Run `call` through the breaker, recording its outcome
    ///
    /// # Errors
    /// Returns `GatewayError::CircuitOpen` without running `call` when the
    /// circuit refuses it, otherwise the call's own error.
    pub async fn call<T, F, Fut>(&self, call: F) -> GatewayResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        let trial = match self.admit_at(Instant::now()) {
            Admission::Rejected => return Err(GatewayError::circuit_open(&self.name)),
            Admission::Normal => None,
            Admission::Trial(epoch) => Some(epoch),
        };
        let mut pending = PendingTrial {
            breaker: self,
            epoch: trial,
        };

        let result = call().await;
        pending.epoch = None;
        match &result {
            Ok(_) => self.record_success(),
            Err(_) => self.record_failure(),
        }
        result
    }

    /// Reset the circuit breaker to closed state
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        *inner = BreakerState {
            trial_epoch: inner.trial_epoch,
            ..BreakerState::closed()
        };
        info!(breaker = %self.name, "Circuit breaker reset");
    }

    /// Free the half-open trial slot held by an abandoned trial
    fn abandon_trial(&self, epoch: u64) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen
            && inner.trial_in_flight
            && inner.trial_epoch == epoch
        {
            inner.trial_in_flight = false;
            debug!(breaker = %self.name, "Half-open trial abandoned");
        }
    }

    /// Force the circuit open (for testing or manual intervention)
    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        Self::open(&self.name, &mut inner, Instant::now());
    }

    /// Get current statistics
    #[must_use]
    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock();
        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            half_open_successes: inner.half_open_successes,
            rejected: inner.rejected,
        }
    }

    fn open(name: &str, inner: &mut BreakerState, now: Instant) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(now);
        inner.half_open_successes = 0;
        inner.trial_in_flight = false;
        warn!(breaker = %name, failures = inner.consecutive_failures, "Circuit breaker opened");
    }
}

/// Trial admitted by [`CircuitBreaker::call`] that has not reported back
struct PendingTrial<'a> {
    breaker: &'a CircuitBreaker,
    epoch: Option<u64>,
}

impl Drop for PendingTrial<'_> {
    fn drop(&mut self) {
        if let Some(epoch) = self.epoch {
            self.breaker.abandon_trial(epoch);
        }
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitBreakerStats {
    /// Call-site name
    pub name: String,
    /// Current state
    pub state: CircuitState,
    /// Consecutive failures while closed
    pub consecutive_failures: u32,
    /// Successful trials in the half-open state
    pub half_open_successes: u32,
    /// Calls refused since creation
    pub rejected: u64,
}

/// One breaker per protected call site, created on first use
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    /// Create a registry whose breakers share `config`
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    /// Breaker for `name`, creating it if needed
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.config.clone())))
            .clone()
    }

    /// Statistics of every breaker
    #[must_use]
    pub fn stats(&self) -> Vec<CircuitBreakerStats> {
        let mut all: Vec<_> = self.breakers.iter().map(|b| b.stats()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }
}
