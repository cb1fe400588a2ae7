//! Circuit breaker for backend protection.
//!
//! # States
//! - Closed: normal operation, requests pass through
//! - Open: backend assumed down, requests fail fast
//! - Half-Open: testing if backend recovered
//!
//! # State Transitions
//! ```text
//! Closed → Open: consecutive failures >= failure_threshold
//! Open → Half-Open: first permit() after open_timeout has elapsed
//! Half-Open → Closed: consecutive trial successes >= success_threshold
//! Half-Open → Open: any trial failure
//! ```
//!
//! # Design Decisions
//! - Per-backend circuit breaker (not global)
//! - Fail fast in Open state (no waiting for timeout)
//! - Single trial in flight in Half-Open
//! - Every transition bumps a generation; outcomes carried by permits from an
//!   older generation only update totals
//! - A permit dropped without an outcome (the call panicked or was cancelled)
//!   is settled as a failure, so a lost trial cannot wedge Half-Open

use std::sync::Mutex;
use std::time::{Duration, Instant};
use serde::Serialize;

use crate::clock::SharedClock;
use crate::config::BreakerConfig;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    /// Numeric encoding used for gauges.
    pub fn as_gauge(self) -> f64 {
        match self {
            BreakerState::Closed => 0.0,
            BreakerState::HalfOpen => 1.0,
            BreakerState::Open => 2.0,
        }
    }
}

/// Proof that `permit()` allowed a request through.
///
/// Should be handed back to [`CircuitBreaker::record_outcome`]; dropping it
/// instead records a failure.
#[must_use = "a granted permit must be returned through record_outcome"]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    trial: bool,
    settled: bool,
}

impl BreakerPermit<'_> {
    /// True when this permit is the half-open trial request.
    pub fn is_trial(&self) -> bool {
        self.trial
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            tracing::warn!(
                server = %self.breaker.server,
                trial = self.trial,
                "Permit dropped without an outcome, counting it as a failure"
            );
            self.breaker.settle(self.generation, false, false);
        }
    }
}

impl std::fmt::Debug for BreakerPermit<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakerPermit")
            .field("server", &self.breaker.server)
            .field("generation", &self.generation)
            .field("trial", &self.trial)
            .finish()
    }
}

#[derive(Debug)]
struct Inner {
    config: BreakerConfig,
    state: BreakerState,
    generation: u64,
    consecutive_failures: u32,
    consecutive_successes: u32,
    trial_in_flight: bool,
    last_failure: Option<Instant>,
    last_state_change: Instant,
    total_requests: u64,
    total_failures: u64,
    total_timeouts: u64,
    total_rejected: u64,
}

/// Point-in-time view of a breaker for observability.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub server: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_timeout_ms: u64,
    pub since_last_failure_ms: Option<u64>,
    pub since_state_change_ms: u64,
    pub total_requests: u64,
    pub total_failures: u64,
    pub total_timeouts: u64,
    pub total_rejected: u64,
}

/// Per-server circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    server: String,
    clock: SharedClock,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(server: impl Into<String>, config: BreakerConfig, clock: SharedClock) -> Self {
        let now = clock.now();
        Self {
            server: server.into(),
            clock,
            inner: Mutex::new(Inner {
                config,
                state: BreakerState::Closed,
                generation: 0,
                consecutive_failures: 0,
                consecutive_successes: 0,
                trial_in_flight: false,
                last_failure: None,
                last_state_change: now,
                total_requests: 0,
                total_failures: 0,
                total_timeouts: 0,
                total_rejected: 0,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// Ask to send one request downstream.
    ///
    /// Returns `None` when the breaker is open, or half-open with its trial
    /// already in flight.
    pub fn permit(&self) -> Option<BreakerPermit<'_>> {
        let now = self.clock.now();
        let mut inner = self.lock();

        match inner.state {
            BreakerState::Closed => Some(self.grant(inner.generation, false)),
            BreakerState::Open => {
                if now.duration_since(inner.last_state_change) < inner.config.open_timeout() {
                    inner.total_rejected += 1;
                    return None;
                }
                self.transition(&mut inner, BreakerState::HalfOpen, now);
                inner.trial_in_flight = true;
                Some(self.grant(inner.generation, true))
            }
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    inner.total_rejected += 1;
                    return None;
                }
                inner.trial_in_flight = true;
                Some(self.grant(inner.generation, true))
            }
        }
    }

    fn grant(&self, generation: u64, trial: bool) -> BreakerPermit<'_> {
        BreakerPermit {
            breaker: self,
            generation,
            trial,
            settled: false,
        }
    }

    /// Report the result of a permitted request.
    pub fn record_outcome(&self, mut permit: BreakerPermit<'_>, success: bool, was_timeout: bool) {
        permit.settled = true;
        self.settle(permit.generation, success, was_timeout);
    }

    fn settle(&self, generation: u64, success: bool, was_timeout: bool) {
        let now = self.clock.now();
        let mut inner = self.lock();

        inner.total_requests += 1;
        if !success {
            inner.total_failures += 1;
            inner.last_failure = Some(now);
        }
        if was_timeout {
            inner.total_timeouts += 1;
        }

        if generation != inner.generation {
            return;
        }

        match inner.state {
            BreakerState::Closed => {
                if success {
                    inner.consecutive_failures = 0;
                    inner.consecutive_successes = inner.consecutive_successes.saturating_add(1);
                } else {
                    self.count_closed_failure(&mut inner, now);
                }
            }
            BreakerState::HalfOpen => {
                inner.trial_in_flight = false;
                if success {
                    inner.consecutive_successes += 1;
                    if inner.consecutive_successes >= inner.config.success_threshold {
                        self.transition(&mut inner, BreakerState::Closed, now);
                    }
                } else {
                    self.transition(&mut inner, BreakerState::Open, now);
                }
            }
            // Permits are never granted in Open, so a matching generation
            // cannot observe it.
            BreakerState::Open => {}
        }
    }

    /// Report downstream distress observed without a permit, such as a pool
    /// acquire timeout.
    pub fn record_failure(&self, was_timeout: bool) {
        let now = self.clock.now();
        let mut inner = self.lock();

        inner.total_requests += 1;
        inner.total_failures += 1;
        inner.last_failure = Some(now);
        if was_timeout {
            inner.total_timeouts += 1;
        }

        match inner.state {
            BreakerState::Closed => self.count_closed_failure(&mut inner, now),
            BreakerState::HalfOpen => self.transition(&mut inner, BreakerState::Open, now),
            BreakerState::Open => {}
        }
    }

    /// Swap thresholds without disturbing the current state.
    pub fn reconfigure(&self, config: BreakerConfig) {
        let mut inner = self.lock();
        if inner.config != config {
            tracing::info!(server = %self.server, ?config, "Circuit breaker reconfigured");
            inner.config = config;
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let now = self.clock.now();
        let inner = self.lock();
        BreakerSnapshot {
            server: self.server.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            failure_threshold: inner.config.failure_threshold,
            success_threshold: inner.config.success_threshold,
            open_timeout_ms: inner.config.open_timeout_ms,
            since_last_failure_ms: inner.last_failure.map(|t| millis(now.duration_since(t))),
            since_state_change_ms: millis(now.duration_since(inner.last_state_change)),
            total_requests: inner.total_requests,
            total_failures: inner.total_failures,
            total_timeouts: inner.total_timeouts,
            total_rejected: inner.total_rejected,
        }
    }

    fn count_closed_failure(&self, inner: &mut Inner, now: Instant) {
        inner.consecutive_successes = 0;
        inner.consecutive_failures += 1;
        if inner.consecutive_failures >= inner.config.failure_threshold {
            self.transition(inner, BreakerState::Open, now);
        }
    }

    fn transition(&self, inner: &mut Inner, to: BreakerState, now: Instant) {
        let from = inner.state;
        inner.state = to;
        inner.generation += 1;
        inner.last_state_change = now;
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
        inner.trial_in_flight = false;

        match to {
            BreakerState::Open => {
                tracing::warn!(server = %self.server, ?from, "Circuit breaker opened");
            }
            BreakerState::HalfOpen => {
                tracing::info!(server = %self.server, "Circuit breaker half-open, sending trial");
            }
            BreakerState::Closed => {
                tracing::info!(server = %self.server, "Circuit breaker closed");
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("circuit breaker mutex poisoned")
    }
}

fn millis(d: Duration) -> u64 {
    d.as_millis().min(u64::MAX as u128) as u64
}
