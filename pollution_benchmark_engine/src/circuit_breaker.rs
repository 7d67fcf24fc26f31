// =============================================================================
// circuit_breaker.rs - KEEPING OUR HANDS OFF A STRUGGLING SATELLITE CATALOGUE
// =============================================================================
//
// The gas-reading service sits in front of a satellite catalogue with a hard
// request quota. When it starts failing (quota exhausted, backend down) the
// worst thing we can do is keep asking: every extra request pushes the quota
// reset further out.
//
// So: N consecutive failures trip the breaker open, requests are refused
// locally for a cooldown, then a trial request is let through (half-open).
// Enough trial successes close it again; one trial failure re-opens it.
//
// A refused request surfaces as FetchError::CircuitOpen, which the scanner
// treats exactly like any other fetch failure: that gas or city is marked
// unavailable for this scan and life goes on.
// =============================================================================

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::error::FetchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

struct CircuitBreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
    last_state_change: Instant,
    total_trips: u64,
}

/// Thread-safe breaker shared by every request to one upstream.
pub struct CircuitBreaker {
    name: String,
    inner: Arc<RwLock<CircuitBreakerInner>>,
    failure_threshold: u32,
    reset_timeout: Duration,
    success_threshold: u32,
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        failure_threshold: u32,
        reset_timeout: Duration,
        success_threshold: u32,
    ) -> Self {
        let name = name.into();
        info!(
            name = %name,
            failure_threshold = failure_threshold,
            reset_timeout_secs = reset_timeout.as_secs(),
            success_threshold = success_threshold,
            "Circuit breaker armed"
        );

        Self {
            name,
            inner: Arc::new(RwLock::new(CircuitBreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
                last_state_change: Instant::now(),
                total_trips: 0,
            })),
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
            success_threshold: success_threshold.max(1),
        }
    }

    /// Whether a request may go out right now. Moves Open -> HalfOpen once
    /// the cooldown has elapsed.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.write();

        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let cooled_down = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.reset_timeout)
                    .unwrap_or(true);
                if cooled_down {
                    info!(name = %self.name, "Circuit OPEN -> HALF_OPEN, sending a trial request");
                    inner.state = CircuitState::HalfOpen;
                    inner.success_count = 0;
                    inner.last_state_change = Instant::now();
                }
                cooled_down
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.write();

        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.success_threshold {
                    info!(
                        name = %self.name,
                        successes = inner.success_count,
                        "Circuit HALF_OPEN -> CLOSED, upstream looks healthy"
                    );
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.last_state_change = Instant::now();
                }
            }
            // A straggler from before the trip. Ignore it.
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.write();

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.failure_threshold {
                    warn!(
                        name = %self.name,
                        failures = inner.failure_count,
                        "Circuit TRIPPED, CLOSED -> OPEN"
                    );
                    Self::open(&mut inner);
                } else {
                    warn!(
                        name = %self.name,
                        failures = inner.failure_count,
                        threshold = self.failure_threshold,
                        "Upstream failure recorded"
                    );
                }
            }
            CircuitState::HalfOpen => {
                warn!(name = %self.name, "Trial request failed, HALF_OPEN -> OPEN");
                inner.failure_count = self.failure_threshold;
                Self::open(&mut inner);
            }
            CircuitState::Open => inner.opened_at = Some(Instant::now()),
        }
    }

    fn open(inner: &mut CircuitBreakerInner) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.total_trips += 1;
        inner.last_state_change = Instant::now();
    }

    /// Run `request` through the breaker. Refuses without running it when
    /// the circuit is open; otherwise records the outcome.
    pub async fn call<T, F>(&self, request: F) -> Result<T, FetchError>
    where
        F: Future<Output = Result<T, FetchError>>,
    {
        if !self.allow_request() {
            return Err(FetchError::CircuitOpen(self.name.clone()));
        }
        let outcome = request.await;
        match &outcome {
            Ok(_) => self.record_success(),
            Err(_) => self.record_failure(),
        }
        outcome
    }

    pub fn state(&self) -> CircuitState {
        self.inner.read().state
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let inner = self.inner.read();
        CircuitBreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            total_trips: inner.total_trips,
            time_in_current_state_secs: inner.last_state_change.elapsed().as_secs(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CircuitBreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub total_trips: u64,
    pub time_in_current_state_secs: u64,
}
