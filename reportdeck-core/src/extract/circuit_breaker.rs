//! Per-source circuit breaker.
//!
//! A source that fails `failure_threshold` times in a row is refused for a
//! cooldown period, so a batch falls back immediately instead of waiting out
//! another timeout on a document that is known to be broken.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// State of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Requests are allowed.
    Closed,
    /// All requests are refused until cooldown expires.
    Open { tripped_at: Instant },
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    cooldown: Duration,
    failure_threshold: u32,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
            }),
            cooldown,
            failure_threshold: failure_threshold.max(1),
        }
    }

    /// Check if a request is currently allowed. An expired cooldown closes the breaker.
    pub fn is_allowed(&self) -> bool {
        let mut inner = self.inner.lock().expect("circuit breaker poisoned");
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open { tripped_at } => {
                if tripped_at.elapsed() >= self.cooldown {
                    inner.state = BreakerState::Closed;
                    inner.consecutive_failures = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("circuit breaker poisoned");
        inner.consecutive_failures = 0;
        inner.state = BreakerState::Closed;
    }

    /// Record a failure. Returns `true` if this failure tripped the breaker.
    pub fn record_failure(&self) -> bool {
        let mut inner = self.inner.lock().expect("circuit breaker poisoned");
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        let trips = inner.consecutive_failures >= self.failure_threshold
            && inner.state == BreakerState::Closed;
        if trips {
            inner.state = BreakerState::Open {
                tripped_at: Instant::now(),
            };
        }
        trips
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().expect("circuit breaker poisoned").state
    }

    /// Remaining cooldown time (zero if not tripped).
    pub fn remaining_cooldown(&self) -> Duration {
        match self.state() {
            BreakerState::Closed => Duration::ZERO,
            BreakerState::Open { tripped_at } => {
                self.cooldown.saturating_sub(tripped_at.elapsed())
            }
        }
    }
}
