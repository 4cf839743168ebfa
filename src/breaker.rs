//! Circuit breaker over OFD calls.
//!
//! Three states. CLOSED passes calls through and counts consecutive
//! transient failures; OPEN short-circuits without touching the network
//! until the recovery deadline; HALF_OPEN lets exactly one probe through at
//! a time and needs `success_threshold` consecutive successes to close.
//! Permanent (receipt-specific) failures never open the circuit.
//!
//! State lives behind a mutex, so callers observe at most one transition per
//! call. The breaker is rebuilt from observation after a restart.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::config::BreakerConfig;
use crate::metrics::{AdapterMetrics, BREAKER_CLOSED, BREAKER_HALF_OPEN, BREAKER_OPEN};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }

    fn gauge_value(&self) -> i64 {
        match self {
            BreakerState::Closed => BREAKER_CLOSED,
            BreakerState::Open => BREAKER_OPEN,
            BreakerState::HalfOpen => BREAKER_HALF_OPEN,
        }
    }
}

/// Posture change that the caller must record in the buffer event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerTransition {
    Opened,
    Closed,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    open_deadline: Option<Instant>,
    probe_in_flight: bool,
}

pub struct CircuitBreaker {
    cfg: BreakerConfig,
    inner: Mutex<Inner>,
    metrics: Arc<AdapterMetrics>,
}

impl CircuitBreaker {
    pub fn new(cfg: BreakerConfig, metrics: Arc<AdapterMetrics>) -> Self {
        metrics.set_breaker_state(BREAKER_CLOSED);
        CircuitBreaker {
            cfg,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                open_deadline: None,
                probe_in_flight: false,
            }),
            metrics,
        }
    }

    /// Ask to make one call. `false` means short-circuit: the OFD must not
    /// be touched. A `true` from a HALF_OPEN breaker reserves the single
    /// probe slot until the call reports its outcome.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock();
        self.promote_if_due(&mut inner);

        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => false,
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Current state, with the OPEN -> HALF_OPEN promotion applied when the
    /// recovery deadline has passed.
    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock();
        self.promote_if_due(&mut inner);
        inner.state
    }

    pub fn on_success(&self) -> Option<BreakerTransition> {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures = 0;
                None
            }
            BreakerState::HalfOpen => {
                inner.probe_in_flight = false;
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.cfg.success_threshold {
                    self.transition(&mut inner, BreakerState::Closed);
                    Some(BreakerTransition::Closed)
                } else {
                    None
                }
            }
            // A success while OPEN means the caller raced a transition;
            // posture is unchanged.
            BreakerState::Open => None,
        }
    }

    pub fn on_transient_failure(&self) -> Option<BreakerTransition> {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.cfg.failure_threshold {
                    self.transition(&mut inner, BreakerState::Open);
                    Some(BreakerTransition::Opened)
                } else {
                    None
                }
            }
            BreakerState::HalfOpen => {
                inner.probe_in_flight = false;
                self.transition(&mut inner, BreakerState::Open);
                Some(BreakerTransition::Opened)
            }
            BreakerState::Open => None,
        }
    }

    /// Permanent failures are receipt-specific: they never move the breaker,
    /// but in HALF_OPEN they release the probe slot.
    pub fn on_permanent_failure(&self) {
        let mut inner = self.inner.lock();
        if inner.state == BreakerState::HalfOpen {
            inner.probe_in_flight = false;
        }
    }

    fn promote_if_due(&self, inner: &mut Inner) {
        if inner.state == BreakerState::Open {
            if let Some(deadline) = inner.open_deadline {
                if Instant::now() >= deadline {
                    self.transition(inner, BreakerState::HalfOpen);
                }
            }
        }
    }

    fn transition(&self, inner: &mut Inner, to: BreakerState) {
        let from = inner.state;
        inner.state = to;
        match to {
            BreakerState::Open => {
                inner.open_deadline = Some(Instant::now() + self.cfg.recovery_timeout);
                inner.consecutive_successes = 0;
                inner.probe_in_flight = false;
                warn!(
                    from = from.as_str(),
                    recovery_timeout_s = self.cfg.recovery_timeout.as_secs(),
                    "Circuit breaker OPEN, OFD calls short-circuit"
                );
            }
            BreakerState::HalfOpen => {
                inner.consecutive_successes = 0;
                inner.probe_in_flight = false;
                info!("Circuit breaker HALF_OPEN, probing OFD");
            }
            BreakerState::Closed => {
                inner.consecutive_failures = 0;
                inner.consecutive_successes = 0;
                inner.open_deadline = None;
                inner.probe_in_flight = false;
                info!(from = from.as_str(), "Circuit breaker CLOSED");
            }
        }
        self.metrics.set_breaker_state(to.gauge_value());
    }
}
