//! Circuit breaker guarding the delivery endpoint.
//!
//! Closed: calls flow. Open: calls are rejected until the recovery timeout
//! has elapsed since the last failure. HalfOpen: a bounded number of probe
//! calls are admitted; a success closes the circuit, a failure reopens it.
//!
//! Admission and the half-open probe count are updated under one lock, so
//! concurrent callers can never admit more than `half_open_max_calls` probes.

use std::sync::Mutex;

use effm_core::{now_millis, CircuitBreakerConfig};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Requests flow normally
    Closed,
    /// Requests are rejected
    Open,
    /// Limited probing
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        };
        write!(f, "{}", s)
    }
}

/// Point-in-time view of the breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSnapshot {
    /// Current state
    pub state: BreakerState,
    /// Consecutive failures
    pub failure_count: u32,
    /// Last observed service health
    pub service_healthy: bool,
    /// Wall time of the last failure, milliseconds since epoch
    pub last_failure_at: Option<i64>,
    /// Earliest wall time a probe is admitted (only while Open)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<i64>,
}

#[derive(Debug)]
struct Inner {
    config: CircuitBreakerConfig,
    state: BreakerState,
    failure_count: u32,
    half_open_calls: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<i64>,
    service_healthy: bool,
}

impl Inner {
    fn open(&mut self) {
        self.state = BreakerState::Open;
        self.service_healthy = false;
        self.last_failure = Some(Instant::now());
        self.last_failure_at = Some(now_millis());
        warn!("Circuit breaker opened after {} failures", self.failure_count);
    }
}

/// Failure-counting circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                config,
                state: BreakerState::Closed,
                failure_count: 0,
                half_open_calls: 0,
                last_failure: None,
                last_failure_at: None,
                service_healthy: true,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace thresholds; state and counters are kept.
    pub fn set_config(&self, config: CircuitBreakerConfig) {
        self.lock().config = config;
    }

    /// Current state, without side effects.
    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// Last observed service health.
    pub fn service_healthy(&self) -> bool {
        self.lock().service_healthy
    }

    /// Ask to make a call. Admitting a half-open probe consumes a slot.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let recovered = inner
                    .last_failure
                    .map(|at| at.elapsed() >= inner.config.recovery_timeout())
                    .unwrap_or(true);
                if recovered {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_calls = 1;
                    info!("Circuit breaker half-open, probing");
                }
                recovered
            }
            BreakerState::HalfOpen => {
                if inner.half_open_calls < inner.config.half_open_max_calls {
                    inner.half_open_calls += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.failure_count = 0;
        inner.service_healthy = true;
        if inner.state == BreakerState::HalfOpen {
            inner.state = BreakerState::Closed;
            inner.half_open_calls = 0;
            info!("Circuit breaker closed after successful probe");
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());
        inner.last_failure_at = Some(now_millis());
        match inner.state {
            BreakerState::HalfOpen => inner.open(),
            BreakerState::Closed if inner.failure_count >= inner.config.failure_threshold => {
                inner.open()
            }
            _ => {}
        }
    }

    /// Open immediately (unhealthy service observed).
    pub fn force_open(&self) {
        self.lock().open();
    }

    /// Back to Closed with cleared counters (healthy service observed).
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = BreakerState::Closed;
        inner.failure_count = 0;
        inner.half_open_calls = 0;
        inner.service_healthy = true;
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        let next_retry_at = match (inner.state, inner.last_failure_at) {
            (BreakerState::Open, Some(at)) => i64::try_from(inner.config.recovery_timeout_ms)
                .ok()
                .and_then(|timeout| at.checked_add(timeout)),
            _ => None,
        };
        BreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            service_healthy: inner.service_healthy,
            last_failure_at: inner.last_failure_at,
            next_retry_at,
        }
    }
}
