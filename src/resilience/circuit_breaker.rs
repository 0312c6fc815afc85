// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Circuit breaker guarding the remote queue.
//!
//! Three states drive write routing:
//! - Closed: normal operation, failures are counted
//! - Open: remote considered down, writes go straight to the durable store
//! - HalfOpen: cooldown elapsed, the next write is a probe
//!
//! The Open -> HalfOpen cooldown is a deadline carried inside the `Open`
//! state and applied on every observation, so "cancelling the timer" is a
//! plain state overwrite: idempotent and safe from any task. Every
//! transition is visible to `state()` before the triggering call returns.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed = 0,
    HalfOpen = 1,
    Open = 2,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::HalfOpen => write!(f, "half_open"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Configuration for the breaker.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Consecutive failures in Closed before tripping.
    pub failure_threshold: u32,
    /// How long Open lasts before the next write may probe.
    pub cooldown: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_millis(2000),
        }
    }
}

impl CircuitConfig {
    /// Fast cooldown for tests.
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            failure_threshold: 2,
            cooldown: Duration::from_millis(20),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Inner {
    Closed { failures: u32 },
    Open { until: Instant },
    HalfOpen,
}

/// A named circuit breaker with call counters.
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    inner: Mutex<Inner>,

    successes: AtomicU64,
    failures: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner::Closed { failures: 0 }),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitConfig::default())
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state. An expired Open is promoted to HalfOpen here, so the
    /// cooldown needs no timer task and cancellation cannot race.
    #[must_use]
    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock();
        Self::observe(&mut inner, &self.name)
    }

    /// Record a successful remote call.
    ///
    /// Closed: resets the failure count. HalfOpen: the probe succeeded,
    /// close the circuit.
    pub fn record_success(&self) -> BreakerState {
        self.successes.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        match Self::observe(&mut inner, &self.name) {
            BreakerState::Closed => {
                *inner = Inner::Closed { failures: 0 };
            }
            BreakerState::HalfOpen => {
                info!(circuit = %self.name, "Probe succeeded, closing circuit");
                *inner = Inner::Closed { failures: 0 };
            }
            // A success while Open can only come from a call that started
            // before the trip; the state is left alone.
            BreakerState::Open => {}
        }
        self.publish(&inner)
    }

    /// Record a failed remote call. Returns the state after the update so
    /// the caller can detect the Closed -> Open trip.
    pub fn record_failure(&self) -> BreakerState {
        self.failures.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        match Self::observe(&mut inner, &self.name) {
            BreakerState::Closed => {
                let failures = match *inner {
                    Inner::Closed { failures } => failures + 1,
                    _ => 1,
                };
                if failures >= self.config.failure_threshold {
                    info!(
                        circuit = %self.name,
                        failures,
                        cooldown_ms = self.config.cooldown.as_millis() as u64,
                        "Failure threshold reached, opening circuit"
                    );
                    *inner = Inner::Open { until: Instant::now() + self.config.cooldown };
                } else {
                    debug!(circuit = %self.name, failures, "Failure recorded");
                    *inner = Inner::Closed { failures };
                }
            }
            BreakerState::HalfOpen => {
                info!(circuit = %self.name, "Probe failed, reopening circuit");
                *inner = Inner::Open { until: Instant::now() + self.config.cooldown };
            }
            BreakerState::Open => {}
        }
        self.publish(&inner)
    }

    /// Externally force HalfOpen, cancelling any pending cooldown and
    /// clearing the failure count. Used when the sentinel quorum announces
    /// a new master or the transport reports readiness.
    pub fn transition_to_half_open(&self) {
        let mut inner = self.inner.lock();
        info!(circuit = %self.name, "Forcing transition to half-open");
        *inner = Inner::HalfOpen;
        self.publish(&inner);
    }

    /// Return to Closed with a zero failure count.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        *inner = Inner::Closed { failures: 0 };
        self.publish(&inner);
    }

    /// Consecutive failure count while Closed (0 otherwise).
    #[must_use]
    pub fn failure_count(&self) -> u32 {
        match *self.inner.lock() {
            Inner::Closed { failures } => failures,
            _ => 0,
        }
    }

    #[must_use]
    pub fn total_successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn total_failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    fn observe(inner: &mut Inner, name: &str) -> BreakerState {
        if let Inner::Open { until } = *inner {
            if Instant::now() >= until {
                info!(circuit = %name, "Cooldown elapsed, half-open");
                *inner = Inner::HalfOpen;
            }
        }
        match *inner {
            Inner::Closed { .. } => BreakerState::Closed,
            Inner::Open { .. } => BreakerState::Open,
            Inner::HalfOpen => BreakerState::HalfOpen,
        }
    }

    fn publish(&self, inner: &Inner) -> BreakerState {
        let state = match *inner {
            Inner::Closed { .. } => BreakerState::Closed,
            Inner::Open { .. } => BreakerState::Open,
            Inner::HalfOpen => BreakerState::HalfOpen,
        };
        crate::metrics::set_breaker_state(&self.name, state as u8);
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_starts_closed_with_zero_failures() {
        let cb = CircuitBreaker::with_defaults("test");
        assert_eq!(cb.state(), BreakerState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[test]
    fn test_failures_accumulate_then_trip() {
        let cb = CircuitBreaker::new(
            "test",
            CircuitConfig { failure_threshold: 3, cooldown: Duration::from_secs(60) },
        );

        assert_eq!(cb.record_failure(), BreakerState::Closed);
        assert_eq!(cb.failure_count(), 1);
        assert_eq!(cb.record_failure(), BreakerState::Closed);
        assert_eq!(cb.failure_count(), 2);
        assert_eq!(cb.record_failure(), BreakerState::Open);
        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let cb = CircuitBreaker::new(
            "test",
            CircuitConfig { failure_threshold: 3, cooldown: Duration::from_secs(60) },
        );

        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        assert_eq!(cb.failure_count(), 0);

        // Needs the full threshold again after the reset.
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn test_cooldown_promotes_to_half_open() {
        let cb = CircuitBreaker::new(
            "test",
            CircuitConfig { failure_threshold: 1, cooldown: Duration::from_millis(20) },
        );

        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cb.state(), BreakerState::HalfOpen);
    }

    #[test]
    fn test_half_open_success_closes() {
        let cb = CircuitBreaker::new("test", CircuitConfig::test());
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);

        cb.transition_to_half_open();
        assert_eq!(cb.state(), BreakerState::HalfOpen);

        assert_eq!(cb.record_success(), BreakerState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let cb = CircuitBreaker::new(
            "test",
            CircuitConfig { failure_threshold: 1, cooldown: Duration::from_secs(60) },
        );
        cb.record_failure();
        cb.transition_to_half_open();

        assert_eq!(cb.record_failure(), BreakerState::Open);
        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[test]
    fn test_forced_half_open_is_idempotent() {
        let cb = CircuitBreaker::new("test", CircuitConfig::test());
        cb.record_failure();
        cb.record_failure();

        cb.transition_to_half_open();
        cb.transition_to_half_open();
        assert_eq!(cb.state(), BreakerState::HalfOpen);
    }

    #[test]
    fn test_reset_returns_to_closed() {
        let cb = CircuitBreaker::new("test", CircuitConfig::test());
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);

        cb.reset();
        assert_eq!(cb.state(), BreakerState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[test]
    fn test_counters_accumulate() {
        let cb = CircuitBreaker::new(
            "test",
            CircuitConfig { failure_threshold: 100, cooldown: Duration::from_secs(60) },
        );
        cb.record_success();
        cb.record_success();
        cb.record_failure();

        assert_eq!(cb.total_successes(), 2);
        assert_eq!(cb.total_failures(), 1);
    }

    #[test]
    fn test_transitions_visible_across_threads() {
        use std::sync::Arc;

        let cb = Arc::new(CircuitBreaker::new(
            "test",
            CircuitConfig { failure_threshold: 1, cooldown: Duration::from_secs(60) },
        ));

        let cb2 = cb.clone();
        let handle = std::thread::spawn(move || {
            cb2.record_failure();
        });
        handle.join().unwrap();

        assert_eq!(cb.state(), BreakerState::Open);
    }
}
