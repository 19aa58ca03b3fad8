//! Per-provider circuit breaker. Skips a recently failed provider instantly
//! instead of paying the full retry budget on every call.
//!
//! CLOSED -> OPEN after `failure_threshold` consecutive failures;
//! OPEN -> HALF_OPEN once the cooldown elapses; a single probe request in
//! HALF_OPEN decides between CLOSED and OPEN again.

use log::{debug, info, warn};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        };
        f.write_str(label)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

pub struct CircuitBreaker {
    provider_name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(provider_name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            provider_name: provider_name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn with_defaults(provider_name: impl Into<String>) -> Self {
        Self::new(provider_name, BreakerConfig::default())
    }

    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.maybe_enter_half_open(&mut inner);
        inner.state
    }

    /// Consulted before every invocation. In HALF_OPEN only one probe call
    /// is let through until its outcome is recorded.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.lock();
        self.maybe_enter_half_open(&mut inner);

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                debug!(
                    "circuit breaker [{}]: request blocked (OPEN)",
                    self.provider_name
                );
                false
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    debug!(
                        "circuit breaker [{}]: probe already in flight",
                        self.provider_name
                    );
                    false
                } else {
                    inner.probe_in_flight = true;
                    debug!(
                        "circuit breaker [{}]: allowing probe request",
                        self.provider_name
                    );
                    true
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            info!(
                "circuit breaker [{}]: closed (provider recovered)",
                self.provider_name
            );
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    warn!(
                        "circuit breaker [{}]: opened after {} consecutive failures",
                        self.provider_name, inner.consecutive_failures
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.probe_in_flight = false;
                warn!(
                    "circuit breaker [{}]: reopened after failed probe",
                    self.provider_name
                );
            }
            CircuitState::Open => {}
        }
    }

    fn maybe_enter_half_open(&self, inner: &mut BreakerInner) {
        if inner.state == CircuitState::Open {
            let elapsed = inner
                .opened_at
                .map(|at| at.elapsed())
                .unwrap_or_default();
            if elapsed >= self.config.cooldown {
                inner.state = CircuitState::HalfOpen;
                inner.probe_in_flight = false;
                info!(
                    "circuit breaker [{}]: half-open, testing recovery",
                    self.provider_name
                );
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            BreakerConfig {
                failure_threshold: threshold,
                cooldown: Duration::from_millis(5),
            },
        )
    }

    #[test]
    fn starts_closed_and_allows_requests() {
        let breaker = CircuitBreaker::with_defaults("test");
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.allow_request());
    }

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let breaker = fast_breaker(3);
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow_request());
    }

    #[test]
    fn success_resets_the_failure_count() {
        let breaker = fast_breaker(3);
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_allows_exactly_one_probe() {
        let breaker = fast_breaker(1);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        assert!(breaker.allow_request());
        assert!(!breaker.allow_request(), "second probe must be blocked");
    }

    #[test]
    fn probe_success_closes_the_circuit() {
        let breaker = fast_breaker(1);
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(10));

        assert!(breaker.allow_request());
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.allow_request());
    }

    #[test]
    fn probe_failure_reopens_the_circuit() {
        let breaker = fast_breaker(1);
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(10));

        assert!(breaker.allow_request());
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow_request());
    }
}
