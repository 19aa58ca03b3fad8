//! Retry with configurable backoff. Handles one provider at a time; when a
//! policy gives up, the gateway decides whether another provider gets a turn.

use crate::error::AdapterError;
use log::{info, warn};
use rand::Rng;
use std::thread;
use std::time::Duration;
use tomo_core::config::RetryConfig;

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    /// Backoff before retry attempt `n` (1-based), with ±20% jitter when
    /// enabled so synchronized clients do not stampede a recovering provider.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.config.delay_for_attempt(attempt);
        if !self.config.jitter_enabled {
            return base;
        }
        let factor = rand::thread_rng().gen_range(0.8..1.2);
        base.mul_f64(factor)
    }

    /// Runs the operation up to `max_retries + 1` times. Transient failures
    /// sleep and retry; fatal ones (auth, quota, configuration) escalate
    /// immediately.
    pub fn execute<T, F>(&self, mut operation: F) -> Result<T, AdapterError>
    where
        F: FnMut() -> Result<T, AdapterError>,
    {
        let attempts = self.config.max_retries + 1;
        let mut last_error: Option<AdapterError> = None;

        for attempt in 1..=attempts {
            match operation() {
                Ok(value) => {
                    if attempt > 1 {
                        info!("operation succeeded on attempt {attempt}/{attempts}");
                    }
                    return Ok(value);
                }
                Err(error) => {
                    if !error.is_transient() {
                        warn!("fatal error, not retrying: {error}");
                        return Err(error);
                    }
                    warn!("attempt {attempt}/{attempts} failed: {error}");
                    if attempt < attempts {
                        let delay = self.delay_for_attempt(attempt);
                        thread::sleep(delay);
                    }
                    last_error = Some(error);
                }
            }
        }

        let source = last_error.unwrap_or(AdapterError::EmptyResponse);
        Err(AdapterError::retry_exhausted(attempts, source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;
    use tomo_core::config::BackoffStrategy;

    fn fast_config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            jitter_enabled: false,
            ..RetryConfig::default()
        }
    }

    #[test]
    fn always_failing_callable_runs_max_retries_plus_one_times() {
        let policy = RetryPolicy::new(fast_config(3));
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = policy.execute(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(AdapterError::EmptyResponse)
        });

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(matches!(
            result,
            Err(AdapterError::RetryExhausted { attempts: 4, .. })
        ));
    }

    #[test]
    fn two_failures_then_success_sleeps_exponentially() {
        let config = RetryConfig {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_strategy: BackoffStrategy::Exponential,
            jitter_enabled: false,
            ..RetryConfig::default()
        };
        let policy = RetryPolicy::new(config);
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let result = policy.execute(|| {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call < 3 {
                Err(AdapterError::EmptyResponse)
            } else {
                Ok("tercera")
            }
        });

        assert_eq!(result.expect("third call succeeds"), "tercera");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 100ms after attempt 1 plus 200ms after attempt 2.
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[test]
    fn fatal_error_is_not_retried() {
        let policy = RetryPolicy::new(fast_config(5));
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = policy.execute(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(AdapterError::Unavailable("bad key".into()))
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(AdapterError::Unavailable(_))));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let config = RetryConfig {
            max_retries: 1,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter_enabled: true,
            ..RetryConfig::default()
        };
        let policy = RetryPolicy::new(config);
        for _ in 0..50 {
            let delay = policy.delay_for_attempt(1);
            assert!(delay >= Duration::from_millis(80));
            assert!(delay <= Duration::from_millis(120));
        }
    }
}
