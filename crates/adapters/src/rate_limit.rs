//! Minimum spacing between consecutive calls to the same provider. The mutex
//! deliberately covers the whole read-check-sleep-update cycle so two threads
//! can never both observe a stale `last_call` and skip their wait.

use log::debug;
use std::collections::HashMap;
use std::sync::Mutex;
use std::thread;
use std::time::Instant;
use tomo_core::config::RateLimitConfig;

pub struct RateLimiter {
    config: RateLimitConfig,
    last_call: Mutex<HashMap<String, Instant>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            last_call: Mutex::new(HashMap::new()),
        }
    }

    /// Blocks until at least the provider's configured delay has passed since
    /// the previous `wait` for that provider, then stamps the call time.
    /// Unknown providers get the default delay.
    pub fn wait(&self, provider: &str) {
        let delay = self.config.delay_for(provider);
        let mut guard = self
            .last_call
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(last) = guard.get(provider) {
            let elapsed = last.elapsed();
            if elapsed < delay {
                let pause = delay - elapsed;
                debug!("rate limiter: sleeping {pause:?} before calling {provider}");
                thread::sleep(pause);
            }
        }

        guard.insert(provider.to_string(), Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn limiter(default_ms: u64, per_provider: &[(&str, u64)]) -> RateLimiter {
        let provider_delays: BTreeMap<String, Duration> = per_provider
            .iter()
            .map(|(name, ms)| (name.to_string(), Duration::from_millis(*ms)))
            .collect();
        RateLimiter::new(RateLimitConfig {
            default_delay: Duration::from_millis(default_ms),
            provider_delays,
        })
    }

    #[test]
    fn consecutive_calls_are_spaced_by_the_configured_delay() {
        let limiter = limiter(0, &[("groq", 50)]);
        let started = Instant::now();
        limiter.wait("groq");
        limiter.wait("groq");
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn first_call_does_not_sleep() {
        let limiter = limiter(0, &[("groq", 200)]);
        let started = Instant::now();
        limiter.wait("groq");
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn providers_are_tracked_independently() {
        let limiter = limiter(0, &[("groq", 200), ("ollama", 0)]);
        limiter.wait("groq");
        let started = Instant::now();
        limiter.wait("ollama");
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn unknown_provider_uses_default_delay() {
        let limiter = limiter(40, &[]);
        let started = Instant::now();
        limiter.wait("misterioso");
        limiter.wait("misterioso");
        assert!(started.elapsed() >= Duration::from_millis(40));
    }
}
