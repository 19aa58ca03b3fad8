//! The single LLM entry point used by every chain. Walks the configured
//! provider chain; for each provider the call goes breaker gate -> rate
//! limiter -> retrying invocation, with the streaming sanitizer splitting
//! reasoning from prose as chunks arrive. Retries stay inside one provider;
//! when a provider's budget is exhausted the next one in the chain gets the
//! call. The returned text never contains reasoning tags or ANSI escapes.

use std::sync::Arc;

use log::{debug, warn};

use tomo_core::cleaning::{CleaningStage, TextCleaner};
use tomo_core::config::AppConfig;
use tomo_core::model::{LanguageModel, LanguageModelError};
use tomo_core::streaming::StreamSanitizer;

use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::error::AdapterError;
use crate::llm::{create_provider_client, ProviderClient};
use crate::rate_limit::RateLimiter;
use crate::retry::RetryPolicy;

type ThoughtSink = Arc<dyn Fn(&str) + Send + Sync>;

struct ProviderSlot {
    name: String,
    client: Box<dyn ProviderClient>,
    breaker: CircuitBreaker,
}

pub struct LlmGateway {
    providers: Vec<ProviderSlot>,
    rate_limiter: RateLimiter,
    retry: RetryPolicy,
    cleaner: TextCleaner,
    thought_sink: Option<ThoughtSink>,
}

impl LlmGateway {
    /// Builds the gateway from the validated configuration: every configured
    /// provider joins the chain in fail-over order.
    pub fn from_config(config: &AppConfig) -> Result<Self, AdapterError> {
        let retry = RetryPolicy::new(config.retry);
        let mut clients: Vec<Box<dyn ProviderClient>> = Vec::new();

        for name in &config.providers.chain {
            let Some(settings) = config.providers.get(name) else {
                continue;
            };
            let Some(model) = config.providers.model_for(name) else {
                debug!("provider {name} skipped: no model configured");
                continue;
            };
            // Ollama is a local server and needs no key; everything else does.
            let has_credentials =
                name == "ollama" || !settings.api_key.trim().is_empty();
            if !has_credentials {
                debug!("provider {name} skipped: no credentials");
                continue;
            }
            clients.push(create_provider_client(
                settings,
                model,
                config.sampling,
                retry.timeout(),
            )?);
        }

        if clients.is_empty() {
            return Err(AdapterError::InvalidConfig(
                "no configured LLM provider found; set at least one <PROVIDER>_API_KEY/<PROVIDER>_MODEL pair".to_string(),
            ));
        }

        Ok(Self::with_clients(
            clients,
            RateLimiter::new(config.rate_limit.clone()),
            retry,
            BreakerConfig::default(),
        ))
    }

    /// Assembly seam used by tests and by callers that build their own
    /// provider clients.
    pub fn with_clients(
        clients: Vec<Box<dyn ProviderClient>>,
        rate_limiter: RateLimiter,
        retry: RetryPolicy,
        breaker_config: BreakerConfig,
    ) -> Self {
        let providers = clients
            .into_iter()
            .map(|client| ProviderSlot {
                name: client.name().to_string(),
                breaker: CircuitBreaker::new(client.name().to_string(), breaker_config),
                client,
            })
            .collect();

        Self {
            providers,
            rate_limiter,
            retry,
            cleaner: TextCleaner::new(),
            thought_sink: None,
        }
    }

    /// Registers an observer for the reasoning channel; deltas arrive as the
    /// stream is being sanitized, not after the call completes.
    pub fn on_thought(mut self, sink: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.thought_sink = Some(Arc::new(sink));
        self
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.iter().map(|slot| slot.name.as_str()).collect()
    }

    fn invoke_provider(&self, slot: &ProviderSlot, prompt: &str) -> Result<String, AdapterError> {
        self.retry.execute(|| {
            self.rate_limiter.wait(&slot.name);

            let mut sanitizer = StreamSanitizer::new();
            let mut answer = String::new();
            {
                let thought_sink = self.thought_sink.clone();
                let mut on_chunk = |chunk: &str| {
                    let delta = sanitizer.process_chunk(chunk);
                    answer.push_str(&delta.answer);
                    if let Some(sink) = &thought_sink {
                        if !delta.thought.is_empty() {
                            sink(&delta.thought);
                        }
                    }
                };
                slot.client.complete(prompt, &mut on_chunk)?;
            }

            let tail = sanitizer.flush();
            answer.push_str(&tail.answer);
            if let Some(sink) = &self.thought_sink {
                if !tail.thought.is_empty() {
                    sink(&tail.thought);
                }
            }

            if answer.trim().is_empty() {
                return Err(AdapterError::EmptyResponse);
            }
            Ok(answer)
        })
    }
}

impl LanguageModel for LlmGateway {
    fn invoke(&self, prompt: &str) -> Result<String, LanguageModelError> {
        for slot in &self.providers {
            if !slot.breaker.allow_request() {
                debug!("provider {} skipped: breaker open", slot.name);
                continue;
            }

            match self.invoke_provider(slot, prompt) {
                Ok(answer) => {
                    slot.breaker.record_success();
                    let cleaned = self.cleaner.clean(
                        &answer,
                        &[
                            CleaningStage::AnsiCodes,
                            CleaningStage::ThinkTags,
                            CleaningStage::Whitespace,
                        ],
                    );
                    return Ok(cleaned);
                }
                Err(error) => {
                    slot.breaker.record_failure();
                    warn!(
                        "provider {} failed, moving to the next in the chain: {error}",
                        slot.name
                    );
                }
            }
        }

        Err(LanguageModelError::new(AdapterError::AllProvidersExhausted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tomo_core::config::{RateLimitConfig, RetryConfig};

    struct FakeClient {
        name: String,
        calls: Arc<AtomicU32>,
        behavior: Behavior,
    }

    enum Behavior {
        Succeed(String),
        FailTransient,
        FailFatal,
    }

    impl FakeClient {
        fn new(name: &str, behavior: Behavior) -> (Box<dyn ProviderClient>, Arc<AtomicU32>) {
            let calls = Arc::new(AtomicU32::new(0));
            (
                Box::new(Self {
                    name: name.to_string(),
                    calls: Arc::clone(&calls),
                    behavior,
                }),
                calls,
            )
        }
    }

    impl ProviderClient for FakeClient {
        fn name(&self) -> &str {
            &self.name
        }

        fn complete(
            &self,
            _prompt: &str,
            on_chunk: &mut dyn FnMut(&str),
        ) -> Result<(), AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.behavior {
                Behavior::Succeed(text) => {
                    // Two chunks that split a think tag across the boundary.
                    let middle = text.len() / 2;
                    let cut = (0..=middle)
                        .rev()
                        .find(|i| text.is_char_boundary(*i))
                        .unwrap_or(0);
                    on_chunk(&text[..cut]);
                    on_chunk(&text[cut..]);
                    Ok(())
                }
                Behavior::FailTransient => Err(AdapterError::EmptyResponse),
                Behavior::FailFatal => Err(AdapterError::Unavailable("bad key".into())),
            }
        }
    }

    fn fast_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            jitter_enabled: false,
            ..RetryConfig::default()
        })
    }

    fn no_rate_limit() -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            default_delay: Duration::ZERO,
            provider_delays: Default::default(),
        })
    }

    fn gateway(clients: Vec<Box<dyn ProviderClient>>, max_retries: u32) -> LlmGateway {
        LlmGateway::with_clients(
            clients,
            no_rate_limit(),
            fast_retry(max_retries),
            BreakerConfig {
                failure_threshold: 1,
                cooldown: Duration::from_secs(60),
            },
        )
    }

    #[test]
    fn strips_think_tags_from_streamed_answer() {
        let (client, _) = FakeClient::new(
            "ollama",
            Behavior::Succeed("Hola <think>idea</think> mundo".to_string()),
        );
        let gateway = gateway(vec![client], 0);

        let answer = gateway.invoke("prompt").expect("answer");
        assert_eq!(answer, "Hola mundo");
    }

    #[test]
    fn forwards_thought_channel_to_observer() {
        let (client, _) = FakeClient::new(
            "ollama",
            Behavior::Succeed("a<think>plan secreto</think>b".to_string()),
        );
        let thoughts = Arc::new(Mutex::new(String::new()));
        let thoughts_clone = Arc::clone(&thoughts);
        let gateway = gateway(vec![client], 0).on_thought(move |delta: &str| {
            thoughts_clone.lock().expect("mutex").push_str(delta);
        });

        let answer = gateway.invoke("prompt").expect("answer");
        assert_eq!(answer, "ab");
        assert_eq!(*thoughts.lock().expect("mutex"), "plan secreto");
    }

    #[test]
    fn fails_over_to_next_provider_after_retry_budget() {
        let (first, first_calls) = FakeClient::new("groq", Behavior::FailTransient);
        let (second, second_calls) =
            FakeClient::new("ollama", Behavior::Succeed("respuesta".to_string()));
        let gateway = gateway(vec![first, second], 1);

        let answer = gateway.invoke("prompt").expect("answer");
        assert_eq!(answer, "respuesta");
        // max_retries = 1 means two attempts against the first provider.
        assert_eq!(first_calls.load(Ordering::SeqCst), 2);
        assert_eq!(second_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fatal_error_skips_retries_but_still_fails_over() {
        let (first, first_calls) = FakeClient::new("openai", Behavior::FailFatal);
        let (second, second_calls) =
            FakeClient::new("ollama", Behavior::Succeed("ok".to_string()));
        let gateway = gateway(vec![first, second], 5);

        let answer = gateway.invoke("prompt").expect("answer");
        assert_eq!(answer, "ok");
        assert_eq!(first_calls.load(Ordering::SeqCst), 1);
        assert_eq!(second_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn open_breaker_skips_provider_without_calling_it() {
        let (first, first_calls) = FakeClient::new("groq", Behavior::FailTransient);
        let (second, _) = FakeClient::new("ollama", Behavior::Succeed("bien".to_string()));
        let gateway = gateway(vec![first, second], 0);

        gateway.invoke("prompt").expect("first invoke");
        let after_first = first_calls.load(Ordering::SeqCst);
        assert_eq!(after_first, 1);

        // Breaker (threshold 1) is open now; the second invoke must not
        // touch the failed provider again.
        gateway.invoke("prompt").expect("second invoke");
        assert_eq!(first_calls.load(Ordering::SeqCst), after_first);
    }

    #[test]
    fn exhausted_chain_reports_all_providers_failed() {
        let (first, _) = FakeClient::new("groq", Behavior::FailTransient);
        let (second, _) = FakeClient::new("ollama", Behavior::FailTransient);
        let gateway = gateway(vec![first, second], 0);

        let error = gateway.invoke("prompt").expect_err("must fail");
        assert!(error.to_string().contains("all providers"));
    }
}
