use crate::segments::SegmentConfig;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const KNOWN_PROVIDERS: [&str; 5] = ["groq", "openai", "deepseek", "anthropic", "ollama"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration:\n  - {}", .0.join("\n  - "))]
    Invalid(Vec<String>),
}

/// Environment lookup seam so tests can feed a map instead of process env.
pub type EnvLookup<'a> = &'a dyn Fn(&str) -> Option<String>;

fn env_string(lookup: EnvLookup<'_>, key: &str, default: &str) -> String {
    lookup(key)
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_parse<T: FromStr + Copy>(lookup: EnvLookup<'_>, key: &str, default: T) -> T {
    lookup(key)
        .and_then(|value| value.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn env_flag(lookup: EnvLookup<'_>, key: &str, default: bool) -> bool {
    match lookup(key) {
        Some(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "true" | "1" | "yes" | "on"
        ),
        None => default,
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BackoffStrategy {
    Exponential,
    Linear,
    Fixed,
}

impl BackoffStrategy {
    fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "linear" => Self::Linear,
            "fixed" => Self::Fixed,
            _ => Self::Exponential,
        }
    }
}

impl fmt::Display for BackoffStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Exponential => "exponential",
            Self::Linear => "linear",
            Self::Fixed => "fixed",
        };
        f.write_str(label)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub timeout: Duration,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_strategy: BackoffStrategy,
    pub jitter_enabled: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            timeout: Duration::from_secs(60),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            backoff_strategy: BackoffStrategy::Exponential,
            jitter_enabled: true,
        }
    }
}

impl RetryConfig {
    pub fn from_lookup(lookup: EnvLookup<'_>) -> Self {
        let defaults = Self::default();
        Self {
            max_retries: env_parse(lookup, "RETRY_MAX_ATTEMPTS", defaults.max_retries),
            timeout: Duration::from_secs(env_parse(lookup, "RETRY_TIMEOUT", 60u64)),
            base_delay: Duration::from_secs_f64(env_parse(lookup, "RETRY_BASE_DELAY", 1.0f64)),
            max_delay: Duration::from_secs_f64(env_parse(lookup, "RETRY_MAX_DELAY", 10.0f64)),
            backoff_strategy: BackoffStrategy::parse(&env_string(
                lookup,
                "RETRY_BACKOFF_STRATEGY",
                "exponential",
            )),
            jitter_enabled: env_flag(lookup, "RETRY_JITTER_ENABLED", true),
        }
    }

    /// Delay before retry attempt `n` (1-based), capped at `max_delay`.
    /// Jitter is applied by the caller so this stays deterministic.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let delay = match self.backoff_strategy {
            BackoffStrategy::Exponential => {
                let factor = 2u32.saturating_pow(attempt - 1);
                self.base_delay.saturating_mul(factor)
            }
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
            BackoffStrategy::Fixed => self.base_delay,
        };
        delay.min(self.max_delay)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RateLimitConfig {
    pub default_delay: Duration,
    pub provider_delays: BTreeMap<String, Duration>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let mut provider_delays = BTreeMap::new();
        provider_delays.insert("openai".to_string(), Duration::from_secs_f64(1.0));
        provider_delays.insert("groq".to_string(), Duration::from_secs_f64(0.5));
        provider_delays.insert("deepseek".to_string(), Duration::from_secs_f64(1.0));
        provider_delays.insert("anthropic".to_string(), Duration::from_secs_f64(1.0));
        provider_delays.insert("ollama".to_string(), Duration::from_secs_f64(0.1));
        Self {
            default_delay: Duration::from_secs_f64(0.5),
            provider_delays,
        }
    }
}

impl RateLimitConfig {
    pub fn from_lookup(lookup: EnvLookup<'_>) -> Self {
        let mut config = Self {
            default_delay: Duration::from_secs_f64(env_parse(
                lookup,
                "RATE_LIMIT_DEFAULT_DELAY",
                0.5f64,
            )),
            ..Self::default()
        };

        for provider in KNOWN_PROVIDERS {
            let key = format!("RATE_LIMIT_{}_DELAY", provider.to_ascii_uppercase());
            if let Some(value) = lookup(&key).and_then(|v| v.trim().parse::<f64>().ok()) {
                config
                    .provider_delays
                    .insert(provider.to_string(), Duration::from_secs_f64(value));
            }
        }

        config
    }

    pub fn delay_for(&self, provider: &str) -> Duration {
        self.provider_delays
            .get(&provider.to_ascii_lowercase())
            .copied()
            .unwrap_or(self.default_delay)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ContextMode {
    Simple,
    Progressive,
    Intelligent,
}

impl ContextMode {
    fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "simple" => Self::Simple,
            "intelligent" => Self::Intelligent,
            _ => Self::Progressive,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ContextConfig {
    pub mode: ContextMode,
    pub limited_context_size: usize,
    pub standard_context_size: usize,
    pub max_context_size: usize,
    pub max_accumulation: usize,
    pub enable_micro_summaries: bool,
    pub micro_summary_interval: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            mode: ContextMode::Progressive,
            limited_context_size: 2_000,
            standard_context_size: 8_000,
            max_context_size: 2_000,
            max_accumulation: 5_000,
            enable_micro_summaries: false,
            micro_summary_interval: 3,
        }
    }
}

impl ContextConfig {
    pub fn from_lookup(lookup: EnvLookup<'_>) -> Self {
        let defaults = Self::default();
        let limited = env_parse(
            lookup,
            "CONTEXT_LIMITED_SIZE",
            defaults.limited_context_size,
        );
        Self {
            mode: ContextMode::parse(&env_string(lookup, "CONTEXT_MODE", "progressive")),
            limited_context_size: limited,
            standard_context_size: env_parse(
                lookup,
                "CONTEXT_STANDARD_SIZE",
                defaults.standard_context_size,
            ),
            max_context_size: env_parse(lookup, "CONTEXT_MAX_SIZE", limited),
            max_accumulation: env_parse(lookup, "CONTEXT_MAX_ACCUMULATION", defaults.max_accumulation),
            enable_micro_summaries: env_flag(lookup, "CONTEXT_ENABLE_MICRO_SUMMARIES", false),
            micro_summary_interval: env_parse(
                lookup,
                "CONTEXT_MICRO_SUMMARY_INTERVAL",
                defaults.micro_summary_interval,
            ),
        }
    }
}

/// Sampling parameters forwarded verbatim to provider clients.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SamplingConfig {
    pub temperature: f32,
    pub streaming: bool,
    pub top_k: u32,
    pub top_p: f32,
    pub repeat_penalty: f32,
    pub max_tokens: Option<u32>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            streaming: true,
            top_k: 50,
            top_p: 0.9,
            repeat_penalty: 1.1,
            max_tokens: None,
        }
    }
}

impl SamplingConfig {
    pub fn from_lookup(lookup: EnvLookup<'_>) -> Self {
        let defaults = Self::default();
        Self {
            temperature: env_parse(lookup, "LLM_TEMPERATURE", defaults.temperature),
            streaming: env_flag(lookup, "LLM_STREAMING", defaults.streaming),
            top_k: env_parse(lookup, "LLM_TOP_K", defaults.top_k),
            top_p: env_parse(lookup, "LLM_TOP_P", defaults.top_p),
            repeat_penalty: env_parse(lookup, "LLM_REPEAT_PENALTY", defaults.repeat_penalty),
            max_tokens: lookup("LLM_MAX_TOKENS").and_then(|v| v.trim().parse().ok()),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct GenerationConfig {
    pub default_subject: String,
    pub default_profile: String,
    pub default_style: String,
    pub default_genre: String,
    pub output_format: String,
    pub output_directory: String,
    pub min_section_length: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            default_subject: "Aventuras en un mundo cyberpunk".to_string(),
            default_profile: "Protagonista rebelde en un entorno distópico".to_string(),
            default_style: "Narrativo-Épico-Imaginativo".to_string(),
            default_genre: "Cyberpunk".to_string(),
            output_format: "txt".to_string(),
            output_directory: "./docs".to_string(),
            min_section_length: 200,
        }
    }
}

impl GenerationConfig {
    pub fn from_lookup(lookup: EnvLookup<'_>) -> Self {
        let defaults = Self::default();
        Self {
            default_subject: env_string(lookup, "GEN_DEFAULT_SUBJECT", &defaults.default_subject),
            default_profile: env_string(lookup, "GEN_DEFAULT_PROFILE", &defaults.default_profile),
            default_style: env_string(lookup, "GEN_DEFAULT_STYLE", &defaults.default_style),
            default_genre: env_string(lookup, "GEN_DEFAULT_GENRE", &defaults.default_genre),
            output_format: env_string(lookup, "GEN_DEFAULT_OUTPUT_FORMAT", &defaults.output_format),
            output_directory: env_string(lookup, "GEN_OUTPUT_DIRECTORY", &defaults.output_directory),
            min_section_length: env_parse(
                lookup,
                "GEN_MIN_SECTION_LENGTH",
                defaults.min_section_length,
            ),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProviderSettings {
    pub name: String,
    pub api_key: String,
    pub api_base: String,
    pub model: String,
}

impl ProviderSettings {
    pub fn is_configured(&self) -> bool {
        match self.name.as_str() {
            // Local server, no key required.
            "ollama" => !self.model.is_empty(),
            _ => !self.api_key.is_empty() && !self.model.is_empty(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProvidersConfig {
    pub settings: BTreeMap<String, ProviderSettings>,
    /// Fail-over order; the selected provider (if any) is moved to the front.
    pub chain: Vec<String>,
    pub selected_provider: Option<String>,
    pub selected_model: Option<String>,
}

impl ProvidersConfig {
    pub fn from_lookup(lookup: EnvLookup<'_>) -> Self {
        let mut settings = BTreeMap::new();
        for provider in KNOWN_PROVIDERS {
            let upper = provider.to_ascii_uppercase();
            let default_base = match provider {
                "openai" => "https://api.openai.com/v1",
                "groq" => "https://api.groq.com/openai/v1",
                "deepseek" => "https://api.deepseek.com/v1",
                "anthropic" => "https://api.anthropic.com",
                "ollama" => "http://localhost:11434/v1",
                _ => "",
            };
            settings.insert(
                provider.to_string(),
                ProviderSettings {
                    name: provider.to_string(),
                    api_key: env_string(lookup, &format!("{upper}_API_KEY"), ""),
                    api_base: env_string(lookup, &format!("{upper}_API_BASE"), default_base),
                    model: env_string(lookup, &format!("{upper}_MODEL"), ""),
                },
            );
        }

        let (selected_provider, mut selected_model) =
            match lookup("MODEL_TYPE").filter(|v| !v.trim().is_empty()) {
                Some(value) => {
                    let (provider, model) = parse_model_id(&value);
                    (Some(provider), model)
                }
                None => (None, None),
            };
        if let Some(model) = lookup("SELECTED_MODEL").filter(|v| !v.trim().is_empty()) {
            selected_model = Some(model);
        }

        let mut chain: Vec<String> = KNOWN_PROVIDERS.iter().map(|p| p.to_string()).collect();
        if let Some(provider) = &selected_provider {
            chain.retain(|name| name != provider);
            chain.insert(0, provider.clone());
        }

        Self {
            settings,
            chain,
            selected_provider,
            selected_model,
        }
    }

    pub fn get(&self, provider: &str) -> Option<&ProviderSettings> {
        self.settings.get(&provider.to_ascii_lowercase())
    }

    /// Effective model for a provider, honouring the `provider:model` override.
    pub fn model_for(&self, provider: &str) -> Option<String> {
        if self.selected_provider.as_deref() == Some(provider) {
            if let Some(model) = &self.selected_model {
                return Some(model.clone());
            }
        }
        self.get(provider)
            .map(|s| s.model.clone())
            .filter(|m| !m.is_empty())
    }
}

/// Splits a `provider:model` identifier; a bare provider name is accepted.
pub fn parse_model_id(value: &str) -> (String, Option<String>) {
    match value.split_once(':') {
        Some((provider, model)) if !model.trim().is_empty() => (
            provider.trim().to_ascii_lowercase(),
            Some(model.trim().to_string()),
        ),
        _ => (value.trim().to_ascii_lowercase(), None),
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AppConfig {
    pub retry: RetryConfig,
    pub rate_limit: RateLimitConfig,
    pub context: ContextConfig,
    pub sampling: SamplingConfig,
    pub segments: SegmentConfig,
    pub generation: GenerationConfig,
    pub providers: ProvidersConfig,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(&|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: EnvLookup<'_>) -> Self {
        Self {
            retry: RetryConfig::from_lookup(lookup),
            rate_limit: RateLimitConfig::from_lookup(lookup),
            context: ContextConfig::from_lookup(lookup),
            sampling: SamplingConfig::from_lookup(lookup),
            segments: SegmentConfig::from_lookup(lookup),
            generation: GenerationConfig::from_lookup(lookup),
            providers: ProvidersConfig::from_lookup(lookup),
        }
    }

    /// Loads and validates in one step; the CLI entry point uses this.
    pub fn load() -> Result<Self, ConfigError> {
        let config = Self::from_env();
        let errors = config.validate();
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }

    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.retry.max_retries < 1 {
            errors.push("RETRY_MAX_ATTEMPTS must be >= 1".to_string());
        }
        if self.retry.timeout.is_zero() {
            errors.push("RETRY_TIMEOUT must be >= 1 second".to_string());
        }
        if self.retry.max_delay < self.retry.base_delay {
            errors.push("RETRY_MAX_DELAY must be >= RETRY_BASE_DELAY".to_string());
        }

        if self.context.limited_context_size < 100 {
            errors.push("CONTEXT_LIMITED_SIZE must be >= 100 characters".to_string());
        }
        if self.context.standard_context_size < self.context.limited_context_size {
            errors.push("CONTEXT_STANDARD_SIZE must be >= CONTEXT_LIMITED_SIZE".to_string());
        }
        if self.context.micro_summary_interval < 1 {
            errors.push("CONTEXT_MICRO_SUMMARY_INTERVAL must be >= 1".to_string());
        }
        if self.context.max_accumulation < 1_000 {
            errors.push("CONTEXT_MAX_ACCUMULATION must be >= 1000 characters".to_string());
        }

        if !(0.0..=2.0).contains(&self.sampling.temperature) {
            errors.push("LLM_TEMPERATURE must be between 0 and 2".to_string());
        }
        if self.sampling.top_k < 1 {
            errors.push("LLM_TOP_K must be >= 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.sampling.top_p) {
            errors.push("LLM_TOP_P must be between 0 and 1".to_string());
        }

        if self.segments.max_segments < 2 {
            errors.push("SEGMENT_MAX_COUNT must be >= 2".to_string());
        }
        if self.segments.max_segment_length < self.segments.min_segment_length {
            errors.push("SEGMENT_MAX_LENGTH must be >= SEGMENT_MIN_LENGTH".to_string());
        }

        if self.generation.min_section_length == 0 {
            errors.push("GEN_MIN_SECTION_LENGTH must be >= 1".to_string());
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(map: HashMap<&'static str, &'static str>) -> impl Fn(&str) -> Option<String> {
        move |key: &str| map.get(key).map(|value| value.to_string())
    }

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_empty());
    }

    #[test]
    fn reads_retry_settings_from_environment() {
        let lookup = lookup_from(HashMap::from([
            ("RETRY_MAX_ATTEMPTS", "5"),
            ("RETRY_BASE_DELAY", "0.5"),
            ("RETRY_BACKOFF_STRATEGY", "linear"),
        ]));
        let retry = RetryConfig::from_lookup(&lookup);

        assert_eq!(retry.max_retries, 5);
        assert_eq!(retry.base_delay, Duration::from_millis(500));
        assert_eq!(retry.backoff_strategy, BackoffStrategy::Linear);
    }

    #[test]
    fn backoff_delays_follow_strategy_and_cap() {
        let retry = RetryConfig {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            backoff_strategy: BackoffStrategy::Exponential,
            ..RetryConfig::default()
        };
        assert_eq!(retry.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(retry.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(retry.delay_for_attempt(4), Duration::from_secs(5));

        let linear = RetryConfig {
            backoff_strategy: BackoffStrategy::Linear,
            ..retry
        };
        assert_eq!(linear.delay_for_attempt(3), Duration::from_secs(3));
    }

    #[test]
    fn provider_delay_falls_back_to_default() {
        let lookup = lookup_from(HashMap::from([
            ("RATE_LIMIT_DEFAULT_DELAY", "0.2"),
            ("RATE_LIMIT_GROQ_DELAY", "2.5"),
        ]));
        let config = RateLimitConfig::from_lookup(&lookup);

        assert_eq!(config.delay_for("groq"), Duration::from_secs_f64(2.5));
        assert_eq!(config.delay_for("unheard-of"), Duration::from_secs_f64(0.2));
    }

    #[test]
    fn model_id_parsing_handles_both_forms() {
        assert_eq!(
            parse_model_id("ollama:llama3"),
            ("ollama".to_string(), Some("llama3".to_string()))
        );
        assert_eq!(parse_model_id("Groq"), ("groq".to_string(), None));
    }

    #[test]
    fn selected_provider_moves_to_chain_front() {
        let lookup = lookup_from(HashMap::from([
            ("MODEL_TYPE", "ollama:llama3"),
            ("OLLAMA_MODEL", "qwen2"),
        ]));
        let providers = ProvidersConfig::from_lookup(&lookup);

        assert_eq!(providers.chain.first().map(String::as_str), Some("ollama"));
        assert_eq!(providers.model_for("ollama"), Some("llama3".to_string()));
    }

    #[test]
    fn validation_reports_every_problem() {
        let mut config = AppConfig::default();
        config.retry.max_retries = 0;
        config.sampling.top_p = 3.0;
        let errors = config.validate();

        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|e| e.contains("RETRY_MAX_ATTEMPTS")));
        assert!(errors.iter().any(|e| e.contains("LLM_TOP_P")));
    }
}
