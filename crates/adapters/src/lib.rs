pub mod breaker;
pub mod error;
pub mod gateway;
pub mod llm;
pub mod rate_limit;
pub mod retry;

pub use breaker::{BreakerConfig, CircuitBreaker, CircuitState};
pub use error::AdapterError;
pub use gateway::LlmGateway;
pub use llm::{create_provider_client, AnthropicClient, OpenAiCompatClient, ProviderClient};
pub use rate_limit::RateLimiter;
pub use retry::RetryPolicy;
