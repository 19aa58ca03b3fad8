//! Provider HTTP clients. Every provider exposes the same internal surface:
//! `complete(prompt, on_chunk)` pushing text chunks to the caller, whether
//! the wire call streams or returns one body.

use std::io::{BufRead, BufReader};
use std::time::Duration;

use log::debug;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use tomo_core::config::{ProviderSettings, SamplingConfig};

use crate::error::{classify_status, AdapterError};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4_096;

pub trait ProviderClient: Send + Sync {
    fn name(&self) -> &str;

    /// Invokes the provider and feeds every received text chunk to
    /// `on_chunk`. Non-streaming providers call it once with the full body.
    fn complete(
        &self,
        prompt: &str,
        on_chunk: &mut dyn FnMut(&str),
    ) -> Result<(), AdapterError>;
}

/// Builds the right client for a provider entry. All OpenAI-style backends
/// (openai, groq, deepseek, ollama) share one implementation; Anthropic has
/// its own wire format.
pub fn create_provider_client(
    settings: &ProviderSettings,
    model: String,
    sampling: SamplingConfig,
    timeout: Duration,
) -> Result<Box<dyn ProviderClient>, AdapterError> {
    if model.trim().is_empty() {
        return Err(AdapterError::InvalidConfig(format!(
            "provider `{}` has no model configured",
            settings.name
        )));
    }

    match settings.name.as_str() {
        "anthropic" => Ok(Box::new(AnthropicClient::new(
            settings, model, sampling, timeout,
        )?)),
        _ => Ok(Box::new(OpenAiCompatClient::new(
            settings, model, sampling, timeout,
        )?)),
    }
}

fn build_client(timeout: Duration) -> Result<Client, AdapterError> {
    Ok(Client::builder().timeout(timeout).build()?)
}

fn trim_base_url(base_url: &str) -> String {
    base_url.trim().trim_end_matches('/').to_string()
}

pub struct OpenAiCompatClient {
    name: String,
    client: Client,
    url: String,
    api_key: Option<String>,
    model: String,
    sampling: SamplingConfig,
}

impl OpenAiCompatClient {
    pub fn new(
        settings: &ProviderSettings,
        model: String,
        sampling: SamplingConfig,
        timeout: Duration,
    ) -> Result<Self, AdapterError> {
        let base = trim_base_url(&settings.api_base);
        if base.is_empty() {
            return Err(AdapterError::InvalidConfig(format!(
                "provider `{}` has no base url",
                settings.name
            )));
        }

        Ok(Self {
            name: settings.name.clone(),
            client: build_client(timeout)?,
            url: format!("{base}/chat/completions"),
            api_key: Some(settings.api_key.clone()).filter(|key| !key.trim().is_empty()),
            model,
            sampling,
        })
    }

    fn send(&self, prompt: &str, stream: bool) -> Result<reqwest::blocking::Response, AdapterError> {
        let body = ChatCompletionRequest {
            model: &self.model,
            messages: vec![ChatMessageRequest {
                role: "user",
                content: prompt,
            }],
            temperature: self.sampling.temperature,
            top_p: self.sampling.top_p,
            max_tokens: self.sampling.max_tokens,
            stream,
        };

        let mut request = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.json(&body).send()?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            return Err(classify_status(status, body));
        }
        Ok(response)
    }
}

impl ProviderClient for OpenAiCompatClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn complete(
        &self,
        prompt: &str,
        on_chunk: &mut dyn FnMut(&str),
    ) -> Result<(), AdapterError> {
        debug!("invoking {} ({})", self.name, self.model);

        if !self.sampling.streaming {
            let response = self.send(prompt, false)?;
            let parsed: ChatCompletionResponse = response.json()?;
            let content = extract_choice_content(parsed).ok_or(AdapterError::EmptyResponse)?;
            on_chunk(&content);
            return Ok(());
        }

        let response = self.send(prompt, true)?;
        let reader = BufReader::new(response);
        for line in reader.lines() {
            let line = line.map_err(|err| AdapterError::MalformedChunk(err.to_string()))?;
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data.is_empty() || data == "[DONE]" {
                continue;
            }

            let chunk: ChatStreamChunk = serde_json::from_str(data)
                .map_err(|err| AdapterError::MalformedChunk(format!("{err}: {data}")))?;
            for choice in chunk.choices {
                if let Some(content) = choice.delta.content {
                    if !content.is_empty() {
                        on_chunk(&content);
                    }
                }
            }
        }
        Ok(())
    }
}

pub struct AnthropicClient {
    client: Client,
    url: String,
    api_key: String,
    model: String,
    sampling: SamplingConfig,
}

impl AnthropicClient {
    pub fn new(
        settings: &ProviderSettings,
        model: String,
        sampling: SamplingConfig,
        timeout: Duration,
    ) -> Result<Self, AdapterError> {
        if settings.api_key.trim().is_empty() {
            return Err(AdapterError::InvalidConfig(
                "anthropic api_key must not be empty".to_string(),
            ));
        }
        let base = trim_base_url(&settings.api_base);
        let base = if base.is_empty() {
            "https://api.anthropic.com".to_string()
        } else {
            base
        };

        Ok(Self {
            client: build_client(timeout)?,
            url: format!("{base}/v1/messages"),
            api_key: settings.api_key.clone(),
            model,
            sampling,
        })
    }

    fn headers(&self) -> Result<HeaderMap, AdapterError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(&self.api_key)
                .map_err(|err| AdapterError::InvalidConfig(format!("invalid api key: {err}")))?,
        );
        headers.insert(
            "anthropic-version",
            HeaderValue::from_static(ANTHROPIC_VERSION),
        );
        Ok(headers)
    }

    fn send(&self, prompt: &str, stream: bool) -> Result<reqwest::blocking::Response, AdapterError> {
        let body = AnthropicRequest {
            model: &self.model,
            max_tokens: self.sampling.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            messages: vec![ChatMessageRequest {
                role: "user",
                content: prompt,
            }],
            temperature: self.sampling.temperature,
            top_p: self.sampling.top_p,
            top_k: self.sampling.top_k,
            stream,
        };

        let response = self
            .client
            .post(&self.url)
            .headers(self.headers()?)
            .json(&body)
            .send()?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            return Err(classify_status(status, body));
        }
        Ok(response)
    }
}

impl ProviderClient for AnthropicClient {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn complete(
        &self,
        prompt: &str,
        on_chunk: &mut dyn FnMut(&str),
    ) -> Result<(), AdapterError> {
        debug!("invoking anthropic ({})", self.model);

        if !self.sampling.streaming {
            let response = self.send(prompt, false)?;
            let parsed: AnthropicResponse = response.json()?;
            let mut text = String::new();
            for block in parsed.content {
                if let Some(part) = block.text {
                    text.push_str(&part);
                }
            }
            if text.trim().is_empty() {
                return Err(AdapterError::EmptyResponse);
            }
            on_chunk(&text);
            return Ok(());
        }

        let response = self.send(prompt, true)?;
        let reader = BufReader::new(response);
        for line in reader.lines() {
            let line = line.map_err(|err| AdapterError::MalformedChunk(err.to_string()))?;
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data.is_empty() {
                continue;
            }

            let event: AnthropicStreamEvent = serde_json::from_str(data)
                .map_err(|err| AdapterError::MalformedChunk(format!("{err}: {data}")))?;
            if event.kind == "content_block_delta" {
                if let Some(delta) = event.delta.and_then(|delta| delta.text) {
                    if !delta.is_empty() {
                        on_chunk(&delta);
                    }
                }
            }
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessageRequest<'a>>,
    temperature: f32,
    top_p: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessageRequest<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    #[serde(default)]
    message: Option<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatStreamChunk {
    #[serde(default)]
    choices: Vec<ChatStreamChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatStreamChoice {
    #[serde(default)]
    delta: ChatStreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChatStreamDelta {
    #[serde(default)]
    content: Option<String>,
}

fn extract_choice_content(response: ChatCompletionResponse) -> Option<String> {
    response
        .choices
        .into_iter()
        .filter_map(|choice| choice.message.and_then(|message| message.content))
        .find(|content| !content.trim().is_empty())
}

#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<ChatMessageRequest<'a>>,
    temperature: f32,
    top_p: f32,
    top_k: u32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<AnthropicContentBlock>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContentBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicStreamEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    delta: Option<AnthropicStreamDelta>,
}

#[derive(Debug, Deserialize)]
struct AnthropicStreamDelta {
    #[serde(default)]
    text: Option<String>,
}
