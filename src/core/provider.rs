use async_trait::async_trait;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::ProviderError;
use crate::models::{CallTarget, ConfigError, ProviderConfig, ProviderKind};

/// One request to an AI provider
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub system_prompt: String,
    pub prompt: String,
    pub target: CallTarget,
}

/// Raw answer from a provider
#[derive(Debug, Clone, Default)]
pub struct ProviderReply {
    pub text: String,
    /// Tokens generated, when the backend reports it
    pub output_tokens: Option<u32>,
    /// Backend said generation stopped on its length limit
    pub hit_length_limit: bool,
}

/// Uniform interface every AI backend sits behind
#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn id(&self) -> &str;

    /// Output token ceiling requested from this backend
    fn max_output_tokens(&self) -> u32;

    async fn call(&self, request: &ProviderRequest, timeout: Duration) -> Result<ProviderReply, ProviderError>;
}

/// Chat message for Ollama and OpenAI-style chat APIs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }
}

#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    #[serde(default)]
    message: Option<ChatMessage>,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    eval_count: Option<u32>,
}

#[derive(Debug, Serialize)]
struct OpenAiChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct OpenAiChatResponse {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: ChatMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    completion_tokens: u32,
}

/// HTTP chat client for Ollama and OpenAI-compatible endpoints
pub struct ChatProvider {
    client: Client,
    config: ProviderConfig,
    api_key: Option<String>,
}

impl ChatProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .build()
            .map_err(|e| ProviderError::RequestFailed(e.to_string()))?;
        let api_key = config
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok());

        Ok(Self { client, config, api_key })
    }

    fn messages(request: &ProviderRequest) -> Vec<ChatMessage> {
        vec![
            ChatMessage::system(request.system_prompt.as_str()),
            ChatMessage::user(request.prompt.as_str()),
        ]
    }

    fn map_send_error(&self, e: reqwest::Error, timeout: Duration) -> ProviderError {
        if e.is_connect() {
            ProviderError::ConnectionRefused(format!(
                "Could not connect to provider '{}' at {}",
                self.config.id, self.config.url
            ))
        } else if e.is_timeout() {
            ProviderError::Timeout(timeout.as_millis() as u64)
        } else {
            ProviderError::from(e)
        }
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response.text().await.unwrap_or_default();
        if status == 429 {
            return Err(ProviderError::QuotaExceeded(message));
        }
        Err(ProviderError::HttpError { status, message })
    }

    async fn call_ollama(&self, request: &ProviderRequest, timeout: Duration) -> Result<ProviderReply, ProviderError> {
        let url = format!("{}/api/chat", self.config.url.trim_end_matches('/'));
        let body = OllamaChatRequest {
            model: &self.config.model,
            messages: Self::messages(request),
            stream: false,
            options: OllamaOptions {
                num_predict: self.config.max_output_tokens,
            },
        };

        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_send_error(e, timeout))?;
        let response = Self::check_status(response).await?;
        let parsed: OllamaChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::ParseError(e.to_string()))?;

        Ok(ProviderReply {
            text: parsed.message.map(|m| m.content).unwrap_or_default(),
            output_tokens: parsed.eval_count,
            hit_length_limit: parsed.done_reason.as_deref() == Some("length"),
        })
    }

    async fn call_openai(&self, request: &ProviderRequest, timeout: Duration) -> Result<ProviderReply, ProviderError> {
        let url = format!("{}/v1/chat/completions", self.config.url.trim_end_matches('/'));
        let body = OpenAiChatRequest {
            model: &self.config.model,
            messages: Self::messages(request),
            max_tokens: self.config.max_output_tokens,
        };

        let mut builder = self.client.post(&url).timeout(timeout).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| self.map_send_error(e, timeout))?;
        let response = Self::check_status(response).await?;
        let parsed: OpenAiChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::ParseError(e.to_string()))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::ParseError("response has no choices".to_string()))?;

        Ok(ProviderReply {
            text: choice.message.content,
            output_tokens: parsed.usage.map(|u| u.completion_tokens),
            hit_length_limit: choice.finish_reason.as_deref() == Some("length"),
        })
    }
}

#[async_trait]
impl ProviderClient for ChatProvider {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn max_output_tokens(&self) -> u32 {
        self.config.max_output_tokens
    }

    async fn call(&self, request: &ProviderRequest, timeout: Duration) -> Result<ProviderReply, ProviderError> {
        debug!(
            provider = %self.config.id,
            model = %self.config.model,
            target = %request.target,
            prompt_chars = request.prompt.len(),
            "Sending chat request"
        );
        match self.config.kind {
            ProviderKind::Ollama => self.call_ollama(request, timeout).await,
            ProviderKind::Openai => self.call_openai(request, timeout).await,
        }
    }
}

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// A provider client paired with the token bucket shared by every job
#[derive(Clone)]
pub struct ProviderHandle {
    client: Arc<dyn ProviderClient>,
    limiter: Arc<DirectLimiter>,
}

impl ProviderHandle {
    pub fn new(client: Arc<dyn ProviderClient>, requests_per_minute: u32, burst: u32) -> Result<Self, ConfigError> {
        let rate = NonZeroU32::new(requests_per_minute).ok_or_else(|| {
            ConfigError::Invalid(format!("provider '{}' has a zero request rate", client.id()))
        })?;
        let burst = NonZeroU32::new(burst.max(1)).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::per_minute(rate).allow_burst(burst);

        Ok(Self {
            client,
            limiter: Arc::new(RateLimiter::direct(quota)),
        })
    }

    /// Build the HTTP client and limiter for a configured provider
    pub fn from_config(config: &ProviderConfig) -> Result<Self, ConfigError> {
        let client = ChatProvider::new(config.clone())
            .map_err(|e| ConfigError::Invalid(format!("provider '{}': {}", config.id, e)))?;
        Self::new(Arc::new(client), config.requests_per_minute, config.burst)
    }

    pub fn id(&self) -> &str {
        self.client.id()
    }

    pub fn max_output_tokens(&self) -> u32 {
        self.client.max_output_tokens()
    }

    /// Wait for a token from this provider's bucket
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    pub async fn call(&self, request: &ProviderRequest, timeout: Duration) -> Result<ProviderReply, ProviderError> {
        self.client.call(request, timeout).await
    }
}

/// Build handles for every configured provider
pub fn build_providers(configs: &[ProviderConfig]) -> Result<Vec<ProviderHandle>, ConfigError> {
    configs.iter().map(ProviderHandle::from_config).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl ProviderClient for Echo {
        fn id(&self) -> &str {
            "echo"
        }

        fn max_output_tokens(&self) -> u32 {
            128
        }

        async fn call(&self, request: &ProviderRequest, _timeout: Duration) -> Result<ProviderReply, ProviderError> {
            Ok(ProviderReply {
                text: request.prompt.clone(),
                ..Default::default()
            })
        }
    }

    #[test]
    fn test_ollama_response_parsing() {
        let json = r#"{"model":"qwen3","message":{"role":"assistant","content":"hello"},"done":true,"done_reason":"length","eval_count":4096}"#;
        let parsed: OllamaChatResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.message.unwrap().content, "hello");
        assert_eq!(parsed.done_reason.as_deref(), Some("length"));
        assert_eq!(parsed.eval_count, Some(4096));
    }

    #[test]
    fn test_openai_response_parsing() {
        let json = r#"{"id":"x","choices":[{"index":0,"message":{"role":"assistant","content":"hi"},"finish_reason":"stop"}],"usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}"#;
        let parsed: OpenAiChatResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.choices[0].message.content, "hi");
        assert_eq!(parsed.choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(parsed.usage.unwrap().completion_tokens, 5);
    }

    #[test]
    fn test_handle_rejects_zero_rate() {
        assert!(ProviderHandle::new(Arc::new(Echo), 0, 1).is_err());
    }

    #[tokio::test]
    async fn test_handle_forwards_calls() {
        let handle = ProviderHandle::new(Arc::new(Echo), 600, 10).unwrap();
        handle.acquire().await;
        let request = ProviderRequest {
            system_prompt: String::new(),
            prompt: "ping".to_string(),
            target: CallTarget::Full,
        };
        let reply = handle.call(&request, Duration::from_secs(1)).await.unwrap();
        assert_eq!(handle.id(), "echo");
        assert_eq!(reply.text, "ping");
        assert_eq!(handle.max_output_tokens(), 128);
    }
}
