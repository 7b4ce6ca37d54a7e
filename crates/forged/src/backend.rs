//! Model backend: the opaque text-completion collaborator.
//!
//! The correction loop talks to a `ModelBackend` trait object; the shipped
//! implementation speaks an OpenAI-compatible chat-completions endpoint
//! (LM Studio, vLLM, hosted gateways). Configuration arrives as an explicit
//! `BackendConfig` value, never from ambient process-wide state.

use async_trait::async_trait;
use forge_core::prompt;
use forge_core::Config;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("backend returned no content")]
    EmptyResponse,
    #[error("generation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, BackendError>;

/// One prior exchange supplied as conversational context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// A generation request: the new prompt plus accumulated context.
#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    pub prompt: String,
    /// Current entry script source, when correcting existing code.
    pub current_source: Option<String>,
    /// Prior prompt/revision exchanges, oldest first.
    pub history: Vec<ChatMessage>,
}

/// Text-completion service the loop delegates code generation to.
///
/// Implementations must honor the cancellation token: a cancelled call
/// returns `BackendError::Cancelled` promptly and leaves the backend
/// usable for subsequent calls.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Generate source text for the request.
    async fn generate(
        &self,
        request: &GenerateRequest,
        cancel: &CancellationToken,
    ) -> Result<String>;

    /// Map a missing module name to a pip package name.
    ///
    /// `Ok(None)` means the backend could not determine a package.
    async fn resolve_package(
        &self,
        module: &str,
        error_message: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<String>>;
}

/// Backend connection settings, carried as an explicit value.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub base_url: String,
    pub model: Option<String>,
    pub api_key: Option<String>,
    /// Timeout per request in seconds (0 = no timeout).
    pub timeout_sec: u32,
}

impl BackendConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            base_url: config.backend_url.clone(),
            model: config.backend_model.clone(),
            api_key: config.api_key.clone(),
            timeout_sec: config.generate_timeout_sec,
        }
    }
}

// --- OpenAI-compatible wire types ---

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    messages: &'a [ChatMessage],
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

/// OpenAI-compatible HTTP backend.
#[derive(Debug)]
pub struct HttpBackend {
    config: BackendConfig,
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new(config: BackendConfig) -> Self {
        let mut builder = reqwest::Client::builder();
        if config.timeout_sec > 0 {
            builder = builder.timeout(Duration::from_secs(u64::from(config.timeout_sec)));
        }
        let client = builder.build().expect("reqwest client");
        Self { config, client }
    }

    fn completions_url(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }

    /// POST a chat request, racing it against the cancellation token.
    async fn chat(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let body = ChatCompletionRequest {
            model: self.config.model.as_deref(),
            messages,
            temperature,
        };

        let mut request = self.client.post(self.completions_url()).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        debug!(url = %self.completions_url(), messages = messages.len(), "sending chat request");

        let response = tokio::select! {
            response = request.send() => response?,
            () = cancel.cancelled() => {
                info!("generation cancelled while awaiting backend");
                return Err(BackendError::Cancelled);
            }
        };

        let parsed: ChatCompletionResponse = tokio::select! {
            parsed = response.error_for_status()?.json() => parsed?,
            () = cancel.cancelled() => return Err(BackendError::Cancelled),
        };

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or(BackendError::EmptyResponse)
    }
}

#[async_trait]
impl ModelBackend for HttpBackend {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    async fn generate(
        &self,
        request: &GenerateRequest,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let mut messages = Vec::with_capacity(request.history.len() + 2);
        messages.extend(request.history.iter().cloned());
        if let Some(source) = &request.current_source {
            messages.push(ChatMessage::user(format!(
                "Current script source:\n```python\n{source}\n```"
            )));
        }
        messages.push(ChatMessage::user(request.prompt.clone()));

        self.chat(&messages, 0.2, cancel).await
    }

    async fn resolve_package(
        &self,
        module: &str,
        error_message: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        let messages = [ChatMessage::user(prompt::build_resolve_package_prompt(
            module,
            error_message,
        ))];
        let answer = self.chat(&messages, 0.1, cancel).await?;
        Ok(prompt::parse_package_answer(&answer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_config_from_engine_config() {
        let mut config = Config::default();
        config.backend_url = "http://10.0.0.5:8080/v1".to_string();
        config.backend_model = Some("qwen2.5-coder".to_string());
        config.api_key = Some("sk-test".to_string());
        config.generate_timeout_sec = 42;

        let backend = BackendConfig::from_config(&config);
        assert_eq!(backend.base_url, "http://10.0.0.5:8080/v1");
        assert_eq!(backend.model.as_deref(), Some("qwen2.5-coder"));
        assert_eq!(backend.api_key.as_deref(), Some("sk-test"));
        assert_eq!(backend.timeout_sec, 42);
    }

    #[test]
    fn completions_url_handles_trailing_slash() {
        let backend = HttpBackend::new(BackendConfig {
            base_url: "http://localhost:1234/v1/".to_string(),
            model: None,
            api_key: None,
            timeout_sec: 0,
        });
        assert_eq!(
            backend.completions_url(),
            "http://localhost:1234/v1/chat/completions"
        );
    }

    #[test]
    fn request_body_omits_missing_model() {
        let messages = [ChatMessage::user("hi")];
        let body = ChatCompletionRequest {
            model: None,
            messages: &messages,
            temperature: 0.2,
        };
        let json = serde_json::to_string(&body).unwrap();
        assert!(!json.contains("model"));
        assert!(json.contains("\"role\":\"user\""));
    }

    #[test]
    fn response_parsing_extracts_content() {
        let json = r#"{
            "choices": [
                {"message": {"role": "assistant", "content": "print('hi')"}}
            ]
        }"#;
        let parsed: ChatCompletionResponse = serde_json::from_str(json).unwrap();
        assert_eq!(
            parsed.choices[0].message.content.as_deref(),
            Some("print('hi')")
        );
    }

    #[tokio::test]
    async fn chat_cancels_before_connecting() {
        // Token already fired: the select should return Cancelled without
        // ever reaching the (unroutable) address.
        let backend = HttpBackend::new(BackendConfig {
            base_url: "http://192.0.2.1:9/v1".to_string(),
            model: None,
            api_key: None,
            timeout_sec: 0,
        });
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = backend
            .generate(&GenerateRequest::default(), &cancel)
            .await;
        assert!(matches!(result, Err(BackendError::Cancelled)));
    }
}
