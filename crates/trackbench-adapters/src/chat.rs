//! Chat-completions client for the resolution and evaluation services.
//!
//! Both external collaborators are OpenAI-style endpoints reached with
//! a bearer credential from the process environment. The client is
//! deliberately thin: one POST per call, the response body parsed once,
//! service-reported errors surfaced as messages.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use trackbench_proto::{AssistantReply, ChatCompletion, ChatRequest};

/// Environment variable holding the bearer credential.
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Default endpoint base.
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Reads the bearer credential from the environment.
///
/// Absence is a fatal startup condition for the harness; the CLI checks
/// this before spawning anything.
pub fn api_key_from_env() -> Option<String> {
    std::env::var(API_KEY_ENV).ok().filter(|k| !k.is_empty())
}

/// Errors from one chat service call.
///
/// Recovered at the conversation level: the affected conversation is
/// marked failed and the suite continues.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("network error calling chat service: {0}")]
    Network(#[from] reqwest::Error),

    /// The service answered with an error payload or a non-success status.
    #[error("chat service error: {0}")]
    Service(String),

    #[error("chat service returned no choices")]
    EmptyReply,

    #[error("failed to parse chat response: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Seam through which the pipeline reaches the resolution and
/// evaluation services; pipeline tests use scripted fakes.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Sends one chat-completions request and returns the first
    /// choice's message.
    async fn complete(&self, request: ChatRequest) -> Result<AssistantReply, ChatError>;
}

/// HTTP client for an OpenAI-compatible chat-completions endpoint.
pub struct ChatClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    request_timeout: Duration,
}

impl ChatClient {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            request_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

#[async_trait]
impl ChatApi for ChatClient {
    async fn complete(&self, request: ChatRequest) -> Result<AssistantReply, ChatError> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        debug!(model = %request.model, messages = request.messages.len(), "Calling chat service");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .timeout(self.request_timeout)
            .send()
            .await?;

        let status = response.status();
        let body: serde_json::Value = response.json().await?;

        // The service reports failures in-band; prefer its message over
        // the bare status code.
        if let Some(error) = body.get("error") {
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error");
            return Err(ChatError::Service(message.to_string()));
        }
        if !status.is_success() {
            return Err(ChatError::Service(format!("HTTP {status}")));
        }

        let completion: ChatCompletion = serde_json::from_value(body)?;
        completion
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message)
            .ok_or(ChatError::EmptyReply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash_normalized() {
        let client = ChatClient::new("key", "https://api.example.com/v1/");
        assert_eq!(
            format!("{}/chat/completions", client.base_url.trim_end_matches('/')),
            "https://api.example.com/v1/chat/completions"
        );
    }
}
