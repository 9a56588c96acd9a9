//! LLM chat client.
//!
//! Thin HTTP client for an OpenAI-compatible `/chat/completions` endpoint.
//! Transport failures and timeouts are retried with exponential backoff
//! (max 3 attempts) inside [`LlmClient::complete`]; what comes back is the
//! raw assistant text, which the prompt layer parses and validates.
//!
//! The client counts nothing: budget accounting lives with the planner,
//! which increments its counter atomically with each call it makes.

pub mod prompt;

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::config::LlmConfig;
use crate::error::{Error, Result, with_backoff};

/// Client for the configured chat-completion endpoint.
pub struct LlmClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f64,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

impl LlmClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::ConfigInvalid(format!("llm client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
        })
    }

    /// Sends one chat completion and returns the assistant text.
    ///
    /// Retries `llm_unreachable` and `timeout` failures with backoff; a
    /// response that parses but carries no choices is
    /// `llm_malformed_response` and is not retried.
    pub async fn complete(&self, system: &str, user: &str) -> Result<String> {
        with_backoff(Duration::from_millis(500), || self.complete_once(system, user)).await
    }

    async fn complete_once(&self, system: &str, user: &str) -> Result<String> {
        debug!(model = %self.model, "chat completion request");
        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&json!({
                "model": self.model,
                "temperature": self.temperature,
                "messages": [
                    { "role": "system", "content": system },
                    { "role": "user", "content": user },
                ],
            }));
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout(format!("llm call: {e}"))
            } else {
                Error::LlmUnreachable(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::LlmUnreachable(format!(
                "endpoint returned {status}"
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| Error::LlmMalformedResponse(format!("unparseable envelope: {e}")))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| Error::LlmMalformedResponse("response carried no choices".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(base_url: String) -> LlmConfig {
        LlmConfig {
            base_url,
            api_key: "sk-test".into(),
            model: "test-model".into(),
            temperature: 0.2,
            timeout_secs: 5,
        }
    }

    #[tokio::test]
    async fn completion_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(serde_json::json!({"model": "test-model"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{ "message": { "role": "assistant", "content": "hello" } }]
            })))
            .mount(&server)
            .await;

        let client = LlmClient::new(&config(server.uri())).unwrap();
        let text = client.complete("sys", "user").await.unwrap();
        assert_eq!(text, "hello");
    }

    #[tokio::test]
    async fn empty_choices_is_malformed_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "choices": [] })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = LlmClient::new(&config(server.uri())).unwrap();
        let err = client.complete("sys", "user").await.unwrap_err();
        assert_eq!(err.kind(), "llm_malformed_response");
    }

    #[tokio::test]
    async fn server_errors_are_retried_then_surface_as_unreachable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let client = LlmClient::new(&config(server.uri())).unwrap();
        let err = client.complete("sys", "user").await.unwrap_err();
        assert_eq!(err.kind(), "llm_unreachable");
    }
}
