//! Chat-completions gateway with concurrency capping and backoff
//!
//! A process-wide semaphore bounds simultaneously in-flight calls; it is
//! the one intentional contention point in the system. Each call retries
//! with exponential backoff on rate limits and transient network errors.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::LlmConfig;
use crate::limits::{limits, metrics};

use super::{ChatMessage, LlmClient, LlmError};

/// Gateway to an OpenAI-compatible chat-completions endpoint
pub struct LlmGateway {
    model: String,
    api_key: String,
    url: String,
    http: Client,
    semaphore: Arc<Semaphore>,
}

impl LlmGateway {
    /// Create a gateway from configuration, reading the API key from the
    /// environment variable named in the config.
    pub fn from_config(config: &LlmConfig, semaphore: Arc<Semaphore>) -> Result<Self, LlmError> {
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| LlmError::InvalidResponse(format!("Environment variable {} not set", config.api_key_env)))?;

        let http = Client::builder().build().map_err(LlmError::Network)?;

        Ok(Self {
            model: config.model.clone(),
            api_key,
            url: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            http,
            semaphore,
        })
    }

    fn build_body(&self, messages: &[ChatMessage], temperature: f32) -> serde_json::Value {
        serde_json::json!({
            "model": self.model,
            "temperature": temperature,
            "messages": messages,
        })
    }

    /// One HTTP round-trip. Distinguishes retryable failures from fatal ones
    /// via `LlmError::is_retryable`; timeouts keep their own error kind.
    async fn post_once(&self, body: &serde_json::Value) -> Result<String, LlmError> {
        let call_timeout = limits().llm_call_timeout();

        let response = self
            .http
            .post(&self.url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .timeout(call_timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| LlmError::from_transport(e, call_timeout))?;

        let status = response.status().as_u16();

        if status == 429 {
            metrics().increment("llm_rate_limits");
            return Err(LlmError::RateLimited);
        }

        if !response.status().is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::ApiError { status, message });
        }

        let api_response: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| LlmError::from_transport(e, call_timeout))?;
        let content = api_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| LlmError::InvalidResponse("response has no message content".to_string()))?;

        Ok(content.trim().to_string())
    }
}

#[async_trait]
impl LlmClient for LlmGateway {
    async fn chat(&self, messages: &[ChatMessage], temperature: f32) -> Result<String, LlmError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| LlmError::InvalidResponse("LLM semaphore closed".to_string()))?;

        let l = limits();
        let body = self.build_body(messages, temperature);
        let mut last: Option<LlmError> = None;

        for attempt in 1..=l.llm_max_retries {
            if attempt > 1 {
                let backoff = l.llm_backoff(attempt - 1);
                warn!(attempt, ?backoff, "chat: retrying after transient error");
                tokio::time::sleep(backoff).await;
            }

            match self.post_once(&body).await {
                Ok(content) => {
                    debug!(attempt, content_len = content.len(), "chat: success");
                    return Ok(content);
                }
                Err(e) if e.is_retryable() => {
                    debug!(attempt, error = %e, "chat: retryable failure");
                    last = Some(e);
                }
                Err(e) => {
                    warn!(error = %e, "chat: fatal failure");
                    metrics().increment("llm_failures");
                    return Err(e);
                }
            }
        }

        metrics().increment("llm_failures");
        Err(LlmError::RetriesExhausted {
            attempts: l.llm_max_retries,
            last: last.map(|e| e.to_string()).unwrap_or_default(),
        })
    }
}

// Chat-completions API response types

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

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway() -> LlmGateway {
        LlmGateway {
            model: "kimi-k2-0905-preview".to_string(),
            api_key: "test-key".to_string(),
            url: "https://api.moonshot.ai/v1/chat/completions".to_string(),
            http: Client::new(),
            semaphore: Arc::new(Semaphore::new(2)),
        }
    }

    #[test]
    fn test_build_body_shape() {
        let gw = gateway();
        let messages = vec![ChatMessage::system("planner"), ChatMessage::user("plan this")];
        let body = gw.build_body(&messages, 0.3);

        assert_eq!(body["model"], "kimi-k2-0905-preview");
        assert!((body["temperature"].as_f64().unwrap() - 0.3).abs() < 1e-6);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "plan this");
    }

    #[test]
    fn test_response_content_extraction() {
        let json = r#"{"choices": [{"message": {"role": "assistant", "content": "DONE: pinged"}}]}"#;
        let parsed: ChatCompletionResponse = serde_json::from_str(json).unwrap();
        assert_eq!(
            parsed.choices[0].message.content.as_deref(),
            Some("DONE: pinged")
        );
    }

    #[test]
    fn test_from_config_requires_api_key_env() {
        let config = LlmConfig {
            api_key_env: "REDHIVE_TEST_KEY_THAT_IS_NOT_SET".to_string(),
            ..Default::default()
        };
        let result = LlmGateway::from_config(&config, Arc::new(Semaphore::new(1)));
        assert!(result.is_err());
    }
}
