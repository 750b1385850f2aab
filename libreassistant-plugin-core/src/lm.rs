//! Language-model backend client.
//!
//! Talks to an externally configured chat-completion endpoint (an Ollama
//! compatible `/api/chat`) in non-streaming mode and hands the raw reply
//! text to the protocol codec.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

use crate::error::LmError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LmConfig {
    /// Base URL of the chat-completion endpoint.
    pub endpoint: String,
    /// Model name sent with every request unless the turn overrides it.
    pub model: String,
    /// Per-request deadline.
    pub timeout: Duration,
}

impl Default for LmConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:11434".to_string(),
            model: "llama3".to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

pub struct LmClient {
    http: reqwest::Client,
    config: LmConfig,
}

impl LmClient {
    pub fn new(config: LmConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// Send one non-streaming chat request and return the reply text.
    pub async fn chat(
        &self,
        messages: &[ChatMessage],
        model: Option<&str>,
    ) -> Result<String, LmError> {
        let model = model.unwrap_or(&self.config.model);
        let body = json!({
            "model": model,
            "messages": messages,
            "stream": false,
        });

        let url = format!(
            "{}/api/chat",
            self.config.endpoint.trim_end_matches('/')
        );
        tracing::debug!(%url, model, turns = messages.len(), "sending chat request");

        let response = self
            .http
            .post(&url)
            .timeout(self.config.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|error| {
                if error.is_timeout() {
                    LmError::Timeout
                } else {
                    LmError::Transport {
                        message: error.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .ok()
                .and_then(|body| {
                    serde_json::from_str::<serde_json::Value>(&body)
                        .ok()
                        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
                        .or(Some(body))
                })
                .unwrap_or_else(|| "failed to read error body".to_string());
            return Err(LmError::Api {
                code: status.as_u16(),
                message,
            });
        }

        let value: serde_json::Value = response.json().await.map_err(|error| {
            LmError::InvalidResponse {
                message: error.to_string(),
            }
        })?;

        value
            .pointer("/message/content")
            .and_then(|content| content.as_str())
            .map(str::to_string)
            .ok_or_else(|| LmError::InvalidResponse {
                message: "response is missing message.content".to_string(),
            })
    }
}
