//! Loopback HTTP client for plugin invocation.
//!
//! Speaks the plugin wire protocol: `POST /<operation>` with a JSON body,
//! answered by `{"success": bool, "result": ..., "error": ...}`. Calls are
//! rejected unless the target is in the running set, bounded by a per-call
//! timeout, and capped on response size.

use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::error::InvokeError;
use crate::supervisor::{PluginDirectory, HEALTH_PATH};

/// Default operation the dispatcher relays model-requested invocations to.
pub const INVOKE_OPERATION: &str = "invoke";

#[derive(Debug, Clone)]
pub struct PluginClientConfig {
    /// Per-call deadline.
    pub invoke_timeout: Duration,
    /// Reject response bodies larger than this.
    pub max_response_bytes: usize,
}

impl Default for PluginClientConfig {
    fn default() -> Self {
        Self {
            invoke_timeout: Duration::from_secs(30),
            max_response_bytes: 4 * 1024 * 1024,
        }
    }
}

/// Wire shape of a plugin operation response.
#[derive(Debug, Deserialize)]
struct OperationResponse {
    success: bool,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

pub struct PluginClient {
    http: reqwest::Client,
    directory: Arc<dyn PluginDirectory>,
    config: PluginClientConfig,
}

impl PluginClient {
    pub fn new(directory: Arc<dyn PluginDirectory>, config: PluginClientConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            directory,
            config,
        }
    }

    /// Invoke an operation on a running plugin.
    ///
    /// Returns the plugin's `result` payload on success. Failures are
    /// categorised so callers can decide what to feed back to the model.
    pub async fn invoke(
        &self,
        plugin_id: &str,
        operation: &str,
        input: &Map<String, Value>,
    ) -> Result<Value, InvokeError> {
        let plugin = self
            .directory
            .find(plugin_id)
            .ok_or_else(|| InvokeError::NotRunning {
                plugin: plugin_id.to_string(),
            })?;

        let url = format!("http://127.0.0.1:{}/{}", plugin.port, operation);
        tracing::debug!(plugin = plugin_id, %url, "invoking plugin operation");

        let response = self
            .http
            .post(&url)
            .timeout(self.config.invoke_timeout)
            .json(input)
            .send()
            .await
            .map_err(|error| self.categorise(plugin_id, error))?;

        let status = response.status();
        if let Some(length) = response.content_length() {
            if length as usize > self.config.max_response_bytes {
                return Err(InvokeError::ResponseTooLarge {
                    plugin: plugin_id.to_string(),
                    limit_bytes: self.config.max_response_bytes,
                });
            }
        }

        let body = response
            .bytes()
            .await
            .map_err(|error| self.categorise(plugin_id, error))?;
        if body.len() > self.config.max_response_bytes {
            return Err(InvokeError::ResponseTooLarge {
                plugin: plugin_id.to_string(),
                limit_bytes: self.config.max_response_bytes,
            });
        }

        if !status.is_success() {
            return Err(InvokeError::Protocol {
                plugin: plugin_id.to_string(),
                message: format!("unexpected status {status}"),
            });
        }

        let parsed: OperationResponse =
            serde_json::from_slice(&body).map_err(|error| InvokeError::Protocol {
                plugin: plugin_id.to_string(),
                message: format!("response body is not a valid operation result: {error}"),
            })?;

        if parsed.success {
            Ok(parsed.result.unwrap_or(Value::Null))
        } else {
            Err(InvokeError::Plugin {
                plugin: plugin_id.to_string(),
                message: parsed
                    .error
                    .unwrap_or_else(|| "plugin reported failure without detail".to_string()),
            })
        }
    }

    /// One-shot health probe against a plugin port.
    pub async fn health(&self, port: u16) -> bool {
        let url = format!("http://127.0.0.1:{port}{HEALTH_PATH}");
        matches!(
            self.http
                .get(&url)
                .timeout(Duration::from_secs(2))
                .send()
                .await,
            Ok(response) if response.status().is_success()
        )
    }

    fn categorise(&self, plugin_id: &str, error: reqwest::Error) -> InvokeError {
        if error.is_timeout() {
            InvokeError::Timeout {
                plugin: plugin_id.to_string(),
                timeout_ms: self.config.invoke_timeout.as_millis() as u64,
            }
        } else {
            InvokeError::Transport {
                plugin: plugin_id.to_string(),
                message: error.to_string(),
            }
        }
    }
}
