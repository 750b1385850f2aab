//! # Host Error Types Module
//!
//! Error type for the HTTP surface, with mapping from the orchestration
//! core's typed errors to HTTP responses.
//!
//! Every response body uses the same shape:
//!
//! ```json
//! { "error": { "message": "...", "type": "...", "code": 409 } }
//! ```
//!
//! Dispatch errors additionally carry the session's invocation records and,
//! for duplicates, the detail of the blocked call, so clients can render
//! partial work alongside the failure.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use libreassistant_plugin_core::error::{DispatchError, SupervisorError};

/// Errors surfaced by the HTTP handlers.
#[derive(Error, Debug)]
pub enum HostError {
    /// Plugin lifecycle errors from the supervisor
    #[error("supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    /// Terminal dispatch outcomes that are not a normal reply
    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// Invalid or malformed request errors
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    /// Internal host errors
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl IntoResponse for HostError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            HostError::Supervisor(e) => match e {
                SupervisorError::UnknownPlugin { .. } => (StatusCode::NOT_FOUND, "unknown_plugin"),
                SupervisorError::InvalidTransition { .. } => {
                    (StatusCode::CONFLICT, "invalid_transition")
                }
                SupervisorError::PermissionDenied { .. } => {
                    (StatusCode::FORBIDDEN, "permission_denied")
                }
                SupervisorError::PortInUse { .. } => (StatusCode::CONFLICT, "port_in_use"),
                SupervisorError::StartAttemptsExhausted { .. } => {
                    (StatusCode::CONFLICT, "start_attempts_exhausted")
                }
                SupervisorError::SpawnFailed { .. } => (StatusCode::BAD_GATEWAY, "spawn_failed"),
                SupervisorError::ReadinessTimeout { .. } => {
                    (StatusCode::BAD_GATEWAY, "readiness_timeout")
                }
            },
            HostError::Dispatch(e) => match e {
                DispatchError::DuplicatePluginCall { .. } => {
                    (StatusCode::CONFLICT, "duplicate_plugin_call")
                }
                DispatchError::BudgetExceeded { .. } => {
                    (StatusCode::UNPROCESSABLE_ENTITY, "budget_exceeded")
                }
                DispatchError::LmUnavailable { .. } => (StatusCode::BAD_GATEWAY, "lm_unavailable"),
                DispatchError::Cancelled { .. } => (StatusCode::REQUEST_TIMEOUT, "cancelled"),
            },
            HostError::InvalidRequest { .. } => (StatusCode::BAD_REQUEST, "invalid_request"),
            HostError::Internal { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        let mut error = json!({
            "message": self.to_string(),
            "type": error_type,
            "code": status.as_u16(),
        });

        if let HostError::Dispatch(e) = &self {
            error["invocations"] = serde_json::to_value(e.invocations()).unwrap_or_default();
            if let DispatchError::DuplicatePluginCall {
                plugin,
                input,
                reason,
                ..
            } = e
            {
                error["detail"] = json!({
                    "plugin": plugin,
                    "input": input,
                    "reason": reason,
                    "suggestion": "rephrase the request or vary the plugin input",
                });
            }
        }

        (status, Json(json!({ "error": error }))).into_response()
    }
}
