//! # HTTP Request Handlers Module
//!
//! Thin request decoding over the orchestration core: every handler
//! validates its input, calls one core operation, and renders the result.
//! No orchestration logic lives here.

use axum::extract::{Path, State};
use axum::response::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::str::FromStr;
use tokio_util::sync::CancellationToken;

use libreassistant_plugin_core::dispatcher::ChatTurn;
use libreassistant_plugin_core::lm::ChatMessage;
use libreassistant_plugin_core::manifest::Capability;

use crate::host_error::HostError;
use crate::server::AppState;

pub async fn health_check(State(state): State<AppState>) -> Result<Json<Value>, HostError> {
    let uptime = (chrono::Utc::now() - state.started_at).num_seconds().max(0);
    Ok(Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": uptime,
    })))
}

pub async fn list_plugins(State(state): State<AppState>) -> Result<Json<Value>, HostError> {
    let mut plugins = Vec::new();
    for status in state.supervisor.statuses().await {
        let descriptor = state.registry.get(&status.id);
        plugins.push(json!({
            "id": status.id,
            "name": descriptor.as_ref().map(|d| d.name.clone()),
            "version": descriptor.as_ref().map(|d| d.version.clone()),
            "description": descriptor.as_ref().map(|d| d.description.clone()),
            "author": descriptor.as_ref().map(|d| d.author.clone()),
            "declared_port": descriptor.as_ref().map(|d| d.port),
            "permissions": descriptor
                .as_ref()
                .map(|d| d.permissions.iter().map(|c| c.as_str()).collect::<Vec<_>>()),
            "granted": state
                .gate
                .granted(&status.id)
                .iter()
                .map(|c| c.as_str())
                .collect::<Vec<_>>(),
            "homepage": descriptor.as_ref().and_then(|d| d.homepage.clone()),
            "license": descriptor.as_ref().and_then(|d| d.license.clone()),
            "state": status.state,
            "port": status.port,
            "pid": status.pid,
            "uptime_seconds": status.uptime_seconds,
            "restart_count": status.restart_count,
            "last_error": status.last_error,
        }));
    }

    Ok(Json(json!({
        "plugins": plugins,
        "scan_errors": state.registry.scan_errors(),
    })))
}

pub async fn rescan_plugins(State(state): State<AppState>) -> Result<Json<Value>, HostError> {
    let count = state.registry.scan().map_err(|e| HostError::Internal {
        message: format!("plugin scan failed: {e}"),
    })?;
    Ok(Json(json!({
        "plugins": count,
        "scan_errors": state.registry.scan_errors(),
    })))
}

#[derive(Debug, Default, Deserialize)]
pub struct ApproveRequest {
    /// Capabilities to grant. Omitted means the full declared set.
    #[serde(default)]
    pub permissions: Option<Vec<String>>,
}

pub async fn approve_plugin(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<ApproveRequest>>,
) -> Result<Json<Value>, HostError> {
    let request = body.map(|Json(body)| body).unwrap_or_default();

    let capabilities: Vec<Capability> = match request.permissions {
        Some(names) => {
            let mut capabilities = Vec::with_capacity(names.len());
            for name in names {
                capabilities.push(Capability::from_str(&name).map_err(|()| {
                    HostError::InvalidRequest {
                        message: format!("unknown capability '{name}'"),
                    }
                })?);
            }
            capabilities
        }
        None => state
            .registry
            .get(&id)
            .map(|descriptor| descriptor.permissions.iter().copied().collect())
            .unwrap_or_default(),
    };

    state.gate.approve(&id, capabilities);
    let status = state.supervisor.approve(&id).await?;
    Ok(Json(json!({ "plugin": status })))
}

fn decode_options(options: BTreeMap<String, Value>) -> Result<BTreeMap<String, String>, HostError> {
    let mut decoded = BTreeMap::new();
    for (name, value) in options {
        let rendered = match value {
            Value::String(s) => s,
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            other => {
                return Err(HostError::InvalidRequest {
                    message: format!("option '{name}' must be a scalar, got {other}"),
                })
            }
        };
        decoded.insert(name, rendered);
    }
    Ok(decoded)
}

pub async fn start_plugin(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<BTreeMap<String, Value>>>,
) -> Result<Json<Value>, HostError> {
    let options = decode_options(body.map(|Json(body)| body).unwrap_or_default())?;
    let port = state.supervisor.start(&id, &options).await?;
    Ok(Json(json!({ "id": id, "state": "running", "port": port })))
}

pub async fn stop_plugin(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, HostError> {
    let status = state.supervisor.stop(&id).await?;
    Ok(Json(json!({ "plugin": status })))
}

pub async fn restart_plugin(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<BTreeMap<String, Value>>>,
) -> Result<Json<Value>, HostError> {
    let options = decode_options(body.map(|Json(body)| body).unwrap_or_default())?;
    let port = state.supervisor.restart(&id, &options).await?;
    Ok(Json(json!({ "id": id, "state": "running", "port": port })))
}

pub async fn clear_plugin(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, HostError> {
    let status = state.supervisor.clear(&id).await?;
    Ok(Json(json!({ "plugin": status })))
}

pub async fn plugin_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, HostError> {
    let status = state.supervisor.status(&id).await?;
    Ok(Json(json!({ "plugin": status })))
}

pub async fn usage(State(state): State<AppState>) -> Result<Json<Value>, HostError> {
    let analytics = state.tracker.analytics();
    let recent: Vec<Value> = state
        .tracker
        .archived()
        .iter()
        .rev()
        .take(20)
        .map(|summary| {
            json!({
                "request_id": summary.request_id,
                "outcome": summary.outcome,
                "started_at": summary.started_at,
                "finished_at": summary.finished_at,
                "invocations": summary.invocations.len(),
            })
        })
        .collect();

    Ok(Json(json!({
        "analytics": analytics,
        "recent_sessions": recent,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub history: Vec<ChatMessage>,
    /// Set false to force a plain-model turn with no plugin access.
    #[serde(default = "default_enable_plugins")]
    pub enable_plugins: bool,
    #[serde(default)]
    pub request_id: Option<String>,
}

fn default_enable_plugins() -> bool {
    true
}

pub async fn chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<Value>, HostError> {
    if request.message.trim().is_empty() {
        return Err(HostError::InvalidRequest {
            message: "message cannot be empty".to_string(),
        });
    }

    let request_id = request
        .request_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let turn = ChatTurn {
        request_id: request_id.clone(),
        message: request.message,
        history: request.history,
        model: request.model,
        plugins_enabled: request.enable_plugins,
    };

    // Run the dispatch in its own task with a drop guard: if the client
    // disconnects, the guard cancels the token and the dispatch tears down
    // cleanly (in-flight record marked, session archived as cancelled).
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    let dispatcher = state.dispatcher.clone();
    let handle = tokio::spawn(async move { dispatcher.dispatch(turn, cancel).await });

    let reply = handle
        .await
        .map_err(|e| HostError::Internal {
            message: format!("dispatch task failed: {e}"),
        })??;

    Ok(Json(json!({
        "request_id": request_id,
        "text": reply.text,
        "markdown": reply.markdown,
        "schema_compliant": reply.schema_compliant,
        "invocations": reply.invocations,
    })))
}
