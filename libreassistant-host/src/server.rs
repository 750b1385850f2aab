//! # HTTP Server Module
//!
//! Server setup for the LibreAssistant host: builds the orchestration core
//! components from configuration, wires them into shared application state,
//! and assembles the axum router.
//!
//! ## Routes
//!
//! - `GET  /health` - service health
//! - `GET  /plugins` - known plugins with runtime status
//! - `POST /plugins/rescan` - explicit manifest re-scan
//! - `POST /plugins/{id}/approve` - grant capabilities and approve
//! - `POST /plugins/{id}/start` - start with optional options body
//! - `POST /plugins/{id}/stop` - stop
//! - `POST /plugins/{id}/restart` - stop then start
//! - `POST /plugins/{id}/clear` - acknowledge a failure
//! - `GET  /plugins/{id}/status` - runtime status snapshot
//! - `GET  /plugins/usage` - usage analytics snapshot
//! - `POST /chat` - dispatch one user turn
//!
//! The middleware stack is trace, CORS, and a whole-request timeout. The
//! server binds loopback by default; it is a local surface, not a public
//! one.

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use libreassistant_plugin_core::client::{PluginClient, PluginClientConfig};
use libreassistant_plugin_core::dispatcher::{Dispatcher, DispatcherConfig};
use libreassistant_plugin_core::lm::{LmClient, LmConfig};
use libreassistant_plugin_core::manifest::PluginRegistry;
use libreassistant_plugin_core::permissions::PermissionGate;
use libreassistant_plugin_core::supervisor::{PluginDirectory, Supervisor, SupervisorConfig};
use libreassistant_plugin_core::tracker::{TrackerConfig, UsageTracker};

use crate::config::Config;
use crate::handlers;

/// Application state shared across all HTTP handlers.
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<PluginRegistry>,
    pub gate: Arc<PermissionGate>,
    pub supervisor: Arc<Supervisor>,
    pub tracker: Arc<UsageTracker>,
    pub dispatcher: Arc<Dispatcher>,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

impl Clone for AppState {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            registry: self.registry.clone(),
            gate: self.gate.clone(),
            supervisor: self.supervisor.clone(),
            tracker: self.tracker.clone(),
            dispatcher: self.dispatcher.clone(),
            started_at: self.started_at,
        }
    }
}

impl AppState {
    /// Build every orchestration component from configuration.
    pub fn from_config(config: Config) -> Self {
        let registry = Arc::new(PluginRegistry::new(config.plugins.root.clone()));
        let gate = Arc::new(PermissionGate::new());

        let supervisor = Arc::new(Supervisor::new(
            registry.clone(),
            gate.clone(),
            SupervisorConfig {
                readiness_deadline: config.plugins.readiness_deadline,
                stop_deadline: config.plugins.stop_deadline,
                max_start_attempts: config.plugins.max_start_attempts,
                ..SupervisorConfig::default()
            },
        ));

        let directory: Arc<dyn PluginDirectory> = supervisor.clone();
        let plugin_client = Arc::new(PluginClient::new(
            directory.clone(),
            PluginClientConfig {
                invoke_timeout: config.plugins.invoke_timeout,
                max_response_bytes: config.plugins.max_response_bytes,
            },
        ));

        let lm = Arc::new(LmClient::new(LmConfig {
            endpoint: config.lm.endpoint.clone(),
            model: config.lm.model.clone(),
            timeout: config.lm.timeout,
        }));

        let tracker = Arc::new(UsageTracker::new(TrackerConfig {
            archive_size: config.usage.archive_size,
        }));

        let dispatcher = Arc::new(Dispatcher::new(
            lm,
            directory,
            plugin_client,
            tracker.clone(),
            DispatcherConfig {
                max_steps: config.dispatch.max_steps,
            },
        ));

        Self {
            config: Arc::new(config),
            registry,
            gate,
            supervisor,
            tracker,
            dispatcher,
            started_at: chrono::Utc::now(),
        }
    }
}

/// Assemble the router over existing application state.
pub fn build_router(state: AppState) -> Router {
    let request_timeout = state.config.server.request_timeout;
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/plugins", get(handlers::list_plugins))
        .route("/plugins/rescan", post(handlers::rescan_plugins))
        .route("/plugins/usage", get(handlers::usage))
        .route("/plugins/{id}/approve", post(handlers::approve_plugin))
        .route("/plugins/{id}/start", post(handlers::start_plugin))
        .route("/plugins/{id}/stop", post(handlers::stop_plugin))
        .route("/plugins/{id}/restart", post(handlers::restart_plugin))
        .route("/plugins/{id}/clear", post(handlers::clear_plugin))
        .route("/plugins/{id}/status", get(handlers::plugin_status))
        .route("/chat", post(handlers::chat))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(TimeoutLayer::new(request_timeout)),
        )
        .with_state(state)
}

/// Create the HTTP server from configuration.
///
/// Does not run lifecycle autostart; callers that want plugins started at
/// boot run `lifecycle::bootstrap` against the state first.
pub async fn create_server(config: Config) -> anyhow::Result<Router> {
    config.validate()?;
    Ok(build_router(AppState::from_config(config)))
}
