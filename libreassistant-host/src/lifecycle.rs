//! # Lifecycle Controller Module
//!
//! Process-wide init and teardown around the orchestration core.
//!
//! Bootstrap scans the plugins root, optionally switches the permission
//! gate into auto-approve mode (local config only, and only for the
//! duration of the bootstrap), then starts each discovered plugin serially
//! with a small inter-start delay to reduce port-binding races. A plugin
//! that fails to approve or start is logged and skipped; its siblings
//! proceed.
//!
//! Shutdown stops all running plugins concurrently under the configured
//! stop deadline and archives every still-active dispatch session as
//! cancelled.

use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

use libreassistant_plugin_core::tracker::SessionOutcome;

use crate::server::AppState;

/// Fatal bootstrap failures.
#[derive(Error, Debug)]
pub enum BootError {
    /// The plugins root does not exist or cannot be read.
    #[error("plugins root {root} cannot be scanned: {source}")]
    ManifestRootMissing {
        root: PathBuf,
        source: std::io::Error,
    },
}

/// Scan the registry and autostart plugins per configuration.
///
/// Returns the number of plugins started. Individual plugin failures are
/// not fatal; only an unscannable plugins root is.
pub async fn bootstrap(state: &AppState) -> Result<usize, BootError> {
    let discovered = state
        .registry
        .scan()
        .map_err(|source| BootError::ManifestRootMissing {
            root: state.config.plugins.root.clone(),
            source,
        })?;
    tracing::info!(
        discovered,
        root = %state.config.plugins.root.display(),
        "plugin discovery complete"
    );

    if !state.config.autostart_enabled() {
        tracing::info!("plugin autostart disabled; plugins remain stopped");
        return Ok(0);
    }

    if state.config.plugins.auto_approve_permissions {
        state.gate.set_auto_approve(true);
    }

    let mut started = 0;
    for descriptor in state.registry.descriptors() {
        if let Err(error) = state.supervisor.approve(&descriptor.id).await {
            tracing::error!(plugin = %descriptor.id, %error, "autostart: approval refused");
            continue;
        }
        match state.supervisor.start(&descriptor.id, &BTreeMap::new()).await {
            Ok(port) => {
                started += 1;
                tracing::info!(plugin = %descriptor.id, port, "autostarted plugin");
            }
            Err(error) => {
                tracing::error!(plugin = %descriptor.id, %error, "autostart failed");
            }
        }
        tokio::time::sleep(state.config.plugins.inter_start_delay).await;
    }

    // Auto-approve is scoped to bootstrap; later starts require explicit
    // grants again.
    if state.config.plugins.auto_approve_permissions {
        state.gate.set_auto_approve(false);
    }

    tracing::info!(started, "plugin autostart complete");
    Ok(started)
}

/// Stop all plugins and archive active sessions.
pub async fn shutdown(state: &AppState) {
    tracing::info!("lifecycle shutdown: stopping plugins");
    state.supervisor.stop_all().await;
    state.tracker.finish_all(SessionOutcome::Cancelled).await;
    tracing::info!("lifecycle shutdown complete");
}
