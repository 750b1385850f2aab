//! # Supervisor Module
//!
//! Owns the lifecycle of every plugin subprocess: launching, readiness
//! probing, crash monitoring, and termination. The supervisor is the sole
//! owner of plugin state and runtime handles, and the sole allocator of
//! plugin loopback ports.
//!
//! ## State machine
//!
//! ```text
//! discovered ──approve──▶ approved ──start──▶ starting ──ready──▶ running
//!                                      │                   │
//!                                      └─start_failed──▶ failed
//!                                                          ▲
//! running ──stop──▶ stopping ──exit──▶ stopped              │
//! running ──crash──▶ failed                                 │
//! failed  ──clear──▶ stopped ──start──▶ starting ───────────┘
//! ```
//!
//! Operations on one plugin are serialised by a per-plugin mutex; distinct
//! plugins progress in parallel. Each running plugin gets a monitor task
//! that detects unexpected exit and marks the plugin `failed` - crashed
//! plugins are **not** restarted automatically; restarting is a caller
//! decision.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::error::SupervisorError;
use crate::manifest::{PluginDescriptor, PluginRegistry};
use crate::permissions::PermissionGate;

/// Conventional readiness path every plugin must serve.
pub const HEALTH_PATH: &str = "/health";

/// Interval between monitor polls of a running child.
const MONITOR_INTERVAL: Duration = Duration::from_millis(500);

/// Ceiling for the readiness probe backoff.
const PROBE_BACKOFF_CAP: Duration = Duration::from_secs(1);

/// Lifecycle state of one plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginState {
    Discovered,
    Approved,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PluginState::Discovered => "discovered",
            PluginState::Approved => "approved",
            PluginState::Starting => "starting",
            PluginState::Running => "running",
            PluginState::Stopping => "stopping",
            PluginState::Stopped => "stopped",
            PluginState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Supervisor tuning knobs.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// How long a starting plugin has to answer the readiness probe.
    pub readiness_deadline: Duration,
    /// How long a stopping plugin has after the terminate signal before it
    /// is force-killed.
    pub stop_deadline: Duration,
    /// Consecutive failed starts allowed before `clear` is required.
    pub max_start_attempts: u32,
    /// First readiness probe delay; doubles up to a one second cap.
    pub probe_initial_backoff: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            readiness_deadline: Duration::from_secs(10),
            stop_deadline: Duration::from_secs(5),
            max_start_attempts: 3,
            probe_initial_backoff: Duration::from_millis(100),
        }
    }
}

/// Snapshot of one plugin's runtime status.
#[derive(Debug, Clone, Serialize)]
pub struct PluginStatus {
    pub id: String,
    pub state: PluginState,
    pub port: Option<u16>,
    pub pid: Option<u32>,
    pub uptime_seconds: Option<u64>,
    pub restart_count: u32,
    pub last_error: Option<String>,
}

/// A plugin that has passed its readiness probe, with its bound port.
#[derive(Clone)]
pub struct RunningPlugin {
    pub descriptor: Arc<PluginDescriptor>,
    pub port: u16,
}

/// Read-only view of the running plugin set.
///
/// The supervisor is the canonical implementation; the dispatcher and the
/// plugin client depend on this trait so turns can be exercised against a
/// stand-in directory in tests.
pub trait PluginDirectory: Send + Sync {
    /// All running plugins.
    fn running(&self) -> Vec<RunningPlugin>;
    /// Look up a running plugin by id.
    fn find(&self, id: &str) -> Option<RunningPlugin>;
}

struct RuntimeHandle {
    child: Child,
    pid: Option<u32>,
    port: u16,
    started_at: Instant,
}

struct PluginSlot {
    descriptor: Arc<PluginDescriptor>,
    state: PluginState,
    handle: Option<RuntimeHandle>,
    restart_count: u32,
    start_attempts: u32,
    last_error: Option<String>,
}

impl PluginSlot {
    fn status(&self) -> PluginStatus {
        PluginStatus {
            id: self.descriptor.id.clone(),
            state: self.state,
            port: self.handle.as_ref().map(|h| h.port),
            pid: self.handle.as_ref().and_then(|h| h.pid),
            uptime_seconds: self
                .handle
                .as_ref()
                .filter(|_| self.state == PluginState::Running)
                .map(|h| h.started_at.elapsed().as_secs()),
            restart_count: self.restart_count,
            last_error: self.last_error.clone(),
        }
    }
}

/// Subprocess lifecycle owner for all plugins.
pub struct Supervisor {
    registry: Arc<PluginRegistry>,
    gate: Arc<PermissionGate>,
    config: SupervisorConfig,
    slots: DashMap<String, Arc<Mutex<PluginSlot>>>,
    running: Arc<DashMap<String, RunningPlugin>>,
    probe: reqwest::Client,
}

impl Supervisor {
    pub fn new(
        registry: Arc<PluginRegistry>,
        gate: Arc<PermissionGate>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            registry,
            gate,
            config,
            slots: DashMap::new(),
            running: Arc::new(DashMap::new()),
            probe: reqwest::Client::new(),
        }
    }

    fn slot(&self, id: &str) -> Result<Arc<Mutex<PluginSlot>>, SupervisorError> {
        if let Some(slot) = self.slots.get(id) {
            return Ok(slot.value().clone());
        }
        let descriptor = self
            .registry
            .get(id)
            .ok_or_else(|| SupervisorError::UnknownPlugin { id: id.to_string() })?;
        let slot = Arc::new(Mutex::new(PluginSlot {
            descriptor,
            state: PluginState::Discovered,
            handle: None,
            restart_count: 0,
            start_attempts: 0,
            last_error: None,
        }));
        self.slots.insert(id.to_string(), slot.clone());
        Ok(slot)
    }

    /// Approve a discovered plugin once its permissions are granted.
    pub async fn approve(&self, id: &str) -> Result<PluginStatus, SupervisorError> {
        let slot = self.slot(id)?;
        let mut slot = slot.lock().await;

        match slot.state {
            PluginState::Discovered => {}
            // Re-approving is harmless anywhere a process is not involved.
            PluginState::Approved | PluginState::Stopped => return Ok(slot.status()),
            state => {
                return Err(SupervisorError::InvalidTransition {
                    id: id.to_string(),
                    action: "approve",
                    state,
                })
            }
        }

        if !self.gate.is_satisfied(&slot.descriptor) {
            return Err(SupervisorError::PermissionDenied {
                id: id.to_string(),
                missing: join_capabilities(&self.gate.missing(&slot.descriptor)),
            });
        }

        slot.state = PluginState::Approved;
        tracing::info!(plugin = id, "plugin approved");
        Ok(slot.status())
    }

    /// Start a plugin subprocess and wait for it to become ready.
    ///
    /// Preconditions: state is `approved` or `stopped`, declared permissions
    /// are granted, and the declared port is free. Options are passed to the
    /// child as `PLUGIN_OPT_*` environment variables. Returns the bound port
    /// once the readiness probe succeeds.
    pub async fn start(
        &self,
        id: &str,
        options: &BTreeMap<String, String>,
    ) -> Result<u16, SupervisorError> {
        let slot_arc = self.slot(id)?;
        let mut slot = slot_arc.lock().await;

        match slot.state {
            PluginState::Approved | PluginState::Stopped => {}
            state => {
                return Err(SupervisorError::InvalidTransition {
                    id: id.to_string(),
                    action: "start",
                    state,
                })
            }
        }

        if slot.start_attempts >= self.config.max_start_attempts {
            return Err(SupervisorError::StartAttemptsExhausted {
                id: id.to_string(),
                attempts: slot.start_attempts,
            });
        }

        if !self.gate.is_satisfied(&slot.descriptor) {
            return Err(SupervisorError::PermissionDenied {
                id: id.to_string(),
                missing: join_capabilities(&self.gate.missing(&slot.descriptor)),
            });
        }

        let descriptor = slot.descriptor.clone();
        let port = descriptor.port;

        // The declared port must be free before the child is spawned; the
        // probe listener is dropped right away so the child can bind it.
        if std::net::TcpListener::bind(("127.0.0.1", port)).is_err() {
            return Err(SupervisorError::PortInUse {
                id: id.to_string(),
                port,
            });
        }

        slot.start_attempts += 1;

        let mut command = Command::new(&descriptor.program);
        command
            .args(&descriptor.args)
            .current_dir(&descriptor.base_dir)
            .env("PLUGIN_ID", &descriptor.id)
            .env("PLUGIN_PORT", port.to_string())
            .env("PLUGIN_DIR", descriptor.base_dir.as_os_str())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (name, value) in options {
            command.env(format!("PLUGIN_OPT_{}", env_name(name)), value);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(error) => {
                let message = error.to_string();
                slot.state = PluginState::Failed;
                slot.last_error = Some(format!("spawn failed: {message}"));
                tracing::error!(plugin = id, error = %message, "plugin spawn failed");
                return Err(SupervisorError::SpawnFailed {
                    id: id.to_string(),
                    message,
                });
            }
        };

        slot.state = PluginState::Starting;
        let pid = child.id();
        tracing::info!(plugin = id, port, pid, "plugin subprocess spawned");
        forward_output(&descriptor.id, &mut child);

        let probe_result = probe_ready(
            &self.probe,
            port,
            self.config.readiness_deadline,
            self.config.probe_initial_backoff,
            || match child.try_wait() {
                Ok(Some(status)) => Some(format!("process exited before ready ({status})")),
                Ok(None) => None,
                Err(error) => Some(format!("wait failed: {error}")),
            },
        )
        .await;

        match probe_result {
            Ok(()) => {
                slot.state = PluginState::Running;
                slot.last_error = None;
                slot.start_attempts = 0;
                slot.handle = Some(RuntimeHandle {
                    child,
                    pid,
                    port,
                    started_at: Instant::now(),
                });
                self.running.insert(
                    descriptor.id.clone(),
                    RunningPlugin {
                        descriptor: descriptor.clone(),
                        port,
                    },
                );
                drop(slot);
                self.spawn_monitor(descriptor.id.clone(), slot_arc);
                tracing::info!(plugin = id, port, "plugin ready");
                Ok(port)
            }
            Err(detail) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                slot.state = PluginState::Failed;
                slot.last_error = Some(detail.clone());
                tracing::error!(plugin = id, detail = %detail, "plugin failed to become ready");
                Err(SupervisorError::ReadinessTimeout {
                    id: id.to_string(),
                    deadline_ms: self.config.readiness_deadline.as_millis() as u64,
                    detail,
                })
            }
        }
    }

    /// Stop a plugin subprocess: terminate signal, bounded wait, force kill.
    ///
    /// Stopping a plugin that has no live process (`stopped`, `failed`,
    /// `discovered`, `approved`) is a no-op.
    pub async fn stop(&self, id: &str) -> Result<PluginStatus, SupervisorError> {
        let slot = self.slot(id)?;
        let mut slot = slot.lock().await;

        match slot.state {
            PluginState::Running | PluginState::Starting => {}
            _ => return Ok(slot.status()),
        }

        slot.state = PluginState::Stopping;
        self.running.remove(id);

        if let Some(mut handle) = slot.handle.take() {
            terminate(id, &mut handle.child, handle.pid, self.config.stop_deadline).await;
        }

        slot.state = PluginState::Stopped;
        tracing::info!(plugin = id, "plugin stopped");
        Ok(slot.status())
    }

    /// Stop then start with the same options.
    pub async fn restart(
        &self,
        id: &str,
        options: &BTreeMap<String, String>,
    ) -> Result<u16, SupervisorError> {
        self.stop(id).await?;
        self.start(id, options).await
    }

    /// Acknowledge a failure, making the plugin startable again.
    pub async fn clear(&self, id: &str) -> Result<PluginStatus, SupervisorError> {
        let slot = self.slot(id)?;
        let mut slot = slot.lock().await;

        match slot.state {
            PluginState::Failed => {}
            state => {
                return Err(SupervisorError::InvalidTransition {
                    id: id.to_string(),
                    action: "clear",
                    state,
                })
            }
        }

        slot.state = PluginState::Stopped;
        slot.start_attempts = 0;
        slot.last_error = None;
        tracing::info!(plugin = id, "plugin failure cleared");
        Ok(slot.status())
    }

    /// Status snapshot for one plugin.
    pub async fn status(&self, id: &str) -> Result<PluginStatus, SupervisorError> {
        let slot = self.slot(id)?;
        let slot = slot.lock().await;
        Ok(slot.status())
    }

    /// Status snapshots for every known plugin, sorted by id.
    pub async fn statuses(&self) -> Vec<PluginStatus> {
        let mut ids = self.registry.ids();
        for entry in self.slots.iter() {
            if !ids.contains(entry.key()) {
                ids.push(entry.key().clone());
            }
        }
        ids.sort();

        let mut statuses = Vec::with_capacity(ids.len());
        for id in ids {
            if let Ok(status) = self.status(&id).await {
                statuses.push(status);
            }
        }
        statuses
    }

    /// Stop every running plugin concurrently. Used at shutdown.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.running.iter().map(|e| e.key().clone()).collect();
        if ids.is_empty() {
            return;
        }
        tracing::info!(count = ids.len(), "stopping all running plugins");
        let stops = ids.iter().map(|id| self.stop(id));
        for (id, result) in ids.iter().zip(futures::future::join_all(stops).await) {
            if let Err(error) = result {
                tracing::warn!(plugin = %id, %error, "error stopping plugin during shutdown");
            }
        }
    }

    fn spawn_monitor(&self, id: String, slot: Arc<Mutex<PluginSlot>>) {
        let running = self.running.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(MONITOR_INTERVAL).await;
                let mut slot = slot.lock().await;
                if slot.state != PluginState::Running {
                    break;
                }
                let Some(handle) = slot.handle.as_mut() else {
                    break;
                };
                match handle.child.try_wait() {
                    Ok(Some(status)) => {
                        slot.state = PluginState::Failed;
                        slot.restart_count += 1;
                        slot.last_error = Some(format!("crash detected: exited with {status}"));
                        slot.handle = None;
                        running.remove(&id);
                        tracing::error!(
                            plugin = %id,
                            %status,
                            "plugin exited unexpectedly; marked failed"
                        );
                        break;
                    }
                    Ok(None) => {}
                    Err(error) => {
                        tracing::warn!(plugin = %id, %error, "monitor wait failed");
                    }
                }
            }
        });
    }
}

impl PluginDirectory for Supervisor {
    fn running(&self) -> Vec<RunningPlugin> {
        let mut plugins: Vec<RunningPlugin> =
            self.running.iter().map(|e| e.value().clone()).collect();
        plugins.sort_by(|a, b| a.descriptor.id.cmp(&b.descriptor.id));
        plugins
    }

    fn find(&self, id: &str) -> Option<RunningPlugin> {
        self.running.get(id).map(|e| e.value().clone())
    }
}

fn join_capabilities(capabilities: &[crate::manifest::Capability]) -> String {
    capabilities
        .iter()
        .map(|c| c.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn env_name(option: &str) -> String {
    option
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Forward the child's stdout and stderr line-by-line into tracing.
fn forward_output(id: &str, child: &mut Child) {
    if let Some(stdout) = child.stdout.take() {
        let plugin = id.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::info!(plugin = %plugin, "{line}");
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let plugin = id.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::warn!(plugin = %plugin, "{line}");
            }
        });
    }
}

/// Poll the plugin's health endpoint with exponential backoff until it
/// answers 200, the child exits, or the deadline passes.
///
/// `exited` is consulted before every probe; returning `Some(detail)` aborts
/// the wait. A zero deadline fails immediately without probing.
async fn probe_ready<F>(
    http: &reqwest::Client,
    port: u16,
    deadline: Duration,
    initial_backoff: Duration,
    mut exited: F,
) -> Result<(), String>
where
    F: FnMut() -> Option<String>,
{
    if deadline.is_zero() {
        return Err("readiness deadline is zero".to_string());
    }

    let url = format!("http://127.0.0.1:{port}{HEALTH_PATH}");
    let started = Instant::now();
    let mut backoff = initial_backoff.max(Duration::from_millis(10));

    loop {
        if let Some(detail) = exited() {
            return Err(detail);
        }
        let remaining = match deadline.checked_sub(started.elapsed()) {
            Some(remaining) if !remaining.is_zero() => remaining,
            _ => return Err(format!("no answer on {url} within {deadline:?}")),
        };

        let probe_timeout = remaining.min(Duration::from_secs(1));
        match http.get(&url).timeout(probe_timeout).send().await {
            Ok(response) if response.status().is_success() => return Ok(()),
            Ok(response) => {
                tracing::debug!(port, status = %response.status(), "readiness probe refused");
            }
            Err(_) => {}
        }

        tokio::time::sleep(backoff.min(remaining)).await;
        backoff = (backoff * 2).min(PROBE_BACKOFF_CAP);
    }
}

/// Terminate a child: graceful signal, bounded wait, then kill.
async fn terminate(id: &str, child: &mut Child, pid: Option<u32>, deadline: Duration) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        if let Err(error) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            tracing::debug!(plugin = id, %error, "SIGTERM delivery failed");
        }
    }
    #[cfg(not(unix))]
    let _ = pid;

    match tokio::time::timeout(deadline, child.wait()).await {
        Ok(Ok(status)) => {
            tracing::debug!(plugin = id, %status, "plugin exited after terminate signal");
        }
        Ok(Err(error)) => {
            tracing::warn!(plugin = id, %error, "wait on stopping plugin failed");
        }
        Err(_) => {
            tracing::warn!(plugin = id, "plugin ignored terminate signal; killing");
            if let Err(error) = child.kill().await {
                tracing::warn!(plugin = id, %error, "kill failed");
            }
        }
    }
}
