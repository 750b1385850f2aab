//! # LibreAssistant Plugin Orchestration Core
//!
//! The orchestration core of LibreAssistant, a privacy-first local AI
//! assistant. Everything here runs on the local machine: plugins are
//! manifest-described subprocesses serving HTTP on loopback ports, and the
//! language model is an externally configured chat-completion endpoint.
//!
//! ## Components
//!
//! - **`manifest`**: discovers plugin directories, validates `plugin.toml`
//!   manifests, and exposes immutable descriptors.
//! - **`permissions`**: the user-approved capability set per plugin; a
//!   plugin cannot start until its declared permissions are granted.
//! - **`supervisor`**: owns every plugin subprocess - spawn, readiness
//!   probing, crash monitoring, graceful stop - behind an explicit
//!   per-plugin state machine.
//! - **`client`**: speaks the plugin wire protocol over loopback HTTP with
//!   timeouts and response size caps.
//! - **`protocol`**: builds the per-turn system instruction and parses the
//!   model's structured replies (lenient extraction, strict validation).
//! - **`dispatcher`**: drives one user turn through a bounded model/plugin
//!   loop with consecutive-duplicate protection and cancellation.
//! - **`tracker`**: per-request usage sessions with ordered invocation
//!   records and a bounded analytics archive.
//! - **`lm`**: the non-streaming chat client for the model backend.
//! - **`fingerprint`**: canonical digests for duplicate detection.
//!
//! ## Example
//!
//! ```rust
//! use libreassistant_plugin_core::manifest::PluginRegistry;
//! use libreassistant_plugin_core::permissions::PermissionGate;
//! use libreassistant_plugin_core::supervisor::{Supervisor, SupervisorConfig};
//! use std::sync::Arc;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let registry = Arc::new(PluginRegistry::new("/var/lib/libreassistant/plugins"));
//! registry.scan()?;
//!
//! let gate = Arc::new(PermissionGate::new());
//! let supervisor = Supervisor::new(registry, gate, SupervisorConfig::default());
//! let port = supervisor.start("search", &Default::default()).await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod dispatcher;
pub mod error;
pub mod fingerprint;
pub mod lm;
pub mod manifest;
pub mod permissions;
pub mod protocol;
pub mod supervisor;
pub mod tracker;

pub use client::{PluginClient, PluginClientConfig};
pub use dispatcher::{ChatTurn, Dispatcher, DispatcherConfig, TurnReply};
pub use error::{DispatchError, InvokeError, LmError, ManifestError, SupervisorError};
pub use fingerprint::fingerprint;
pub use lm::{ChatMessage, LmClient, LmConfig, Role};
pub use manifest::{Capability, PluginDescriptor, PluginRegistry};
pub use permissions::PermissionGate;
pub use protocol::{parse_reply, AssistantReply, ParsedReply};
pub use supervisor::{
    PluginDirectory, PluginState, PluginStatus, RunningPlugin, Supervisor, SupervisorConfig,
};
pub use tracker::{
    InvocationRecord, SessionOutcome, SessionSummary, TrackerConfig, UsageAnalytics, UsageTracker,
};
