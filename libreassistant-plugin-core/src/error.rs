//! # Error Handling Module
//!
//! This module defines the error types for the plugin orchestration core.
//! Every failure the core can produce is represented as a typed value and
//! propagated with `Result`; errors are never used for control flow and the
//! core never panics on an orchestration path.
//!
//! ## Error Categories
//!
//! One enum per failure domain, mirroring the component boundaries:
//!
//! - **`ManifestError`**: manifest discovery and validation failures. These
//!   exclude a single plugin from the registry; they never abort a scan.
//! - **`SupervisorError`**: lifecycle failures - refused transitions, port
//!   conflicts, spawn failures, readiness timeouts. Always scoped to one
//!   plugin; sibling plugins are unaffected.
//! - **`InvokeError`**: plugin HTTP invocation failures, categorised so the
//!   dispatcher can decide what to feed back to the language model.
//! - **`LmError`**: language-model transport and API failures. The
//!   dispatcher surfaces these once and does not retry internally.
//! - **`DispatchError`**: terminal outcomes of a dispatch turn that are not
//!   a normal assistant reply. Each variant carries the session's
//!   invocation records so callers can show partial work.
//!
//! ## Usage
//!
//! ```rust
//! match supervisor.start("search", &options).await {
//!     Ok(port) => println!("running on {port}"),
//!     Err(SupervisorError::PortInUse { id, port }) => {
//!         eprintln!("{id}: port {port} taken");
//!     }
//!     Err(e) => eprintln!("start failed: {e}"),
//! }
//! ```

use thiserror::Error;

use crate::supervisor::PluginState;
use crate::tracker::InvocationRecord;

/// Manifest discovery and validation errors.
///
/// Produced by the registry while scanning the plugins root. Each error is
/// scoped to a single candidate directory; the scan records it and moves on.
#[derive(Error, Debug)]
pub enum ManifestError {
    /// The candidate directory has no manifest file
    #[error("no plugin manifest found in {dir}")]
    NotFound { dir: String },

    /// The manifest file could not be read
    #[error("failed to read manifest: {0}")]
    Io(#[from] std::io::Error),

    /// The manifest is not valid TOML or is missing required fields
    #[error("malformed manifest: {0}")]
    Parse(#[from] toml::de::Error),

    /// The plugin id is not lowercase-hyphen form
    #[error("invalid plugin id '{id}': {reason}")]
    InvalidId { id: String, reason: &'static str },

    /// The declared port falls outside the unprivileged range
    #[error("plugin '{id}' declares port {port}, outside the allowed range 1024-65535")]
    PortOutOfRange { id: String, port: i64 },

    /// A declared permission is not part of the capability vocabulary
    #[error("plugin '{id}' declares unknown capability '{capability}'")]
    UnknownCapability { id: String, capability: String },

    /// The entrypoint command line is empty
    #[error("plugin '{id}' declares an empty entrypoint")]
    EmptyEntrypoint { id: String },

    /// Two manifests under the root claim the same id
    #[error("duplicate plugin id '{id}' (already loaded from another directory)")]
    DuplicateId { id: String },
}

/// Plugin lifecycle errors, scoped to a single plugin.
#[derive(Error, Debug)]
pub enum SupervisorError {
    /// The id does not match any discovered plugin
    #[error("unknown plugin '{id}'")]
    UnknownPlugin { id: String },

    /// The requested operation is not legal from the plugin's current state
    #[error("plugin '{id}' cannot {action} from state '{state}'")]
    InvalidTransition {
        id: String,
        action: &'static str,
        state: PluginState,
    },

    /// Declared permissions are not covered by the grant set
    #[error("plugin '{id}' is missing approval for capabilities: {missing}")]
    PermissionDenied { id: String, missing: String },

    /// The declared loopback port is already bound
    #[error("port {port} declared by plugin '{id}' is already in use")]
    PortInUse { id: String, port: u16 },

    /// The entrypoint process could not be spawned
    #[error("failed to spawn plugin '{id}': {message}")]
    SpawnFailed { id: String, message: String },

    /// The process started but never answered the readiness probe
    #[error("plugin '{id}' did not become ready within {deadline_ms} ms: {detail}")]
    ReadinessTimeout {
        id: String,
        deadline_ms: u64,
        detail: String,
    },

    /// Consecutive failed starts exceeded the per-plugin guard
    #[error("plugin '{id}' exhausted {attempts} start attempts; clear it before retrying")]
    StartAttemptsExhausted { id: String, attempts: u32 },
}

/// Plugin HTTP invocation errors.
///
/// The categories matter to the dispatcher: `Plugin` and `Protocol` are fed
/// back to the language model as context, `Cancelled` tears the turn down,
/// the rest surface as transport failures.
#[derive(Error, Debug)]
pub enum InvokeError {
    /// The target plugin is not in the running set
    #[error("plugin '{plugin}' is not running")]
    NotRunning { plugin: String },

    /// The call exceeded the per-invocation timeout
    #[error("invocation of plugin '{plugin}' timed out after {timeout_ms} ms")]
    Timeout { plugin: String, timeout_ms: u64 },

    /// The HTTP request failed below the protocol layer
    #[error("transport error invoking plugin '{plugin}': {message}")]
    Transport { plugin: String, message: String },

    /// The plugin answered with a body that does not match the wire contract
    #[error("plugin '{plugin}' returned a non-compliant response: {message}")]
    Protocol { plugin: String, message: String },

    /// The plugin answered `success: false`
    #[error("plugin '{plugin}' reported failure: {message}")]
    Plugin { plugin: String, message: String },

    /// The response body exceeded the configured size cap
    #[error("response from plugin '{plugin}' exceeded the {limit_bytes} byte cap")]
    ResponseTooLarge { plugin: String, limit_bytes: usize },

    /// The caller cancelled the dispatch while the call was in flight
    #[error("invocation of plugin '{plugin}' was cancelled")]
    Cancelled { plugin: String },
}

/// Language-model transport and API errors.
#[derive(Error, Debug)]
pub enum LmError {
    /// The request exceeded the configured deadline
    #[error("language model request timed out")]
    Timeout,

    /// The endpoint was unreachable or the connection failed
    #[error("language model transport error: {message}")]
    Transport { message: String },

    /// The endpoint answered with a non-success status
    #[error("language model API error: {code} - {message}")]
    Api { code: u16, message: String },

    /// The response body was missing the expected text field
    #[error("language model returned an invalid response: {message}")]
    InvalidResponse { message: String },

    /// The caller cancelled the dispatch while the call was in flight
    #[error("language model call was cancelled")]
    Cancelled,
}

/// Terminal dispatch outcomes that are not a normal assistant reply.
///
/// Every variant carries the invocation records accumulated before the turn
/// ended, so the surface can render partial work alongside the error.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// The model asked for the same (plugin, canonical input) twice in a row
    #[error("plugin '{plugin}' was invoked twice in a row with identical input")]
    DuplicatePluginCall {
        plugin: String,
        input: serde_json::Value,
        reason: String,
        invocations: Vec<InvocationRecord>,
    },

    /// The step budget ran out before the model produced a message
    #[error("dispatch step budget of {max_steps} exhausted without a final reply")]
    BudgetExceeded {
        max_steps: usize,
        invocations: Vec<InvocationRecord>,
    },

    /// The language model call failed; the turn is not retried internally
    #[error("language model unavailable: {source}")]
    LmUnavailable {
        #[source]
        source: LmError,
        invocations: Vec<InvocationRecord>,
    },

    /// The caller cancelled the turn
    #[error("dispatch was cancelled")]
    Cancelled { invocations: Vec<InvocationRecord> },
}

impl DispatchError {
    /// Invocation records accumulated before the turn ended.
    pub fn invocations(&self) -> &[InvocationRecord] {
        match self {
            DispatchError::DuplicatePluginCall { invocations, .. }
            | DispatchError::BudgetExceeded { invocations, .. }
            | DispatchError::LmUnavailable { invocations, .. }
            | DispatchError::Cancelled { invocations } => invocations,
        }
    }
}
