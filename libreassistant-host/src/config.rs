//! # Configuration Module
//!
//! Configuration management for the LibreAssistant host: loading from TOML,
//! environment variable overrides, and validation.
//!
//! ## Configuration File Example
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8740
//! request_timeout = "120s"
//!
//! [plugins]
//! root = "/var/lib/libreassistant/plugins"
//! auto_start = true
//! disable_autostart = false
//! auto_approve_permissions = false
//! readiness_deadline = "10s"
//! stop_deadline = "5s"
//! invoke_timeout = "30s"
//! max_response_bytes = 4194304
//! inter_start_delay = "250ms"
//! max_start_attempts = 3
//!
//! [lm]
//! endpoint = "http://localhost:11434"
//! model = "llama3"
//! timeout = "60s"
//!
//! [dispatch]
//! max_steps = 5
//!
//! [usage]
//! archive_size = 100
//!
//! [logging]
//! level = "info"
//! format = "pretty"
//! ```
//!
//! ## Environment Variables
//!
//! - `ASSISTANT_HOST`: override server host
//! - `ASSISTANT_PORT`: override server port
//! - `ASSISTANT_PLUGINS_ROOT`: override the plugins root
//! - `ASSISTANT_LM_ENDPOINT`: override the model endpoint
//! - `ASSISTANT_LM_MODEL`: override the model name
//! - `ASSISTANT_LOG_LEVEL`: override the log level
//!
//! The permission auto-approve flag deliberately has no environment
//! override: enabling it requires editing the local configuration file.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Duration fields accept `"500ms"`, `"30s"`, `"1m"`, `"2h"`, or a bare
/// number of seconds.
pub mod duration_serde {
    use super::*;
    use serde::de::Error;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() != 0 {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        } else {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        match value {
            serde_json::Value::String(s) => parse_duration(&s).map_err(Error::custom),
            serde_json::Value::Number(n) => n
                .as_u64()
                .map(Duration::from_secs)
                .ok_or_else(|| Error::custom("duration seconds must be a non-negative integer")),
            _ => Err(Error::custom("invalid duration format")),
        }
    }
}

/// Parse a human duration string.
pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        anyhow::bail!("empty duration string");
    }
    if let Some(stripped) = s.strip_suffix("ms") {
        let num: u64 = stripped
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid number: {stripped}"))?;
        return Ok(Duration::from_millis(num));
    }
    if let Some(stripped) = s.strip_suffix('s') {
        let num: u64 = stripped
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid number: {stripped}"))?;
        return Ok(Duration::from_secs(num));
    }
    if let Some(stripped) = s.strip_suffix('m') {
        let num: u64 = stripped
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid number: {stripped}"))?;
        return Ok(Duration::from_secs(num * 60));
    }
    if let Some(stripped) = s.strip_suffix('h') {
        let num: u64 = stripped
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid number: {stripped}"))?;
        return Ok(Duration::from_secs(num * 3600));
    }
    anyhow::bail!("unknown duration unit: {s}")
}

/// Top-level host configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub plugins: PluginsConfig,
    pub lm: LmSettings,
    pub dispatch: DispatchSettings,
    pub usage: UsageSettings,
    pub logging: LoggingConfig,
}

/// HTTP server binding and timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Whole-request deadline for the HTTP surface. Must comfortably exceed
    /// the dispatch budget (LM timeout x max steps) to be meaningful.
    #[serde(with = "duration_serde")]
    pub request_timeout: Duration,
}

/// Plugin discovery and supervision settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsConfig {
    /// Directory scanned for plugin subdirectories.
    pub root: PathBuf,
    /// Start every discovered plugin at boot.
    pub auto_start: bool,
    /// Overrides `auto_start` when set; plugins stay stopped at boot.
    pub disable_autostart: bool,
    /// Grant every declared capability during bootstrap. Local config only;
    /// do not enable in an adversarial deployment.
    pub auto_approve_permissions: bool,
    #[serde(with = "duration_serde")]
    pub readiness_deadline: Duration,
    #[serde(with = "duration_serde")]
    pub stop_deadline: Duration,
    #[serde(with = "duration_serde")]
    pub invoke_timeout: Duration,
    pub max_response_bytes: usize,
    /// Pause between serial autostarts to reduce port-binding races.
    #[serde(with = "duration_serde")]
    pub inter_start_delay: Duration,
    pub max_start_attempts: u32,
}

/// Language-model endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LmSettings {
    pub endpoint: String,
    pub model: String,
    #[serde(with = "duration_serde")]
    pub timeout: Duration,
}

/// Dispatch loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
    pub max_steps: usize,
}

/// Usage tracking settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageSettings {
    pub archive_size: usize,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8740,
            request_timeout: Duration::from_secs(300),
        }
    }
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("plugins"),
            auto_start: true,
            disable_autostart: false,
            auto_approve_permissions: false,
            readiness_deadline: Duration::from_secs(10),
            stop_deadline: Duration::from_secs(5),
            invoke_timeout: Duration::from_secs(30),
            max_response_bytes: 4 * 1024 * 1024,
            inter_start_delay: Duration::from_millis(250),
            max_start_attempts: 3,
        }
    }
}

impl Default for LmSettings {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:11434".to_string(),
            model: "llama3".to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self { max_steps: 5 }
    }
}

impl Default for UsageSettings {
    fn default() -> Self {
        Self { archive_size: 100 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            plugins: PluginsConfig::default(),
            lm: LmSettings::default(),
            dispatch: DispatchSettings::default(),
            usage: UsageSettings::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, apply environment overrides,
    /// and validate.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read config file {path}: {e}"))?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `ASSISTANT_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        if let Ok(host) = std::env::var("ASSISTANT_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("ASSISTANT_PORT") {
            self.server.port = port
                .parse()
                .map_err(|_| anyhow::anyhow!("ASSISTANT_PORT is not a valid port: {port}"))?;
        }
        if let Ok(root) = std::env::var("ASSISTANT_PLUGINS_ROOT") {
            self.plugins.root = PathBuf::from(root);
        }
        if let Ok(endpoint) = std::env::var("ASSISTANT_LM_ENDPOINT") {
            self.lm.endpoint = endpoint;
        }
        if let Ok(model) = std::env::var("ASSISTANT_LM_MODEL") {
            self.lm.model = model;
        }
        if let Ok(level) = std::env::var("ASSISTANT_LOG_LEVEL") {
            self.logging.level = level;
        }
        Ok(())
    }

    /// Validate schema constraints.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.host.is_empty() {
            anyhow::bail!("server host cannot be empty");
        }
        if self.server.port == 0 {
            anyhow::bail!("server port must be between 1 and 65535");
        }
        if self.lm.endpoint.is_empty() {
            anyhow::bail!("lm endpoint cannot be empty");
        }
        if !self.lm.endpoint.starts_with("http://") && !self.lm.endpoint.starts_with("https://") {
            anyhow::bail!("lm endpoint must be an http(s) URL: {}", self.lm.endpoint);
        }
        if self.lm.model.is_empty() {
            anyhow::bail!("lm model cannot be empty");
        }
        if self.lm.timeout.is_zero() {
            anyhow::bail!("lm timeout cannot be zero");
        }
        if self.plugins.invoke_timeout.is_zero() {
            anyhow::bail!("plugin invoke timeout cannot be zero");
        }
        if self.plugins.max_response_bytes == 0 {
            anyhow::bail!("plugin max response size cannot be zero");
        }
        if self.usage.archive_size == 0 {
            anyhow::bail!("usage archive size cannot be zero");
        }
        Ok(())
    }

    /// Whether lifecycle autostart should run.
    pub fn autostart_enabled(&self) -> bool {
        self.plugins.auto_start && !self.plugins.disable_autostart
    }
}
