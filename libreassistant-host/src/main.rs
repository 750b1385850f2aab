//! # LibreAssistant Host Binary
//!
//! Entry point for the LibreAssistant plugin orchestration host. Loads
//! configuration, discovers and autostarts plugins, and serves the HTTP
//! surface until a termination signal arrives.
//!
//! ## Usage
//!
//! ```bash
//! # Default configuration file (assistant.toml, falling back to defaults)
//! libreassistant-host
//!
//! # Custom configuration and plugins root
//! libreassistant-host --config my-config.toml --plugins-root ~/plugins
//!
//! # Debug logging
//! libreassistant-host --log-level debug
//! ```
//!
//! ## Exit codes
//!
//! - `0`   clean shutdown
//! - `64`  plugins root missing or unreadable
//! - `65`  fatal error at boot (bad configuration, bind failure)
//! - `130` shutdown on termination signal

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use libreassistant_host::config::{Config, LogFormat};
use libreassistant_host::lifecycle::{self, BootError};
use libreassistant_host::server::{build_router, AppState};

const EXIT_NO_PLUGINS_ROOT: u8 = 64;
const EXIT_BOOT_FAILURE: u8 = 65;
const EXIT_SIGNALLED: u8 = 130;

/// Command line arguments for the LibreAssistant host.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "assistant.toml")]
    config: String,

    /// Override the server host address.
    #[arg(long)]
    host: Option<String>,

    /// Override the server port.
    #[arg(short, long)]
    port: Option<u16>,

    /// Override the plugins root directory.
    #[arg(long)]
    plugins_root: Option<PathBuf>,

    /// Override the logging level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = if std::path::Path::new(&args.config).exists() {
        Config::load(&args.config)?
    } else {
        // The host runs out of the box; a config file is optional.
        let mut config = Config::default();
        config.apply_env_overrides()?;
        config
    };

    if let Some(host) = &args.host {
        config.server.host = host.clone();
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(root) = &args.plugins_root {
        config.plugins.root = root.clone();
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    config.validate()?;
    Ok(config)
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.logging.level.clone()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
        LogFormat::Compact => builder.compact().init(),
    }
}

/// Resolve when a termination signal (SIGINT or SIGTERM) arrives.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                tracing::warn!(%error, "cannot install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("configuration error: {error}");
            return ExitCode::from(EXIT_BOOT_FAILURE);
        }
    };

    init_tracing(&config);

    let state = AppState::from_config(config);

    match lifecycle::bootstrap(&state).await {
        Ok(_) => {}
        Err(error @ BootError::ManifestRootMissing { .. }) => {
            tracing::error!(%error, "bootstrap failed");
            return ExitCode::from(EXIT_NO_PLUGINS_ROOT);
        }
    }

    let addr: SocketAddr = match format!(
        "{}:{}",
        state.config.server.host, state.config.server.port
    )
    .parse()
    {
        Ok(addr) => addr,
        Err(error) => {
            tracing::error!(%error, "invalid server address");
            lifecycle::shutdown(&state).await;
            return ExitCode::from(EXIT_BOOT_FAILURE);
        }
    };

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(error) => {
            tracing::error!(%error, %addr, "cannot bind server address");
            lifecycle::shutdown(&state).await;
            return ExitCode::from(EXIT_BOOT_FAILURE);
        }
    };

    tracing::info!(%addr, "LibreAssistant host listening");

    let app = build_router(state.clone());
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    lifecycle::shutdown(&state).await;

    match result {
        // serve() only returns once the shutdown future resolved, which
        // here means a termination signal arrived.
        Ok(()) => ExitCode::from(EXIT_SIGNALLED),
        Err(error) => {
            tracing::error!(%error, "server terminated with error");
            ExitCode::from(EXIT_BOOT_FAILURE)
        }
    }
}
