//! # LibreAssistant Host Library
//!
//! The thin boundary adapter around the plugin orchestration core: TOML
//! configuration, the axum HTTP surface, and the process lifecycle
//! controller. All orchestration logic lives in
//! `libreassistant-plugin-core`; this crate only decodes requests, invokes
//! core operations, and renders results.
//!
//! ## Quick Start
//!
//! ```rust
//! use libreassistant_host::{config::Config, server::create_server};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("assistant.toml")?;
//!     let app = create_server(config).await?;
//!     // Serve `app` with axum.
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod handlers;
pub mod host_error;
pub mod lifecycle;
pub mod server;

pub use server::{build_router, create_server, AppState};
