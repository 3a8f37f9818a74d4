//! # confsync
//!
//! Client-side remote configuration sync with typed values, live updates and heartbeats.
//!
//! ## Overview
//!
//! `confsync` keeps a local, typed map of configuration values in sync with a
//! remote configuration service:
//! - Lock-free reads of the current values using `arc-swap`
//! - Change diffing with synchronous update notifications
//! - A persistent duplex connection with automatic reconnect and liveness pings
//! - Periodic heartbeats with bounded retry
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use confsync::prelude::*;
//!
//! # async fn example() -> confsync::error::Result<()> {
//! // Template from `confsync.config.yml`, settings from `CONFSYNC_*` variables
//! let client = Client::builder().build()?;
//! client.connect().await?;
//!
//! // Reads never hit the network
//! if let Some(TypedValue::Number(port)) = client.get("app.port") {
//!     println!("Server port: {port}");
//! }
//!
//! let _handle = client.on_config_update(|update| {
//!     println!("{} properties changed", update.changes.len());
//! });
//! # Ok(())
//! # }
//! ```
//!
//! ## Template
//!
//! Properties are declared in groups; each has a type and a default:
//!
//! ```yaml
//! version: v1
//! configuration:
//!   - id: app
//!     name: Application
//!     properties:
//!       - id: port
//!         type: number
//!         default: 3000
//!       - id: maintenance
//!         type: boolean
//!         default: false
//! ```
//!
//! Values are addressed by qualified id (`app.port`). Until the client
//! connects, and whenever it cannot, reads return the last applied values.
//!
//! ## Feature Flags
//!
//! - `http` (default): [`api::HttpInstanceApi`] over `reqwest`
//! - `websocket` (default): [`connection::WebSocketTransport`] over `tokio-tungstenite`
//! - `metrics`: OpenTelemetry counters for connects, updates and heartbeats
//!
//! ```toml
//! [dependencies]
//! confsync = { version = "0.1", features = ["metrics"] }
//! ```

#![warn(missing_docs, rust_2024_compatibility)]
#![deny(unsafe_code)]

pub mod api;
pub mod backoff;
pub mod client;
pub mod connection;
pub mod core;
pub mod error;
pub mod heartbeat;
pub mod notify;

#[cfg(feature = "metrics")]
pub mod metrics;

/// Convenient re-exports for common usage patterns.
pub mod prelude {
    pub use crate::client::{Client, ClientBuilder, ClientSettings, ConnectOptions};
    pub use crate::core::{ConfigStore, ConfigUpdate, TypedValue};
    pub use crate::error::{ConfigError, Result};
}
