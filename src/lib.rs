//! Companion Tap: TLS interception relay with session capture
//!
//! The relay terminates a mobile client's TLS session with a fixed identity,
//! opens its own verified TLS connection to one fixed upstream, and pumps the
//! decrypted bytes between them while appending everything to a per-session
//! capture file. A separate frame server decodes the companion device's
//! length-prefixed plaintext protocol.
//!
//! # Main Features
//!
//! - Upstream-first session setup: a failed upstream never reaches the client handshake
//! - Duplex or legacy alternating relay, every read and write bounded by a timeout
//! - Lazy, append-only capture artifacts at `<capture_prefix><session id>`
//! - Bounded concurrency with queue or reject admission
//! - `[u32 BE length][payload]` frame decoding with partial-read reassembly
//!
//! # Example
//!
//! ```no_run
//! use companion_tap::common::shutdown_channel;
//! use companion_tap::config::TapConfig;
//! use companion_tap::relay::{RelayContext, RelayServer};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> companion_tap::Result<()> {
//!     let config = Arc::new(TapConfig {
//!         upstream_host: "api.example.com".to_string(),
//!         cert: Some("certs/server.crt".into()),
//!         key: Some("certs/server.key".into()),
//!         capture_prefix: Some("captures/session-".to_string()),
//!         ..TapConfig::default()
//!     });
//!     config.validate()?;
//!
//!     let ctx = Arc::new(RelayContext::from_config(Arc::clone(&config))?);
//!     let (trigger, signal) = shutdown_channel();
//!     let server = RelayServer::bind(ctx)?;
//!
//!     tokio::spawn(async move {
//!         let _ = tokio::signal::ctrl_c().await;
//!         trigger.trigger();
//!     });
//!     server.run(signal).await
//! }
//! ```

pub mod capture;
pub mod common;
pub mod config;
pub mod frame;
pub mod relay;
pub mod tls;

pub use common::{Result, TapError};
pub use config::TapConfig;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
