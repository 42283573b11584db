//! Default configuration values
//!
//! This module is the single source of truth for configuration defaults.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use super::{AdmissionPolicy, RelayMode};

/// Environment variable prefix for all configuration options
///
/// `COMPANION_TAP_IO_TIMEOUT_MS=2000` sets `io_timeout_ms`.
pub const ENV_PREFIX: &str = "COMPANION_TAP";

/// Environment variable naming the configuration file
pub const CONFIG_FILE_ENV: &str = "COMPANION_TAP_CONFIG_FILE";

/// Default relay listen port (HTTPS)
pub const RELAY_PORT: u16 = 443;

/// Default upstream port
pub const UPSTREAM_PORT: u16 = 443;

/// Chunk size for a single relay read (64 KiB)
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Per read/write deadline in milliseconds
pub const IO_TIMEOUT_MS: u64 = 1500;

/// Connect + TLS handshake deadline in milliseconds
pub const HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

/// Frame connection idle deadline in milliseconds
pub const FRAME_IDLE_TIMEOUT_MS: u64 = 30_000;

/// Upper bound for any configured timeout (one day)
pub const MAX_TIMEOUT_MS: u64 = 24 * 60 * 60 * 1000;

/// Default log level as string
pub const LOG_LEVEL_STR: &str = "info";

/// Default relay listen address
pub fn relay_listen() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), RELAY_PORT)
}

/// Default relay mode
pub fn relay_mode() -> RelayMode {
    RelayMode::Duplex
}

/// Default admission policy once `max_sessions` is reached
pub fn admission() -> AdmissionPolicy {
    AdmissionPolicy::Queue
}

/// Default maximum number of concurrent relay sessions
pub fn max_sessions() -> usize {
    256
}

/// Default largest accepted frame payload (16 MiB)
pub fn max_frame_len() -> usize {
    16 * 1024 * 1024
}

/// Default maximum number of concurrent frame connections
pub fn max_frame_connections() -> usize {
    64
}

/// Default time to wait for in-flight sessions on shutdown
pub fn shutdown_grace_secs() -> u64 {
    30
}

/// Default log level
pub fn log_level() -> String {
    LOG_LEVEL_STR.to_string()
}
