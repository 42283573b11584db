//! Configuration validator
//!
//! This module provides functionality for validating configuration.

use log::warn;
use std::path::Path;

use crate::common::{TapError, Result};
use super::{IdentitySource, TapConfig, MAX_TIMEOUT_MS};

/// Validate the configuration
pub fn validate_config(config: &TapConfig) -> Result<()> {
    validate_network_settings(config)?;
    validate_identity_settings(config)?;
    validate_general_settings(config)?;

    Ok(())
}

/// Validate network settings
fn validate_network_settings(config: &TapConfig) -> Result<()> {
    if config.upstream_host.trim().is_empty() {
        return Err(TapError::Config(
            "upstream_host is required".to_string()
        ));
    }

    if config.upstream_port == 0 && config.upstream_connect_addr.is_none() {
        return Err(TapError::Config(
            "upstream_port must be greater than 0".to_string()
        ));
    }

    if let Some(frame_listen) = config.frame_listen {
        if frame_listen == config.relay_listen {
            return Err(TapError::Config(
                "relay_listen and frame_listen must be different".to_string()
            ));
        }
    }

    Ok(())
}

/// Validate certificate settings
fn validate_identity_settings(config: &TapConfig) -> Result<()> {
    match config.identity()? {
        IdentitySource::Pem { cert, key } => {
            validate_file_exists(&cert, "Certificate")?;
            validate_file_exists(&key, "Private key")?;
        }
        IdentitySource::Pkcs12 { path, .. } => {
            validate_file_exists(&path, "PKCS#12 bundle")?;
        }
    }

    if let Some(ca) = &config.upstream_ca_file {
        validate_file_exists(ca, "Upstream CA bundle")?;
    }

    Ok(())
}

/// Validate general settings
fn validate_general_settings(config: &TapConfig) -> Result<()> {
    match config.log_level.as_str() {
        "error" | "warn" | "info" | "debug" | "trace" => {}
        level => {
            warn!("Invalid log level: {}. RUST_LOG or the default filter applies", level);
        }
    }

    let positive = [
        ("chunk_size", config.chunk_size as u64),
        ("io_timeout_ms", config.io_timeout_ms),
        ("handshake_timeout_ms", config.handshake_timeout_ms),
        ("max_sessions", config.max_sessions as u64),
        ("max_frame_len", config.max_frame_len as u64),
        ("max_frame_connections", config.max_frame_connections as u64),
        ("frame_idle_timeout_ms", config.frame_idle_timeout_ms),
    ];
    for (name, value) in positive {
        if value == 0 {
            return Err(TapError::Config(format!("{} must be greater than 0", name)));
        }
    }

    let timeouts = [
        ("io_timeout_ms", config.io_timeout_ms),
        ("handshake_timeout_ms", config.handshake_timeout_ms),
        ("frame_idle_timeout_ms", config.frame_idle_timeout_ms),
    ];
    for (name, value) in timeouts {
        if value > MAX_TIMEOUT_MS {
            return Err(TapError::Config(format!("{} cannot exceed {}", name, MAX_TIMEOUT_MS)));
        }
    }

    if config.max_frame_len > u32::MAX as usize {
        return Err(TapError::Config(format!(
            "max_frame_len cannot exceed {} (4-byte length prefix)",
            u32::MAX
        )));
    }

    if let Some(prefix) = &config.capture_prefix {
        if prefix.is_empty() {
            return Err(TapError::Config(
                "capture_prefix must not be empty; omit it to disable capture".to_string()
            ));
        }
    }

    Ok(())
}

/// Validate that a file exists
fn validate_file_exists(path: &Path, description: &str) -> Result<()> {
    if !path.exists() {
        return Err(TapError::Config(format!(
            "{} file does not exist: {}",
            description,
            path.display()
        )));
    }
    if !path.is_file() {
        return Err(TapError::Config(format!(
            "{} path is not a file: {}",
            description,
            path.display()
        )));
    }
    Ok(())
}
