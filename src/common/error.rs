//! Error handling module
//!
//! This module defines the error types and result type aliases used in the application.

use bytes::Bytes;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Companion tap error type
#[derive(Error, Debug)]
pub enum TapError {
    /// IO error (peer reset, closed socket, other transport fault)
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// OpenSSL error while building a TLS context
    #[error("OpenSSL error: {0}")]
    Ssl(#[from] openssl::error::ErrorStack),

    /// TLS negotiation failed in either direction
    #[error("TLS handshake failed during {stage}: {message}")]
    HandshakeFailure {
        /// Stage that was handshaking
        stage: &'static str,
        /// OpenSSL failure description
        message: String,
    },

    /// A read, write or handshake exceeded its deadline
    #[error("Timed out after {after:?} during {stage}")]
    IoTimeout {
        /// Stage that was blocked
        stage: &'static str,
        /// Configured deadline
        after: Duration,
    },

    /// The stream ended before a frame's declared payload arrived
    #[error("Frame length mismatch: declared {declared} bytes, received {}", .partial.len())]
    FrameLengthMismatch {
        /// Length from the 4-byte prefix
        declared: u32,
        /// Payload bytes obtained before the stream ended
        partial: Bytes,
    },

    /// A frame prefix declared more than the configured maximum
    #[error("Frame too large: declared {declared} bytes (max {max})")]
    FrameTooLarge {
        /// Length from the 4-byte prefix
        declared: u32,
        /// Configured maximum
        max: usize,
    },

    /// Certificate or private key could not be loaded
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl TapError {
    /// Whether the enclosing connection can keep going after this error.
    ///
    /// Only a short frame payload is recoverable; everything else ends the
    /// session or connection that produced it.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TapError::FrameLengthMismatch { .. })
    }

    /// Whether this error is a deadline expiry
    pub fn is_timeout(&self) -> bool {
        matches!(self, TapError::IoTimeout { .. })
    }
}

impl From<config::ConfigError> for TapError {
    fn from(err: config::ConfigError) -> Self {
        TapError::Config(err.to_string())
    }
}

/// Result type alias
///
/// This is a `Result` type alias that uses our custom `TapError`.
pub type Result<T> = std::result::Result<T, TapError>;
