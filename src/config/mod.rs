//! Configuration module
//!
//! This module holds the immutable startup configuration, loaded once from
//! defaults, an optional JSON file, environment variables and command line
//! flags, then validated and shared read-only by every session.

mod defaults;
mod loader;
mod validator;

pub use self::defaults::{CONFIG_FILE_ENV, ENV_PREFIX, MAX_TIMEOUT_MS};
pub use self::loader::ConfigBuilder;
pub use self::validator::validate_config;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::common::{TapError, Result};

/// How decrypted bytes are pumped between the two TLS streams
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RelayMode {
    /// Each direction is an independent read/write loop
    Duplex,
    /// Half-duplex drain phases that end on a short read
    Alternating,
}

impl Default for RelayMode {
    #[inline]
    fn default() -> Self {
        defaults::relay_mode()
    }
}

impl fmt::Display for RelayMode {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Duplex => write!(f, "duplex"),
            Self::Alternating => write!(f, "alternating"),
        }
    }
}

impl FromStr for RelayMode {
    type Err = TapError;

    #[inline]
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "duplex" => Ok(Self::Duplex),
            "alternating" => Ok(Self::Alternating),
            _ => Err(TapError::Config(format!(
                "Invalid relay mode: {}. Valid values are: duplex, alternating",
                s
            ))),
        }
    }
}

/// What the relay accept loop does once `max_sessions` are active
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionPolicy {
    /// Stop accepting until a session slot frees up
    Queue,
    /// Accept and immediately close the excess connection
    Reject,
}

impl Default for AdmissionPolicy {
    #[inline]
    fn default() -> Self {
        defaults::admission()
    }
}

impl fmt::Display for AdmissionPolicy {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queue => write!(f, "queue"),
            Self::Reject => write!(f, "reject"),
        }
    }
}

impl FromStr for AdmissionPolicy {
    type Err = TapError;

    #[inline]
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queue" => Ok(Self::Queue),
            "reject" => Ok(Self::Reject),
            _ => Err(TapError::Config(format!(
                "Invalid admission policy: {}. Valid values are: queue, reject",
                s
            ))),
        }
    }
}

/// PKCS#12 password; never printed
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(transparent)]
pub struct Password(String);

impl Password {
    /// Wrap a password
    pub fn new(password: impl Into<String>) -> Self {
        Self(password.into())
    }

    /// Borrow the plain text
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Password(***)")
    }
}

/// Where the fixed TLS identity comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentitySource {
    /// PEM certificate chain and PEM private key
    Pem { cert: PathBuf, key: PathBuf },
    /// PKCS#12 bundle
    Pkcs12 { path: PathBuf, password: Password },
}

/// The single fixed backend the relay forwards to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    /// Hostname used for SNI and certificate verification
    pub host: String,
    /// Port used when `connect_addr` is not pinned
    pub port: u16,
    /// Address dialled instead of resolving `host:port`
    pub connect_addr: Option<SocketAddr>,
}

impl UpstreamTarget {
    /// The `host:port` authority or pinned address being dialled, for logs
    pub fn dial_target(&self) -> String {
        match self.connect_addr {
            Some(addr) => addr.to_string(),
            None => format!("{}:{}", self.host, self.port),
        }
    }
}

impl fmt::Display for UpstreamTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.connect_addr {
            Some(addr) => write!(f, "{}:{} via {}", self.host, self.port, addr),
            None => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

/// Companion tap configuration
///
/// Loaded once at startup and shared read-only as `Arc<TapConfig>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TapConfig {
    // --- Relay ---

    /// Address the TLS relay listens on
    pub relay_listen: SocketAddr,

    /// Upstream hostname (SNI and certificate verification)
    pub upstream_host: String,

    /// Upstream port
    pub upstream_port: u16,

    /// Pinned address to dial instead of resolving the upstream hostname
    pub upstream_connect_addr: Option<SocketAddr>,

    /// Extra CA bundle trusted for the upstream, on top of system roots
    pub upstream_ca_file: Option<PathBuf>,

    /// PEM certificate chain presented to clients
    pub cert: Option<PathBuf>,

    /// PEM private key for `cert`
    pub key: Option<PathBuf>,

    /// PKCS#12 bundle presented to clients (alternative to `cert`/`key`)
    pub pkcs12: Option<PathBuf>,

    /// Password for `pkcs12`
    pub pkcs12_password: Option<Password>,

    /// Capture artifact base path; the session id is appended. Unset disables capture.
    pub capture_prefix: Option<String>,

    /// Relay strategy
    pub relay_mode: RelayMode,

    /// Maximum bytes per relay read
    pub chunk_size: usize,

    /// Per read/write deadline
    pub io_timeout_ms: u64,

    /// Connect and handshake deadline
    pub handshake_timeout_ms: u64,

    /// Maximum concurrent relay sessions
    pub max_sessions: usize,

    /// Behaviour at `max_sessions`
    pub admission: AdmissionPolicy,

    // --- Frame server ---

    /// Address the frame server listens on; unset disables it
    pub frame_listen: Option<SocketAddr>,

    /// Largest accepted frame payload
    pub max_frame_len: usize,

    /// Maximum concurrent frame connections
    pub max_frame_connections: usize,

    /// A frame connection that delivers nothing for this long is closed
    pub frame_idle_timeout_ms: u64,

    // --- General ---

    /// Seconds to wait for in-flight sessions on shutdown
    pub shutdown_grace_secs: u64,

    /// Log level (error, warn, info, debug, trace)
    pub log_level: String,
}

impl Default for TapConfig {
    fn default() -> Self {
        Self {
            relay_listen: defaults::relay_listen(),
            upstream_host: String::new(),
            upstream_port: defaults::UPSTREAM_PORT,
            upstream_connect_addr: None,
            upstream_ca_file: None,
            cert: None,
            key: None,
            pkcs12: None,
            pkcs12_password: None,
            capture_prefix: None,
            relay_mode: defaults::relay_mode(),
            chunk_size: defaults::CHUNK_SIZE,
            io_timeout_ms: defaults::IO_TIMEOUT_MS,
            handshake_timeout_ms: defaults::HANDSHAKE_TIMEOUT_MS,
            max_sessions: defaults::max_sessions(),
            admission: defaults::admission(),
            frame_listen: None,
            max_frame_len: defaults::max_frame_len(),
            max_frame_connections: defaults::max_frame_connections(),
            frame_idle_timeout_ms: defaults::FRAME_IDLE_TIMEOUT_MS,
            shutdown_grace_secs: defaults::shutdown_grace_secs(),
            log_level: defaults::log_level(),
        }
    }
}

impl TapConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        validate_config(self)
    }

    /// Per read/write deadline
    #[inline]
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    /// Connect and handshake deadline
    #[inline]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Frame connection idle deadline
    #[inline]
    pub fn frame_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_idle_timeout_ms)
    }

    /// Shutdown grace period
    #[inline]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// The configured upstream
    pub fn upstream(&self) -> UpstreamTarget {
        UpstreamTarget {
            host: self.upstream_host.clone(),
            port: self.upstream_port,
            connect_addr: self.upstream_connect_addr,
        }
    }

    /// Resolve which identity format is configured
    ///
    /// Exactly one of `cert`+`key` or `pkcs12` must be set.
    pub fn identity(&self) -> Result<IdentitySource> {
        match (&self.cert, &self.key, &self.pkcs12) {
            (Some(cert), Some(key), None) => Ok(IdentitySource::Pem {
                cert: cert.clone(),
                key: key.clone(),
            }),
            (None, None, Some(path)) => Ok(IdentitySource::Pkcs12 {
                path: path.clone(),
                password: self.pkcs12_password.clone().unwrap_or_default(),
            }),
            (Some(_), None, None) | (None, Some(_), None) => Err(TapError::Config(
                "Both cert and key must be set for a PEM identity".to_string(),
            )),
            (None, None, None) => Err(TapError::Config(
                "No TLS identity configured: set cert and key, or pkcs12".to_string(),
            )),
            _ => Err(TapError::Config(
                "Configure either cert/key or pkcs12, not both".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TapConfig::default();
        assert_eq!(config.relay_listen.to_string(), "0.0.0.0:443");
        assert_eq!(config.upstream_port, 443);
        assert_eq!(config.chunk_size, 65536);
        assert_eq!(config.io_timeout(), Duration::from_millis(1500));
        assert_eq!(config.frame_idle_timeout(), Duration::from_secs(30));
        assert_eq!(config.relay_mode, RelayMode::Duplex);
        assert_eq!(config.admission, AdmissionPolicy::Queue);
        assert!(config.capture_prefix.is_none());
        assert!(config.frame_listen.is_none());
    }

    #[test]
    fn test_relay_mode_from_str() {
        assert_eq!("Alternating".parse::<RelayMode>().unwrap(), RelayMode::Alternating);
        assert_eq!("duplex".parse::<RelayMode>().unwrap(), RelayMode::Duplex);
        assert!("half".parse::<RelayMode>().is_err());
        assert_eq!(RelayMode::Alternating.to_string(), "alternating");
    }

    #[test]
    fn test_admission_from_str() {
        assert_eq!("REJECT".parse::<AdmissionPolicy>().unwrap(), AdmissionPolicy::Reject);
        assert!("drop".parse::<AdmissionPolicy>().is_err());
    }

    #[test]
    fn test_identity_resolution() {
        let mut config = TapConfig::default();
        assert!(config.identity().is_err());

        config.cert = Some("server.crt".into());
        assert!(config.identity().is_err(), "cert without key is incomplete");

        config.key = Some("server.key".into());
        assert_eq!(
            config.identity().unwrap(),
            IdentitySource::Pem { cert: "server.crt".into(), key: "server.key".into() }
        );

        config.pkcs12 = Some("server.pfx".into());
        assert!(config.identity().is_err(), "both formats is ambiguous");

        config.cert = None;
        config.key = None;
        config.pkcs12_password = Some(Password::new("secret"));
        match config.identity().unwrap() {
            IdentitySource::Pkcs12 { path, password } => {
                assert_eq!(path, PathBuf::from("server.pfx"));
                assert_eq!(password.expose(), "secret");
            }
            other => panic!("unexpected identity {:?}", other),
        }
    }

    #[test]
    fn test_password_is_redacted() {
        let password = Password::new("hunter2");
        assert!(!format!("{:?}", password).contains("hunter2"));
    }

    #[test]
    fn test_upstream_display() {
        let mut config = TapConfig::default();
        config.upstream_host = "api.example.com".to_string();
        assert_eq!(config.upstream().to_string(), "api.example.com:443");
        assert_eq!(config.upstream().dial_target(), "api.example.com:443");

        config.upstream_connect_addr = Some("10.0.0.7:8443".parse().unwrap());
        assert_eq!(config.upstream().to_string(), "api.example.com:443 via 10.0.0.7:8443");
        assert_eq!(config.upstream().dial_target(), "10.0.0.7:8443");
    }
}
