//! Configuration layering tests
//!
//! These mutate process environment variables, so they run serially.

use serial_test::serial;
use std::env;
use std::io::Write;

use companion_tap::config::{AdmissionPolicy, ConfigBuilder, RelayMode, TapConfig, ENV_PREFIX};
use companion_tap::TapError;

const VARS: &[&str] = &[
    "COMPANION_TAP_UPSTREAM_HOST",
    "COMPANION_TAP_IO_TIMEOUT_MS",
    "COMPANION_TAP_RELAY_MODE",
    "COMPANION_TAP_MAX_SESSIONS",
    "COMPANION_TAP_CAPTURE_PREFIX",
];

fn clear_env() {
    for var in VARS {
        env::remove_var(var);
    }
}

fn config_file(value: serde_json::Value) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
    write!(file, "{}", value).unwrap();
    file
}

#[test]
#[serial]
fn test_env_overrides_file() {
    clear_env();
    let file = config_file(serde_json::json!({
        "upstream_host": "file.example.com",
        "io_timeout_ms": 2000,
        "max_sessions": 8,
    }));

    env::set_var("COMPANION_TAP_IO_TIMEOUT_MS", "750");
    env::set_var("COMPANION_TAP_RELAY_MODE", "alternating");

    let config = ConfigBuilder::new()
        .with_file(file.path())
        .with_env(ENV_PREFIX)
        .build()
        .unwrap();
    clear_env();

    assert_eq!(config.upstream_host, "file.example.com");
    assert_eq!(config.io_timeout_ms, 750);
    assert_eq!(config.max_sessions, 8);
    assert_eq!(config.relay_mode, RelayMode::Alternating);
    assert_eq!(config.admission, AdmissionPolicy::Queue);
}

#[test]
#[serial]
fn test_env_only() {
    clear_env();
    env::set_var("COMPANION_TAP_UPSTREAM_HOST", "env.example.com");
    env::set_var("COMPANION_TAP_CAPTURE_PREFIX", "/var/tmp/tap-");

    let config = ConfigBuilder::new().with_env(ENV_PREFIX).build().unwrap();
    clear_env();

    assert_eq!(config.upstream_host, "env.example.com");
    assert_eq!(config.capture_prefix.as_deref(), Some("/var/tmp/tap-"));
    assert_eq!(config.io_timeout_ms, TapConfig::default().io_timeout_ms);
}

#[test]
#[serial]
fn test_invalid_env_value_is_rejected() {
    clear_env();
    env::set_var("COMPANION_TAP_MAX_SESSIONS", "lots");

    let result = ConfigBuilder::new().with_env(ENV_PREFIX).build();
    clear_env();

    assert!(matches!(result, Err(TapError::Config(_))));
}

#[test]
#[serial]
fn test_loaded_config_still_needs_validation() {
    clear_env();
    let config = ConfigBuilder::new().with_env(ENV_PREFIX).build().unwrap();

    // No upstream and no identity configured
    assert!(config.validate().is_err());
}
