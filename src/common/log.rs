//! Logging utilities
//!
//! This module wires the `log` facade to `env_logger` and provides small
//! formatting helpers shared by the relay and frame loggers.

use std::fmt::Write;

/// Initialize the logging system
///
/// `RUST_LOG` takes precedence; `level` is the fallback filter.
///
/// # Parameters
///
/// * `level` - Log level
pub fn init_logger(level: &str) {
    let env = env_logger::Env::default()
        .filter_or("RUST_LOG", level);

    // A second initialisation (e.g. from tests) is not an error worth failing on
    let _ = env_logger::Builder::from_env(env).try_init();
}

/// Render bytes as dash-separated uppercase hex, e.g. `0A-FF-10`
pub fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 {
            out.push('-');
        }
        let _ = write!(out, "{:02X}", b);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logger() {
        // Only checks that repeated initialisation does not panic
        init_logger("debug");
        init_logger("info");
    }

    #[test]
    fn test_hex_dump() {
        assert_eq!(hex_dump(&[]), "");
        assert_eq!(hex_dump(&[0x08]), "08");
        assert_eq!(hex_dump(&[0x08, 0xAD, 0xfb, 0x02]), "08-AD-FB-02");
    }
}
