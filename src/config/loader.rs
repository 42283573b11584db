//! Configuration loading
//!
//! Layers, lowest to highest priority:
//! 1. Built-in defaults (`TapConfig::default`)
//! 2. JSON configuration file
//! 3. Environment variables with the `COMPANION_TAP_` prefix
//!
//! Command line flags are applied by the binary on top of the result.

use config::{Config, Environment, File, FileFormat};
use log::debug;
use std::path::{Path, PathBuf};

use crate::common::{TapError, Result};
use super::TapConfig;

/// Layered configuration builder
pub struct ConfigBuilder {
    file: Option<PathBuf>,
    env_prefix: Option<String>,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBuilder {
    /// Create a builder that yields the defaults only
    pub fn new() -> Self {
        Self {
            file: None,
            env_prefix: None,
        }
    }

    /// Add a JSON configuration file; it must exist
    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        let path = path.as_ref();
        debug!("Adding file configuration source: {}", path.display());
        self.file = Some(path.to_path_buf());
        self
    }

    /// Add environment variables with the given prefix (without trailing `_`)
    pub fn with_env(mut self, prefix: &str) -> Self {
        debug!("Adding environment configuration source with prefix: {}", prefix);
        self.env_prefix = Some(prefix.to_string());
        self
    }

    /// Build the configuration
    ///
    /// The result is not validated; call [`TapConfig::validate`] once all
    /// overrides are applied.
    pub fn build(self) -> Result<TapConfig> {
        let mut builder = Config::builder();

        if let Some(path) = &self.file {
            if !path.is_file() {
                return Err(TapError::Config(format!(
                    "Configuration file not found: {}",
                    path.display()
                )));
            }
            let name = path.to_string_lossy();
            builder = builder.add_source(File::new(&name, FileFormat::Json).required(true));
        }

        if let Some(prefix) = &self.env_prefix {
            builder = builder.add_source(
                Environment::with_prefix(prefix)
                    .try_parsing(true)
                    .ignore_empty(true),
            );
        }

        let config: TapConfig = builder.build()?.try_deserialize()?;
        debug!("Configuration built: {:?}", config);
        Ok(config)
    }
}
