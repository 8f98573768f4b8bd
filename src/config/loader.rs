//! Configuration loader implementation
//!
//! Builds a [`SynergyConfig`] from the configuration file and environment with the `config` crate.

use std::path::{Path, PathBuf};

use config::{Config, Environment, File};
use log::debug;

use crate::common::{ProxyError, Result};
use super::defaults;
use super::SynergyConfig;

impl SynergyConfig {
    /// Load configuration from an optional file plus the environment
    ///
    /// When `path` is `None` the file named by `SYNERGY_CONFIG_FILE` is used, if any.
    /// A missing file is not an error; a malformed one is.
    ///
    /// Environment keys use a double underscore for nesting, so
    /// `SYNERGY_ADMIN_LISTEN` maps to `admin_listen`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path: Option<PathBuf> = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(defaults::CONFIG_FILE_ENV).map(PathBuf::from));

        let mut builder = Config::builder();
        if let Some(config_path) = &config_path {
            debug!("Loading configuration from {}", config_path.display());
            builder = builder.add_source(File::from(config_path.clone()).required(false));
        }
        builder = builder.add_source(
            Environment::with_prefix(defaults::ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .map_err(|e| ProxyError::Config(format!("Failed to load configuration: {}", e)))?
            .try_deserialize::<SynergyConfig>()
            .map_err(|e| ProxyError::Config(format!("Failed to parse configuration: {}", e)))?;

        Ok(config)
    }
}
