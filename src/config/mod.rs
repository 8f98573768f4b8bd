//! Configuration module
//!
//! Settings are layered, lowest priority first:
//!
//! 1. Defaults from [`defaults`]
//! 2. An optional JSON configuration file
//! 3. `SYNERGY_*` environment variables
//! 4. Command line flags (applied by the binary through [`SynergyConfig::apply_overrides`])

pub mod defaults;
mod loader;
pub mod store;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::common::{ProxyError, Result};

pub use defaults::ENV_PREFIX;
pub use store::ProxyStore;

/// Process-wide settings shared by every proxy instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynergyConfig {
    /// Management API listen address
    pub admin_listen: SocketAddr,
    /// Directory for the keystore and persisted proxies
    pub data_dir: PathBuf,
    /// Keystore path, defaults to `<data_dir>/key_store.json`
    pub keystore_file: Option<PathBuf>,
    /// Password protecting every PKCS#12 entry of the keystore
    pub keystore_password: String,
    /// Proxies file, defaults to `<data_dir>/proxies.json`
    pub proxies_file: Option<PathBuf>,
    /// Outbound connect timeout in seconds
    pub connect_timeout: u64,
    /// Login handshake timeout in seconds
    pub handshake_timeout: u64,
    /// Read buffer size for raw byte relays
    pub buffer_size: usize,
    /// Log level
    pub log_level: String,
    /// Verify upstream TLS certificates
    pub verify_upstream: bool,
    /// Extra RPC service descriptors (JSON)
    pub registry_file: Option<PathBuf>,
    /// Local block palette for game sessions (JSON)
    pub palette_file: Option<PathBuf>,
}

impl Default for SynergyConfig {
    fn default() -> Self {
        Self {
            admin_listen: defaults::admin_listen(),
            data_dir: defaults::data_dir(),
            keystore_file: None,
            keystore_password: defaults::keystore_password(),
            proxies_file: None,
            connect_timeout: defaults::connect_timeout(),
            handshake_timeout: defaults::handshake_timeout(),
            buffer_size: defaults::buffer_size(),
            log_level: defaults::log_level(),
            verify_upstream: false,
            registry_file: None,
            palette_file: None,
        }
    }
}

/// Command line values that override file and environment settings
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub admin_listen: Option<SocketAddr>,
    pub data_dir: Option<PathBuf>,
    pub log_level: Option<String>,
    pub connect_timeout: Option<u64>,
    pub handshake_timeout: Option<u64>,
    pub verify_upstream: bool,
}

impl SynergyConfig {
    /// Effective keystore path
    pub fn keystore_path(&self) -> PathBuf {
        self.keystore_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join(defaults::KEYSTORE_FILE_NAME))
    }

    /// Effective proxies file path
    pub fn proxies_path(&self) -> PathBuf {
        self.proxies_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join(defaults::PROXIES_FILE_NAME))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout)
    }

    /// Apply command line overrides on top of loaded values
    pub fn apply_overrides(mut self, overrides: Overrides) -> Self {
        if let Some(addr) = overrides.admin_listen {
            self.admin_listen = addr;
        }
        if let Some(dir) = overrides.data_dir {
            self.data_dir = dir;
        }
        if let Some(level) = overrides.log_level {
            self.log_level = level;
        }
        if let Some(secs) = overrides.connect_timeout {
            self.connect_timeout = secs;
        }
        if let Some(secs) = overrides.handshake_timeout {
            self.handshake_timeout = secs;
        }
        if overrides.verify_upstream {
            self.verify_upstream = true;
        }
        self
    }

    /// Reject settings that cannot work
    pub fn validate(&self) -> Result<()> {
        if self.connect_timeout == 0 {
            return Err(ProxyError::Config("connect_timeout must be greater than 0".to_string()));
        }
        if self.handshake_timeout == 0 {
            return Err(ProxyError::Config("handshake_timeout must be greater than 0".to_string()));
        }
        if self.buffer_size < 512 {
            return Err(ProxyError::Config(format!(
                "buffer_size {} is too small, minimum is 512", self.buffer_size
            )));
        }
        for (name, path) in [("registry_file", &self.registry_file), ("palette_file", &self.palette_file)] {
            if let Some(path) = path {
                if !path.exists() {
                    return Err(ProxyError::Config(format!("{} {} does not exist", name, path.display())));
                }
            }
        }
        Ok(())
    }
}
