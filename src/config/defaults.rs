//! Default configuration values
//!
//! This module provides default values for configuration options.
//! It is the single source of truth for defaults used by serde, clap and tests.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

/// Environment variable prefix for all configuration options
pub const ENV_PREFIX: &str = "SYNERGY";

/// Environment variable naming the configuration file
pub const CONFIG_FILE_ENV: &str = "SYNERGY_CONFIG_FILE";

/// Default admin API listen address as string
pub const ADMIN_LISTEN_STR: &str = "127.0.0.1:8080";

/// Directory below `$HOME` holding the keystore and proxies file
pub const DATA_DIR_NAME: &str = ".synergy";

/// Keystore file name inside the data directory
pub const KEYSTORE_FILE_NAME: &str = "key_store.json";

/// Persisted proxies file name inside the data directory
pub const PROXIES_FILE_NAME: &str = "proxies.json";

/// Default log level as string
pub const LOG_LEVEL_STR: &str = "info";

/// Default admin listen address
pub fn admin_listen() -> SocketAddr {
    SocketAddr::from_str(ADMIN_LISTEN_STR)
        .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 8080)))
}

/// Default data directory, `$HOME/.synergy` or `./.synergy` without a home
pub fn data_dir() -> PathBuf {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DATA_DIR_NAME)
}

/// Default keystore password
pub fn keystore_password() -> String {
    String::new()
}

/// Default log level
pub fn log_level() -> String {
    LOG_LEVEL_STR.to_string()
}

/// Default buffer size (8KB)
pub fn buffer_size() -> usize {
    8192
}

/// Default connection timeout in seconds
pub fn connect_timeout() -> u64 {
    30
}

/// Default handshake timeout in seconds
pub fn handshake_timeout() -> u64 {
    30
}
