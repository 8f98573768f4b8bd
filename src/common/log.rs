//! Logging helpers
//!
//! Wraps `env_logger` so every binary and test initializes logging the same way.

/// Initialize the global logger
///
/// `RUST_LOG` wins over `level` when it is set.
///
/// # Parameters
///
/// * `level` - Default filter, e.g. `info` or `synergy_proxy=debug`
pub fn init_logger(level: &str) {
    let env = env_logger::Env::default()
        .filter_or("RUST_LOG", level);

    // A second initialization (tests, embedding) is not an error for us.
    let _ = env_logger::Builder::from_env(env)
        .format_timestamp_millis()
        .try_init();
}
