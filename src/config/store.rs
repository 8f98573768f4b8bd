//! Persisted proxy definitions

use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::common::{ProxyError, Result};
use crate::proxy::ProxyDefinition;

/// `proxies.json`: a JSON array of proxy definitions
#[derive(Debug, Clone)]
pub struct ProxyStore {
    path: PathBuf,
}

impl ProxyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load all definitions; a missing file holds none
    pub fn load(&self) -> Result<Vec<ProxyDefinition>> {
        if !self.path.exists() {
            debug!("No proxies file at {}", self.path.display());
            return Ok(Vec::new());
        }
        let data = std::fs::read_to_string(&self.path)?;
        let definitions: Vec<ProxyDefinition> = serde_json::from_str(&data)
            .map_err(|e| ProxyError::Config(format!("Invalid proxies file {}: {}", self.path.display(), e)))?;
        info!("Loaded {} proxies from {}", definitions.len(), self.path.display());
        Ok(definitions)
    }

    /// Replace the file contents with `definitions`
    pub fn save(&self, definitions: &[ProxyDefinition]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(definitions)?)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!("Saved {} proxies to {}", definitions.len(), self.path.display());
        Ok(())
    }
}
