//! Block palette and type registry merge
//!
//! Runtime ids of block states are positional: both ends number the merged,
//! sorted list of blocks. The proxy therefore merges its local palette with
//! the blocks announced by the server and installs the same result on both
//! legs.

use std::collections::BTreeMap;
use std::path::Path;

use log::info;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::common::{ProxyError, Result};

/// Protocol version from which blocks sort by their full key
pub const FULL_KEY_SORT_VERSION: i32 = 486;

/// A block and all of its states
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockDefinition {
    pub key: String,
    #[serde(default)]
    pub states: Vec<Value>,
}

/// One entry of a palette file
#[derive(Debug, Deserialize)]
struct PaletteEntry {
    name: String,
    #[serde(default)]
    states: Value,
}

#[derive(Debug, Deserialize)]
struct PaletteFile {
    blocks: Vec<PaletteEntry>,
}

/// Blocks known to the proxy before any server is contacted
#[derive(Debug, Clone, Default)]
pub struct BlockPalette {
    blocks: BTreeMap<String, BlockDefinition>,
}

impl BlockPalette {
    /// Load `{"blocks": [{"name": .., "states": ..}, ..]}`, grouping states by block
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let file: PaletteFile = serde_json::from_str(&data)
            .map_err(|e| ProxyError::Config(format!("Invalid palette {}: {}", path.display(), e)))?;

        let mut palette = Self::default();
        for entry in file.blocks {
            palette.add_state(entry.name, entry.states);
        }
        info!("Loaded {} blocks from {}", palette.len(), path.display());
        Ok(palette)
    }

    pub fn add_state(&mut self, key: String, state: Value) {
        self.blocks
            .entry(key.clone())
            .or_insert_with(|| BlockDefinition { key, states: Vec::new() })
            .states
            .push(state);
    }

    pub fn blocks(&self) -> impl Iterator<Item = &BlockDefinition> {
        self.blocks.values()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// A block state with its runtime id
#[derive(Debug, Clone, PartialEq)]
pub struct BlockState {
    pub runtime_id: u32,
    pub key: String,
    pub state: Value,
}

/// Runtime id assignments shared by both legs of a session
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TypeRegistry {
    pub block_states: Vec<BlockState>,
    pub items: BTreeMap<i16, String>,
}

impl TypeRegistry {
    pub fn block_state(&self, runtime_id: u32) -> Option<&BlockState> {
        self.block_states.get(runtime_id as usize)
    }

    pub fn item(&self, id: i16) -> Option<&str> {
        self.items.get(&id).map(String::as_str)
    }
}

fn sort_key(key: &str, version: i32) -> String {
    if version >= FULL_KEY_SORT_VERSION {
        key.to_lowercase()
    } else {
        key.split_once(':').map_or(key, |(_, name)| name).to_lowercase()
    }
}

/// Merge the local palette with server blocks and items
///
/// Local blocks come first, then the server's; the combined list is sorted by
/// key (stable, so duplicates keep that order) and states are numbered from 0.
pub fn merge(local: &BlockPalette, server_blocks: &[BlockDefinition], items: &[(String, i16)], version: i32) -> TypeRegistry {
    let mut blocks: Vec<&BlockDefinition> = local.blocks().chain(server_blocks.iter()).collect();
    blocks.sort_by_cached_key(|block| sort_key(&block.key, version));

    let mut registry = TypeRegistry::default();
    for block in blocks {
        for state in &block.states {
            let runtime_id = registry.block_states.len() as u32;
            registry.block_states.push(BlockState { runtime_id, key: block.key.clone(), state: state.clone() });
        }
    }
    for (key, id) in items {
        registry.items.insert(*id, key.clone());
    }
    registry
}
