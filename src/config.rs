use anyhow::{ensure, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::patch::PatchRule;

pub const DEFAULT_CONFIG: &str = "boards.json";

/// One board's LED remapping profile. `dtb_index` pins the target blob;
/// when absent the blob is auto-detected from the rule node names.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BoardProfile {
    #[serde(default)]
    pub dtb_index: Option<usize>,
    pub leds: Vec<PatchRule>,
}

/// The whole config file: board id -> profile. Built here once, handed to
/// the core as typed rules; the core never sees raw config text.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct PatchConfig {
    boards: BTreeMap<String, BoardProfile>,
}

impl PatchConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Could not read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("Could not parse config {}", path.display()))?;
        ensure!(!config.boards.is_empty(), "config {} has no boards", path.display());
        Ok(config)
    }

    /// Look up one board and validate its profile. Unknown board or an
    /// empty rule list is an error for that board.
    pub fn board(&self, name: &str) -> Result<&BoardProfile> {
        let profile = self
            .boards
            .get(name)
            .with_context(|| format!("Board '{name}' not found in config"))?;
        ensure!(!profile.leds.is_empty(), "Board '{name}' has no LED rules");
        Ok(profile)
    }

    /// All boards in deterministic (sorted key) order, validity unchecked.
    pub fn boards(&self) -> impl Iterator<Item = (&str, &BoardProfile)> {
        self.boards.iter().map(|(k, v)| (k.as_str(), v))
    }
}
