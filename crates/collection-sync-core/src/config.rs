use crate::notify::DEFAULT_UPDATE_THRESHOLD;
use crate::types::LibraryIdentifier;
use anyhow::Context;
use serde::Deserialize;
use std::path::Path;

/// Per-synchronizer settings.
///
/// ```toml
/// include_item_counts = true
/// update_threshold = 200
///
/// [library_id]
/// group = 42
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    pub library_id: LibraryIdentifier,
    pub include_item_counts: bool,
    /// Processed entries between intermediate tree notifications.
    pub update_threshold: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            library_id: LibraryIdentifier::default(),
            include_item_counts: false,
            update_threshold: DEFAULT_UPDATE_THRESHOLD,
        }
    }
}

impl SyncConfig {
    pub fn new(library_id: LibraryIdentifier, include_item_counts: bool) -> Self {
        Self {
            library_id,
            include_item_counts,
            ..Self::default()
        }
    }

    pub fn from_toml_str(input: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(input).context("invalid synchronizer config")?;
        if config.update_threshold == 0 {
            anyhow::bail!("update_threshold must be at least 1");
        }
        Ok(config)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let input = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml_str(&input).with_context(|| format!("in {}", path.display()))
    }
}
