use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which source wins when a shared column carries a non-null value on
/// both sides of a merge.
///
/// JSON wins by default: the API pull reflects the latest upstream
/// state, while the CSV export is a periodic bulk snapshot. The correct
/// precedence may be entity-specific, so it stays a configuration point
/// rather than a constant baked into the merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePrecedence {
    #[default]
    JsonWins,
    CsvWins,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Explicit configuration handed to every component at construction.
/// No component locates its own data file by probing candidate paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// SQLite database file holding the per-source entity tables.
    pub db_path: PathBuf,
    /// JSON file tracking per-entity last-sync timestamps.
    pub state_path: PathBuf,
    /// Directory of saved per-run JSON dumps, when replaying offline.
    #[serde(default)]
    pub raw_dump_dir: Option<PathBuf>,
    /// Rows per upsert transaction.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Hard ceiling on one entity's sync cycle, in seconds. An
    /// exceeded cycle fails; it is never reported as partial success.
    #[serde(default)]
    pub cycle_timeout_secs: Option<u64>,
    /// Default merge precedence for shared columns.
    #[serde(default)]
    pub merge_precedence: MergePrecedence,
    /// Per-entity overrides of the default precedence.
    #[serde(default)]
    pub entity_precedence: BTreeMap<String, MergePrecedence>,
}

fn default_batch_size() -> usize {
    200
}

impl SyncConfig {
    pub fn new(db_path: impl Into<PathBuf>, state_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            state_path: state_path.into(),
            raw_dump_dir: None,
            batch_size: default_batch_size(),
            cycle_timeout_secs: None,
            merge_precedence: MergePrecedence::default(),
            entity_precedence: BTreeMap::new(),
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }

    pub fn precedence_for(&self, entity: &str) -> MergePrecedence {
        self.entity_precedence
            .get(entity)
            .copied()
            .unwrap_or(self.merge_precedence)
    }
}
