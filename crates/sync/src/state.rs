use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct EntityState {
    #[serde(default)]
    last_sync_time: Option<DateTime<Utc>>,
    #[serde(default)]
    last_updated: Option<DateTime<Utc>>,
}

/// On-disk shape of the sync-state file. Unknown keys are ignored on
/// read, so newer writers stay compatible with older files and vice
/// versa.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StateFile {
    #[serde(default = "default_version")]
    version: u32,
    #[serde(default)]
    last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    global: EntityState,
    #[serde(default)]
    entities: BTreeMap<String, EntityState>,
}

fn default_version() -> u32 {
    1
}

impl Default for StateFile {
    fn default() -> Self {
        Self {
            version: default_version(),
            last_updated: None,
            global: EntityState::default(),
            entities: BTreeMap::new(),
        }
    }
}

/// Persists, per entity, the timestamp of the last successfully
/// processed batch; supplies the cutoff for the next incremental fetch.
///
/// A corrupt or missing state file is treated as "no prior sync" so a
/// cycle can always proceed with a full fetch. Write failures are
/// logged and surfaced as `false`, never raised, so the caller can
/// retry the window without having advanced the cutoff. Read-modify-
/// write runs under a process-local lock; cross-process safety is out
/// of scope.
pub struct SyncStateTracker {
    path: PathBuf,
    lock: Mutex<()>,
}

impl SyncStateTracker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Returns `None` only when no successful sync has been recorded
    /// for the entity (first run).
    pub fn get_last_sync_time(&self, entity: Option<&str>) -> Option<DateTime<Utc>> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let state = self.read_state();
        match entity {
            Some(name) => state.entities.get(name)?.last_sync_time,
            None => state.global.last_sync_time,
        }
    }

    /// Records a successful sync up to `time`. Timestamps never move
    /// backward here; only `clear` resets them for a full re-fetch.
    pub fn update_last_sync_time(&self, entity: Option<&str>, time: DateTime<Utc>) -> bool {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut state = self.read_state();
        let now = Utc::now();

        let entry = match entity {
            Some(name) => state.entities.entry(name.to_string()).or_default(),
            None => &mut state.global,
        };
        if let Some(current) = entry.last_sync_time {
            if time < current {
                tracing::warn!(
                    entity = entity.unwrap_or("<global>"),
                    %time,
                    %current,
                    "ignoring backward sync-state update"
                );
                return true;
            }
        }
        entry.last_sync_time = Some(time);
        entry.last_updated = Some(now);
        state.last_updated = Some(now);

        match self.write_state(&state) {
            Ok(()) => true,
            Err(err) => {
                tracing::error!(
                    entity = entity.unwrap_or("<global>"),
                    path = %self.path.display(),
                    %err,
                    "failed to persist sync state"
                );
                false
            }
        }
    }

    /// Removes persisted state for one entity, or everything when
    /// `entity` is `None`, enabling a full historical re-fetch.
    pub fn clear(&self, entity: Option<&str>) -> bool {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut state = self.read_state();
        match entity {
            Some(name) => {
                state.entities.remove(name);
            }
            None => {
                state = StateFile::default();
            }
        }
        state.last_updated = Some(Utc::now());
        match self.write_state(&state) {
            Ok(()) => true,
            Err(err) => {
                tracing::error!(path = %self.path.display(), %err, "failed to clear sync state");
                false
            }
        }
    }

    fn read_state(&self) -> StateFile {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(state) => state,
                Err(err) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        %err,
                        "sync-state file is corrupt, treating as first run"
                    );
                    StateFile::default()
                }
            },
            Err(_) => StateFile::default(),
        }
    }

    fn write_state(&self, state: &StateFile) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let serialized = serde_json::to_string_pretty(state)?;
        // Write-then-rename keeps a concurrent reader from ever seeing
        // a half-written file.
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serialized)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
