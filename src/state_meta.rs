//! Persisted shard state metadata: `(primary, index_uuid, allocation_id)`
//! (spec §6). Written with the same atomic temp-file-then-rename pattern as
//! `storage.rs::save_catalog`, under `_state/state-<gen>.st`; the highest
//! generation on disk wins on re-read, so a crash mid-write never leaves a
//! reader looking at a half-written file.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardStateMeta {
    pub primary: bool,
    pub index_uuid: String,
    pub allocation_id: String,
}

fn state_dir(shard_dir: &Path) -> PathBuf {
    shard_dir.join("_state")
}

fn state_path(shard_dir: &Path, generation: u64) -> PathBuf {
    state_dir(shard_dir).join(format!("state-{}.st", generation))
}

impl ShardStateMeta {
    pub fn new(primary: bool, index_uuid: impl Into<String>, allocation_id: impl Into<String>) -> Self {
        Self { primary, index_uuid: index_uuid.into(), allocation_id: allocation_id.into() }
    }

    /// Write a new generation. Returns the generation number written so the
    /// caller can retain only the most recent few.
    pub fn write(&self, shard_dir: &Path) -> Result<u64> {
        let dir = state_dir(shard_dir);
        fs::create_dir_all(&dir)?;
        let next_generation = Self::highest_generation_on_disk(shard_dir)?.map_or(1, |g| g + 1);
        let path = state_path(shard_dir, next_generation);
        let temp_path = path.with_extension("st.tmp");
        fs::write(&temp_path, serde_json::to_vec(self)?)?;
        fs::rename(temp_path, path)?;
        Ok(next_generation)
    }

    /// Read the highest-generation state file present. `Ok(None)` if the
    /// shard has never persisted state (e.g. a brand-new shard).
    pub fn read_latest(shard_dir: &Path) -> Result<Option<Self>> {
        let Some(generation) = Self::highest_generation_on_disk(shard_dir)? else {
            return Ok(None);
        };
        let path = state_path(shard_dir, generation);
        let bytes = fs::read(path)?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    fn highest_generation_on_disk(shard_dir: &Path) -> Result<Option<u64>> {
        let dir = state_dir(shard_dir);
        if !dir.exists() {
            return Ok(None);
        }
        let mut max_gen = None;
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(rest) = name.strip_prefix("state-").and_then(|s| s.strip_suffix(".st")) {
                if let Ok(gen) = rest.parse::<u64>() {
                    max_gen = Some(max_gen.map_or(gen, |m: u64| m.max(gen)));
                }
            }
        }
        Ok(max_gen)
    }

    /// Deletes every generation strictly below `keep_from_generation`,
    /// mirroring the translog's `trim_unreferenced_readers`.
    pub fn prune_old_generations(shard_dir: &Path, keep_from_generation: u64) -> Result<()> {
        let dir = state_dir(shard_dir);
        if !dir.exists() {
            return Ok(());
        }
        let mut generation = 1;
        while generation < keep_from_generation {
            let _ = fs::remove_file(state_path(shard_dir, generation));
            generation += 1;
        }
        Ok(())
    }
}
