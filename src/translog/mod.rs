//! Write-ahead translog: generations, sync, retention, iteration (spec §4.2).

pub mod generation;
pub mod record;
mod worker;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::Durability;
use crate::error::Result;
use crate::ids::ShardId;

pub use generation::TranslogGeneration;
pub use record::{Operation, TranslogLocation, TranslogOp, VersionType};
pub use worker::TranslogStatsSnapshot;
use worker::TranslogWorkerHandle;

fn generate_uuid() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos()).unwrap_or(0);
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{:x}-{:x}", nanos, seq)
}

/// Append-only per-shard operation log.
pub struct Translog {
    shard: ShardId,
    dir: PathBuf,
    uuid: String,
    worker: TranslogWorkerHandle,
    generation_threshold_bytes: u64,
}

impl Translog {
    /// Create a fresh translog (new shard, `EmptyStore` recovery).
    pub fn create(shard: ShardId, dir: PathBuf, durability: Durability, async_fsync_interval: std::time::Duration, generation_threshold_bytes: u64) -> Result<Self> {
        fs::create_dir_all(&dir)?;
        let uuid = generate_uuid();
        let worker = TranslogWorkerHandle::new(shard.clone(), dir.clone(), 1, durability, async_fsync_interval)?;
        let translog = Self { shard, dir, uuid, worker, generation_threshold_bytes };
        translog.write_uuid_marker()?;
        Ok(translog)
    }

    /// Re-open an existing translog directory, continuing from the highest
    /// generation found on disk.
    pub fn open(shard: ShardId, dir: PathBuf, durability: Durability, async_fsync_interval: std::time::Duration, generation_threshold_bytes: u64) -> Result<Self> {
        let uuid = Self::read_uuid_marker(&dir)?.unwrap_or_else(generate_uuid);
        let current_generation = Self::highest_generation_on_disk(&dir)?.unwrap_or(1);
        let worker = TranslogWorkerHandle::new(shard.clone(), dir.clone(), current_generation, durability, async_fsync_interval)?;
        let translog = Self { shard, dir, uuid, worker, generation_threshold_bytes };
        translog.write_uuid_marker()?;
        Ok(translog)
    }

    fn uuid_marker_path(dir: &Path) -> PathBuf {
        dir.join("translog.uuid")
    }

    /// `true` iff `dir` holds an already-initialized translog (the uuid
    /// marker written by `create`/`open`). `ExistingStore` recovery uses
    /// this to distinguish "nothing was ever written here" from "reopening
    /// a translog that genuinely exists".
    pub fn exists(dir: &Path) -> bool {
        Self::uuid_marker_path(dir).exists()
    }

    fn write_uuid_marker(&self) -> Result<()> {
        let path = Self::uuid_marker_path(&self.dir);
        if !path.exists() {
            fs::write(&path, &self.uuid)?;
        }
        Ok(())
    }

    fn read_uuid_marker(dir: &Path) -> Result<Option<String>> {
        let path = Self::uuid_marker_path(dir);
        if path.exists() {
            Ok(Some(fs::read_to_string(path)?))
        } else {
            Ok(None)
        }
    }

    fn highest_generation_on_disk(dir: &Path) -> Result<Option<i64>> {
        if !dir.exists() {
            return Ok(None);
        }
        let mut max_gen = None;
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(rest) = name.strip_prefix("translog-").and_then(|s| s.strip_suffix(".tlog")) {
                if let Ok(gen) = rest.parse::<i64>() {
                    max_gen = Some(max_gen.map_or(gen, |m: i64| m.max(gen)));
                }
            }
        }
        Ok(max_gen)
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Synchronously writes bytes into the current generation; atomic
    /// w.r.t. crash up to the next `sync()`.
    pub fn append(&self, op: TranslogOp) -> Result<TranslogLocation> {
        self.worker.append(op)
    }

    /// Returns `true` iff a durable fsync occurred at or beyond `loc` as
    /// part of this call (idempotent: already-synced returns `false`).
    pub fn ensure_synced(&self, loc: TranslogLocation) -> Result<bool> {
        self.worker.ensure_synced(loc)
    }

    /// Closes the current generation with a footer and opens a new one.
    /// Returns the new (incremented) generation number.
    pub fn roll_generation(&self) -> Result<i64> {
        self.worker.roll_generation()
    }

    /// Deletes generations strictly below `min_generation_to_retain`.
    pub fn trim_unreferenced_readers(&self, min_generation_to_retain: i64) -> Result<()> {
        self.worker.trim_unreferenced_readers(min_generation_to_retain)
    }

    pub fn stats(&self) -> TranslogStatsSnapshot {
        self.worker.stats()
    }

    /// Switches the durability mode applied to subsequent appends (spec §8
    /// scenario 1: toggling `REQUEST`/`ASYNC` on a live shard changes
    /// whether indexing syncs inline).
    pub fn set_durability(&self, durability: Durability) -> Result<()> {
        self.worker.set_durability(durability)
    }

    pub fn current_file_generation(&self) -> i64 {
        self.stats().generation
    }

    /// `true` once `current-generation-size > generation_threshold_bytes`.
    pub fn should_roll_translog_generation(&self) -> bool {
        self.stats().uncommitted_size_bytes as u64 > self.generation_threshold_bytes
    }

    /// Finite forward iterator over every retained op across generations,
    /// from `min_generation` (inclusive) through the current generation.
    pub fn snapshot(&self, min_generation: i64) -> Result<Vec<(TranslogLocation, TranslogOp)>> {
        let current = self.current_file_generation();
        let mut ops = Vec::new();
        for generation in min_generation..=current {
            ops.extend(TranslogGeneration::read_ops(&self.shard, &self.dir, generation)?);
        }
        Ok(ops)
    }
}
