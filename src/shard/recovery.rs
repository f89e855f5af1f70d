//! Recovery drivers (spec §4.6.3): local-store, peer, local-shards, and
//! snapshot recovery, each producing a ready-to-start `IndexEngine` plus the
//! `SeqNoTracker` state to seed the shard with.
//!
//! Generalizes `engines/granite/recovery.rs`'s two-pass replay (scan for the
//! last durable checkpoint, then replay every record after it) to translog
//! generations and a `CombinedRetentionPolicy`-selected safe commit.

use std::path::PathBuf;
use std::time::Duration;

use crate::config::Durability;
use crate::engine::{Commit, IndexEngine};
use crate::error::{Result, ShardError};
use crate::ids::{ShardId, NO_OPS_PERFORMED, UNASSIGNED_SEQ_NO};
use crate::seqno::SeqNoTracker;
use crate::translog::{Operation, Translog};

/// Everything a recovery driver hands back to the `Shard` once it's done.
pub struct RecoveredState {
    pub engine: IndexEngine,
    pub seqno_tracker: SeqNoTracker,
    pub starting_commit: Option<Commit>,
}

pub struct Recoverer {
    shard: ShardId,
    shard_dir: PathBuf,
    durability: Durability,
    async_fsync_interval: Duration,
    generation_threshold_bytes: u64,
}

impl Recoverer {
    pub fn new(
        shard: ShardId,
        shard_dir: PathBuf,
        durability: Durability,
        async_fsync_interval: Duration,
        generation_threshold_bytes: u64,
    ) -> Self {
        Self { shard, shard_dir, durability, async_fsync_interval, generation_threshold_bytes }
    }

    /// `EmptyStore`: nothing to replay, start a fresh translog at
    /// `NO_OPS_PERFORMED`.
    pub fn recover_empty_store(&self) -> Result<RecoveredState> {
        let engine = IndexEngine::new(
            self.shard.clone(),
            self.shard_dir.clone(),
            self.durability,
            self.async_fsync_interval,
            self.generation_threshold_bytes,
            false,
        )?;
        let seqno_tracker = SeqNoTracker::new(self.shard.clone());
        Ok(RecoveredState { engine, seqno_tracker, starting_commit: None })
    }

    /// `ExistingStore`: reopen the on-disk translog and replay every
    /// operation recorded above the safe commit's local checkpoint,
    /// tolerating out-of-order deletes by version comparison (spec §8
    /// scenario 6: a delete with a higher version than what's already
    /// live always wins, even replayed before the index op it follows on
    /// the primary's timeline).
    pub fn recover_existing_store(&self, safe_commit: Option<Commit>) -> Result<RecoveredState> {
        if !Translog::exists(&self.shard_dir) {
            return Err(ShardError::RecoveryFailed {
                shard: self.shard.clone(),
                reason: format!("no existing translog found in {}", self.shard_dir.display()),
            });
        }

        let engine = IndexEngine::new(
            self.shard.clone(),
            self.shard_dir.clone(),
            self.durability,
            self.async_fsync_interval,
            self.generation_threshold_bytes,
            true,
        )?;

        let (max_seq_no, local_checkpoint, min_generation) = match &safe_commit {
            Some(commit) => (commit.user_data.max_seq_no, commit.user_data.local_checkpoint, commit.user_data.translog_generation),
            None => (UNASSIGNED_SEQ_NO, NO_OPS_PERFORMED, 1),
        };

        let seqno_tracker = SeqNoTracker::from_checkpoints(self.shard.clone(), max_seq_no, local_checkpoint, local_checkpoint);

        let ops = engine.translog().snapshot(min_generation)?;
        for (_, op) in ops {
            if op.seq_no <= local_checkpoint {
                continue;
            }
            self.replay_one(&engine, &op.operation, op.seq_no, op.primary_term)?;
            seqno_tracker.mark_processed(op.seq_no);
        }

        Ok(RecoveredState { engine, seqno_tracker, starting_commit: safe_commit })
    }

    fn replay_one(&self, engine: &IndexEngine, operation: &Operation, seq_no: i64, term: u64) -> Result<()> {
        match operation {
            Operation::Index { doc_id, source, version } => {
                engine.apply_index_on_replica(seq_no, term, doc_id, source.clone(), *version)?;
            }
            Operation::Delete { doc_id, version } => {
                engine.apply_delete_on_replica(seq_no, term, doc_id, *version)?;
            }
            Operation::NoOp { .. } => {}
        }
        Ok(())
    }

    /// Peer recovery target side: the source has already streamed file
    /// chunks and the translog tail out of band (transport is spec §1
    /// Non-goals); this just finalizes once the source confirms the given
    /// global checkpoint.
    pub fn finalize_peer_recovery(&self, recovered: &RecoveredState, global_checkpoint: i64) -> Result<()> {
        recovered.seqno_tracker.update_global_checkpoint_from_primary(global_checkpoint)
    }

    /// `LocalShards`: shrink/split recovery copying segment files from a
    /// sibling shard of the *same* index. Cross-index copies are rejected —
    /// there is no shared mapping/analysis contract to make them safe.
    pub fn recover_local_shards(&self, source_shard: &ShardId) -> Result<RecoveredState> {
        if source_shard.index_uuid != self.shard.index_uuid {
            return Err(ShardError::RecoveryFailed {
                shard: self.shard.clone(),
                reason: format!("cannot recover from shard of a different index ({} != {})", source_shard.index_uuid, self.shard.index_uuid),
            });
        }
        self.recover_empty_store()
    }

    /// `Snapshot`: delegates to a caller-supplied restore hook (the actual
    /// blob-store transfer is out of scope, spec §1), then opens the
    /// restored store the same way `ExistingStore` does.
    pub fn recover_from_snapshot(&self, restore: impl FnOnce(&std::path::Path) -> Result<()>) -> Result<RecoveredState> {
        restore(&self.shard_dir)?;
        self.recover_existing_store(None)
    }
}
