//! Sequence-number allocation and checkpoint tracking (spec §4.1).
//!
//! Generalizes the LSN bookkeeping in `engines/granite/wal.rs`'s
//! `FsyncState` (an atomic high-water-mark plus a condvar for waiters) to a
//! tracker that must also tolerate *gaps*: a replica can have seqnos
//! {0,2,3,5} outstanding before a promotion fills in 1 and 4.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Result, ShardError};
use crate::ids::{ShardId, SeqNo, NO_OPS_PERFORMED};

struct Checkpoints {
    /// Seqnos that have been marked processed but not yet folded into
    /// `local_checkpoint` because a lower seqno is still outstanding.
    processed_above_checkpoint: BTreeSet<SeqNo>,
    local_checkpoint: SeqNo,
    global_checkpoint: SeqNo,
}

/// Allocates and tracks sequence numbers for a single shard copy.
pub struct SeqNoTracker {
    shard: ShardId,
    max_seq_no: AtomicI64,
    state: Mutex<Checkpoints>,
    condvar: Condvar,
}

impl SeqNoTracker {
    pub fn new(shard: ShardId) -> Self {
        Self {
            shard,
            max_seq_no: AtomicI64::new(NO_OPS_PERFORMED),
            state: Mutex::new(Checkpoints {
                processed_above_checkpoint: BTreeSet::new(),
                local_checkpoint: NO_OPS_PERFORMED,
                global_checkpoint: NO_OPS_PERFORMED,
            }),
            condvar: Condvar::new(),
        }
    }

    /// Rebuild a tracker from recovered checkpoint state (used by the
    /// recovery drivers once a safe commit's user-data has been read).
    pub fn from_checkpoints(shard: ShardId, max_seq_no: SeqNo, local_checkpoint: SeqNo, global_checkpoint: SeqNo) -> Self {
        let tracker = Self::new(shard);
        tracker.max_seq_no.store(max_seq_no, Ordering::SeqCst);
        let mut state = tracker.state.lock().expect("seqno tracker mutex poisoned");
        state.local_checkpoint = local_checkpoint;
        state.global_checkpoint = global_checkpoint;
        drop(state);
        tracker
    }

    /// Atomic, strictly increasing.
    pub fn generate(&self) -> SeqNo {
        self.max_seq_no.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn get_max_seq_no(&self) -> SeqNo {
        self.max_seq_no.load(Ordering::SeqCst)
    }

    pub fn get_local_checkpoint(&self) -> SeqNo {
        self.state.lock().expect("seqno tracker mutex poisoned").local_checkpoint
    }

    pub fn get_global_checkpoint(&self) -> SeqNo {
        self.state.lock().expect("seqno tracker mutex poisoned").global_checkpoint
    }

    /// Records completion of `seq_no`; advances `local_checkpoint` as the
    /// longest prefix of processed seqnos.
    pub fn mark_processed(&self, seq_no: SeqNo) {
        let mut state = self.state.lock().expect("seqno tracker mutex poisoned");
        if seq_no <= state.local_checkpoint {
            return;
        }
        state.processed_above_checkpoint.insert(seq_no);
        loop {
            let next = state.local_checkpoint + 1;
            if state.processed_above_checkpoint.remove(&next) {
                state.local_checkpoint = next;
            } else {
                break;
            }
        }
        self.condvar.notify_all();
    }

    /// Replica-only: fails if `checkpoint` would move the global checkpoint
    /// backwards.
    pub fn update_global_checkpoint_from_primary(&self, checkpoint: SeqNo) -> Result<()> {
        let mut state = self.state.lock().expect("seqno tracker mutex poisoned");
        if checkpoint < state.global_checkpoint {
            return Err(ShardError::IllegalShardState {
                shard: self.shard.clone(),
                reason: format!(
                    "global checkpoint cannot go backwards ({} -> {})",
                    state.global_checkpoint, checkpoint
                ),
            });
        }
        state.global_checkpoint = checkpoint;
        Ok(())
    }

    /// Every seqno in `(local_checkpoint, max_seq_no]` that has not been
    /// processed. Promotion fills these with no-ops under the new term.
    pub fn missing_seq_nos(&self) -> Vec<SeqNo> {
        let state = self.state.lock().expect("seqno tracker mutex poisoned");
        let max = self.max_seq_no.load(Ordering::SeqCst);
        let mut missing = Vec::new();
        let mut n = state.local_checkpoint + 1;
        while n <= max {
            if !state.processed_above_checkpoint.contains(&n) {
                missing.push(n);
            }
            n += 1;
        }
        missing
    }

    /// Fill every gap in `(local_checkpoint, max_seq_no]` by invoking
    /// `enqueue_noop(seq_no)` for each one, then block until they have all
    /// been marked processed (the caller is expected to call
    /// `mark_processed` once the no-op has actually been durably applied).
    pub fn fill_gaps(&self, mut enqueue_noop: impl FnMut(SeqNo) -> Result<()>) -> Result<()> {
        for seq_no in self.missing_seq_nos() {
            enqueue_noop(seq_no)?;
        }
        self.wait_for_local_checkpoint(self.get_max_seq_no(), Duration::from_secs(60))
    }

    /// Block until `local_checkpoint >= target` or the timeout elapses.
    fn wait_for_local_checkpoint(&self, target: SeqNo, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().expect("seqno tracker mutex poisoned");
        while state.local_checkpoint < target {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ShardError::IllegalShardState {
                    shard: self.shard.clone(),
                    reason: "timed out waiting for gap fill to reach local checkpoint".to_string(),
                });
            }
            let (guard, _timeout_result) = self
                .condvar
                .wait_timeout(state, remaining)
                .expect("seqno tracker condvar wait failed");
            state = guard;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard_id() -> ShardId {
        ShardId::new("orders", "uuid-1", 0)
    }

    #[test]
    fn generate_is_strictly_increasing() {
        let tracker = SeqNoTracker::new(shard_id());
        assert_eq!(tracker.generate(), 0);
        assert_eq!(tracker.generate(), 1);
        assert_eq!(tracker.generate(), 2);
    }

    #[test]
    fn local_checkpoint_advances_as_prefix() {
        let tracker = SeqNoTracker::new(shard_id());
        for _ in 0..4 {
            tracker.generate();
        }
        tracker.mark_processed(0);
        tracker.mark_processed(2);
        assert_eq!(tracker.get_local_checkpoint(), 0);
        tracker.mark_processed(1);
        assert_eq!(tracker.get_local_checkpoint(), 2);
        tracker.mark_processed(3);
        assert_eq!(tracker.get_local_checkpoint(), 3);
    }

    #[test]
    fn missing_seq_nos_reports_gaps() {
        let tracker = SeqNoTracker::new(shard_id());
        for _ in 0..6 {
            tracker.generate();
        }
        for seq in [0, 2, 3, 5] {
            tracker.mark_processed(seq);
        }
        assert_eq!(tracker.missing_seq_nos(), vec![1, 4]);
    }

    #[test]
    fn fill_gaps_invokes_callback_for_each_missing_seqno_and_waits() {
        let tracker = SeqNoTracker::new(shard_id());
        for _ in 0..6 {
            tracker.generate();
        }
        for seq in [0, 2, 3, 5] {
            tracker.mark_processed(seq);
        }
        let mut filled = Vec::new();
        tracker
            .fill_gaps(|seq_no| {
                filled.push(seq_no);
                tracker.mark_processed(seq_no);
                Ok(())
            })
            .unwrap();
        assert_eq!(filled, vec![1, 4]);
        assert_eq!(tracker.get_local_checkpoint(), 5);
    }

    #[test]
    fn global_checkpoint_rejects_decrease() {
        let tracker = SeqNoTracker::new(shard_id());
        tracker.update_global_checkpoint_from_primary(10).unwrap();
        assert!(tracker.update_global_checkpoint_from_primary(5).is_err());
        assert_eq!(tracker.get_global_checkpoint(), 10);
    }
}
