//! Combined retention policy: safe-commit selection, commit/translog
//! generation retention, and pinning (spec §4.4, §8 scenario 4).
//!
//! No direct teacher analog exists for commit bookkeeping (the teacher has
//! no on-disk commit concept at all); this is built in the teacher's
//! `RwLock<HashMap<..>>` idiom from `engines/granite/manager.rs`, where
//! shared mutable catalog-like state is guarded by a single `RwLock` rather
//! than fine-grained locking per entry.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::engine::Commit;
use crate::error::{Result, ShardError};
use crate::ids::ShardId;

struct RetentionState {
    commits: Vec<Commit>,
    pinned_generations: HashMap<u64, u32>,
    current_translog_uuid: String,
}

/// Tracks every commit produced by the engine plus pins held by snapshots,
/// and decides which are safe to delete.
pub struct CombinedRetentionPolicy {
    shard: ShardId,
    state: RwLock<RetentionState>,
}

impl CombinedRetentionPolicy {
    pub fn new(shard: ShardId, translog_uuid: String) -> Self {
        Self {
            shard,
            state: RwLock::new(RetentionState {
                commits: Vec::new(),
                pinned_generations: HashMap::new(),
                current_translog_uuid: translog_uuid,
            }),
        }
    }

    /// Record a freshly produced commit, replacing the stale-translog-uuid
    /// bookkeeping is not needed here since a fresh commit always carries
    /// the current uuid.
    pub fn on_new_commit(&self, commit: Commit) {
        let mut state = self.state.write().expect("retention policy lock poisoned");
        state.commits.push(commit);
    }

    /// The commit a recovery or peer-recovery driver should start from: the
    /// youngest commit whose `max_seq_no <= global_checkpoint`. If none
    /// qualifies, the oldest known commit (spec §4.4 "otherwise the
    /// oldest"). Ties broken by higher translog generation.
    ///
    /// A legacy commit (`Commit::is_legacy`, predating sequence numbers) is
    /// excluded from consideration once any other commit exists — spec §9:
    /// it becomes permanently unsafe the moment a newer commit is taken. A
    /// shard with nothing but a single legacy commit still uses it, since
    /// there is nothing newer to prefer.
    pub fn safe_commit(&self, global_checkpoint: i64) -> Option<Commit> {
        let state = self.state.read().expect("retention policy lock poisoned");
        if state.commits.is_empty() {
            return None;
        }
        let supersede_legacy = state.commits.len() > 1;
        let candidates: Vec<&Commit> = state.commits.iter().filter(|c| !supersede_legacy || !c.is_legacy()).collect();
        if candidates.is_empty() {
            return None;
        }
        let mut eligible: Vec<&Commit> =
            candidates.iter().copied().filter(|c| c.user_data.max_seq_no <= global_checkpoint).collect();
        if eligible.is_empty() {
            let oldest = candidates
                .iter()
                .min_by_key(|c| (c.user_data.max_seq_no, std::cmp::Reverse(c.user_data.translog_generation)))
                .map(|c| (*c).clone());
            return oldest;
        }
        eligible.sort_by_key(|c| (c.user_data.max_seq_no, c.user_data.translog_generation));
        eligible.last().map(|c| (*c).clone())
    }

    /// Pin a commit (e.g. for a snapshot in progress) so it survives
    /// deletion regardless of `safe_commit`. Reference-counted: multiple
    /// pins on the same generation require matching releases.
    pub fn pin(&self, commit: &Commit) {
        let mut state = self.state.write().expect("retention policy lock poisoned");
        *state.pinned_generations.entry(commit.generation).or_insert(0) += 1;
    }

    /// Releases one pin. Returns `true` if the commit has no pins left.
    pub fn release(&self, commit: &Commit) -> bool {
        let mut state = self.state.write().expect("retention policy lock poisoned");
        match state.pinned_generations.get_mut(&commit.generation) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                state.pinned_generations.remove(&commit.generation);
                true
            }
            None => true,
        }
    }

    fn is_pinned(state: &RetentionState, commit: &Commit) -> bool {
        state.pinned_generations.contains_key(&commit.generation)
    }

    /// Commits that may be deleted: older than the safe commit and unpinned,
    /// carrying a stale translog uuid, or a legacy commit superseded by any
    /// newer one — all deleted unconditionally regardless of pin count
    /// except the pin check itself (spec §4.4: a commit from a previous
    /// translog incarnation, or a legacy pre-sequence-number commit once
    /// superseded, can never be recovered from again).
    pub fn deletable_commits(&self, global_checkpoint: i64) -> Vec<Commit> {
        let state = self.state.read().expect("retention policy lock poisoned");
        let safe = self.safe_commit(global_checkpoint);
        let supersede_legacy = state.commits.len() > 1;
        state
            .commits
            .iter()
            .filter(|c| {
                if Self::is_pinned(&state, c) {
                    return false;
                }
                if c.user_data.translog_uuid != state.current_translog_uuid {
                    return true;
                }
                if supersede_legacy && c.is_legacy() {
                    return true;
                }
                match &safe {
                    Some(safe_commit) => {
                        *c != *safe_commit
                            && (c.user_data.max_seq_no, c.user_data.translog_generation)
                                < (safe_commit.user_data.max_seq_no, safe_commit.user_data.translog_generation)
                    }
                    None => false,
                }
            })
            .cloned()
            .collect()
    }

    /// Removes deletable commits from the in-memory ledger. Callers are
    /// responsible for deleting the underlying files first.
    pub fn prune(&self, global_checkpoint: i64) -> Result<Vec<Commit>> {
        let deletable = self.deletable_commits(global_checkpoint);
        if deletable.is_empty() {
            return Ok(Vec::new());
        }
        let mut state = self.state.write().expect("retention policy lock poisoned");
        state.commits.retain(|c| !deletable.contains(c));
        Ok(deletable)
    }

    pub fn has_unreferenced_commits(&self, global_checkpoint: i64) -> bool {
        !self.deletable_commits(global_checkpoint).is_empty()
    }

    /// The lowest translog generation that must be retained for recovery:
    /// the generation of the safe commit, or the oldest known commit if no
    /// commit exists yet (a freshly created shard keeps generation 1).
    pub fn min_translog_generation_for_recovery(&self, global_checkpoint: i64) -> i64 {
        self.safe_commit(global_checkpoint).map_or(1, |c| c.user_data.translog_generation)
    }

    pub fn translog_generation_of_last_commit(&self) -> i64 {
        let state = self.state.read().expect("retention policy lock poisoned");
        state
            .commits
            .iter()
            .max_by_key(|c| c.user_data.max_seq_no)
            .map_or(1, |c| c.user_data.translog_generation)
    }

    /// Called when the translog is recreated (e.g. after a primary
    /// promotion that rolls a new uuid); every commit referencing the old
    /// uuid becomes unconditionally deletable.
    pub fn on_translog_uuid_changed(&self, new_uuid: String) {
        let mut state = self.state.write().expect("retention policy lock poisoned");
        state.current_translog_uuid = new_uuid;
    }

    pub fn assert_has_any_commit(&self) -> Result<()> {
        let state = self.state.read().expect("retention policy lock poisoned");
        if state.commits.is_empty() {
            return Err(ShardError::IllegalShardState {
                shard: self.shard.clone(),
                reason: "no commit has ever been produced".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::CommitUserData;

    fn shard_id() -> ShardId {
        ShardId::new("orders", "uuid-1", 0)
    }

    fn commit(generation: u64, max_seq_no: i64, translog_generation: i64, uuid: &str) -> Commit {
        Commit {
            generation,
            user_data: CommitUserData {
                max_seq_no,
                local_checkpoint: max_seq_no,
                translog_uuid: uuid.to_string(),
                translog_generation,
            },
        }
    }

    /// Spec §8 scenario 4: C1..C5 at MAX_SEQ_NO 10/20/30/40/50, GCP=35 -> the
    /// youngest commit with max_seq_no <= 35 is C3 (max_seq_no=30).
    #[test]
    fn safe_commit_is_youngest_at_or_below_global_checkpoint() {
        let policy = CombinedRetentionPolicy::new(shard_id(), "u1".to_string());
        for (gen, max_seq) in [(1, 10), (2, 20), (3, 30), (4, 40), (5, 50)] {
            policy.on_new_commit(commit(gen, max_seq, gen as i64, "u1"));
        }
        let safe = policy.safe_commit(35).unwrap();
        assert_eq!(safe.user_data.max_seq_no, 30);
    }

    #[test]
    fn safe_commit_falls_back_to_oldest_when_none_qualify() {
        let policy = CombinedRetentionPolicy::new(shard_id(), "u1".to_string());
        policy.on_new_commit(commit(1, 10, 1, "u1"));
        policy.on_new_commit(commit(2, 20, 2, "u1"));
        let safe = policy.safe_commit(-1).unwrap();
        assert_eq!(safe.user_data.max_seq_no, 10);
    }

    #[test]
    fn pinned_commits_are_never_deletable() {
        let policy = CombinedRetentionPolicy::new(shard_id(), "u1".to_string());
        for (gen, max_seq) in [(1, 10), (2, 20), (3, 30), (4, 40), (5, 50)] {
            policy.on_new_commit(commit(gen, max_seq, gen as i64, "u1"));
        }
        let c2 = commit(2, 20, 2, "u1");
        policy.pin(&c2);
        let deletable = policy.deletable_commits(35);
        assert!(!deletable.contains(&c2));
    }

    #[test]
    fn stale_translog_uuid_commits_are_unconditionally_deletable() {
        let policy = CombinedRetentionPolicy::new(shard_id(), "u2".to_string());
        policy.on_new_commit(commit(1, 10, 1, "u1"));
        let deletable = policy.deletable_commits(100);
        assert_eq!(deletable.len(), 1);
    }

    #[test]
    fn release_reports_whether_fully_unpinned() {
        let policy = CombinedRetentionPolicy::new(shard_id(), "u1".to_string());
        let c1 = commit(1, 10, 1, "u1");
        policy.on_new_commit(c1.clone());
        policy.pin(&c1);
        policy.pin(&c1);
        assert!(!policy.release(&c1));
        assert!(policy.release(&c1));
    }

    #[test]
    fn legacy_commit_is_superseded_once_a_newer_commit_exists() {
        let policy = CombinedRetentionPolicy::new(shard_id(), "u1".to_string());
        policy.on_new_commit(commit(1, crate::ids::UNASSIGNED_SEQ_NO, 1, "u1"));
        // Only a legacy commit exists: it's still the safe commit and not
        // deletable, since there's nothing newer.
        assert!(policy.safe_commit(100).unwrap().is_legacy());
        assert!(policy.deletable_commits(100).is_empty());

        policy.on_new_commit(commit(2, 10, 2, "u1"));
        let safe = policy.safe_commit(100).unwrap();
        assert!(!safe.is_legacy());
        assert_eq!(safe.user_data.max_seq_no, 10);
        let deletable = policy.deletable_commits(100);
        assert_eq!(deletable.len(), 1);
        assert!(deletable[0].is_legacy());
    }

    #[test]
    fn deletable_commits_breaks_ties_on_translog_generation() {
        let policy = CombinedRetentionPolicy::new(shard_id(), "u1".to_string());
        // Two commits share max_seq_no=20 but differ in translog generation;
        // the older-generation one is superseded even though its
        // max_seq_no isn't strictly less than the safe commit's.
        policy.on_new_commit(commit(1, 20, 1, "u1"));
        policy.on_new_commit(commit(2, 20, 2, "u1"));
        let safe = policy.safe_commit(100).unwrap();
        assert_eq!(safe.user_data.translog_generation, 2);
        let deletable = policy.deletable_commits(100);
        assert_eq!(deletable.len(), 1);
        assert_eq!(deletable[0].user_data.translog_generation, 1);
    }

    #[test]
    fn min_translog_generation_for_recovery_tracks_safe_commit() {
        let policy = CombinedRetentionPolicy::new(shard_id(), "u1".to_string());
        policy.on_new_commit(commit(1, 10, 1, "u1"));
        policy.on_new_commit(commit(2, 20, 2, "u1"));
        policy.on_new_commit(commit(3, 30, 3, "u1"));
        assert_eq!(policy.min_translog_generation_for_recovery(25), 2);
    }
}
