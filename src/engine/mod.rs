//! Wraps the underlying segment store: accepts index/delete/noop, produces
//! commits (spec §4.3). The real inverted-index file format and query
//! evaluator are out of scope (spec §1) — `live docs` below is a minimal
//! in-memory stand-in, the same role `StorageEngine`'s `HashMap<u64, Row>`
//! plays for a real storage engine in the teacher repo.

pub mod commit;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::config::Durability;
use crate::error::{Result, ShardError};
use crate::ids::{PrimaryTerm, SeqNo, ShardId};
use crate::translog::{Operation, Translog, TranslogLocation, TranslogOp};

pub use commit::{Commit, CommitUserData};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexResult {
    pub seq_no: SeqNo,
    pub term: PrimaryTerm,
    pub version: u64,
    pub created: bool,
    /// Where this op landed in the translog, or `None` for a replica op
    /// that turned out to be stale/duplicate and was never appended.
    pub location: Option<TranslogLocation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteResult {
    pub seq_no: SeqNo,
    pub term: PrimaryTerm,
    pub found: bool,
    pub location: Option<TranslogLocation>,
}

#[derive(Debug, Clone)]
struct LiveDoc {
    seq_no: SeqNo,
    version: u64,
    source: Vec<u8>,
    deleted: bool,
}

/// Shared, process-wide circuit breaker tracking cumulative segment memory
/// pinned by open searchers (spec §5 Accounting). Reference-counted per
/// shard the way the design notes describe; a fresh one per engine is fine
/// for this crate since there is no process-wide registry to share it
/// through.
#[derive(Default)]
pub struct AccountingBreaker {
    used: AtomicUsize,
}

impl AccountingBreaker {
    pub fn used(&self) -> usize {
        self.used.load(Ordering::SeqCst)
    }

    fn reserve(&self, bytes: usize) {
        self.used.fetch_add(bytes, Ordering::SeqCst);
    }

    fn release(&self, bytes: usize) {
        self.used.fetch_sub(bytes, Ordering::SeqCst);
    }
}

/// A pinned, immutable view over the engine's documents at the moment it
/// was acquired. Must be released (dropped) for the accounting breaker to
/// decrement — spec §5: "releasing them is required for the accounting
/// breaker to decrement."
pub struct Searcher {
    pub scope: String,
    docs: HashMap<String, (Vec<u8>, u64)>,
    memory_bytes: usize,
    breaker: Arc<AccountingBreaker>,
}

impl Searcher {
    pub fn get(&self, doc_id: &str) -> Option<&(Vec<u8>, u64)> {
        self.docs.get(doc_id)
    }

    pub fn doc_count(&self) -> usize {
        self.docs.len()
    }
}

impl Drop for Searcher {
    fn drop(&mut self) {
        self.breaker.release(self.memory_bytes);
    }
}

pub struct IndexEngine {
    shard: ShardId,
    translog: Translog,
    live_docs: RwLock<HashMap<String, LiveDoc>>,
    commits: Mutex<Vec<Commit>>,
    commit_generation: AtomicU64,
    breaker: Arc<AccountingBreaker>,
    uncommitted_since_flush: AtomicU64,
    closed: std::sync::atomic::AtomicBool,
}

impl IndexEngine {
    pub fn new(
        shard: ShardId,
        translog_dir: std::path::PathBuf,
        durability: Durability,
        async_fsync_interval: std::time::Duration,
        generation_threshold_bytes: u64,
        restore_existing: bool,
    ) -> Result<Self> {
        let translog = if restore_existing {
            Translog::open(shard.clone(), translog_dir, durability, async_fsync_interval, generation_threshold_bytes)?
        } else {
            Translog::create(shard.clone(), translog_dir, durability, async_fsync_interval, generation_threshold_bytes)?
        };
        Ok(Self {
            shard,
            translog,
            live_docs: RwLock::new(HashMap::new()),
            commits: Mutex::new(Vec::new()),
            commit_generation: AtomicU64::new(0),
            breaker: Arc::new(AccountingBreaker::default()),
            uncommitted_since_flush: AtomicU64::new(0),
            closed: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub fn translog(&self) -> &Translog {
        &self.translog
    }

    pub fn breaker(&self) -> Arc<AccountingBreaker> {
        Arc::clone(&self.breaker)
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ShardError::EngineClosed { shard: self.shard.clone() });
        }
        Ok(())
    }

    /// Primary indexing: seqno/term are allocated by the caller (the
    /// `Shard`, per spec §4.6.2 step 2) and passed in here.
    pub fn apply_index_on_primary(
        &self,
        seq_no: SeqNo,
        term: PrimaryTerm,
        doc_id: &str,
        source: Vec<u8>,
        version: u64,
    ) -> Result<IndexResult> {
        self.check_open()?;
        let loc = self.translog.append(TranslogOp {
            seq_no,
            primary_term: term,
            operation: Operation::Index { doc_id: doc_id.to_string(), source: source.clone(), version },
        })?;
        let created = self.apply_to_live_docs(doc_id, seq_no, version, source, false);
        self.uncommitted_since_flush.fetch_add(1, Ordering::Relaxed);
        Ok(IndexResult { seq_no, term, version, created, location: Some(loc) })
    }

    /// Replica indexing: seqno/term supplied; duplicate or stale ops are
    /// silently ignored.
    pub fn apply_index_on_replica(
        &self,
        seq_no: SeqNo,
        term: PrimaryTerm,
        doc_id: &str,
        source: Vec<u8>,
        version: u64,
    ) -> Result<IndexResult> {
        self.check_open()?;
        if self.is_stale_or_duplicate(doc_id, seq_no) {
            return Ok(IndexResult { seq_no, term, version, created: false, location: None });
        }
        let loc = self.translog.append(TranslogOp {
            seq_no,
            primary_term: term,
            operation: Operation::Index { doc_id: doc_id.to_string(), source: source.clone(), version },
        })?;
        let created = self.apply_to_live_docs(doc_id, seq_no, version, source, false);
        self.uncommitted_since_flush.fetch_add(1, Ordering::Relaxed);
        Ok(IndexResult { seq_no, term, version, created, location: Some(loc) })
    }

    pub fn apply_delete_on_primary(&self, seq_no: SeqNo, term: PrimaryTerm, doc_id: &str, version: u64) -> Result<DeleteResult> {
        self.check_open()?;
        let loc = self.translog.append(TranslogOp {
            seq_no,
            primary_term: term,
            operation: Operation::Delete { doc_id: doc_id.to_string(), version },
        })?;
        let found = self.apply_to_live_docs(doc_id, seq_no, version, Vec::new(), true);
        self.uncommitted_since_flush.fetch_add(1, Ordering::Relaxed);
        Ok(DeleteResult { seq_no, term, found, location: Some(loc) })
    }

    pub fn apply_delete_on_replica(&self, seq_no: SeqNo, term: PrimaryTerm, doc_id: &str, version: u64) -> Result<DeleteResult> {
        self.check_open()?;
        if self.is_stale_or_duplicate(doc_id, seq_no) {
            return Ok(DeleteResult { seq_no, term, found: false, location: None });
        }
        let loc = self.translog.append(TranslogOp {
            seq_no,
            primary_term: term,
            operation: Operation::Delete { doc_id: doc_id.to_string(), version },
        })?;
        let found = self.apply_to_live_docs(doc_id, seq_no, version, Vec::new(), true);
        self.uncommitted_since_flush.fetch_add(1, Ordering::Relaxed);
        Ok(DeleteResult { seq_no, term, found, location: Some(loc) })
    }

    pub fn mark_seq_no_as_noop(&self, seq_no: SeqNo, term: PrimaryTerm, reason: &str) -> Result<()> {
        self.check_open()?;
        self.translog.append(TranslogOp {
            seq_no,
            primary_term: term,
            operation: Operation::NoOp { reason: reason.to_string() },
        })?;
        self.uncommitted_since_flush.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Out-of-order-safe write: only applies when `seq_no`/`version` is not
    /// superseded by a higher version already recorded for this doc (spec
    /// §4.7.1 "out-of-order delete handling").
    fn apply_to_live_docs(&self, doc_id: &str, seq_no: SeqNo, version: u64, source: Vec<u8>, deleted: bool) -> bool {
        let mut docs = self.live_docs.write().expect("engine live_docs lock poisoned");
        match docs.get(doc_id) {
            Some(existing) if existing.version >= version => false,
            _ => {
                docs.insert(doc_id.to_string(), LiveDoc { seq_no, version, source, deleted });
                true
            }
        }
    }

    fn is_stale_or_duplicate(&self, doc_id: &str, seq_no: SeqNo) -> bool {
        let docs = self.live_docs.read().expect("engine live_docs lock poisoned");
        docs.get(doc_id).map_or(false, |d| d.seq_no >= seq_no)
    }

    /// Makes recent writes visible to new searchers. In this stand-in
    /// engine every write is already visible; `refresh` exists as the
    /// settling point the accounting invariant is checked against.
    pub fn refresh(&self, source: &str) -> Result<()> {
        self.check_open()?;
        log::debug!("{} engine refreshed (source: {})", self.shard, source);
        Ok(())
    }

    /// Produces a commit; a forced flush produces a commit even with no
    /// new ops, a non-forced flush with nothing uncommitted is a no-op.
    pub fn flush(&self, force: bool, max_seq_no: SeqNo, local_checkpoint: SeqNo) -> Result<Option<Commit>> {
        self.check_open()?;
        let uncommitted = self.uncommitted_since_flush.load(Ordering::SeqCst);
        if !force && uncommitted == 0 {
            return Ok(None);
        }
        let translog_generation = self.translog.current_file_generation();
        let commit = Commit {
            generation: self.commit_generation.fetch_add(1, Ordering::SeqCst) + 1,
            user_data: CommitUserData {
                max_seq_no,
                local_checkpoint,
                translog_uuid: self.translog.uuid().to_string(),
                translog_generation,
            },
        };
        self.commits.lock().expect("engine commits lock poisoned").push(commit.clone());
        self.uncommitted_since_flush.store(0, Ordering::SeqCst);
        Ok(Some(commit))
    }

    pub fn commits(&self) -> Vec<Commit> {
        self.commits.lock().expect("engine commits lock poisoned").clone()
    }

    pub fn force_merge(&self, _max_segments: u32, flush: bool, _only_expunge_deletes: bool, max_seq_no: SeqNo, local_checkpoint: SeqNo) -> Result<()> {
        self.check_open()?;
        if flush {
            self.flush(true, max_seq_no, local_checkpoint)?;
        }
        Ok(())
    }

    pub fn roll_translog_generation(&self) -> Result<i64> {
        self.translog.roll_generation()
    }

    /// Pins a reader over the documents currently visible, charging the
    /// accounting breaker for its approximate memory until released.
    pub fn acquire_searcher(&self, scope: &str) -> Result<Searcher> {
        self.check_open()?;
        let docs = self.live_docs.read().expect("engine live_docs lock poisoned");
        let mut snapshot = HashMap::new();
        let mut memory_bytes = 0usize;
        for (doc_id, live) in docs.iter() {
            if !live.deleted {
                memory_bytes += doc_id.len() + live.source.len();
                snapshot.insert(doc_id.clone(), (live.source.clone(), live.version));
            }
        }
        self.breaker.reserve(memory_bytes);
        Ok(Searcher { scope: scope.to_string(), docs: snapshot, memory_bytes, breaker: Arc::clone(&self.breaker) })
    }

    /// Releases the engine. After this, the breaker's delta returns to
    /// zero (spec §5 Accounting).
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
