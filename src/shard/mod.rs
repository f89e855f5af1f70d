//! The shard facade: ties together the engine, sequence-number tracker,
//! operation permits, and retention policy behind the state machine and
//! indexing path described in spec §4.6.
//!
//! Grounded on the teacher's `Server`/`TransactionManager` pair (the
//! request-accepting front door plus the component that actually owns
//! mutation ordering), combined into one struct the way a shard combines
//! "accept a write" and "order it safely" into a single object.

pub mod flush;
pub mod listeners;
pub mod recovery;
pub mod refresh;

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::config::ShardSettings;
use crate::engine::{Commit, DeleteResult, IndexEngine, IndexResult, Searcher};
use crate::error::{Result, ShardError};
use crate::ids::{PrimaryTerm, SeqNo, ShardId};
use crate::permits::OperationPermits;
use crate::retention::CombinedRetentionPolicy;
use crate::routing::Routing;
use crate::seqno::SeqNoTracker;

use flush::FlushCoordinator;
use listeners::{GlobalCheckpointListeners, IndexingOperationListeners};
use recovery::{RecoveredState, Recoverer};
use refresh::{RefreshScheduler, SearchIdleTracker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardLifecycleState {
    Created,
    Recovering,
    PostRecovery,
    Started,
    Closed,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ShardStats {
    pub max_seq_no: SeqNo,
    pub local_checkpoint: SeqNo,
    pub global_checkpoint: SeqNo,
    /// Every completed flush pass, periodic or forced.
    pub flush_count_total: u64,
    /// The subset of `flush_count_total` triggered by
    /// `after_write_operation`'s threshold check rather than an explicit
    /// caller-forced `Shard::flush` (spec §4.6.4 / §8 scenario 5).
    pub flush_count_periodic: u64,
    pub refresh_count: u64,
    pub active_permits: u32,
}

struct Components {
    engine: IndexEngine,
    seqno: SeqNoTracker,
    permits: OperationPermits,
    retention: CombinedRetentionPolicy,
}

/// Per-shard storage engine facade (spec §4.6 Shard).
pub struct Shard {
    id: ShardId,
    shard_dir: PathBuf,
    settings: ShardSettings,
    routing: RwLock<Routing>,
    lifecycle: RwLock<ShardLifecycleState>,
    components: RwLock<Option<Components>>,
    flush_coordinator: FlushCoordinator,
    refresh_scheduler: Arc<RefreshScheduler>,
    search_idle: Arc<SearchIdleTracker>,
    indexing_listeners: IndexingOperationListeners,
    global_checkpoint_listeners: GlobalCheckpointListeners,
}

impl Shard {
    pub fn new(id: ShardId, shard_dir: PathBuf, settings: ShardSettings, routing: Routing) -> Self {
        Self {
            id,
            shard_dir,
            settings,
            routing: RwLock::new(routing),
            lifecycle: RwLock::new(ShardLifecycleState::Created),
            components: RwLock::new(None),
            flush_coordinator: FlushCoordinator::new(),
            refresh_scheduler: Arc::new(RefreshScheduler::new()),
            search_idle: Arc::new(SearchIdleTracker::new()),
            indexing_listeners: IndexingOperationListeners::default(),
            global_checkpoint_listeners: GlobalCheckpointListeners::default(),
        }
    }

    pub fn id(&self) -> &ShardId {
        &self.id
    }

    pub fn lifecycle_state(&self) -> ShardLifecycleState {
        *self.lifecycle.read().expect("shard lifecycle lock poisoned")
    }

    pub fn routing(&self) -> Routing {
        self.routing.read().expect("shard routing lock poisoned").clone()
    }

    fn recoverer(&self) -> Recoverer {
        Recoverer::new(
            self.id.clone(),
            self.shard_dir.clone(),
            self.settings.translog_durability,
            self.settings.async_fsync_interval,
            self.settings.generation_threshold_bytes,
        )
    }

    /// CREATED -> RECOVERING -> POST_RECOVERY. Drives one of the four
    /// recovery sources based on the shard's routing.
    pub fn start_recovery(&self) -> Result<()> {
        self.transition(ShardLifecycleState::Created, ShardLifecycleState::Recovering)?;

        let routing = self.routing();
        let recoverer = self.recoverer();
        let recovered = match &routing.recovery_source {
            crate::routing::RecoverySource::EmptyStore => recoverer.recover_empty_store()?,
            crate::routing::RecoverySource::ExistingStore => {
                let safe_commit = self.read_persisted_safe_commit();
                recoverer.recover_existing_store(safe_commit)?
            }
            crate::routing::RecoverySource::Peer => recoverer.recover_existing_store(None)?,
            crate::routing::RecoverySource::LocalShards => {
                return Err(ShardError::RecoveryFailed {
                    shard: self.id.clone(),
                    reason: "local-shards recovery requires an explicit source shard id".to_string(),
                })
            }
            crate::routing::RecoverySource::Snapshot { snapshot_id } => {
                recoverer.recover_from_snapshot(|_dir| {
                    log::info!("{} restoring from snapshot {}", self.id, snapshot_id);
                    Ok(())
                })?
            }
        };

        self.install_recovered_state(recovered)?;
        self.transition(ShardLifecycleState::Recovering, ShardLifecycleState::PostRecovery)
    }

    /// Recovery source requiring a concrete sibling shard id; not reachable
    /// through `start_recovery`'s routing-driven dispatch since the source
    /// shard isn't part of `Routing`.
    pub fn start_local_shards_recovery(&self, source_shard: &ShardId) -> Result<()> {
        self.transition(ShardLifecycleState::Created, ShardLifecycleState::Recovering)?;
        let recovered = self.recoverer().recover_local_shards(source_shard)?;
        self.install_recovered_state(recovered)?;
        self.transition(ShardLifecycleState::Recovering, ShardLifecycleState::PostRecovery)
    }

    fn read_persisted_safe_commit(&self) -> Option<Commit> {
        None
    }

    fn install_recovered_state(&self, recovered: RecoveredState) -> Result<()> {
        let retention = CombinedRetentionPolicy::new(self.id.clone(), recovered.engine.translog().uuid().to_string());
        if let Some(commit) = recovered.starting_commit {
            retention.on_new_commit(commit);
        }
        let permits = OperationPermits::new(self.id.clone(), 1);
        let mut components = self.components.write().expect("shard components lock poisoned");
        *components = Some(Components { engine: recovered.engine, seqno: recovered.seqno_tracker, permits, retention });
        Ok(())
    }

    /// POST_RECOVERY -> STARTED.
    pub fn mark_as_started(&self) -> Result<()> {
        self.transition(ShardLifecycleState::PostRecovery, ShardLifecycleState::Started)
    }

    fn transition(&self, from: ShardLifecycleState, to: ShardLifecycleState) -> Result<()> {
        let mut state = self.lifecycle.write().expect("shard lifecycle lock poisoned");
        if *state != from {
            return Err(ShardError::IllegalShardState {
                shard: self.id.clone(),
                reason: format!("cannot move to {:?} from {:?} (expected {:?})", to, *state, from),
            });
        }
        *state = to;
        Ok(())
    }

    fn with_components<T>(&self, f: impl FnOnce(&Components) -> Result<T>) -> Result<T> {
        let guard = self.components.read().expect("shard components lock poisoned");
        let components = guard.as_ref().ok_or_else(|| ShardError::ShardNotStarted {
            shard: self.id.clone(),
            state: format!("{:?}", self.lifecycle_state()),
        })?;
        f(components)
    }

    fn assert_started(&self) -> Result<()> {
        if self.lifecycle_state() != ShardLifecycleState::Started {
            return Err(ShardError::ShardNotStarted { shard: self.id.clone(), state: format!("{:?}", self.lifecycle_state()) });
        }
        Ok(())
    }

    /// Primary indexing path (spec §4.6.2): acquire a permit, allocate the
    /// seqno, apply to the engine, mark it processed, then run
    /// `after_write_operation`.
    pub fn index(&self, doc_id: &str, source: Vec<u8>, version: u64) -> Result<IndexResult> {
        self.assert_started()?;
        let routing = self.routing();
        self.with_components(|components| {
            let _permit = components.permits.acquire(&routing, Duration::from_secs(30))?;
            self.indexing_listeners.before_indexing(doc_id);
            let seq_no = components.seqno.generate();
            let term = components.permits.current_term();
            let result = components.engine.apply_index_on_primary(seq_no, term, doc_id, source, version);
            let success = result.is_ok();
            if success {
                components.seqno.mark_processed(seq_no);
            }
            self.indexing_listeners.after_indexing(doc_id, seq_no, success);
            let result = result?;
            self.after_write_operation(components)?;
            Ok(result)
        })
    }

    /// Replica indexing path: seqno/term are supplied by the primary.
    /// Routed through `acquire_replica_permit` (spec §4.5) so a stale-term
    /// op is rejected outright and a newer-term op advances the shard
    /// (draining in-flight ops, filling sequence-number gaps, rolling the
    /// translog generation) before being applied.
    pub fn index_on_replica(&self, seq_no: SeqNo, term: PrimaryTerm, doc_id: &str, source: Vec<u8>, version: u64) -> Result<IndexResult> {
        self.assert_started()?;
        self.with_components(|components| {
            let _permit = self.acquire_replica_permit_for_term(components, term)?;
            let result = components.engine.apply_index_on_replica(seq_no, term, doc_id, source, version)?;
            components.seqno.mark_processed(seq_no);
            self.after_write_operation(components)?;
            Ok(result)
        })
    }

    pub fn delete(&self, doc_id: &str, version: u64) -> Result<DeleteResult> {
        self.assert_started()?;
        let routing = self.routing();
        self.with_components(|components| {
            let _permit = components.permits.acquire(&routing, Duration::from_secs(30))?;
            self.indexing_listeners.before_delete(doc_id);
            let seq_no = components.seqno.generate();
            let term = components.permits.current_term();
            let result = components.engine.apply_delete_on_primary(seq_no, term, doc_id, version);
            let success = result.is_ok();
            if success {
                components.seqno.mark_processed(seq_no);
            }
            self.indexing_listeners.after_delete(doc_id, seq_no, success);
            let result = result?;
            self.after_write_operation(components)?;
            Ok(result)
        })
    }

    pub fn delete_on_replica(&self, seq_no: SeqNo, term: PrimaryTerm, doc_id: &str, version: u64) -> Result<DeleteResult> {
        self.assert_started()?;
        self.with_components(|components| {
            let _permit = self.acquire_replica_permit_for_term(components, term)?;
            let result = components.engine.apply_delete_on_replica(seq_no, term, doc_id, version)?;
            components.seqno.mark_processed(seq_no);
            self.after_write_operation(components)?;
            Ok(result)
        })
    }

    /// Shared gate for both replica apply paths: stale terms fail via
    /// `TermTooOld`, a term matching the shard's current one is a fast
    /// acquire, and a newer term blocks new permits, drains in-flight ones,
    /// fills every sequence-number gap with no-ops, and rolls the translog
    /// generation before advancing (spec §4.5).
    fn acquire_replica_permit_for_term<'a>(&self, components: &'a Components, term: PrimaryTerm) -> Result<crate::permits::Permit<'a>> {
        components.permits.acquire_replica_permit(
            term,
            Duration::from_secs(30),
            || {
                components.seqno.fill_gaps(|gap_seq_no| {
                    components.engine.mark_seq_no_as_noop(gap_seq_no, term, "filling gap before replica term advance")?;
                    components.seqno.mark_processed(gap_seq_no);
                    Ok(())
                })
            },
            || components.engine.roll_translog_generation().map(|_| ()),
        )
    }

    /// Propagates a global checkpoint advance from the primary, then
    /// notifies any listeners waiting on it.
    pub fn update_global_checkpoint_from_primary(&self, checkpoint: SeqNo) -> Result<()> {
        self.with_components(|components| components.seqno.update_global_checkpoint_from_primary(checkpoint))?;
        self.global_checkpoint_listeners.notify(checkpoint);
        Ok(())
    }

    /// Fires `callback` once the global checkpoint reaches `target`, or
    /// immediately if it already has. Fires with `Err(ShardClosed)` instead
    /// if the shard closes before `target` is ever reached.
    pub fn register_global_checkpoint_listener(&self, target: SeqNo, callback: impl FnOnce(Result<SeqNo, ShardError>) + Send + 'static) {
        let current_gcp = self.with_components(|c| Ok(c.seqno.get_global_checkpoint())).unwrap_or(crate::ids::NO_OPS_PERFORMED);
        self.global_checkpoint_listeners.register(target, current_gcp, callback);
    }

    /// Runs after every successful write: evaluates whether a periodic
    /// flush or translog generation roll is due (spec §4.6.4).
    fn after_write_operation(&self, components: &Components) -> Result<()> {
        if components.engine.translog().should_roll_translog_generation() {
            components.engine.roll_translog_generation()?;
        }
        if self.should_periodically_flush(components) {
            let max_seq_no = components.seqno.get_max_seq_no();
            let local_checkpoint = components.seqno.get_local_checkpoint();
            self.flush_coordinator.request_flush(&components.engine, false, max_seq_no, local_checkpoint, true)?;
        }
        Ok(())
    }

    fn should_periodically_flush(&self, components: &Components) -> bool {
        components.engine.translog().stats().uncommitted_size_bytes as u64 > self.settings.flush_threshold_bytes
    }

    pub fn flush(&self, force: bool) -> Result<Option<Commit>> {
        self.with_components(|components| {
            let max_seq_no = components.seqno.get_max_seq_no();
            let local_checkpoint = components.seqno.get_local_checkpoint();
            let commit = self.flush_coordinator.request_flush(&components.engine, force, max_seq_no, local_checkpoint, false)?;
            if let Some(commit) = &commit {
                components.retention.on_new_commit(commit.clone());
            }
            Ok(commit)
        })
    }

    pub fn refresh(&self, source: &str) -> Result<()> {
        self.with_components(|components| components.engine.refresh(source))
    }

    /// Switches durability mode on the live translog (spec §8 scenario 1).
    pub fn set_durability(&self, durability: crate::config::Durability) -> Result<()> {
        self.with_components(|components| components.engine.translog().set_durability(durability))
    }

    /// Whether `location` (from an `IndexResult`/`DeleteResult`) still
    /// needed a sync to become durable as of this call — `false` for a
    /// `None` location (nothing was ever appended) or one already synced
    /// inline under `REQUEST` durability.
    pub fn ensure_synced(&self, location: Option<crate::translog::TranslogLocation>) -> Result<bool> {
        let Some(location) = location else {
            return Ok(false);
        };
        self.with_components(|components| components.engine.translog().ensure_synced(location))
    }

    pub fn acquire_searcher(&self, scope: &str) -> Result<Searcher> {
        self.search_idle.mark_searched();
        self.with_components(|components| components.engine.acquire_searcher(scope))
    }

    /// Primary promotion (spec §4.6.5): bump the term, drain in-flight
    /// operations, fill every sequence-number gap with no-ops under the new
    /// term, then roll the translog generation so recovery never mixes ops
    /// from two different primary terms in one generation.
    pub fn promote_to_primary(&self) -> Result<()> {
        self.assert_started()?;
        {
            let mut routing = self.routing.write().expect("shard routing lock poisoned");
            routing.primary = true;
        }
        self.with_components(|components| {
            let new_term = components.permits.current_term() + 1;
            let permit = self.acquire_replica_permit_for_term(components, new_term)?;
            drop(permit);
            Ok(())
        })
    }

    /// Relocation hand-off (spec §4.6.6): block new permits, drain
    /// in-flight ones, hand control to `on_drained`, then move routing to
    /// RELOCATING. If `on_drained` fails the shard remains STARTED and
    /// usable. `cancel`, if flipped to `true` by another thread while the
    /// drain is still waiting on in-flight permits, aborts the hand-off
    /// before `on_drained` ever runs and leaves routing untouched.
    pub fn relocate(&self, target_node_id: &str, cancel: &AtomicBool, on_drained: impl FnOnce() -> Result<()>) -> Result<()> {
        self.assert_started()?;
        self.with_components(|components| components.permits.block_new_and_drain_cancellable(Some(cancel), on_drained))?;
        let mut routing = self.routing.write().expect("shard routing lock poisoned");
        *routing = routing
            .moved_to_relocating(target_node_id)
            .map_err(|reason| ShardError::IllegalShardState { shard: self.id.clone(), reason })?;
        Ok(())
    }

    /// Marks a relocation hand-off as fully complete (RELOCATING ->
    /// RELOCATED). Once finalized, write attempts against this copy
    /// surface `ShardError::Relocated` rather than `NotPrimary`.
    pub fn finalize_relocation(&self) -> Result<()> {
        let mut routing = self.routing.write().expect("shard routing lock poisoned");
        *routing =
            routing.moved_to_relocated().map_err(|reason| ShardError::IllegalShardState { shard: self.id.clone(), reason })?;
        Ok(())
    }

    pub fn close(&self) {
        let mut state = self.lifecycle.write().expect("shard lifecycle lock poisoned");
        if *state == ShardLifecycleState::Closed {
            return;
        }
        *state = ShardLifecycleState::Closed;
        drop(state);
        self.flush_coordinator.shutdown();
        self.refresh_scheduler.shutdown();
        self.global_checkpoint_listeners.notify_closed(&self.id);
        if let Some(components) = self.components.read().expect("shard components lock poisoned").as_ref() {
            components.engine.close();
        }
        log::info!("{} shard closed", self.id);
    }

    pub fn fail_shard(&self, reason: &str) {
        log::error!("{} shard failed: {}", self.id, reason);
        self.close();
    }

    pub fn stats(&self) -> Result<ShardStats> {
        self.with_components(|components| {
            Ok(ShardStats {
                max_seq_no: components.seqno.get_max_seq_no(),
                local_checkpoint: components.seqno.get_local_checkpoint(),
                global_checkpoint: components.seqno.get_global_checkpoint(),
                flush_count_total: self.flush_coordinator.flush_count_total(),
                flush_count_periodic: self.flush_coordinator.flush_count_periodic(),
                refresh_count: self.refresh_scheduler.refresh_count(),
                active_permits: components.permits.active_count(),
            })
        })
    }
}
