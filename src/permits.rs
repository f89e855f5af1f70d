//! Operation permits: normal acquire/release, block-and-drain for
//! synchronization points, and term-aware replica permits (spec §4.5).
//!
//! Generalizes the `Mutex`+`Condvar` high-water-mark idiom from
//! `engines/granite/wal.rs`'s `FsyncState` to a reference-counted gate: the
//! mutex-protected state is an active-permit count plus a "blocked" flag
//! instead of a single synced offset, and the condvar wakes waiters both
//! when a permit is released and when blocking ends.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Result, ShardError};
use crate::ids::ShardId;
use crate::routing::{Routing, RoutingState};

struct PermitState {
    active_count: u32,
    blocked: bool,
}

/// Guards concurrent indexing operations against shard-lifecycle
/// transitions (primary promotion, relocation hand-off, closing).
pub struct OperationPermits {
    shard: ShardId,
    state: Mutex<PermitState>,
    condvar: Condvar,
    current_term: AtomicU64,
}

/// RAII guard: dropping it releases the permit.
pub struct Permit<'a> {
    permits: &'a OperationPermits,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        self.permits.release();
    }
}

impl OperationPermits {
    pub fn new(shard: ShardId, initial_term: u64) -> Self {
        Self {
            shard,
            state: Mutex::new(PermitState { active_count: 0, blocked: false }),
            condvar: Condvar::new(),
            current_term: AtomicU64::new(initial_term),
        }
    }

    pub fn current_term(&self) -> u64 {
        self.current_term.load(Ordering::SeqCst)
    }

    pub fn active_count(&self) -> u32 {
        self.state.lock().expect("permits mutex poisoned").active_count
    }

    /// Acquire a normal-mode permit for an indexing op, only once
    /// `routing` authorizes this copy to accept writes and the shard is not
    /// currently blocked for a transition.
    pub fn acquire(&self, routing: &Routing, timeout: Duration) -> Result<Permit<'_>> {
        if routing.primary && routing.state == RoutingState::Relocated {
            return Err(ShardError::Relocated { shard: self.shard.clone() });
        }
        if routing.primary && !routing.is_primary_mode() {
            return Err(ShardError::NotPrimary { shard: self.shard.clone() });
        }
        self.wait_and_take(timeout)?;
        Ok(Permit { permits: self })
    }

    fn wait_and_take(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().expect("permits mutex poisoned");
        while state.blocked {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ShardError::PermitTimeout { shard: self.shard.clone(), waited_ms: timeout.as_millis() as u64 });
            }
            let (guard, result) = self.condvar.wait_timeout(state, remaining).expect("permits condvar wait failed");
            state = guard;
            if result.timed_out() && state.blocked {
                return Err(ShardError::PermitTimeout { shard: self.shard.clone(), waited_ms: timeout.as_millis() as u64 });
            }
        }
        state.active_count += 1;
        Ok(())
    }

    fn release(&self) {
        let mut state = self.state.lock().expect("permits mutex poisoned");
        state.active_count -= 1;
        self.condvar.notify_all();
    }

    /// Block new permit acquisition, wait for every active permit to drain,
    /// run `on_drained`, then unblock. Used for primary promotion and
    /// relocation hand-off (spec §4.6.5 / §4.6.6).
    pub fn block_new_and_drain<T>(&self, on_drained: impl FnOnce() -> Result<T>) -> Result<T> {
        self.block_new_and_drain_cancellable(None, on_drained)
    }

    /// Like `block_new_and_drain`, but polls `cancel` while waiting for
    /// in-flight permits to drain. If `cancel` flips to `true` before the
    /// drain completes, unblocks without ever running `on_drained` and
    /// returns an error — used by relocation hand-off, which must be
    /// abortable if the cluster cancels the relocation before the source
    /// shard has handed control to the target.
    pub fn block_new_and_drain_cancellable<T>(&self, cancel: Option<&AtomicBool>, on_drained: impl FnOnce() -> Result<T>) -> Result<T> {
        {
            let mut state = self.state.lock().expect("permits mutex poisoned");
            state.blocked = true;
            loop {
                if let Some(cancel) = cancel {
                    if cancel.load(Ordering::SeqCst) {
                        state.blocked = false;
                        self.condvar.notify_all();
                        return Err(ShardError::IllegalShardState {
                            shard: self.shard.clone(),
                            reason: "drain cancelled before in-flight permits finished".to_string(),
                        });
                    }
                }
                if state.active_count == 0 {
                    break;
                }
                state = match cancel {
                    Some(_) => {
                        let (guard, _) =
                            self.condvar.wait_timeout(state, Duration::from_millis(50)).expect("permits condvar wait failed");
                        guard
                    }
                    None => self.condvar.wait(state).expect("permits condvar wait failed"),
                };
            }
        }
        let result = on_drained();
        let mut state = self.state.lock().expect("permits mutex poisoned");
        state.blocked = false;
        self.condvar.notify_all();
        result
    }

    /// Term-aware permit acquisition for replica operations (spec §4.5):
    /// - `op_term < current_term`: fail fast, the sender is stale.
    /// - `op_term == current_term`: fast path, behaves like `acquire`.
    /// - `op_term > current_term`: block and drain in-flight ops, advance
    ///   the term, fill sequence-number gaps via `fill_gaps`, roll the
    ///   translog generation via `roll_generation`, then resume. Both
    ///   closures are the caller's responsibility since only the caller
    ///   (the `Shard`) knows how to enumerate gaps against its
    ///   `SeqNoTracker` and where its translog lives.
    pub fn acquire_replica_permit(
        &self,
        op_term: u64,
        timeout: Duration,
        fill_gaps: impl FnOnce() -> Result<()>,
        roll_generation: impl FnOnce() -> Result<()>,
    ) -> Result<Permit<'_>> {
        let current = self.current_term.load(Ordering::SeqCst);
        if op_term < current {
            return Err(ShardError::TermTooOld { shard: self.shard.clone(), op_term, current_term: current });
        }
        if op_term == current {
            self.wait_and_take(timeout)?;
            return Ok(Permit { permits: self });
        }
        self.block_new_and_drain(|| {
            self.current_term.store(op_term, Ordering::SeqCst);
            fill_gaps()?;
            roll_generation()
        })?;
        self.wait_and_take(timeout)?;
        Ok(Permit { permits: self })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ShardId;
    use crate::routing::RecoverySource;

    fn shard_id() -> ShardId {
        ShardId::new("orders", "uuid-1", 0)
    }

    fn started_primary_routing() -> Routing {
        Routing::new_initializing(shard_id(), "node-1", true, "alloc-1", RecoverySource::EmptyStore)
            .moved_to_started()
            .unwrap()
    }

    #[test]
    fn acquire_and_release_tracks_active_count() {
        let permits = OperationPermits::new(shard_id(), 1);
        let routing = started_primary_routing();
        assert_eq!(permits.active_count(), 0);
        let permit = permits.acquire(&routing, Duration::from_millis(100)).unwrap();
        assert_eq!(permits.active_count(), 1);
        drop(permit);
        assert_eq!(permits.active_count(), 0);
    }

    #[test]
    fn non_started_primary_routing_is_rejected() {
        let permits = OperationPermits::new(shard_id(), 1);
        let routing = Routing::new_initializing(shard_id(), "node-1", true, "alloc-1", RecoverySource::EmptyStore);
        assert!(permits.acquire(&routing, Duration::from_millis(100)).is_err());
    }

    #[test]
    fn relocated_primary_routing_is_rejected_with_dedicated_error() {
        let permits = OperationPermits::new(shard_id(), 1);
        let routing = started_primary_routing().moved_to_relocating("node-2").unwrap().moved_to_relocated().unwrap();
        let result = permits.acquire(&routing, Duration::from_millis(100));
        assert!(matches!(result, Err(ShardError::Relocated { .. })));
    }

    #[test]
    fn cancelling_a_drain_aborts_without_running_on_drained() {
        use std::sync::Arc;
        use std::thread;

        let permits = Arc::new(OperationPermits::new(shard_id(), 1));
        let routing = started_primary_routing();
        let permit = permits.acquire(&routing, Duration::from_millis(100)).unwrap();

        let cancel = Arc::new(AtomicBool::new(false));
        let permits2 = Arc::clone(&permits);
        let cancel2 = Arc::clone(&cancel);
        let ran_on_drained = Arc::new(AtomicBool::new(false));
        let ran_on_drained2 = Arc::clone(&ran_on_drained);
        let handle = thread::spawn(move || {
            permits2.block_new_and_drain_cancellable(Some(&cancel2), || {
                ran_on_drained2.store(true, Ordering::SeqCst);
                Ok(())
            })
        });

        thread::sleep(Duration::from_millis(50));
        cancel.store(true, Ordering::SeqCst);
        let result = handle.join().unwrap();
        assert!(result.is_err());
        assert!(!ran_on_drained.load(Ordering::SeqCst));
        drop(permit);
    }

    #[test]
    fn block_new_and_drain_waits_for_active_permits() {
        use std::sync::Arc;
        use std::thread;

        let permits = Arc::new(OperationPermits::new(shard_id(), 1));
        let routing = started_primary_routing();
        let permit = permits.acquire(&routing, Duration::from_millis(100)).unwrap();

        let permits2 = Arc::clone(&permits);
        let drained = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let drained2 = Arc::clone(&drained);
        let handle = thread::spawn(move || {
            permits2.block_new_and_drain(|| {
                drained2.store(true, Ordering::SeqCst);
                Ok(())
            })
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!drained.load(Ordering::SeqCst));
        drop(permit);
        handle.join().unwrap().unwrap();
        assert!(drained.load(Ordering::SeqCst));
    }

    #[test]
    fn replica_permit_rejects_stale_term() {
        let permits = OperationPermits::new(shard_id(), 5);
        let result = permits.acquire_replica_permit(3, Duration::from_millis(100), || Ok(()), || Ok(()));
        assert!(matches!(result, Err(ShardError::TermTooOld { .. })));
    }

    #[test]
    fn replica_permit_advances_term_and_fills_gaps_on_newer_term() {
        use std::sync::Arc;

        let permits = OperationPermits::new(shard_id(), 1);
        let filled = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let rolled = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let filled2 = Arc::clone(&filled);
        let rolled2 = Arc::clone(&rolled);
        {
            let permit = permits
                .acquire_replica_permit(
                    2,
                    Duration::from_millis(100),
                    move || {
                        filled2.store(true, Ordering::SeqCst);
                        Ok(())
                    },
                    move || {
                        rolled2.store(true, Ordering::SeqCst);
                        Ok(())
                    },
                )
                .unwrap();
            drop(permit);
        }
        assert_eq!(permits.current_term(), 2);
        assert!(filled.load(Ordering::SeqCst));
        assert!(rolled.load(Ordering::SeqCst));
    }
}
