//! Indexing operation hooks and global-checkpoint listeners (spec §4.6.7,
//! §5). Pre/post hooks are defensive against a misbehaving listener
//! panicking mid-callback — a single bad listener must not poison the
//! indexing path for every caller that follows.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Mutex;

use crate::error::ShardError;
use crate::ids::{ShardId, SeqNo};

/// Observes indexing operations before and after they are applied.
/// Default no-op hooks, matching `EngineHandler`'s pattern of giving every
/// callback a harmless default so implementors only override what they use.
pub trait IndexingOperationListener: Send + Sync {
    fn before_indexing(&self, _doc_id: &str) {}
    fn after_indexing(&self, _doc_id: &str, _seq_no: SeqNo, _success: bool) {}
    fn before_delete(&self, _doc_id: &str) {}
    fn after_delete(&self, _doc_id: &str, _seq_no: SeqNo, _success: bool) {}
}

/// Registry that calls every listener, catching panics so one broken
/// listener cannot break the ones registered after it.
#[derive(Default)]
pub struct IndexingOperationListeners {
    listeners: Mutex<Vec<std::sync::Arc<dyn IndexingOperationListener>>>,
}

impl IndexingOperationListeners {
    pub fn register(&self, listener: std::sync::Arc<dyn IndexingOperationListener>) {
        self.listeners.lock().expect("listeners mutex poisoned").push(listener);
    }

    pub fn before_indexing(&self, doc_id: &str) {
        for listener in self.listeners.lock().expect("listeners mutex poisoned").iter() {
            Self::guarded(|| listener.before_indexing(doc_id));
        }
    }

    pub fn after_indexing(&self, doc_id: &str, seq_no: SeqNo, success: bool) {
        for listener in self.listeners.lock().expect("listeners mutex poisoned").iter() {
            Self::guarded(|| listener.after_indexing(doc_id, seq_no, success));
        }
    }

    pub fn before_delete(&self, doc_id: &str) {
        for listener in self.listeners.lock().expect("listeners mutex poisoned").iter() {
            Self::guarded(|| listener.before_delete(doc_id));
        }
    }

    pub fn after_delete(&self, doc_id: &str, seq_no: SeqNo, success: bool) {
        for listener in self.listeners.lock().expect("listeners mutex poisoned").iter() {
            Self::guarded(|| listener.after_delete(doc_id, seq_no, success));
        }
    }

    fn guarded(f: impl FnOnce()) {
        if let Err(_) = panic::catch_unwind(AssertUnwindSafe(f)) {
            log::error!("indexing operation listener panicked; continuing");
        }
    }
}

/// One-shot callback fired once the shard's global checkpoint reaches
/// `target`, or with `Err(ShardError::ShardClosed)` if the shard closes
/// first. Registrations are delivered in the order they were made.
struct Registration {
    target: SeqNo,
    callback: Box<dyn FnOnce(Result<SeqNo, ShardError>) + Send>,
}

#[derive(Default)]
pub struct GlobalCheckpointListeners {
    pending: Mutex<Vec<Registration>>,
}

impl GlobalCheckpointListeners {
    /// Register a callback for `target`. `current_global_checkpoint` is
    /// checked immediately: if the checkpoint has already reached `target`
    /// by the time of registration, `callback` fires inline instead of
    /// being queued — mirroring `EngineHandler`'s dispatch-on-registration
    /// default-method pattern, where a hook that's already satisfied runs
    /// right away rather than waiting for the next unrelated event.
    pub fn register(
        &self,
        target: SeqNo,
        current_global_checkpoint: SeqNo,
        callback: impl FnOnce(Result<SeqNo, ShardError>) + Send + 'static,
    ) {
        if target <= current_global_checkpoint {
            callback(Ok(current_global_checkpoint));
            return;
        }
        self.pending
            .lock()
            .expect("global checkpoint listeners mutex poisoned")
            .push(Registration { target, callback: Box::new(callback) });
    }

    /// Call once the global checkpoint has advanced; fires every
    /// registration whose target has now been reached, in registration
    /// order, and drops them from the pending set.
    pub fn notify(&self, global_checkpoint: SeqNo) {
        let mut pending = self.pending.lock().expect("global checkpoint listeners mutex poisoned");
        let mut remaining = Vec::new();
        let mut ready = Vec::new();
        for registration in pending.drain(..) {
            if registration.target <= global_checkpoint {
                ready.push(registration);
            } else {
                remaining.push(registration);
            }
        }
        *pending = remaining;
        drop(pending);
        for registration in ready {
            (registration.callback)(Ok(global_checkpoint));
        }
    }

    /// Drains every still-pending registration and fires it with
    /// `ShardClosed`, so a caller blocked waiting on a checkpoint that will
    /// now never arrive gets told why instead of hanging forever.
    pub fn notify_closed(&self, shard: &ShardId) {
        let pending: Vec<Registration> = self.pending.lock().expect("global checkpoint listeners mutex poisoned").drain(..).collect();
        for registration in pending {
            (registration.callback)(Err(ShardError::ShardClosed { shard: shard.clone() }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
    use std::sync::Arc;

    struct PanicyListener;
    impl IndexingOperationListener for PanicyListener {
        fn after_indexing(&self, _doc_id: &str, _seq_no: SeqNo, _success: bool) {
            panic!("boom");
        }
    }

    struct RecordingListener {
        called: Arc<AtomicBool>,
    }
    impl IndexingOperationListener for RecordingListener {
        fn after_indexing(&self, _doc_id: &str, _seq_no: SeqNo, _success: bool) {
            self.called.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn panicking_listener_does_not_block_later_listeners() {
        let listeners = IndexingOperationListeners::default();
        let called = Arc::new(AtomicBool::new(false));
        listeners.register(Arc::new(PanicyListener));
        listeners.register(Arc::new(RecordingListener { called: Arc::clone(&called) }));
        listeners.after_indexing("d1", 0, true);
        assert!(called.load(Ordering::SeqCst));
    }

    #[test]
    fn global_checkpoint_listener_fires_once_target_reached() {
        let listeners = GlobalCheckpointListeners::default();
        let fired_at = Arc::new(AtomicI64::new(-1));
        let fired_at2 = Arc::clone(&fired_at);
        listeners.register(5, 0, move |result| fired_at2.store(result.unwrap(), Ordering::SeqCst));
        listeners.notify(3);
        assert_eq!(fired_at.load(Ordering::SeqCst), -1);
        listeners.notify(5);
        assert_eq!(fired_at.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn registering_an_already_satisfied_target_fires_immediately() {
        let listeners = GlobalCheckpointListeners::default();
        let fired_at = Arc::new(AtomicI64::new(-1));
        let fired_at2 = Arc::clone(&fired_at);
        listeners.register(5, 10, move |result| fired_at2.store(result.unwrap(), Ordering::SeqCst));
        assert_eq!(fired_at.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn closing_notifies_pending_listeners_with_shard_closed() {
        use crate::ids::ShardId;

        let listeners = GlobalCheckpointListeners::default();
        let got_closed = Arc::new(AtomicBool::new(false));
        let got_closed2 = Arc::clone(&got_closed);
        listeners.register(5, 0, move |result| {
            got_closed2.store(matches!(result, Err(ShardError::ShardClosed { .. })), Ordering::SeqCst);
        });
        listeners.notify_closed(&ShardId::new("orders", "uuid-1", 0));
        assert!(got_closed.load(Ordering::SeqCst));
    }
}
