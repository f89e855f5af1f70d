//! Scheduled refresh and search-idle detection (spec §4.6.4, §6
//! `index.refresh_interval` / `index.search_idle_after`). Background loop
//! shape grounded on `sandstone/worker.rs`'s `worker_loop`: a shutdown flag
//! checked each wake, sleeping the remainder of the interval in between.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::engine::IndexEngine;

/// Tracks whether the shard has been searched recently, to support
/// `index.search_idle_after`: once idle, scheduled refresh stops until a
/// search arrives and an `await_shard_search_active` caller needs a kick.
pub struct SearchIdleTracker {
    woken: Mutex<bool>,
    condvar: Condvar,
    last_active: Mutex<Instant>,
}

impl SearchIdleTracker {
    pub fn new() -> Self {
        Self { woken: Mutex::new(false), condvar: Condvar::new(), last_active: Mutex::new(Instant::now()) }
    }

    pub fn mark_searched(&self) {
        let mut woken = self.woken.lock().expect("search idle tracker mutex poisoned");
        *woken = true;
        self.condvar.notify_all();
        *self.last_active.lock().expect("search idle tracker last-active mutex poisoned") = Instant::now();
    }

    /// The instant of the most recent `mark_searched` call (or creation,
    /// if none yet), so a long-running scheduler loop can re-check idleness
    /// against up-to-date activity instead of a one-time snapshot.
    pub fn last_active(&self) -> Instant {
        *self.last_active.lock().expect("search idle tracker last-active mutex poisoned")
    }

    pub fn is_idle(&self, since: Instant, idle_after: Duration) -> bool {
        since.elapsed() >= idle_after
    }

    /// Blocks the caller until the next search arrives (or `timeout`
    /// elapses), then invokes `on_active`. Models `awaitShardSearchActive`:
    /// a caller that finds the shard idle registers interest and is woken
    /// once a search actually comes in, rather than polling.
    pub fn await_search_active(&self, timeout: Duration, on_active: impl FnOnce()) {
        let mut woken = self.woken.lock().expect("search idle tracker mutex poisoned");
        *woken = false;
        let (guard, _) = self.condvar.wait_timeout_while(woken, timeout, |w| !*w).expect("search idle tracker wait failed");
        woken = guard;
        if *woken {
            on_active();
        }
    }
}

pub struct RefreshScheduler {
    closed: AtomicBool,
    refresh_count: AtomicU64,
}

impl RefreshScheduler {
    pub fn new() -> Self {
        Self { closed: AtomicBool::new(false), refresh_count: AtomicU64::new(0) }
    }

    pub fn refresh_count(&self) -> u64 {
        self.refresh_count.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Run the scheduled-refresh loop until `shutdown()` is called.
    /// `interval` of `None` means scheduled refresh is disabled entirely
    /// (spec: `index.refresh_interval = -1`), in which case this returns
    /// immediately — refresh then only happens on explicit request.
    pub fn run(self: &Arc<Self>, engine: Arc<IndexEngine>, interval: Option<Duration>, idle: Arc<SearchIdleTracker>, idle_after: Duration) {
        let Some(interval) = interval else {
            return;
        };
        loop {
            if self.closed.load(Ordering::SeqCst) {
                log::info!("refresh scheduler shutting down");
                break;
            }
            if !idle.is_idle(idle.last_active(), idle_after) {
                if let Err(e) = engine.refresh("scheduled") {
                    log::error!("scheduled refresh failed: {}", e);
                } else {
                    self.refresh_count.fetch_add(1, Ordering::SeqCst);
                }
            }
            std::thread::sleep(interval);
        }
    }
}
