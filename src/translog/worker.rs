//! Background writer thread for the translog.
//!
//! Directly generalizes `engines/granite/wal.rs`'s `granite_worker_thread`:
//! a dedicated `std::thread` owns the mutable generation state and drains a
//! bounded `mpsc::sync_channel` of requests, so concurrent callers never
//! touch the file handle directly. Durability is signalled through a
//! `Mutex`+`Condvar` high-water-mark, the same shape as the teacher's
//! `FsyncState`, generalized from a plain LSN to a `TranslogLocation`
//! (generation, offset) pair.

use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::config::Durability;
use crate::error::Result;
use crate::ids::ShardId;
use crate::translog::generation::TranslogGeneration;
use crate::translog::record::{TranslogLocation, TranslogOp};

#[derive(Debug, Clone, Copy, Default)]
pub struct TranslogStatsSnapshot {
    pub uncommitted_ops: u64,
    pub uncommitted_size_bytes: i64,
    pub total_ops: u64,
    pub generation: i64,
}

/// Durability high-water-mark, generalizing `FsyncState` from a bare LSN to
/// a `TranslogLocation`.
struct SyncState {
    synced: Mutex<Option<TranslogLocation>>,
    condvar: Condvar,
}

impl SyncState {
    fn new() -> Self {
        Self { synced: Mutex::new(None), condvar: Condvar::new() }
    }

    fn signal(&self, loc: TranslogLocation) {
        let mut guard = self.synced.lock().expect("translog sync state mutex poisoned");
        if guard.map_or(true, |current| loc > current) {
            *guard = Some(loc);
        }
        self.condvar.notify_all();
    }

    fn is_at_or_beyond(&self, loc: TranslogLocation) -> bool {
        let guard = self.synced.lock().expect("translog sync state mutex poisoned");
        guard.map_or(false, |current| current >= loc)
    }
}

pub enum TranslogMessage {
    Append { op: TranslogOp, responder: mpsc::SyncSender<Result<TranslogLocation>> },
    Sync { responder: mpsc::SyncSender<Result<()>> },
    RollGeneration { responder: mpsc::SyncSender<Result<i64>> },
    TrimUnreferenced { min_generation_to_retain: i64, responder: mpsc::SyncSender<Result<()>> },
    Stats { responder: mpsc::SyncSender<TranslogStatsSnapshot> },
    SetDurability { durability: Durability, responder: mpsc::SyncSender<()> },
    Shutdown,
}

pub struct TranslogWorkerHandle {
    pub sender: mpsc::SyncSender<TranslogMessage>,
    sync_state: Arc<SyncState>,
}

impl TranslogWorkerHandle {
    pub fn new(
        shard: ShardId,
        dir: PathBuf,
        starting_generation: i64,
        durability: Durability,
        async_fsync_interval: Duration,
    ) -> Result<Self> {
        let generation = if starting_generation == 1 {
            TranslogGeneration::create(shard.clone(), dir.clone(), starting_generation)?
        } else {
            TranslogGeneration::reopen_current(shard.clone(), dir.clone(), starting_generation)?
        };

        let (tx, rx) = mpsc::sync_channel::<TranslogMessage>(4096);
        let sync_state = Arc::new(SyncState::new());
        let worker_sync_state = Arc::clone(&sync_state);

        std::thread::spawn(move || {
            translog_worker_thread(shard, dir, generation, rx, durability, async_fsync_interval, worker_sync_state);
        });

        Ok(Self { sender: tx, sync_state })
    }

    pub fn append(&self, op: TranslogOp) -> Result<TranslogLocation> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.send(TranslogMessage::Append { op, responder: tx })?;
        rx.recv().expect("translog worker dropped responder")
    }

    /// Returns `true` iff this call itself performed a durable fsync.
    pub fn ensure_synced(&self, loc: TranslogLocation) -> Result<bool> {
        if self.sync_state.is_at_or_beyond(loc) {
            return Ok(false);
        }
        let (tx, rx) = mpsc::sync_channel(1);
        self.send(TranslogMessage::Sync { responder: tx })?;
        rx.recv().expect("translog worker dropped responder")?;
        Ok(true)
    }

    pub fn roll_generation(&self) -> Result<i64> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.send(TranslogMessage::RollGeneration { responder: tx })?;
        rx.recv().expect("translog worker dropped responder")
    }

    pub fn trim_unreferenced_readers(&self, min_generation_to_retain: i64) -> Result<()> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.send(TranslogMessage::TrimUnreferenced { min_generation_to_retain, responder: tx })?;
        rx.recv().expect("translog worker dropped responder")
    }

    pub fn stats(&self) -> TranslogStatsSnapshot {
        let (tx, rx) = mpsc::sync_channel(1);
        if self.send(TranslogMessage::Stats { responder: tx }).is_err() {
            return TranslogStatsSnapshot::default();
        }
        rx.recv().unwrap_or_default()
    }

    /// Switches the durability mode the worker thread applies to
    /// subsequent appends (spec §8 scenario 1). Already-written ops keep
    /// whatever sync guarantee they were written under; this only changes
    /// behavior going forward.
    pub fn set_durability(&self, durability: Durability) -> Result<()> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.send(TranslogMessage::SetDurability { durability, responder: tx })?;
        rx.recv().expect("translog worker dropped responder");
        Ok(())
    }

    fn send(&self, msg: TranslogMessage) -> Result<()> {
        self.sender.send(msg).map_err(|_| crate::error::ShardError::EngineClosed {
            shard: ShardId::new("", "", 0),
        })
    }
}

impl Drop for TranslogWorkerHandle {
    fn drop(&mut self) {
        let _ = self.sender.send(TranslogMessage::Shutdown);
    }
}

fn translog_worker_thread(
    shard: ShardId,
    dir: PathBuf,
    mut generation: TranslogGeneration,
    rx: mpsc::Receiver<TranslogMessage>,
    mut durability: Durability,
    async_fsync_interval: Duration,
    sync_state: Arc<SyncState>,
) {
    let mut total_ops: u64 = generation.op_count();
    let mut last_sync = Instant::now();
    let mut dirty_since_sync = false;

    loop {
        let recv_timeout = if durability == Durability::Async {
            async_fsync_interval.saturating_sub(last_sync.elapsed())
        } else {
            Duration::from_secs(3600)
        };

        let msg = match rx.recv_timeout(recv_timeout) {
            Ok(msg) => msg,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if dirty_since_sync {
                    if let Ok(()) = generation.sync() {
                        sync_state.signal(current_location(&generation));
                        dirty_since_sync = false;
                    }
                }
                last_sync = Instant::now();
                continue;
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        };

        match msg {
            TranslogMessage::Append { op, responder } => {
                let result = generation.append(&op).and_then(|loc| {
                    generation.flush()?;
                    total_ops += 1;
                    dirty_since_sync = true;
                    if durability == Durability::Request {
                        generation.sync()?;
                        sync_state.signal(loc);
                        dirty_since_sync = false;
                        last_sync = Instant::now();
                    }
                    Ok(loc)
                });
                let _ = responder.send(result);
            }
            TranslogMessage::Sync { responder } => {
                let result = generation.sync().map(|()| {
                    sync_state.signal(current_location(&generation));
                    dirty_since_sync = false;
                    last_sync = Instant::now();
                });
                let _ = responder.send(result);
            }
            TranslogMessage::RollGeneration { responder } => {
                let result = (|| {
                    generation.sync()?;
                    generation.seal()?;
                    let sealed_loc = current_location(&generation);
                    sync_state.signal(sealed_loc);
                    let next_gen = generation.generation + 1;
                    generation = TranslogGeneration::create(shard.clone(), dir.clone(), next_gen)?;
                    dirty_since_sync = false;
                    Ok(next_gen)
                })();
                let _ = responder.send(result);
            }
            TranslogMessage::TrimUnreferenced { min_generation_to_retain, responder } => {
                let result = (|| {
                    let mut gen_to_delete = 1;
                    while gen_to_delete < min_generation_to_retain {
                        TranslogGeneration::delete_files(&dir, gen_to_delete)?;
                        gen_to_delete += 1;
                    }
                    Ok(())
                })();
                let _ = responder.send(result);
            }
            TranslogMessage::Stats { responder } => {
                let snapshot = TranslogStatsSnapshot {
                    uncommitted_ops: generation.op_count(),
                    uncommitted_size_bytes: generation.current_size_bytes(),
                    total_ops,
                    generation: generation.generation,
                };
                let _ = responder.send(snapshot);
            }
            TranslogMessage::SetDurability { durability: new_durability, responder } => {
                durability = new_durability;
                let _ = responder.send(());
            }
            TranslogMessage::Shutdown => {
                if dirty_since_sync {
                    let _ = generation.sync();
                }
                break;
            }
        }
    }
    log::info!("{} translog worker shut down", shard);
}

fn current_location(generation: &TranslogGeneration) -> TranslogLocation {
    TranslogLocation { generation: generation.generation, offset: generation.current_size_bytes(), size: 0 }
}
