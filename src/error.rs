//! Error types for the shard storage engine.
//!
//! A single enum carries every failure mode described in spec §7. Every
//! variant that represents an operational failure carries the `ShardId` it
//! happened against, since callers (and logs) need to know which shard to
//! look at.

use std::fmt;
use std::io;

use crate::ids::ShardId;

/// Unified error type for shard engine operations.
#[derive(Debug)]
pub enum ShardError {
    /// Op against a shard past CLOSED.
    ShardClosed { shard: ShardId },
    /// Op requiring STARTED when the shard is in CREATED/RECOVERING.
    ShardNotStarted { shard: ShardId, state: String },
    /// Primary-only op attempted on a replica or a relocated primary.
    NotPrimary { shard: ShardId },
    /// Replica op carried a term older than the shard's current term.
    TermTooOld { shard: ShardId, op_term: u64, current_term: u64 },
    /// Permit acquisition exceeded its wait timeout.
    PermitTimeout { shard: ShardId, waited_ms: u64 },
    /// Attempt to revert or reuse a primary that has already relocated.
    Relocated { shard: ShardId },
    /// Another process/instance holds the shard's node-environment lock.
    LockObtainFailed { shard: ShardId, reason: String },
    /// Missing index, checksum mismatch, mapping mismatch, etc.
    RecoveryFailed { shard: ShardId, reason: String },
    /// The engine was closed while an operation was in flight.
    EngineClosed { shard: ShardId },
    /// Checksum or sequencing failure while replaying the translog.
    TranslogCorrupted { shard: ShardId, reason: String },
    /// The on-disk store was scanned and found irreparably corrupt.
    ShardCorrupt { shard: ShardId, reason: String },
    /// Race loser in a relocation/cancellation attempt, or any other
    /// attempt to apply a transition the state machine no longer allows.
    IllegalShardState { shard: ShardId, reason: String },

    /// I/O error (file operations).
    Io(io::Error),
    /// JSON (de)serialization error — used for `ShardStateMeta` and
    /// checkpoint sidecars.
    Json(String),
    /// Binary (de)serialization error — used for translog records.
    Bincode(String),
}

impl fmt::Display for ShardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardError::ShardClosed { shard } => write!(f, "{} shard is closed", shard),
            ShardError::ShardNotStarted { shard, state } => {
                write!(f, "{} shard is not started (current state: {})", shard, state)
            }
            ShardError::NotPrimary { shard } => write!(f, "{} shard is not primary", shard),
            ShardError::TermTooOld { shard, op_term, current_term } => write!(
                f,
                "{} operation term {} is older than current term {}",
                shard, op_term, current_term
            ),
            ShardError::PermitTimeout { shard, waited_ms } => {
                write!(f, "{} permit acquisition timed out after {}ms", shard, waited_ms)
            }
            ShardError::Relocated { shard } => write!(f, "{} shard has relocated", shard),
            ShardError::LockObtainFailed { shard, reason } => {
                write!(f, "{} failed to obtain shard lock: {}", shard, reason)
            }
            ShardError::RecoveryFailed { shard, reason } => {
                write!(f, "{} recovery failed: {}", shard, reason)
            }
            ShardError::EngineClosed { shard } => write!(f, "{} engine was closed mid-operation", shard),
            ShardError::TranslogCorrupted { shard, reason } => {
                write!(f, "{} translog corrupted: {}", shard, reason)
            }
            ShardError::ShardCorrupt { shard, reason } => write!(f, "{} shard is corrupt: {}", shard, reason),
            ShardError::IllegalShardState { shard, reason } => {
                write!(f, "{} illegal shard state: {}", shard, reason)
            }
            ShardError::Io(e) => write!(f, "{}", e),
            ShardError::Json(msg) => write!(f, "{}", msg),
            ShardError::Bincode(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for ShardError {}

impl From<io::Error> for ShardError {
    fn from(e: io::Error) -> Self {
        ShardError::Io(e)
    }
}

impl From<serde_json::Error> for ShardError {
    fn from(e: serde_json::Error) -> Self {
        ShardError::Json(e.to_string())
    }
}

impl From<bincode::Error> for ShardError {
    fn from(e: bincode::Error) -> Self {
        ShardError::Bincode(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ShardError>;
