//! A per-shard storage engine: translog, sequence numbers, retention, and
//! recovery for the unit that sits underneath a distributed search/index
//! cluster's replication and allocation layers (those layers themselves are
//! out of scope — see each module's Non-goals).

pub mod config;
pub mod engine;
pub mod error;
pub mod ids;
pub mod permits;
pub mod retention;
pub mod routing;
pub mod seqno;
pub mod shard;
pub mod state_meta;
pub mod translog;

pub use config::{Durability, ShardSettings};
pub use engine::{Commit, CommitUserData, DeleteResult, IndexEngine, IndexResult, Searcher};
pub use error::{Result, ShardError};
pub use ids::{PrimaryTerm, SeqNo, ShardId, NO_OPS_PERFORMED, UNASSIGNED_PRIMARY_TERM, UNASSIGNED_SEQ_NO};
pub use permits::{OperationPermits, Permit};
pub use retention::CombinedRetentionPolicy;
pub use routing::{RecoverySource, Routing, RoutingState};
pub use seqno::SeqNoTracker;
pub use shard::{Shard, ShardLifecycleState, ShardStats};
pub use state_meta::ShardStateMeta;
pub use translog::{Operation, Translog, TranslogGeneration, TranslogLocation, TranslogOp, TranslogStatsSnapshot, VersionType};
