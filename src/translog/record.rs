//! Translog wire record and location types (spec §3 Operation, TranslogLocation).

use serde::{Deserialize, Serialize};

use crate::ids::{PrimaryTerm, SeqNo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionType {
    Internal,
    External,
}

/// The operation variant carried by a translog record, mirroring the
/// `Index`/`Delete`/`NoOp` union in spec §3. `source` is treated as an
/// opaque byte blob — document parsing/mapping is out of scope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Operation {
    Index {
        doc_id: String,
        source: Vec<u8>,
        version: u64,
    },
    Delete {
        doc_id: String,
        version: u64,
    },
    NoOp {
        reason: String,
    },
}

impl Operation {
    pub fn doc_id(&self) -> Option<&str> {
        match self {
            Operation::Index { doc_id, .. } => Some(doc_id),
            Operation::Delete { doc_id, .. } => Some(doc_id),
            Operation::NoOp { .. } => None,
        }
    }
}

/// A single durable translog record: the operation plus the seqno/term it
/// was admitted under.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TranslogOp {
    pub seq_no: SeqNo,
    pub primary_term: PrimaryTerm,
    pub operation: Operation,
}

/// Where an appended operation landed: totally ordered lexicographically by
/// generation then offset (spec §3 TranslogLocation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TranslogLocation {
    pub generation: i64,
    pub offset: i64,
    pub size: i32,
}
