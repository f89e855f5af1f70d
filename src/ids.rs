//! Shard identity and the handful of distinguished sequence-number values.

use std::fmt;

/// Stable identity of a shard: (index name, index uuid, shard number).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardId {
    pub index_name: String,
    pub index_uuid: String,
    pub shard_number: u32,
}

impl ShardId {
    pub fn new(index_name: impl Into<String>, index_uuid: impl Into<String>, shard_number: u32) -> Self {
        Self {
            index_name: index_name.into(),
            index_uuid: index_uuid.into(),
            shard_number,
        }
    }

    /// The directory-name component for this shard under a node's data path.
    /// Validated the same way `minisql`'s storage layer validates table names:
    /// reject path-traversal-capable characters before ever joining a path.
    pub fn to_path_component(&self) -> Result<String, String> {
        if self.index_uuid.is_empty() {
            return Err("index uuid cannot be empty".to_string());
        }
        for forbidden in ["..", "/", "\\", "\0"] {
            if self.index_uuid.contains(forbidden) || self.index_name.contains(forbidden) {
                return Err(format!(
                    "shard id '{}' contains forbidden path characters",
                    self
                ));
            }
        }
        Ok(format!("{}/{}/{}", self.index_name, self.index_uuid, self.shard_number))
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}][{}][{}]", self.index_name, self.index_uuid, self.shard_number)
    }
}

/// Per-shard primary-term generation number. Monotonic, never decreases.
pub type PrimaryTerm = u64;

/// Per-shard sequence number. Signed so the sentinel values below fit in-band.
pub type SeqNo = i64;

/// No sequence number has been assigned yet.
pub const UNASSIGNED_SEQ_NO: SeqNo = -2;

/// The shard has never processed any operation.
pub const NO_OPS_PERFORMED: SeqNo = -1;

/// The starting primary term for a freshly created shard.
pub const UNASSIGNED_PRIMARY_TERM: PrimaryTerm = 0;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_component_joins_fields() {
        let id = ShardId::new("orders", "abc-123", 2);
        assert_eq!(id.to_path_component().unwrap(), "orders/abc-123/2");
    }

    #[test]
    fn path_component_rejects_traversal() {
        let id = ShardId::new("../etc", "abc-123", 0);
        assert!(id.to_path_component().is_err());
    }

    #[test]
    fn display_format() {
        let id = ShardId::new("orders", "abc-123", 2);
        assert_eq!(id.to_string(), "[orders][abc-123][2]");
    }
}
