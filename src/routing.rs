//! Routing state: where a shard copy sits in the cluster's view of the world.
//!
//! Consumed as an input (spec §1 Non-goals: allocation/routing computation
//! lives elsewhere); this module only models the tuple and its legal
//! transitions.

use crate::ids::ShardId;

/// Where a shard copy's data should come from when it first initializes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoverySource {
    EmptyStore,
    ExistingStore,
    Peer,
    Snapshot { snapshot_id: String },
    LocalShards,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingState {
    Unassigned,
    Initializing,
    Started,
    Relocating,
    /// Terminal: relocation hand-off has completed and control has fully
    /// passed to the target copy. A write arriving against a shard still in
    /// this state on the old copy must be rejected, not silently treated as
    /// "not primary".
    Relocated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routing {
    pub shard_id: ShardId,
    pub node_id: String,
    pub relocating_target_node_id: Option<String>,
    pub primary: bool,
    pub state: RoutingState,
    pub allocation_id: String,
    pub recovery_source: RecoverySource,
}

impl Routing {
    pub fn new_initializing(
        shard_id: ShardId,
        node_id: impl Into<String>,
        primary: bool,
        allocation_id: impl Into<String>,
        recovery_source: RecoverySource,
    ) -> Self {
        Self {
            shard_id,
            node_id: node_id.into(),
            relocating_target_node_id: None,
            primary,
            state: RoutingState::Initializing,
            allocation_id: allocation_id.into(),
            recovery_source,
        }
    }

    /// INITIALIZING -> STARTED. Only legal from INITIALIZING.
    pub fn moved_to_started(&self) -> Result<Self, String> {
        if self.state != RoutingState::Initializing {
            return Err(format!("cannot start routing from state {:?}", self.state));
        }
        Ok(Self { state: RoutingState::Started, ..self.clone() })
    }

    /// STARTED -> RELOCATING. Only legal from STARTED primary copies.
    pub fn moved_to_relocating(&self, target_node_id: impl Into<String>) -> Result<Self, String> {
        if self.state != RoutingState::Started {
            return Err(format!("cannot relocate routing from state {:?}", self.state));
        }
        Ok(Self {
            state: RoutingState::Relocating,
            relocating_target_node_id: Some(target_node_id.into()),
            ..self.clone()
        })
    }

    /// RELOCATING -> RELOCATED. Only legal once hand-off to the target copy
    /// has fully completed; terminal from then on.
    pub fn moved_to_relocated(&self) -> Result<Self, String> {
        if self.state != RoutingState::Relocating {
            return Err(format!("cannot finalize relocation from state {:?}", self.state));
        }
        Ok(Self { state: RoutingState::Relocated, ..self.clone() })
    }

    pub fn is_relocation_target(&self) -> bool {
        self.state == RoutingState::Initializing && matches!(self.recovery_source, RecoverySource::Peer)
    }

    /// Whether this copy is currently the write-accepting primary. False
    /// for a replica, an initializing/relocating primary, or one that has
    /// already handed off and moved to `Relocated`.
    pub fn is_primary_mode(&self) -> bool {
        self.primary && self.state == RoutingState::Started
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard_id() -> ShardId {
        ShardId::new("orders", "uuid-1", 0)
    }

    #[test]
    fn initializing_can_start() {
        let r = Routing::new_initializing(shard_id(), "node-1", true, "alloc-1", RecoverySource::EmptyStore);
        let started = r.moved_to_started().unwrap();
        assert_eq!(started.state, RoutingState::Started);
    }

    #[test]
    fn cannot_start_twice() {
        let r = Routing::new_initializing(shard_id(), "node-1", true, "alloc-1", RecoverySource::EmptyStore)
            .moved_to_started()
            .unwrap();
        assert!(r.moved_to_started().is_err());
    }

    #[test]
    fn started_primary_can_relocate() {
        let r = Routing::new_initializing(shard_id(), "node-1", true, "alloc-1", RecoverySource::EmptyStore)
            .moved_to_started()
            .unwrap();
        let relocating = r.moved_to_relocating("node-2").unwrap();
        assert_eq!(relocating.state, RoutingState::Relocating);
        assert_eq!(relocating.relocating_target_node_id.as_deref(), Some("node-2"));
    }

    #[test]
    fn relocating_can_finalize_to_relocated_and_then_is_terminal() {
        let r = Routing::new_initializing(shard_id(), "node-1", true, "alloc-1", RecoverySource::EmptyStore)
            .moved_to_started()
            .unwrap()
            .moved_to_relocating("node-2")
            .unwrap();
        let relocated = r.moved_to_relocated().unwrap();
        assert_eq!(relocated.state, RoutingState::Relocated);
        assert!(relocated.moved_to_relocated().is_err());
        assert!(relocated.moved_to_started().is_err());
    }

    #[test]
    fn is_primary_mode_true_only_for_started_primary() {
        let replica = Routing::new_initializing(shard_id(), "node-1", false, "alloc-1", RecoverySource::Peer)
            .moved_to_started()
            .unwrap();
        assert!(!replica.is_primary_mode());

        let started_primary = Routing::new_initializing(shard_id(), "node-1", true, "alloc-1", RecoverySource::EmptyStore)
            .moved_to_started()
            .unwrap();
        assert!(started_primary.is_primary_mode());

        let relocated_primary = started_primary.moved_to_relocating("node-2").unwrap().moved_to_relocated().unwrap();
        assert!(!relocated_primary.is_primary_mode());
    }
}
