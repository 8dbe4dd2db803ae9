//! Flattened views of the replicated room state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use gpumesh_core::{PeerId, WorkerRecord};

/// Point-in-time view of a room, as returned by `RoomRegistry::get_state`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub room_id: String,
    pub workers: BTreeMap<PeerId, WorkerRecord>,
    /// Only set when it names a present member.
    pub admin_peer_id: Option<PeerId>,
    pub version: u64,
}

impl RoomSnapshot {
    pub fn member_ids(&self) -> Vec<PeerId> {
        self.workers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}
