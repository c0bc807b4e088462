use crate::types::{EntityId, RedundantReference};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Last-known liveness of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ServerState {
    #[default]
    Unknown,
    Up,
    Down,
}

/// What this node knows about other servers and about which servers
/// replicate which entities.
#[derive(Default)]
pub struct ServerDirectory {
    states: DashMap<i64, ServerState>,
    siblings: DashMap<EntityId, Vec<i64>>,
}

impl ServerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, server_id: i64) -> ServerState {
        self.states
            .get(&server_id)
            .map(|s| *s.value())
            .unwrap_or_default()
    }

    /// Record a new state. Returns the previous one.
    pub fn set_state(&self, server_id: i64, state: ServerState) -> ServerState {
        self.states
            .insert(server_id, state)
            .unwrap_or_default()
    }

    pub fn set_siblings(&self, id: EntityId, sibling_server_ids: Vec<i64>) {
        if sibling_server_ids.is_empty() {
            self.siblings.remove(&id);
        } else {
            self.siblings.insert(id, sibling_server_ids);
        }
    }

    pub fn register_reference(&self, reference: &RedundantReference) {
        self.set_siblings(reference.target_id, reference.sibling_server_ids.clone());
    }

    pub fn siblings(&self, id: &EntityId) -> Vec<i64> {
        self.siblings
            .get(id)
            .map(|s| s.value().clone())
            .unwrap_or_default()
    }

    pub fn forget_entity(&self, id: &EntityId) {
        self.siblings.remove(id);
    }

    /// Server currently authoritative for writes to `id`: the home server if
    /// it is up, else the first sibling reporting up, else the home server
    /// anyway.
    pub fn managing_node_for(&self, id: &EntityId) -> i64 {
        let home = id.server_id;
        if self.state(home) == ServerState::Up {
            return home;
        }
        self.siblings(id)
            .into_iter()
            .find(|s| self.state(*s) == ServerState::Up)
            .unwrap_or(home)
    }

    /// Whether `server_id` is the home, the manager or a sibling of `id`.
    pub fn is_replica_peer(&self, id: &EntityId, server_id: i64) -> bool {
        server_id == id.server_id
            || server_id == self.managing_node_for(id)
            || self.siblings(id).contains(&server_id)
    }

    /// The redundant reference this directory knows for `id`.
    pub fn reference(&self, id: EntityId) -> RedundantReference {
        RedundantReference::new(id, self.siblings(&id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity() -> EntityId {
        EntityId::from_parts(10, 42)
    }

    #[test]
    fn home_server_manages_when_up() {
        let dir = ServerDirectory::new();
        dir.set_siblings(entity(), vec![11, 12]);
        dir.set_state(10, ServerState::Up);
        dir.set_state(11, ServerState::Up);
        assert_eq!(dir.managing_node_for(&entity()), 10);
    }

    #[test]
    fn first_live_sibling_takes_over() {
        let dir = ServerDirectory::new();
        dir.register_reference(&RedundantReference::new(entity(), vec![11, 12]));
        dir.set_state(10, ServerState::Down);
        dir.set_state(11, ServerState::Down);
        dir.set_state(12, ServerState::Up);
        assert_eq!(dir.managing_node_for(&entity()), 12);
    }

    #[test]
    fn falls_back_to_home_when_nobody_is_up() {
        let dir = ServerDirectory::new();
        dir.set_siblings(entity(), vec![11]);
        assert_eq!(dir.state(11), ServerState::Unknown);
        assert_eq!(dir.managing_node_for(&entity()), 10);
    }

    #[test]
    fn replica_peers() {
        let dir = ServerDirectory::new();
        dir.set_siblings(entity(), vec![11]);
        assert!(dir.is_replica_peer(&entity(), 10));
        assert!(dir.is_replica_peer(&entity(), 11));
        assert!(!dir.is_replica_peer(&entity(), 13));
        dir.set_siblings(entity(), Vec::new());
        assert!(!dir.is_replica_peer(&entity(), 11));
        assert!(dir.reference(entity()).sibling_server_ids.is_empty());
    }

    #[test]
    fn set_state_returns_previous() {
        let dir = ServerDirectory::new();
        assert_eq!(dir.set_state(3, ServerState::Up), ServerState::Unknown);
        assert_eq!(dir.set_state(3, ServerState::Down), ServerState::Up);
    }
}
