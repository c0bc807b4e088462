use super::EntityId;
use serde::{Deserialize, Serialize};

/// Non-owning handle to an entity. Always resolved through the entity table.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct Reference {
    pub target_id: EntityId,
}

impl Reference {
    pub fn new(target_id: EntityId) -> Self {
        Self { target_id }
    }
}

/// Handle to an entity that is replicated to failover servers.
///
/// The sibling servers receive every distributed write and serve reads when
/// the home server is not up.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RedundantReference {
    pub target_id: EntityId,
    pub sibling_server_ids: Vec<i64>,
}

impl RedundantReference {
    pub fn new(target_id: EntityId, sibling_server_ids: Vec<i64>) -> Self {
        Self {
            target_id,
            sibling_server_ids,
        }
    }

    pub fn reference(&self) -> Reference {
        Reference::new(self.target_id)
    }
}
