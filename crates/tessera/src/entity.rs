use crate::access::{Access, AccessMode};
use crate::codec::EntityRegistry;
use crate::controller::CommandController;
use crate::error::MeshError;
use crate::types::EntityId;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::Arc;

/// Identity and access of an entity. Every entity embeds exactly one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityCore {
    pub id: EntityId,
    pub access: Access,
    /// Distributed writes applied so far, as numbered by the managing node.
    #[serde(default)]
    pub version: u64,
}

impl EntityCore {
    /// Core for a new entity that has not been assigned an id yet.
    pub fn new(owner: EntityId) -> Self {
        Self {
            id: EntityId::ZERO,
            access: Access::new(owner),
            version: 0,
        }
    }

    pub fn with_id(id: EntityId, owner: EntityId) -> Self {
        Self {
            id,
            access: Access::new(owner),
            version: 0,
        }
    }
}

/// An addressable, owned piece of distributed state.
///
/// Entities never hold other entities: links between them are [`EntityId`]s
/// resolved through the entity table. The state half of an entity (everything
/// but the [`EntityCore`]) is opaque to the mesh and travels as the bytes
/// produced by [`encode_state`](Entity::encode_state).
pub trait Entity: Send + Sync + 'static {
    /// Tag the entity type was registered under in the
    /// [`EntityRegistry`](crate::codec::EntityRegistry).
    fn type_tag(&self) -> &'static str;

    fn core(&self) -> &EntityCore;

    fn core_mut(&mut self) -> &mut EntityCore;

    fn encode_state(&self) -> Result<Vec<u8>, MeshError>;

    /// Replace the state with previously encoded bytes.
    fn apply_state(&mut self, state: &[u8]) -> Result<(), MeshError>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    fn id(&self) -> EntityId {
        self.core().id
    }

    fn access(&self) -> &Access {
        &self.core().access
    }

    fn is_allowed_access(&self, requester: &EntityId, mode: AccessMode) -> bool {
        let core = self.core();
        core.access.is_allowed(requester, mode, &core.id)
    }

    /// Controller that resolves commands addressed to this entity. Defaults to
    /// the controller registered for the entity's type tag.
    fn command_controller(
        &self,
        registry: &EntityRegistry,
    ) -> Result<Arc<CommandController>, MeshError> {
        registry.controller_for(self.type_tag())
    }
}

/// Downcast a dispatched entity to its concrete type.
pub fn downcast_mut<T: Entity>(entity: &mut dyn Entity) -> Result<&mut T, MeshError> {
    let tag = entity.type_tag();
    entity
        .as_any_mut()
        .downcast_mut::<T>()
        .ok_or_else(|| MeshError::HandlerFailed {
            reason: format!("entity of type `{tag}` is not a {}", std::any::type_name::<T>()),
        })
}

pub fn downcast_ref<T: Entity>(entity: &dyn Entity) -> Result<&T, MeshError> {
    let tag = entity.type_tag();
    entity
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| MeshError::HandlerFailed {
            reason: format!("entity of type `{tag}` is not a {}", std::any::type_name::<T>()),
        })
}
