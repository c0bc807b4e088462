//! Tagged encoding of heterogeneous entities.
//!
//! The entity table stores many entity types behind `Box<dyn Entity>`. On the
//! wire and on disk each one is an [`EntityRecord`]: the registered type tag,
//! the id, optionally the access rules, and the opaque state bytes. The
//! [`EntityRegistry`] maps tags back to decoders and command controllers.

use crate::access::Access;
use crate::controller::CommandController;
use crate::entity::{Entity, EntityCore};
use crate::error::MeshError;
use crate::hash::hash64;
use crate::types::EntityId;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Serialized entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub tag: String,
    pub id: EntityId,
    /// `None` in public copies.
    pub access: Option<Access>,
    pub state: Vec<u8>,
    /// Version of the entity when the record was taken.
    #[serde(default)]
    pub version: u64,
}

/// What is stored under `res/<id>`: either an entity or a tombstone
/// forwarding lookups of a retired id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoredRecord {
    Entity(EntityRecord),
    Redirect { target: EntityId },
}

impl StoredRecord {
    pub fn to_bytes(&self) -> Result<Vec<u8>, MeshError> {
        rmp_serde::to_vec(self).map_err(|e| MeshError::encode("stored record", e))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MeshError> {
        rmp_serde::from_slice(bytes).map_err(|e| MeshError::decode("stored record", e))
    }
}

/// A concrete entity type the registry can decode.
pub trait EntityType: Entity + Sized {
    const TAG: &'static str;

    /// Rebuild an entity from its core and encoded state.
    fn decode(core: EntityCore, state: &[u8]) -> Result<Self, MeshError>;

    /// Register the type's commands. The controller already falls back to the
    /// node's core commands.
    fn register_commands(controller: &mut CommandController) -> Result<(), MeshError>;
}

pub type DecodeFn =
    Arc<dyn Fn(EntityCore, &[u8]) -> Result<Box<dyn Entity>, MeshError> + Send + Sync>;

struct EntityKind {
    controller: Arc<CommandController>,
    decode: DecodeFn,
}

/// Tag to decoder and controller map.
pub struct EntityRegistry {
    kinds: DashMap<String, EntityKind>,
    core: Arc<CommandController>,
}

impl EntityRegistry {
    pub fn new(core: Arc<CommandController>) -> Self {
        Self {
            kinds: DashMap::new(),
            core,
        }
    }

    /// Controller holding the built-in commands every type falls back to.
    pub fn core_controller(&self) -> &Arc<CommandController> {
        &self.core
    }

    pub fn register<T: EntityType>(&self) -> Result<(), MeshError> {
        let mut controller = CommandController::with_fallback(Arc::clone(&self.core));
        T::register_commands(&mut controller)?;
        let decode: DecodeFn = Arc::new(|core, state| {
            let entity = T::decode(core, state)?;
            Ok(Box::new(entity) as Box<dyn Entity>)
        });
        self.register_with(T::TAG, controller, decode)
    }

    /// Register a type by hand. Fails with `AlreadyRegistered` if the tag is taken.
    pub fn register_with(
        &self,
        tag: &str,
        controller: CommandController,
        decode: DecodeFn,
    ) -> Result<(), MeshError> {
        use dashmap::mapref::entry::Entry;
        match self.kinds.entry(tag.to_string()) {
            Entry::Occupied(_) => Err(MeshError::AlreadyRegistered {
                slug: tag.to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(EntityKind {
                    controller: Arc::new(controller),
                    decode,
                });
                Ok(())
            }
        }
    }

    pub fn is_registered(&self, tag: &str) -> bool {
        self.kinds.contains_key(tag)
    }

    pub fn controller_for(&self, tag: &str) -> Result<Arc<CommandController>, MeshError> {
        self.kinds
            .get(tag)
            .map(|kind| Arc::clone(&kind.controller))
            .ok_or_else(|| MeshError::malformed(format!("unknown entity type `{tag}`")))
    }

    pub fn encode(
        &self,
        entity: &dyn Entity,
        include_access: bool,
    ) -> Result<EntityRecord, MeshError> {
        let core = entity.core();
        Ok(EntityRecord {
            tag: entity.type_tag().to_string(),
            id: core.id,
            access: include_access.then(|| core.access.clone()),
            state: entity.encode_state()?,
            version: core.version,
        })
    }

    pub fn decode(&self, record: &EntityRecord) -> Result<Box<dyn Entity>, MeshError> {
        let decode = self
            .kinds
            .get(&record.tag)
            .map(|kind| Arc::clone(&kind.decode))
            .ok_or_else(|| MeshError::malformed(format!("unknown entity type `{}`", record.tag)))?;
        let core = EntityCore {
            id: record.id,
            access: record.access.clone().unwrap_or_default(),
            version: record.version,
        };
        decode(core, &record.state)
    }

    /// Independent copy of `entity` including its access rules.
    pub fn deep_copy(&self, entity: &dyn Entity) -> Result<Box<dyn Entity>, MeshError> {
        self.decode(&self.encode(entity, true)?)
    }

    /// Overwrite `target`'s access, state and version with the record's.
    pub fn restore_into(
        &self,
        target: &mut dyn Entity,
        record: &EntityRecord,
    ) -> Result<(), MeshError> {
        if record.tag != target.type_tag() {
            return Err(MeshError::malformed(format!(
                "cannot restore a `{}` record into a `{}`",
                record.tag,
                target.type_tag()
            )));
        }
        target.apply_state(&record.state)?;
        if let Some(access) = &record.access {
            target.core_mut().access = access.clone();
        }
        target.core_mut().version = record.version;
        Ok(())
    }
}

/// Hash of the entity's state bytes, compared between a managing node and
/// its siblings after a replicated write.
pub fn state_hash(entity: &dyn Entity) -> Result<u64, MeshError> {
    Ok(hash64(&entity.encode_state()?))
}
