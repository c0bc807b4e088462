use super::{FORCE_CLONE, SIBLING_UPDATE};
use crate::codec::{state_hash, EntityRecord};
use crate::command::{encode_reply, Command, CommandContext, CommandSettings};
use crate::entity::Entity;
use crate::envelope::CommandEnvelope;
use crate::error::MeshError;
use crate::permission::IsReplicaPeer;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Apply a write the managing node already executed and authorized.
///
/// The payload is the original envelope. Replies with the hash of the
/// sibling's state after the write and takes over the version the managing
/// node stamped on the update.
pub struct SiblingUpdate {
    settings: CommandSettings,
}

impl SiblingUpdate {
    pub fn new() -> Self {
        Self {
            settings: CommandSettings::new().require(IsReplicaPeer).thread_safe(),
        }
    }
}

impl Default for SiblingUpdate {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Command for SiblingUpdate {
    fn slug(&self) -> &str {
        SIBLING_UPDATE
    }

    fn settings(&self) -> &CommandSettings {
        &self.settings
    }

    async fn execute(
        &self,
        ctx: &CommandContext<'_>,
        target: &mut dyn Entity,
    ) -> Result<Vec<u8>, MeshError> {
        let inner = CommandEnvelope::from_bytes(ctx.payload)?;
        let controller = target.command_controller(ctx.node.registry())?;
        let command = controller
            .resolve(&inner.slug)
            .map_err(|_| MeshError::UnknownCommand {
                slug: inner.slug.clone(),
                target: Some(target.id()),
            })?;
        let inner_ctx = CommandContext::new(ctx.node, &inner, &inner.payload);
        controller
            .dispatch_trusted(&inner_ctx, command.as_ref(), target)
            .await?;
        match ctx.envelope.version() {
            Some(version) => target.core_mut().version = version,
            None => target.core_mut().version += 1,
        }
        let hash = state_hash(target)?;
        debug!(target = %target.id(), slug = %inner.slug, hash, "applied sibling update");
        encode_reply(&hash)
    }
}

/// Payload of [`ForceClone`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForceClonePayload {
    pub record: EntityRecord,
    /// Sibling servers of the entity, as known to the sender.
    pub siblings: Vec<i64>,
}

/// Overwrite a replica with the sender's copy. Used to seed new siblings and
/// to resynchronise siblings after a failed or rolled back write.
pub struct ForceClone {
    settings: CommandSettings,
}

impl ForceClone {
    pub fn new() -> Self {
        Self {
            settings: CommandSettings::new().require(IsReplicaPeer).thread_safe(),
        }
    }
}

impl Default for ForceClone {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Command for ForceClone {
    fn slug(&self) -> &str {
        FORCE_CLONE
    }

    fn settings(&self) -> &CommandSettings {
        &self.settings
    }

    async fn execute(
        &self,
        ctx: &CommandContext<'_>,
        target: &mut dyn Entity,
    ) -> Result<Vec<u8>, MeshError> {
        let payload: ForceClonePayload = ctx.value()?;
        ctx.node.registry().restore_into(target, &payload.record)?;
        ctx.node
            .directory()
            .set_siblings(target.id(), payload.siblings);
        encode_reply(&state_hash(target)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::downcast_ref;
    use crate::testing::{CounterEntity, TestMesh};
    use crate::types::{EntityId, MessageId};

    fn replica() -> CounterEntity {
        let mut counter = CounterEntity::new(EntityId::from_parts(1, 5));
        counter.core.id = EntityId::from_parts(1, 100);
        counter
    }

    #[tokio::test]
    async fn sibling_update_applies_inner_command() {
        let mesh = TestMesh::new(&[1, 2]).await;
        let sibling = mesh.node(2);
        let inner = CommandEnvelope::with_value(
            EntityId::from_parts(3, 9),
            EntityId::from_parts(1, 100),
            MessageId(5),
            "increment",
            &4i64,
        )
        .unwrap();
        let mut outer = CommandEnvelope::new(
            EntityId::server(1),
            EntityId::from_parts(1, 100),
            MessageId(6),
            SIBLING_UPDATE,
            inner.to_bytes().unwrap(),
        );
        outer.set_version(3);
        let ctx = CommandContext::new(&sibling, &outer, &outer.payload);
        let mut target = replica();

        let reply = SiblingUpdate::new().execute(&ctx, &mut target).await.unwrap();
        let hash: u64 = rmp_serde::from_slice(&reply).unwrap();
        assert_eq!(target.value, 4);
        assert_eq!(target.core.version, 3);
        assert_eq!(hash, state_hash(&target).unwrap());
        mesh.shutdown();
    }

    #[tokio::test]
    async fn force_clone_overwrites_state_and_siblings() {
        let mesh = TestMesh::new(&[1, 2]).await;
        let sibling = mesh.node(2);
        let mut source = replica();
        source.value = 77;
        let payload = ForceClonePayload {
            record: sibling.registry().encode(&source, true).unwrap(),
            siblings: vec![2, 3],
        };
        let envelope = CommandEnvelope::with_value(
            EntityId::server(1),
            EntityId::from_parts(1, 100),
            MessageId(1),
            FORCE_CLONE,
            &payload,
        )
        .unwrap();
        let ctx = CommandContext::new(&sibling, &envelope, &envelope.payload);
        let mut target = replica();

        ForceClone::new().execute(&ctx, &mut target).await.unwrap();
        assert_eq!(downcast_ref::<CounterEntity>(&target).unwrap().value, 77);
        assert_eq!(
            sibling.directory().siblings(&EntityId::from_parts(1, 100)),
            vec![2, 3]
        );
        mesh.shutdown();
    }
}
