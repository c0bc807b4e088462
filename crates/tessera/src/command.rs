use crate::entity::Entity;
use crate::envelope::CommandEnvelope;
use crate::error::MeshError;
use crate::node::MeshNode;
use crate::permission::Permission;
use crate::types::EntityId;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Execution contract of a command.
#[derive(Clone, Default)]
pub struct CommandSettings {
    /// May run outside the sender's sticky worker.
    pub thread_safe: bool,
    /// The command changes state that must reach the managing node, its
    /// siblings and the subscribers.
    pub distribute: bool,
    /// The payload is sealed with the session channel and must be opened
    /// before execution.
    pub encrypted: bool,
    /// Apply on a cached copy immediately in addition to forwarding. The
    /// command may then apply twice on that node, so its handler must be
    /// idempotent.
    pub local_propagation: bool,
    /// Do not send the automatic success confirmation.
    pub disable_execute_confirm: bool,
    /// Every permission must pass before the command executes.
    pub permissions: Vec<Arc<dyn Permission>>,
}

impl CommandSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn distributed() -> Self {
        Self {
            distribute: true,
            ..Default::default()
        }
    }

    pub fn require(mut self, permission: impl Permission + 'static) -> Self {
        self.permissions.push(Arc::new(permission));
        self
    }

    pub fn thread_safe(mut self) -> Self {
        self.thread_safe = true;
        self
    }

    pub fn encrypted(mut self) -> Self {
        self.encrypted = true;
        self
    }

    pub fn local_propagation(mut self) -> Self {
        self.local_propagation = true;
        self
    }

    pub fn without_confirm(mut self) -> Self {
        self.disable_execute_confirm = true;
        self
    }
}

impl fmt::Debug for CommandSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let permissions: Vec<&str> = self.permissions.iter().map(|p| p.name()).collect();
        f.debug_struct("CommandSettings")
            .field("thread_safe", &self.thread_safe)
            .field("distribute", &self.distribute)
            .field("encrypted", &self.encrypted)
            .field("local_propagation", &self.local_propagation)
            .field("disable_execute_confirm", &self.disable_execute_confirm)
            .field("permissions", &permissions)
            .finish()
    }
}

/// What a command sees while it executes.
pub struct CommandContext<'a> {
    pub node: &'a MeshNode,
    pub envelope: &'a CommandEnvelope,
    /// Payload after decryption.
    pub payload: &'a [u8],
}

impl<'a> CommandContext<'a> {
    pub fn new(node: &'a MeshNode, envelope: &'a CommandEnvelope, payload: &'a [u8]) -> Self {
        Self {
            node,
            envelope,
            payload,
        }
    }

    pub fn sender(&self) -> EntityId {
        self.envelope.sender_id
    }

    /// Decode the payload as `T`.
    pub fn value<T: serde::de::DeserializeOwned>(&self) -> Result<T, MeshError> {
        rmp_serde::from_slice(self.payload).map_err(|e| MeshError::decode("command payload", e))
    }
}

/// Encode a command return value.
pub fn encode_reply<T: Serialize>(value: &T) -> Result<Vec<u8>, MeshError> {
    rmp_serde::to_vec(value).map_err(|e| MeshError::encode("command reply", e))
}

/// A state-changing or querying operation on an entity, dispatched by slug.
#[async_trait]
pub trait Command: Send + Sync + 'static {
    fn slug(&self) -> &str;

    fn settings(&self) -> &CommandSettings;

    /// Run against `target`. The returned bytes are the MessagePack-encoded
    /// reply delivered to the sender (empty for none).
    async fn execute(
        &self,
        ctx: &CommandContext<'_>,
        target: &mut dyn Entity,
    ) -> Result<Vec<u8>, MeshError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::AccessMode;
    use crate::permission::{HasAccess, IsOwner};

    #[test]
    fn settings_builder() {
        let settings = CommandSettings::distributed()
            .local_propagation()
            .require(IsOwner)
            .require(HasAccess(AccessMode::WRITE));
        assert!(settings.distribute);
        assert!(settings.local_propagation);
        assert!(!settings.encrypted);
        assert_eq!(settings.permissions.len(), 2);

        let printed = format!("{settings:?}");
        assert!(printed.contains("IsOwner"), "got: {printed}");
    }

    #[test]
    fn defaults_are_all_off() {
        let settings = CommandSettings::new();
        assert!(!settings.thread_safe);
        assert!(!settings.distribute);
        assert!(!settings.disable_execute_confirm);
        assert!(settings.permissions.is_empty());
    }
}
