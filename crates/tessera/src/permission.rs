use crate::access::AccessMode;
use crate::command::CommandContext;
use crate::entity::Entity;
use crate::types::EntityId;

/// A precondition a command requires before it may execute.
///
/// `sender` is usually the envelope's sender; during token delegation it is
/// the token's issuer instead.
pub trait Permission: Send + Sync {
    fn name(&self) -> &str;

    fn check(&self, ctx: &CommandContext<'_>, target: &dyn Entity, sender: &EntityId) -> bool;
}

/// The sender owns the target.
#[derive(Debug, Clone, Copy)]
pub struct IsOwner;

impl Permission for IsOwner {
    fn name(&self) -> &str {
        "IsOwner"
    }

    fn check(&self, _ctx: &CommandContext<'_>, target: &dyn Entity, sender: &EntityId) -> bool {
        target.access().owner == *sender
    }
}

/// The target's access rules allow the sender `mode`.
#[derive(Debug, Clone, Copy)]
pub struct HasAccess(pub AccessMode);

impl Permission for HasAccess {
    fn name(&self) -> &str {
        match self.0 {
            AccessMode::READ => "HasReadAccess",
            AccessMode::WRITE => "HasWriteAccess",
            AccessMode::CHANGE_PERMISSIONS => "HasChangePermissionsAccess",
            _ => "HasAccess",
        }
    }

    fn check(&self, _ctx: &CommandContext<'_>, target: &dyn Entity, sender: &EntityId) -> bool {
        target.is_allowed_access(sender, self.0)
    }
}

/// The sender is a server rather than an entity hosted on one.
#[derive(Debug, Clone, Copy)]
pub struct IsServer;

impl Permission for IsServer {
    fn name(&self) -> &str {
        "IsServer"
    }

    fn check(&self, _ctx: &CommandContext<'_>, _target: &dyn Entity, sender: &EntityId) -> bool {
        sender.is_server() && !sender.is_local()
    }
}

/// The sender lives on the target's home server.
#[derive(Debug, Clone, Copy)]
pub struct SameServer;

impl Permission for SameServer {
    fn name(&self) -> &str {
        "SameServer"
    }

    fn check(&self, _ctx: &CommandContext<'_>, target: &dyn Entity, sender: &EntityId) -> bool {
        sender.server_id == target.id().server_id
    }
}

/// The sender is a server that manages or replicates the target.
#[derive(Debug, Clone, Copy)]
pub struct IsReplicaPeer;

impl Permission for IsReplicaPeer {
    fn name(&self) -> &str {
        "IsReplicaPeer"
    }

    fn check(&self, ctx: &CommandContext<'_>, target: &dyn Entity, sender: &EntityId) -> bool {
        sender.is_server()
            && ctx
                .node
                .directory()
                .is_replica_peer(&target.id(), sender.server_id)
    }
}
