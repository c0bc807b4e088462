//! Commands every entity type understands. Each type's controller falls back
//! to the controller built here.

mod replication;
mod resource;

pub use replication::{ForceClone, ForceClonePayload, SiblingUpdate};
pub use resource::{GetResource, Subscribe, Unsubscribe};

use crate::controller::CommandController;
use crate::error::MeshError;

pub const SUBSCRIBE: &str = "subscribe";
pub const UNSUBSCRIBE: &str = "unsubscribe";
pub const GET_RESOURCE: &str = "getResource";
pub const SIBLING_UPDATE: &str = "siblingUpdate";
pub const FORCE_CLONE: &str = "forceClone";
/// Handled where envelopes arrive, never dispatched to an entity.
pub const RECEIVE_CONFIRM: &str = "receiveConfirm";

/// Whether `slug` runs on whichever node it is addressed to, bypassing the
/// managing-node routing.
pub fn is_direct(slug: &str) -> bool {
    matches!(
        slug,
        SUBSCRIBE | UNSUBSCRIBE | GET_RESOURCE | SIBLING_UPDATE | FORCE_CLONE
    )
}

pub fn core_controller() -> Result<CommandController, MeshError> {
    let mut controller = CommandController::new();
    controller.register(Subscribe::new())?;
    controller.register(Unsubscribe::new())?;
    controller.register(GetResource::new())?;
    controller.register(SiblingUpdate::new())?;
    controller.register(ForceClone::new())?;
    Ok(controller)
}
