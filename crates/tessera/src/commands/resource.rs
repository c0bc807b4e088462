use super::{GET_RESOURCE, SUBSCRIBE, UNSUBSCRIBE};
use crate::access::AccessMode;
use crate::command::{encode_reply, Command, CommandContext, CommandSettings};
use crate::entity::Entity;
use crate::error::MeshError;
use crate::permission::HasAccess;
use async_trait::async_trait;
use tracing::debug;

/// Push future distributed writes of the target to the sender's server.
pub struct Subscribe {
    settings: CommandSettings,
}

impl Subscribe {
    pub fn new() -> Self {
        Self {
            settings: CommandSettings::new()
                .require(HasAccess(AccessMode::READ))
                .thread_safe(),
        }
    }
}

impl Default for Subscribe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Command for Subscribe {
    fn slug(&self) -> &str {
        SUBSCRIBE
    }

    fn settings(&self) -> &CommandSettings {
        &self.settings
    }

    async fn execute(
        &self,
        ctx: &CommandContext<'_>,
        target: &mut dyn Entity,
    ) -> Result<Vec<u8>, MeshError> {
        let server = ctx.sender().full_server_id();
        if target.core_mut().access.subscribe(server) {
            debug!(target = %target.id(), subscriber = %server, "subscribed");
        }
        Ok(Vec::new())
    }
}

pub struct Unsubscribe {
    settings: CommandSettings,
}

impl Unsubscribe {
    pub fn new() -> Self {
        Self {
            settings: CommandSettings::new().thread_safe(),
        }
    }
}

impl Default for Unsubscribe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Command for Unsubscribe {
    fn slug(&self) -> &str {
        UNSUBSCRIBE
    }

    fn settings(&self) -> &CommandSettings {
        &self.settings
    }

    async fn execute(
        &self,
        ctx: &CommandContext<'_>,
        target: &mut dyn Entity,
    ) -> Result<Vec<u8>, MeshError> {
        let server = ctx.sender().full_server_id();
        target.core_mut().access.unsubscribe(&server);
        Ok(Vec::new())
    }
}

/// Return the full record of the target, access rules included.
pub struct GetResource {
    settings: CommandSettings,
}

impl GetResource {
    pub fn new() -> Self {
        Self {
            settings: CommandSettings::new()
                .require(HasAccess(AccessMode::READ))
                .thread_safe(),
        }
    }
}

impl Default for GetResource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Command for GetResource {
    fn slug(&self) -> &str {
        GET_RESOURCE
    }

    fn settings(&self) -> &CommandSettings {
        &self.settings
    }

    async fn execute(
        &self,
        ctx: &CommandContext<'_>,
        target: &mut dyn Entity,
    ) -> Result<Vec<u8>, MeshError> {
        let record = ctx.node.registry().encode(target, true)?;
        encode_reply(&record)
    }
}
