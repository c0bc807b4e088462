//! Distributed entity ownership.
//!
//! Every entity has a globally unique [`EntityId`](types::EntityId) that
//! names the server it lives on. Commands are envelopes addressed to an id;
//! a [`MeshNode`](node::MeshNode) routes each one to the entity's managing
//! node, checks permissions (optionally delegated through signed tokens),
//! executes it, replicates the write to sibling servers and confirms the
//! outcome back to the sender exactly once.
//!
//! ```text
//! let node = MeshNode::builder(NodeConfig::for_server(1))
//!     .transport(transport)
//!     .build()
//!     .await?;
//! node.register_entity::<Counter>()?;
//! let id = node.create_entity(Counter::new(owner))?;
//! let value: i64 = node
//!     .send_command(owner, id, "increment", &1i64)
//!     .await?
//!     .value(node.config().reply_timeout)
//!     .await?;
//! ```

pub mod access;
pub mod callbacks;
mod clone;
pub mod codec;
pub mod command;
pub mod commands;
pub mod config;
pub mod controller;
pub mod crypto;
pub mod dedup;
pub mod directory;
pub mod entity;
pub mod entity_table;
pub mod envelope;
pub mod error;
pub mod hash;
pub mod message_id;
pub mod metrics;
pub mod node;
pub mod outbox;
pub mod permission;
pub mod persistence;
mod protocol;
pub mod reply;
pub mod rollback;
pub mod storage;
pub mod testing;
pub mod token;
pub mod transport;
pub mod types;
mod worker;

/// Commonly used items.
pub mod prelude {
    pub use crate::access::{Access, AccessMode, AccessScope};
    pub use crate::codec::EntityType;
    pub use crate::command::{encode_reply, Command, CommandContext, CommandSettings};
    pub use crate::config::NodeConfig;
    pub use crate::controller::CommandController;
    pub use crate::entity::{downcast_mut, downcast_ref, Entity, EntityCore};
    pub use crate::envelope::CommandEnvelope;
    pub use crate::error::MeshError;
    pub use crate::node::{MeshNode, MeshNodeBuilder};
    pub use crate::permission::{HasAccess, IsOwner, IsReplicaPeer, IsServer, Permission, SameServer};
    pub use crate::token::{Scope, Token, TokenBuilder};
    pub use crate::types::{EntityId, MessageId, RedundantReference};
}
