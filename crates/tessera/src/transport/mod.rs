//! Transport collaborator. The mesh core never opens sockets itself: each
//! wire protocol implements [`CommandTransmit`].

pub mod memory;

use crate::envelope::CommandEnvelope;
use crate::error::MeshError;
use async_trait::async_trait;
use std::sync::Arc;

/// Callback invoked for every envelope arriving at this node.
pub type ReceiveHandler = Arc<dyn Fn(CommandEnvelope) + Send + Sync>;

#[async_trait]
pub trait CommandTransmit: Send + Sync {
    /// Hand `envelope` to the node identified by `server_id`.
    ///
    /// Fails with `ServerUnavailable` when the server cannot be reached; the
    /// caller decides whether to park the envelope for redelivery.
    async fn send(&self, server_id: i64, envelope: CommandEnvelope) -> Result<(), MeshError>;

    /// Install the handler for incoming envelopes, replacing any earlier one.
    fn on_receive(&self, handler: ReceiveHandler);
}

/// Transport of an offline node: nothing is reachable.
pub struct NoopTransmit;

#[async_trait]
impl CommandTransmit for NoopTransmit {
    async fn send(&self, server_id: i64, _envelope: CommandEnvelope) -> Result<(), MeshError> {
        Err(MeshError::ServerUnavailable {
            server_id,
            source: None,
        })
    }

    fn on_receive(&self, _handler: ReceiveHandler) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntityId, MessageId};

    #[tokio::test]
    async fn noop_transmit_is_unavailable() {
        let envelope = CommandEnvelope::new(
            EntityId::from_parts(1, 1),
            EntityId::from_parts(2, 1),
            MessageId(1),
            "increment",
            Vec::new(),
        );
        let err = NoopTransmit.send(2, envelope).await.unwrap_err();
        assert!(matches!(err, MeshError::ServerUnavailable { server_id: 2, .. }));
    }
}
