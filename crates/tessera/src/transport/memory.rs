use super::{CommandTransmit, ReceiveHandler};
use crate::envelope::CommandEnvelope;
use crate::error::MeshError;
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// In-process network connecting any number of nodes.
///
/// Every envelope is encoded and decoded on the way through, so anything that
/// would not survive the wire does not survive here either. Servers can be
/// isolated (sends fail with `ServerUnavailable`), black-holed (sends
/// succeed but nothing arrives) or held (arrivals wait for `release`).
#[derive(Default)]
pub struct MemoryNetwork {
    handlers: DashMap<i64, ReceiveHandler>,
    isolated: DashSet<i64>,
    black_holed: DashSet<i64>,
    held: DashSet<i64>,
    in_flight: Mutex<Vec<(i64, CommandEnvelope)>>,
    delivered: DashMap<String, usize>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Transport endpoint for the node with `server_id`.
    pub fn endpoint(self: &Arc<Self>, server_id: i64) -> Arc<MemoryTransmit> {
        Arc::new(MemoryTransmit {
            server_id,
            network: Arc::clone(self),
        })
    }

    /// Make `server_id` unreachable in both directions.
    pub fn isolate(&self, server_id: i64) {
        self.isolated.insert(server_id);
    }

    /// Silently drop everything sent to `server_id`.
    pub fn black_hole(&self, server_id: i64) {
        self.black_holed.insert(server_id);
    }

    pub fn heal(&self, server_id: i64) {
        self.isolated.remove(&server_id);
        self.black_holed.remove(&server_id);
    }

    /// Accept envelopes for `server_id` but keep them until [`release`](Self::release).
    pub fn hold(&self, server_id: i64) {
        self.held.insert(server_id);
    }

    /// Deliver everything held for `server_id` in the order it was sent.
    pub fn release(&self, server_id: i64) {
        self.held.remove(&server_id);
        let waiting: Vec<CommandEnvelope> = {
            let mut in_flight = self.in_flight.lock();
            let (hits, kept): (Vec<_>, Vec<_>) =
                in_flight.drain(..).partition(|(to, _)| *to == server_id);
            *in_flight = kept;
            hits.into_iter().map(|(_, envelope)| envelope).collect()
        };
        let Some(handler) = self.handlers.get(&server_id).map(|h| Arc::clone(h.value())) else {
            return;
        };
        for envelope in waiting {
            *self.delivered.entry(envelope.slug.clone()).or_insert(0) += 1;
            handler(envelope);
        }
    }

    /// Envelopes with `slug` delivered so far.
    pub fn delivered(&self, slug: &str) -> usize {
        self.delivered.get(slug).map(|c| *c).unwrap_or(0)
    }

    fn deliver(&self, from: i64, to: i64, envelope: CommandEnvelope) -> Result<(), MeshError> {
        if self.isolated.contains(&from) || self.isolated.contains(&to) {
            return Err(MeshError::ServerUnavailable {
                server_id: to,
                source: None,
            });
        }
        let handler = self
            .handlers
            .get(&to)
            .map(|h| Arc::clone(h.value()))
            .ok_or(MeshError::ServerUnavailable {
                server_id: to,
                source: None,
            })?;
        if self.black_holed.contains(&to) {
            debug!(from, to, slug = %envelope.slug, "dropped by black hole");
            return Ok(());
        }
        let envelope = CommandEnvelope::from_bytes(&envelope.to_bytes()?)?;
        if self.held.contains(&to) {
            self.in_flight.lock().push((to, envelope));
            return Ok(());
        }
        *self.delivered.entry(envelope.slug.clone()).or_insert(0) += 1;
        handler(envelope);
        Ok(())
    }
}

/// One node's view of a [`MemoryNetwork`].
pub struct MemoryTransmit {
    server_id: i64,
    network: Arc<MemoryNetwork>,
}

impl MemoryTransmit {
    pub fn server_id(&self) -> i64 {
        self.server_id
    }
}

#[async_trait]
impl CommandTransmit for MemoryTransmit {
    async fn send(&self, server_id: i64, envelope: CommandEnvelope) -> Result<(), MeshError> {
        self.network.deliver(self.server_id, server_id, envelope)
    }

    fn on_receive(&self, handler: ReceiveHandler) {
        self.network.handlers.insert(self.server_id, handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntityId, MessageId};

    fn envelope(slug: &str) -> CommandEnvelope {
        CommandEnvelope::new(
            EntityId::from_parts(1, 1),
            EntityId::from_parts(2, 1),
            MessageId(1),
            slug,
            vec![7],
        )
    }

    fn collecting(network: &Arc<MemoryNetwork>, server_id: i64) -> Arc<Mutex<Vec<CommandEnvelope>>> {
        let inbox = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&inbox);
        network
            .endpoint(server_id)
            .on_receive(Arc::new(move |env: CommandEnvelope| sink.lock().push(env)));
        inbox
    }

    #[tokio::test]
    async fn delivers_to_registered_handler() {
        let network = MemoryNetwork::new();
        let inbox = collecting(&network, 2);
        let a = network.endpoint(1);

        a.send(2, envelope("increment")).await.unwrap();
        assert_eq!(inbox.lock().len(), 1);
        assert_eq!(inbox.lock()[0].payload, vec![7]);
        assert_eq!(network.delivered("increment"), 1);
    }

    #[tokio::test]
    async fn unknown_server_is_unavailable() {
        let network = MemoryNetwork::new();
        let err = network.endpoint(1).send(9, envelope("x")).await.unwrap_err();
        assert!(matches!(err, MeshError::ServerUnavailable { server_id: 9, .. }));
    }

    #[tokio::test]
    async fn isolate_black_hole_and_heal() {
        let network = MemoryNetwork::new();
        let inbox = collecting(&network, 2);
        let a = network.endpoint(1);

        network.isolate(2);
        assert!(a.send(2, envelope("x")).await.is_err());

        network.heal(2);
        network.black_hole(2);
        a.send(2, envelope("x")).await.unwrap();
        assert!(inbox.lock().is_empty());

        network.heal(2);
        a.send(2, envelope("x")).await.unwrap();
        assert_eq!(inbox.lock().len(), 1);
    }

    #[tokio::test]
    async fn held_envelopes_arrive_in_order_on_release() {
        let network = MemoryNetwork::new();
        let inbox = collecting(&network, 2);
        let a = network.endpoint(1);

        network.hold(2);
        a.send(2, envelope("first")).await.unwrap();
        a.send(2, envelope("second")).await.unwrap();
        assert!(inbox.lock().is_empty());
        assert_eq!(network.delivered("first"), 0);

        network.release(2);
        let slugs: Vec<String> = inbox.lock().iter().map(|e| e.slug.clone()).collect();
        assert_eq!(slugs, vec!["first", "second"]);
    }
}
