//! Cloning remote entities into the local table.
//!
//! A proxy is installed first so commands arriving while the copy is in
//! flight are buffered, then the requester subscribes at the managing node
//! and fetches the full record. Buffered commands are replayed against the
//! copy in arrival order before anything else can reach it.

use crate::codec::EntityRecord;
use crate::commands::{GET_RESOURCE, SUBSCRIBE};
use crate::entity::Entity;
use crate::entity_table::{EntitySlot, SlotContent};
use crate::error::MeshError;
use crate::node::MeshNode;
use crate::protocol::Step;
use crate::types::EntityId;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

impl MeshNode {
    /// Make a local, subscribed copy of the remote entity `id` on behalf of
    /// `requester`, an entity hosted on this node.
    ///
    /// Returns the resident slot right away when the entity is already here.
    /// Concurrent calls for the same id share a single fetch.
    #[instrument(skip(self), fields(%requester, %id))]
    pub async fn clone_and_subscribe(
        &self,
        requester: EntityId,
        id: EntityId,
    ) -> Result<Arc<EntitySlot>, MeshError> {
        if let Some(slot) = self.table().get(&id) {
            if !slot.is_proxy() {
                return Ok(slot);
            }
        }
        if requester.server_id != self.server_id() {
            return Err(MeshError::malformed(format!(
                "requester {requester} is not hosted on this node"
            )));
        }

        let lock = self
            .clone_locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let result = {
            let _guard = lock.lock().await;
            self.clone_locked(requester, id).await
        };
        self.clone_locks
            .remove_if(&id, |_, existing| Arc::ptr_eq(existing, &lock) && Arc::strong_count(existing) <= 2);
        result
    }

    /// Like [`clone_and_subscribe`](Self::clone_and_subscribe), but returns
    /// at once and hands the outcome to `on_complete`.
    pub fn clone_and_subscribe_with<F>(self: &Arc<Self>, requester: EntityId, id: EntityId, on_complete: F)
    where
        F: FnOnce(Result<Arc<EntitySlot>, MeshError>) + Send + 'static,
    {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            let result = node.clone_and_subscribe(requester, id).await;
            on_complete(result);
        });
    }

    async fn clone_locked(&self, requester: EntityId, id: EntityId) -> Result<Arc<EntitySlot>, MeshError> {
        if let Some(slot) = self.table().resolve(&id).await? {
            if !slot.is_proxy() {
                return Ok(slot);
            }
        }
        let manager = self.directory().managing_node_for(&id);
        if manager == self.server_id() {
            return Err(MeshError::ObjectNotFound { id });
        }

        let slot = match self.table().install_proxy(id) {
            Some(slot) => slot,
            None => match self.table().get(&id) {
                Some(slot) if !slot.is_proxy() => return Ok(slot),
                Some(slot) => slot,
                None => return Err(MeshError::ObjectNotFound { id }),
            },
        };

        match self.fetch_remote(requester, id, manager).await {
            Ok(entity) => {
                self.complete_clone(&slot, entity, id).await;
                Ok(slot)
            }
            Err(err) => {
                warn!(%err, "clone failed");
                self.abandon_clone(&slot, id, manager).await;
                Err(err)
            }
        }
    }

    async fn fetch_remote(
        &self,
        requester: EntityId,
        id: EntityId,
        manager: i64,
    ) -> Result<Box<dyn Entity>, MeshError> {
        let timeout = self.config().clone_timeout;

        let mut subscribe = self.envelope(requester, id, SUBSCRIBE, &())?;
        self.sign(&mut subscribe)?;
        self.request(manager, subscribe, timeout).await?;

        let mut fetch = self.envelope(requester, id, GET_RESOURCE, &())?;
        self.sign(&mut fetch)?;
        let bytes = self.request(manager, fetch, timeout).await?;
        let record: EntityRecord =
            rmp_serde::from_slice(&bytes).map_err(|e| MeshError::decode("entity record", e))?;
        debug!(tag = %record.tag, "fetched remote entity");
        self.registry().decode(&record)
    }

    /// Swap the proxy for the fetched copy and replay what it buffered while
    /// still holding the slot. Writes the managing node pushed while the
    /// record was in flight are skipped when the record's version already
    /// includes them; commands from local senders all run.
    async fn complete_clone(&self, slot: &EntitySlot, entity: Box<dyn Entity>, id: EntityId) {
        let mut content = slot.lock().await;
        let buffered = slot.promote(&mut content, entity);
        self.table().proxy_promoted();
        debug!(replayed = buffered.len(), "clone complete");

        let manager = self.directory().managing_node_for(&id);
        for envelope in buffered {
            let outcome = match self.execute_on_slot(&mut content, &envelope, manager).await {
                Ok(Step::Done(outcome)) => Ok(outcome),
                Ok(Step::Replicate(plan)) => self.settle(&mut content, &envelope, plan).await,
                Err(err) => Err(err),
            };
            self.finish(&envelope, outcome).await;
        }
    }

    /// Drop the proxy and send what it buffered on to the managing node.
    /// Updates pushed by replica peers are discarded since the manager
    /// already has them.
    async fn abandon_clone(&self, slot: &EntitySlot, id: EntityId, manager: i64) {
        let buffered = {
            let mut content = slot.lock().await;
            self.table().remove(&id);
            match &mut *content {
                SlotContent::Proxy(proxy) => {
                    proxy.abandoned = true;
                    std::mem::take(&mut proxy.buffered)
                }
                SlotContent::Live(_) => Vec::new(),
            }
        };
        for envelope in buffered {
            if envelope.sender_id.is_server()
                && self
                    .directory()
                    .is_replica_peer(&envelope.recipient_id, envelope.sender_id.server_id)
            {
                continue;
            }
            if let Err(err) = self.forward(manager, &envelope).await {
                self.finish(&envelope, Err(err)).await;
            }
        }
    }
}
