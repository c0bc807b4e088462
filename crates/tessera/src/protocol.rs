//! Routing and execution of commands against the entity table.
//!
//! Every command for a networked entity is decided by its managing node:
//! the home server while it is up, otherwise the first live sibling. The
//! managing node snapshots the entity, executes, replicates the command to
//! the siblings and only keeps the write once every sibling reports the
//! same state hash. The wait for the siblings runs off the dispatch worker
//! while the entity stays locked; commands for the entity that arrive
//! meanwhile are parked and run in arrival order once it settles.
//!
//! Nodes holding a cached copy forward writes to the managing node and
//! apply them when the manager pushes them back. Every pushed write carries
//! the version the manager reached with it, so a copy skips writes its
//! state already includes.

use crate::codec::{state_hash, EntityRecord};
use crate::command::{Command, CommandContext, CommandSettings};
use crate::commands::ForceClonePayload;
use crate::commands::{self, FORCE_CLONE, SIBLING_UPDATE, SUBSCRIBE, UNSUBSCRIBE};
use crate::controller::CommandController;
use crate::entity::Entity;
use crate::entity_table::{EntitySlot, SlotContent};
use crate::envelope::CommandEnvelope;
use crate::error::MeshError;
use crate::node::MeshNode;
use crate::reply::{ErrorReply, ExitResult};
use crate::types::EntityId;
use futures::future::join_all;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, instrument, warn};

/// What the sender hears back after a command was handled here.
#[derive(Debug)]
pub(crate) enum Outcome {
    Reply(Vec<u8>),
    /// Someone else confirms: the command was forwarded, buffered on a proxy
    /// or was an update pushed by the managing node.
    Silent,
}

/// Result of running a command against a locked slot.
pub(crate) enum Step {
    Done(Outcome),
    /// Executed by the managing node, not yet confirmed by the siblings.
    Replicate(WritePlan),
}

/// Result of routing an envelope.
pub(crate) enum Handled {
    Done(Outcome),
    Replicating(OwnedMutexGuard<SlotContent>, WritePlan),
}

pub(crate) struct WritePlan {
    command: Arc<dyn Command>,
    siblings: Vec<i64>,
    reply: Vec<u8>,
}

/// A write waiting for its siblings. Owns the entity lock until settled.
pub(crate) struct PendingWrite {
    envelope: CommandEnvelope,
    lock: OwnedMutexGuard<SlotContent>,
    plan: WritePlan,
}

fn acknowledge(settings: &CommandSettings, reply: Vec<u8>) -> Outcome {
    if settings.disable_execute_confirm {
        Outcome::Silent
    } else {
        Outcome::Reply(reply)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl MeshNode {
    /// Run `envelope` on the calling worker unless another command for the
    /// same entity is in progress, in which case it is parked behind it.
    /// A replicated write is settled in its own task together with
    /// whatever gets parked meanwhile.
    pub(crate) async fn process_in_order(self: &Arc<Self>, envelope: CommandEnvelope) {
        let id = envelope.recipient_id;
        let Some(envelope) = self.entity_queues().claim(envelope) else {
            debug!(recipient = %id, "parked behind a command in progress");
            return;
        };
        let node = Arc::clone(self);
        match self.process_guarded(envelope).await {
            Some(write) => {
                tokio::spawn(async move {
                    node.settle_write(write).await;
                    let next = node.entity_queues().next(&id);
                    node.run_parked(id, next).await;
                });
            }
            None => {
                let next = self.entity_queues().next(&id);
                if next.is_some() {
                    tokio::spawn(async move { node.run_parked(id, next).await });
                }
            }
        }
    }

    async fn run_parked(&self, id: EntityId, mut next: Option<CommandEnvelope>) {
        while let Some(envelope) = next {
            if let Some(write) = self.process_guarded(envelope).await {
                self.settle_write(write).await;
            }
            next = self.entity_queues().next(&id);
        }
    }

    /// Process a thread safe command outside the entity queues.
    pub(crate) async fn process_detached(&self, envelope: CommandEnvelope) {
        if let Some(write) = self.process_guarded(envelope).await {
            self.settle_write(write).await;
        }
    }

    /// Execute `envelope` and confirm the outcome to its sender. A panicking
    /// handler is reported as a failure instead of taking the worker down.
    /// Replicated writes are handed back unconfirmed.
    pub(crate) async fn process_guarded(&self, envelope: CommandEnvelope) -> Option<PendingWrite> {
        let result = match AssertUnwindSafe(self.execute_for_reference(&envelope))
            .catch_unwind()
            .await
        {
            Ok(Ok(Handled::Replicating(lock, plan))) => {
                return Some(PendingWrite {
                    envelope,
                    lock,
                    plan,
                })
            }
            Ok(Ok(Handled::Done(outcome))) => Ok(outcome),
            Ok(Err(err)) => Err(err),
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                error!(
                    slug = %envelope.slug,
                    recipient = %envelope.recipient_id,
                    %reason,
                    "command handler panicked"
                );
                Err(MeshError::HandlerFailed { reason })
            }
        };
        self.finish(&envelope, result).await;
        None
    }

    /// Wait for the siblings of a replicated write, then confirm it.
    #[instrument(skip_all, fields(
        slug = %write.envelope.slug,
        recipient = %write.envelope.recipient_id,
        message_id = %write.envelope.message_id,
    ))]
    pub(crate) async fn settle_write(&self, write: PendingWrite) {
        let PendingWrite {
            envelope,
            mut lock,
            plan,
        } = write;
        let result = self.settle(&mut lock, &envelope, plan).await;
        drop(lock);
        self.finish(&envelope, result).await;
    }

    pub(crate) async fn finish(&self, envelope: &CommandEnvelope, result: Result<Outcome, MeshError>) {
        let exit = match result {
            Ok(Outcome::Silent) => return,
            Ok(Outcome::Reply(bytes)) => ExitResult::Success(bytes),
            Err(err) => {
                debug!(%err, slug = %envelope.slug, "command failed");
                ExitResult::Failure(ErrorReply::from_error(&err))
            }
        };
        self.confirm(envelope, exit).await;
    }

    #[instrument(skip_all, fields(
        slug = %envelope.slug,
        recipient = %envelope.recipient_id,
        sender = %envelope.sender_id,
        message_id = %envelope.message_id,
    ))]
    pub(crate) async fn execute_for_reference(
        &self,
        envelope: &CommandEnvelope,
    ) -> Result<Handled, MeshError> {
        let id = envelope.recipient_id;
        if commands::is_direct(&envelope.slug) {
            return self.execute_direct(envelope).await.map(Handled::Done);
        }
        if id.is_local() {
            let slot = self.table().resolve_required(&id).await?;
            let mut content = slot.lock().await;
            let entity = content
                .entity_mut()
                .ok_or(MeshError::ObjectNotFound { id })?;
            let (controller, command) = self.command_for(entity, &envelope.slug)?;
            let ctx = CommandContext::new(self, envelope, &envelope.payload);
            let reply = controller.dispatch(&ctx, command.as_ref(), entity).await?;
            return Ok(Handled::Done(acknowledge(command.settings(), reply)));
        }

        let manager = self.directory().managing_node_for(&id);
        let slot = self.table().resolve(&id).await?;
        let outcome = match slot {
            Some(slot) => {
                let mut lock = slot.lock_owned().await;
                let step = self.execute_on_slot(&mut lock, envelope, manager).await?;
                return Ok(match step {
                    Step::Done(outcome) => Handled::Done(outcome),
                    Step::Replicate(plan) => Handled::Replicating(lock, plan),
                });
            }
            None if manager == self.server_id() => return Err(MeshError::ObjectNotFound { id }),
            None if self.is_trusted_update(envelope) => {
                debug!("update for an entity no longer held here");
                Outcome::Silent
            }
            None => {
                self.forward(manager, envelope).await?;
                Outcome::Silent
            }
        };
        Ok(Handled::Done(outcome))
    }

    /// Handle `envelope` against a slot whose lock the caller holds.
    pub(crate) async fn execute_on_slot(
        &self,
        content: &mut SlotContent,
        envelope: &CommandEnvelope,
        manager: i64,
    ) -> Result<Step, MeshError> {
        let outcome = match content {
            SlotContent::Proxy(proxy) if proxy.abandoned => {
                if manager == self.server_id() {
                    return Err(MeshError::ObjectNotFound {
                        id: envelope.recipient_id,
                    });
                }
                self.forward(manager, envelope).await?;
                Outcome::Silent
            }
            SlotContent::Proxy(proxy) => {
                debug!(buffered = proxy.buffered.len() + 1, "buffering until clone completes");
                proxy.buffered.push(envelope.clone());
                Outcome::Silent
            }
            SlotContent::Live(entity) if manager == self.server_id() => {
                return self.execute_as_manager(entity.as_mut(), envelope).await;
            }
            SlotContent::Live(entity) => {
                self.execute_on_copy(entity.as_mut(), envelope, manager)
                    .await?
            }
        };
        Ok(Step::Done(outcome))
    }

    fn command_for(
        &self,
        entity: &dyn Entity,
        slug: &str,
    ) -> Result<(Arc<CommandController>, Arc<dyn Command>), MeshError> {
        let controller = entity.command_controller(self.registry())?;
        let command = controller
            .resolve(slug)
            .map_err(|_| MeshError::UnknownCommand {
                slug: slug.to_string(),
                target: Some(entity.id()),
            })?;
        Ok((controller, command))
    }

    /// Commands flagged `encrypted` must arrive sealed unless they were
    /// issued on this node.
    fn check_confidential(
        &self,
        envelope: &CommandEnvelope,
        settings: &CommandSettings,
    ) -> Result<(), MeshError> {
        let sender = envelope.sender_id;
        let from_here = sender.is_local() || sender.server_id == self.server_id();
        if settings.encrypted && !from_here && !envelope.is_confidential() {
            return Err(MeshError::malformed(format!(
                "`{}` must be sent encrypted",
                envelope.slug
            )));
        }
        Ok(())
    }

    /// A write pushed by a server that replicates the recipient.
    fn is_trusted_update(&self, envelope: &CommandEnvelope) -> bool {
        let sender = envelope.sender_id;
        sender.is_server()
            && sender.server_id != self.server_id()
            && self
                .directory()
                .is_replica_peer(&envelope.recipient_id, sender.server_id)
    }

    async fn execute_as_manager(
        &self,
        entity: &mut dyn Entity,
        envelope: &CommandEnvelope,
    ) -> Result<Step, MeshError> {
        let (controller, command) = self.command_for(entity, &envelope.slug)?;
        let settings = command.settings();
        self.check_confidential(envelope, settings)?;
        let ctx = CommandContext::new(self, envelope, &envelope.payload);
        let id = entity.id();

        let siblings: Vec<i64> = if settings.distribute {
            self.directory()
                .siblings(&id)
                .into_iter()
                .filter(|s| *s != self.server_id())
                .collect()
        } else {
            Vec::new()
        };
        if siblings.is_empty() {
            let reply = controller.dispatch(&ctx, command.as_ref(), entity).await?;
            if settings.distribute {
                entity.core_mut().version += 1;
                self.fan_out(entity, envelope, settings, &siblings).await;
            }
            return Ok(Step::Done(acknowledge(settings, reply)));
        }

        self.ledger().add(entity, envelope.message_id).await?;
        let reply = match controller.dispatch(&ctx, command.as_ref(), entity).await {
            Ok(reply) => reply,
            Err(err) => {
                self.ledger().rollback(entity, envelope.message_id).await?;
                return Err(err);
            }
        };
        entity.core_mut().version += 1;
        Ok(Step::Replicate(WritePlan {
            command,
            siblings,
            reply,
        }))
    }

    /// Keep a write the siblings all applied, or roll it back everywhere.
    /// `content` must still be the locked slot the write ran against.
    pub(crate) async fn settle(
        &self,
        content: &mut SlotContent,
        envelope: &CommandEnvelope,
        plan: WritePlan,
    ) -> Result<Outcome, MeshError> {
        let entity = content.entity_mut().ok_or(MeshError::ObjectNotFound {
            id: envelope.recipient_id,
        })?;
        let id = entity.id();
        let settings = plan.command.settings();
        if let Err(reason) = self.replicate(entity, envelope, &plan.siblings).await {
            warn!(%id, %reason, "replication failed, rolling back");
            self.ledger().rollback(entity, envelope.message_id).await?;
            self.resync_siblings(entity, &plan.siblings).await;
            return Err(MeshError::ReplicationFailed { id, reason });
        }
        self.ledger().remove(&id, envelope.message_id).await?;
        self.fan_out(entity, envelope, settings, &plan.siblings).await;
        Ok(acknowledge(settings, plan.reply))
    }

    async fn execute_on_copy(
        &self,
        entity: &mut dyn Entity,
        envelope: &CommandEnvelope,
        manager: i64,
    ) -> Result<Outcome, MeshError> {
        let (controller, command) = self.command_for(entity, &envelope.slug)?;
        let settings = command.settings();
        let ctx = CommandContext::new(self, envelope, &envelope.payload);

        if self.is_trusted_update(envelope) {
            let pushed = envelope.version();
            let held = entity.core().version;
            if pushed.is_some_and(|version| version <= held) {
                debug!(held, pushed = ?pushed, "copy already includes the pushed write");
                return Ok(Outcome::Silent);
            }
            let reply = controller
                .dispatch_trusted(&ctx, command.as_ref(), entity)
                .await?;
            if let Some(version) = pushed {
                entity.core_mut().version = version;
            }
            return Ok(if settings.distribute {
                Outcome::Silent
            } else {
                acknowledge(settings, reply)
            });
        }
        self.check_confidential(envelope, settings)?;
        if !settings.distribute {
            let reply = controller.dispatch(&ctx, command.as_ref(), entity).await?;
            return Ok(acknowledge(settings, reply));
        }
        if settings.local_propagation {
            controller.dispatch(&ctx, command.as_ref(), entity).await?;
            debug!("applied ahead of the managing node");
        }
        self.forward(manager, envelope).await?;
        Ok(Outcome::Silent)
    }

    /// Pass `envelope` on to `manager` unchanged apart from its hop count.
    /// The manager confirms to the original sender.
    pub(crate) async fn forward(
        &self,
        manager: i64,
        envelope: &CommandEnvelope,
    ) -> Result<(), MeshError> {
        if envelope.hops() >= self.config().redirect_max_hops {
            warn!(manager, hops = envelope.hops(), "forwarding hop limit reached");
            return Err(MeshError::ServerUnavailable {
                server_id: manager,
                source: None,
            });
        }
        let mut forwarded = envelope.clone();
        forwarded.increment_hops();
        debug!(
            manager = format_args!("{manager:x}"),
            "forwarding to managing node"
        );
        self.deliver(manager, forwarded).await
    }

    /// Core commands addressed to the entity itself rather than routed to
    /// its managing node.
    async fn execute_direct(&self, envelope: &CommandEnvelope) -> Result<Outcome, MeshError> {
        let id = envelope.recipient_id;
        let slot = match self.table().resolve(&id).await? {
            Some(slot) => slot,
            None if envelope.slug == FORCE_CLONE => self.install_forced_replica(envelope)?,
            None => return Err(MeshError::ObjectNotFound { id }),
        };
        let mut content = slot.lock().await;
        let entity = content
            .entity_mut()
            .ok_or(MeshError::ObjectNotFound { id })?;
        let (controller, command) = self.command_for(entity, &envelope.slug)?;
        let ctx = CommandContext::new(self, envelope, &envelope.payload);
        let reply = controller.dispatch(&ctx, command.as_ref(), entity).await?;
        if matches!(envelope.slug.as_str(), SUBSCRIBE | UNSUBSCRIBE) {
            self.share_subscribers(entity).await;
        }
        Ok(Outcome::Reply(reply))
    }

    /// Siblings take over pushing writes when the managing node fails, so
    /// they need its subscriber list.
    async fn share_subscribers(&self, entity: &dyn Entity) {
        let id = entity.id();
        if self.directory().managing_node_for(&id) != self.server_id() {
            return;
        }
        let siblings: Vec<i64> = self
            .directory()
            .siblings(&id)
            .into_iter()
            .filter(|s| *s != self.server_id())
            .collect();
        if !siblings.is_empty() {
            debug!(%id, siblings = siblings.len(), "sharing subscribers with siblings");
            self.resync_siblings(entity, &siblings).await;
        }
    }

    /// A sibling learning about an entity for the first time. The sender
    /// must be a replica peer according to the payload, and this node must
    /// be one of the listed siblings.
    fn install_forced_replica(&self, envelope: &CommandEnvelope) -> Result<Arc<EntitySlot>, MeshError> {
        let payload: ForceClonePayload = envelope.value()?;
        let id = envelope.recipient_id;
        let sender = envelope.sender_id;
        let trusted = sender.is_server()
            && (sender.server_id == id.server_id || payload.siblings.contains(&sender.server_id))
            && payload.siblings.contains(&self.server_id());
        if !trusted {
            return Err(MeshError::PermissionNotMet {
                permission: "IsReplicaPeer".to_string(),
                target: id,
                sender,
                command: envelope.slug.clone(),
            });
        }
        if payload.record.id != id {
            return Err(MeshError::malformed(format!(
                "replica record for {} sent to {id}",
                payload.record.id
            )));
        }
        self.directory().set_siblings(id, payload.siblings.clone());
        let entity = self.registry().decode(&payload.record)?;
        debug!(%id, "installing replica");
        self.table().insert_if_absent(entity)
    }

    /// Send the inner command to every sibling and compare the state hash
    /// each reports against ours. Siblings that lack the entity get a full
    /// copy instead.
    async fn replicate(
        &self,
        entity: &dyn Entity,
        envelope: &CommandEnvelope,
        siblings: &[i64],
    ) -> Result<(), String> {
        let expected = state_hash(entity).map_err(|e| e.to_string())?;
        let record = self
            .registry()
            .encode(entity, true)
            .map_err(|e| e.to_string())?;
        let inner = envelope.to_bytes().map_err(|e| e.to_string())?;
        let attempts = siblings.iter().map(|&sibling| {
            let inner = inner.clone();
            let record = &record;
            async move {
                self.replicate_to(sibling, envelope, inner, record, expected)
                    .await
                    .map_err(|e| format!("sibling {sibling:x}: {e}"))
            }
        });
        let failures: Vec<String> = join_all(attempts)
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(failures.join("; "))
        }
    }

    async fn replicate_to(
        &self,
        sibling: i64,
        envelope: &CommandEnvelope,
        inner: Vec<u8>,
        record: &EntityRecord,
        expected: u64,
    ) -> Result<(), MeshError> {
        let timeout = self.config().sibling_confirm_timeout;
        let mut update = self.originate(record.id, SIBLING_UPDATE, inner)?;
        update.set_version(record.version);
        if envelope.is_confidential() {
            update.mark_confidential();
        }
        let hash = match self.request(sibling, update, timeout).await {
            Ok(bytes) => decode_hash(&bytes)?,
            Err(MeshError::ObjectNotFound { .. }) => {
                debug!(sibling, "sibling lacks the entity, pushing a full copy");
                self.force_clone(sibling, record, timeout).await?
            }
            Err(err) => return Err(err),
        };
        if hash != expected {
            return Err(MeshError::ReplicationFailed {
                id: record.id,
                reason: format!("state hash {hash:x} differs from {expected:x}"),
            });
        }
        Ok(())
    }

    /// Overwrite the copy `server_id` holds with `record`. Returns the
    /// state hash the server reports afterwards.
    async fn force_clone(
        &self,
        server_id: i64,
        record: &EntityRecord,
        timeout: Duration,
    ) -> Result<u64, MeshError> {
        let payload = ForceClonePayload {
            record: record.clone(),
            siblings: self.directory().siblings(&record.id),
        };
        let bytes = rmp_serde::to_vec(&payload).map_err(|e| MeshError::encode("forceClone payload", e))?;
        let envelope = self.originate(record.id, FORCE_CLONE, bytes)?;
        decode_hash(&self.request(server_id, envelope, timeout).await?)
    }

    /// Best effort: overwrite the siblings' copies with ours, access rules
    /// included.
    async fn resync_siblings(&self, entity: &dyn Entity, siblings: &[i64]) {
        let record = match self.registry().encode(entity, true) {
            Ok(record) => record,
            Err(err) => {
                warn!(%err, "cannot encode entity for resync");
                return;
            }
        };
        let timeout = self.config().sibling_confirm_timeout;
        let record = &record;
        let attempts = siblings
            .iter()
            .map(|&sibling| async move { (sibling, self.force_clone(sibling, record, timeout).await) });
        for (sibling, result) in join_all(attempts).await {
            if let Err(err) = result {
                warn!(%err, sibling = format_args!("{sibling:x}"), "sibling resync failed");
            }
        }
    }

    /// Push a confirmed write to every subscribed server that is not already
    /// a sibling. With local propagation the originating server applied it
    /// already and is skipped.
    async fn fan_out(
        &self,
        entity: &dyn Entity,
        envelope: &CommandEnvelope,
        settings: &CommandSettings,
        siblings: &[i64],
    ) {
        let mut servers: Vec<i64> = entity
            .access()
            .subscribers
            .iter()
            .map(|s| s.server_id)
            .filter(|s| *s != self.server_id() && !siblings.contains(s))
            .filter(|s| !(settings.local_propagation && *s == envelope.sender_id.server_id))
            .collect();
        servers.sort_unstable();
        servers.dedup();
        for server_id in servers {
            let result = async {
                let mut update = self.originate(entity.id(), &envelope.slug, envelope.payload.clone())?;
                update.set_version(entity.core().version);
                if envelope.is_confidential() {
                    update.mark_confidential();
                }
                self.deliver(server_id, update).await
            }
            .await;
            if let Err(err) = result {
                warn!(%err, server_id = format_args!("{server_id:x}"), "failed to update subscriber");
            }
        }
    }

    /// Make `siblings` the replica set of `id`, a live entity managed here,
    /// and push a full copy to each of them.
    #[instrument(skip(self, siblings), fields(%id))]
    pub async fn seed_siblings(&self, id: EntityId, siblings: Vec<i64>) -> Result<(), MeshError> {
        let manager = self.directory().managing_node_for(&id);
        if manager != self.server_id() {
            return Err(MeshError::malformed(format!(
                "{id} is managed by {manager:x}, not this node"
            )));
        }
        let siblings: Vec<i64> = siblings
            .into_iter()
            .filter(|s| *s != self.server_id())
            .collect();
        self.directory().set_siblings(id, siblings.clone());

        let slot = self.table().resolve_required(&id).await?;
        let content = slot.lock().await;
        let entity = content.entity().ok_or(MeshError::ObjectNotFound { id })?;
        let record = self.registry().encode(entity, true)?;
        let expected = state_hash(entity)?;
        let timeout = self.config().sibling_confirm_timeout;
        let attempts = siblings.iter().map(|&sibling| {
            let record = &record;
            async move {
                match self.force_clone(sibling, record, timeout).await {
                    Ok(hash) if hash == expected => Ok(()),
                    Ok(hash) => Err(format!("sibling {sibling:x}: state hash {hash:x} differs")),
                    Err(err) => Err(format!("sibling {sibling:x}: {err}")),
                }
            }
        });
        let failures: Vec<String> = join_all(attempts)
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect();
        drop(content);
        if failures.is_empty() {
            debug!(siblings = siblings.len(), "siblings seeded");
            Ok(())
        } else {
            Err(MeshError::ReplicationFailed {
                id,
                reason: failures.join("; "),
            })
        }
    }
}

fn decode_hash(bytes: &[u8]) -> Result<u64, MeshError> {
    rmp_serde::from_slice(bytes).map_err(|e| MeshError::decode("state hash", e))
}
