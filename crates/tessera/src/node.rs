//! A mesh node: the context object every command executes against.
//!
//! The node owns the entity table, the command registry, the duplicate
//! filter, the rollback ledger, the callback registry and the outbox, and
//! connects them to a [`CommandTransmit`]. Nothing is global; tests run any
//! number of nodes side by side.

use crate::callbacks::{CallbackRegistry, PendingReply};
use crate::codec::{EntityRegistry, EntityType};
use crate::commands::{self, RECEIVE_CONFIRM};
use crate::config::NodeConfig;
use crate::crypto::{Ed25519Signing, KeyPair, KeyStore, SessionChannel, SigningAlgorithm};
use crate::dedup::DuplicateSuppressor;
use crate::directory::{ServerDirectory, ServerState};
use crate::entity::Entity;
use crate::entity_table::EntityTable;
use crate::envelope::CommandEnvelope;
use crate::error::MeshError;
use crate::message_id::MessageIdGenerator;
use crate::metrics::MeshMetrics;
use crate::outbox::Outbox;
use crate::persistence::Persistence;
use crate::reply::{Confirmation, ErrorReply, ExitResult};
use crate::rollback::RollbackLedger;
use crate::storage::file::FilePersistence;
use crate::storage::memory::MemoryPersistence;
use crate::token::{Token, TokenBuilder, TokenManager};
use crate::transport::{CommandTransmit, NoopTransmit};
use crate::types::{EntityId, RedundantReference};
use crate::worker::{EntityQueues, WorkerPool};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub struct MeshNodeBuilder {
    config: NodeConfig,
    persistence: Option<Arc<dyn Persistence>>,
    transport: Option<Arc<dyn CommandTransmit>>,
    keys: Option<Arc<KeyStore>>,
    algorithm: Arc<dyn SigningAlgorithm>,
    key_pair: Option<KeyPair>,
    sessions: Option<Arc<dyn SessionChannel>>,
    metrics: Option<Arc<MeshMetrics>>,
}

impl MeshNodeBuilder {
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            persistence: None,
            transport: None,
            keys: None,
            algorithm: Arc::new(Ed25519Signing),
            key_pair: None,
            sessions: None,
            metrics: None,
        }
    }

    /// Storage for entities, tokens, the rollback ledger and the outbox.
    /// Defaults to files under `config.data_root`, or memory without one.
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn CommandTransmit>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Public keys of every signer this node should trust.
    pub fn key_store(mut self, keys: Arc<KeyStore>) -> Self {
        self.keys = Some(keys);
        self
    }

    pub fn signing_algorithm(mut self, algorithm: Arc<dyn SigningAlgorithm>) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Sign originated envelopes and issued tokens with `key_pair`. The
    /// public half is registered for this node's server id.
    pub fn key_pair(mut self, key_pair: KeyPair) -> Self {
        self.key_pair = Some(key_pair);
        self
    }

    pub fn session_channel(mut self, sessions: Arc<dyn SessionChannel>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn metrics(mut self, metrics: Arc<MeshMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Validate the config, restore persisted node state and start the
    /// workers and the outbox retry loop.
    pub async fn build(self) -> Result<Arc<MeshNode>, MeshError> {
        let config = self.config;
        config.validate()?;

        let persistence: Arc<dyn Persistence> = match (self.persistence, &config.data_root) {
            (Some(persistence), _) => persistence,
            (None, Some(root)) => Arc::new(FilePersistence::new(root.clone())),
            (None, None) => Arc::new(MemoryPersistence::new()),
        };
        let metrics = self
            .metrics
            .unwrap_or_else(|| Arc::new(MeshMetrics::unregistered()));
        let server = EntityId::server(config.server_id);

        let registry = Arc::new(EntityRegistry::new(Arc::new(commands::core_controller()?)));
        let table = Arc::new(EntityTable::new(
            config.server_id,
            Arc::clone(&registry),
            Arc::clone(&persistence),
            config.redirect_max_hops,
            Arc::clone(&metrics),
        ));

        let keys = self.keys.unwrap_or_default();
        if let Some(key_pair) = &self.key_pair {
            keys.insert(server, key_pair.public.clone());
        }
        let tokens = TokenManager::new(
            Arc::clone(&keys),
            Arc::clone(&self.algorithm),
            config.single_use_tokens,
        );
        tokens.load(persistence.as_ref()).await?;

        let ledger = RollbackLedger::new(
            Arc::clone(&registry),
            Arc::clone(&persistence),
            Arc::clone(&metrics),
        );
        ledger.load().await?;

        let node = Arc::new(MeshNode {
            server,
            registry,
            table,
            directory: ServerDirectory::new(),
            tokens,
            keys,
            algorithm: self.algorithm,
            key_pair: self.key_pair,
            sessions: self.sessions,
            dedup: DuplicateSuppressor::new(config.dedup_window),
            ledger,
            callbacks: Arc::new(CallbackRegistry::new(Arc::clone(&metrics))),
            transport: self.transport.unwrap_or_else(|| Arc::new(NoopTransmit)),
            outbox: Outbox::new(Arc::clone(&persistence), Arc::clone(&metrics)),
            persistence,
            ids: MessageIdGenerator::new(),
            metrics,
            workers: OnceLock::new(),
            entity_queues: EntityQueues::default(),
            clone_locks: DashMap::new(),
            cancel: CancellationToken::new(),
            self_ref: OnceLock::new(),
            config,
        });
        let _ = node.self_ref.set(Arc::downgrade(&node));
        let _ = node.workers.set(WorkerPool::spawn(
            Arc::downgrade(&node),
            node.config.worker_count,
            node.cancel.clone(),
        ));

        let weak = Arc::downgrade(&node);
        node.transport.on_receive(Arc::new(move |envelope| {
            if let Some(node) = weak.upgrade() {
                node.receive(envelope);
            }
        }));
        spawn_outbox_retry(&node);

        info!(
            server_id = format_args!("{:x}", node.server_id()),
            workers = node.config.worker_count,
            "mesh node started"
        );
        Ok(node)
    }
}

pub struct MeshNode {
    config: NodeConfig,
    server: EntityId,
    registry: Arc<EntityRegistry>,
    table: Arc<EntityTable>,
    persistence: Arc<dyn Persistence>,
    directory: ServerDirectory,
    tokens: TokenManager,
    keys: Arc<KeyStore>,
    algorithm: Arc<dyn SigningAlgorithm>,
    key_pair: Option<KeyPair>,
    sessions: Option<Arc<dyn SessionChannel>>,
    dedup: DuplicateSuppressor,
    ledger: RollbackLedger,
    callbacks: Arc<CallbackRegistry>,
    transport: Arc<dyn CommandTransmit>,
    outbox: Outbox,
    ids: MessageIdGenerator,
    metrics: Arc<MeshMetrics>,
    workers: OnceLock<WorkerPool>,
    entity_queues: EntityQueues,
    pub(crate) clone_locks: DashMap<EntityId, Arc<Mutex<()>>>,
    cancel: CancellationToken,
    self_ref: OnceLock<Weak<Self>>,
}

impl MeshNode {
    pub fn builder(config: NodeConfig) -> MeshNodeBuilder {
        MeshNodeBuilder::new(config)
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn server_id(&self) -> i64 {
        self.server.server_id
    }

    /// Id of this node as a sender.
    pub fn server_entity(&self) -> EntityId {
        self.server
    }

    pub fn registry(&self) -> &Arc<EntityRegistry> {
        &self.registry
    }

    pub fn table(&self) -> &Arc<EntityTable> {
        &self.table
    }

    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    pub fn directory(&self) -> &ServerDirectory {
        &self.directory
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    pub fn keys(&self) -> &Arc<KeyStore> {
        &self.keys
    }

    pub fn ledger(&self) -> &RollbackLedger {
        &self.ledger
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn metrics(&self) -> &Arc<MeshMetrics> {
        &self.metrics
    }

    pub fn callbacks(&self) -> &Arc<CallbackRegistry> {
        &self.callbacks
    }

    pub(crate) fn dedup(&self) -> &DuplicateSuppressor {
        &self.dedup
    }

    pub(crate) fn entity_queues(&self) -> &EntityQueues {
        &self.entity_queues
    }

    pub(crate) fn self_arc(&self) -> Option<Arc<Self>> {
        self.self_ref.get().and_then(Weak::upgrade)
    }

    pub fn register_entity<T: EntityType>(&self) -> Result<(), MeshError> {
        self.registry.register::<T>()
    }

    /// Give `entity` a fresh id on this node and add it to the table.
    pub fn create_entity(&self, entity: impl Entity) -> Result<EntityId, MeshError> {
        self.table.assign_id(Box::new(entity), false)
    }

    pub fn register_reference(&self, reference: &RedundantReference) {
        self.directory.register_reference(reference);
    }

    /// Record the last-known state of a server. A server coming up gets
    /// everything parked for it redelivered.
    pub async fn set_server_state(&self, server_id: i64, state: ServerState) -> Result<(), MeshError> {
        let previous = self.directory.set_state(server_id, state);
        if state == ServerState::Up && previous != ServerState::Up {
            let delivered = self.outbox.flush(server_id, self.transport.as_ref()).await?;
            if delivered > 0 {
                info!(server_id = format_args!("{server_id:x}"), delivered, "redelivered parked envelopes");
            }
        }
        Ok(())
    }

    /// Retry every server with parked envelopes once.
    pub async fn flush_outbox(&self) -> Result<usize, MeshError> {
        let mut delivered = 0;
        for server_id in self.outbox.servers() {
            delivered += self.outbox.flush(server_id, self.transport.as_ref()).await?;
        }
        Ok(delivered)
    }

    /// Sign a delegation token as `issuer`, which must live on this node.
    pub fn issue_token(&self, issuer: EntityId, builder: TokenBuilder) -> Result<Token, MeshError> {
        if issuer.server_id != self.server_id() {
            return Err(MeshError::TokenInvalid {
                reason: format!("issuer {issuer} is not hosted on this node"),
            });
        }
        let key_pair = self.key_pair.as_ref().ok_or_else(|| MeshError::TokenInvalid {
            reason: "node has no signing key".to_string(),
        })?;
        builder.sign(issuer, self.algorithm.as_ref(), key_pair)
    }

    /// Build an envelope from `sender` with a fresh message id and a
    /// MessagePack payload.
    pub fn envelope<T: Serialize>(
        &self,
        sender: EntityId,
        recipient: EntityId,
        slug: &str,
        value: &T,
    ) -> Result<CommandEnvelope, MeshError> {
        CommandEnvelope::with_value(sender, recipient, self.ids.next(), slug, value)
    }

    /// Send a command on behalf of an entity hosted here and register for its
    /// confirmation.
    pub async fn send_command<T: Serialize>(
        &self,
        sender: EntityId,
        recipient: EntityId,
        slug: &str,
        value: &T,
    ) -> Result<PendingReply, MeshError> {
        let envelope = self.envelope(sender, recipient, slug, value)?;
        self.send(envelope).await
    }

    /// Send a prepared envelope. Its sender must live on this node, since
    /// that is where the confirmation is delivered.
    #[instrument(skip_all, fields(slug = %envelope.slug, recipient = %envelope.recipient_id, message_id = %envelope.message_id))]
    pub async fn send(&self, mut envelope: CommandEnvelope) -> Result<PendingReply, MeshError> {
        let sender = envelope.sender_id;
        if !sender.is_local() && sender.server_id != self.server_id() {
            return Err(MeshError::malformed(format!(
                "sender {sender} is not hosted on this node"
            )));
        }
        if self.resolves_encrypted(&envelope) {
            envelope.mark_confidential();
        }
        self.sign(&mut envelope)?;
        let pending = self.callbacks.register(envelope.message_id);
        if let Err(err) = self.submit(envelope) {
            self.callbacks.cancel(pending.message_id());
            return Err(err);
        }
        Ok(pending)
    }

    fn resolves_encrypted(&self, envelope: &CommandEnvelope) -> bool {
        self.table
            .get(&envelope.recipient_id)
            .and_then(|slot| slot.type_tag())
            .and_then(|tag| self.registry.controller_for(tag).ok())
            .and_then(|controller| controller.resolve(&envelope.slug).ok())
            .is_some_and(|command| command.settings().encrypted)
    }

    /// Whether the command `envelope` names may run off its sender's worker.
    pub(crate) fn is_thread_safe(&self, envelope: &CommandEnvelope) -> bool {
        let controller = self
            .table
            .get(&envelope.recipient_id)
            .and_then(|slot| slot.type_tag())
            .and_then(|tag| self.registry.controller_for(tag).ok())
            .unwrap_or_else(|| Arc::clone(self.registry.core_controller()));
        controller
            .resolve(&envelope.slug)
            .is_ok_and(|command| command.settings().thread_safe)
    }

    pub(crate) fn submit(&self, envelope: CommandEnvelope) -> Result<(), MeshError> {
        self.workers
            .get()
            .ok_or(MeshError::ShuttingDown)?
            .submit(envelope)
    }

    /// Entry point for envelopes arriving from the transport.
    ///
    /// Opens sealed payloads, verifies signatures, completes confirmations
    /// and drops redeliveries; everything else is queued on the sender's
    /// worker.
    pub fn receive(&self, mut envelope: CommandEnvelope) {
        match self.accept(&mut envelope) {
            Ok(true) => {
                if let Err(err) = self.submit(envelope) {
                    debug!(%err, "dropping envelope");
                }
            }
            Ok(false) => {}
            Err(err) => {
                warn!(
                    %err,
                    sender = %envelope.sender_id,
                    slug = %envelope.slug,
                    "rejected incoming envelope"
                );
                if envelope.slug != RECEIVE_CONFIRM {
                    self.spawn_confirm(envelope, ExitResult::Failure(ErrorReply::from_error(&err)));
                }
            }
        }
    }

    fn accept(&self, envelope: &mut CommandEnvelope) -> Result<bool, MeshError> {
        self.open(envelope)?;
        self.verify(envelope)?;
        if envelope.slug == RECEIVE_CONFIRM {
            let confirmation: Confirmation = envelope.value()?;
            self.callbacks
                .complete(confirmation.message_id, confirmation.exit);
            return Ok(false);
        }
        if self
            .dedup
            .already_processed(&envelope.sender_id, envelope.message_id)
        {
            self.metrics.duplicates_suppressed.inc();
            debug!(
                sender = %envelope.sender_id,
                message_id = %envelope.message_id,
                "dropping redelivered envelope"
            );
            return Ok(false);
        }
        Ok(true)
    }

    pub(crate) fn sign(&self, envelope: &mut CommandEnvelope) -> Result<(), MeshError> {
        if let Some(key_pair) = &self.key_pair {
            let signature = self.algorithm.sign(&envelope.signing_bytes(), key_pair)?;
            envelope.signature = Some(signature);
        }
        Ok(())
    }

    fn verify(&self, envelope: &CommandEnvelope) -> Result<(), MeshError> {
        match &envelope.signature {
            Some(signature) => {
                let key = self
                    .keys
                    .resolve(&envelope.sender_id)
                    .ok_or(MeshError::InvalidSignature)?;
                if self
                    .algorithm
                    .verify(&envelope.signing_bytes(), signature, &key)
                {
                    Ok(())
                } else {
                    Err(MeshError::InvalidSignature)
                }
            }
            None if self.config.require_signed_envelopes => Err(MeshError::InvalidSignature),
            None => Ok(()),
        }
    }

    fn session(&self) -> Result<&Arc<dyn SessionChannel>, MeshError> {
        self.sessions
            .as_ref()
            .ok_or_else(|| MeshError::malformed("confidential envelope but no session channel"))
    }

    /// Seal a confidential payload for `server_id`.
    fn seal_for(&self, server_id: i64, envelope: &mut CommandEnvelope) -> Result<(), MeshError> {
        if !envelope.is_confidential() || envelope.sealed_by()?.is_some() {
            return Ok(());
        }
        envelope.payload = self.session()?.encrypt(server_id, &envelope.payload)?;
        envelope.set_sealed_by(Some(self.server_id()));
        Ok(())
    }

    fn open(&self, envelope: &mut CommandEnvelope) -> Result<(), MeshError> {
        let Some(peer) = envelope.sealed_by()? else {
            return Ok(());
        };
        envelope.payload = self.session()?.decrypt(peer, &envelope.payload)?;
        envelope.set_sealed_by(None);
        Ok(())
    }

    /// Advance the session key shared with `peer`. Both ends must ratchet.
    pub fn ratchet_session(&self, peer: i64) -> Result<(), MeshError> {
        self.session()?.ratchet(peer);
        Ok(())
    }

    /// Envelope originated by this node as a server.
    pub(crate) fn originate(
        &self,
        recipient: EntityId,
        slug: &str,
        payload: Vec<u8>,
    ) -> Result<CommandEnvelope, MeshError> {
        let mut envelope =
            CommandEnvelope::new(self.server, recipient, self.ids.next(), slug, payload);
        self.sign(&mut envelope)?;
        Ok(envelope)
    }

    /// Hand `envelope` to `server_id`, parking it in the outbox when the
    /// server cannot be reached or already has envelopes waiting.
    pub(crate) async fn deliver(
        &self,
        server_id: i64,
        mut envelope: CommandEnvelope,
    ) -> Result<(), MeshError> {
        if server_id == self.server_id() {
            return self.submit(envelope);
        }
        self.seal_for(server_id, &mut envelope)?;
        if self.outbox.has_parked(server_id) {
            return self.outbox.park(server_id, envelope).await;
        }
        match self.transport.send(server_id, envelope.clone()).await {
            Ok(()) => Ok(()),
            Err(err) if !err.is_terminal() => self.outbox.park(server_id, envelope).await,
            Err(err) => Err(err),
        }
    }

    /// Send `envelope` to `server_id` right away and wait for its reply.
    /// Nothing is parked: an unreachable server fails the request.
    pub(crate) async fn request(
        &self,
        server_id: i64,
        mut envelope: CommandEnvelope,
        timeout: std::time::Duration,
    ) -> Result<Vec<u8>, MeshError> {
        let pending = self.callbacks.register(envelope.message_id);
        let sent = if server_id == self.server_id() {
            self.submit(envelope)
        } else {
            match self.seal_for(server_id, &mut envelope) {
                Ok(()) => self.transport.send(server_id, envelope).await,
                Err(err) => Err(err),
            }
        };
        if let Err(err) = sent {
            self.callbacks.cancel(pending.message_id());
            return Err(err);
        }
        pending.result(timeout).await
    }

    /// Report the outcome of `original` to its sender.
    pub(crate) async fn confirm(&self, original: &CommandEnvelope, exit: ExitResult) {
        let server_id = original.reply_server();
        if server_id == self.server_id() || original.sender_id.is_local() {
            self.callbacks.complete(original.message_id, exit);
            return;
        }
        let confirmation = Confirmation {
            message_id: original.message_id,
            exit,
        };
        let result = async {
            let payload = rmp_serde::to_vec(&confirmation)
                .map_err(|e| MeshError::encode("confirmation", e))?;
            let mut envelope = self.originate(original.sender_id, RECEIVE_CONFIRM, payload)?;
            if original.is_confidential() {
                envelope.mark_confidential();
            }
            self.deliver(server_id, envelope).await
        }
        .await;
        if let Err(err) = result {
            warn!(%err, message_id = %original.message_id, "failed to send confirmation");
        }
    }

    fn spawn_confirm(&self, original: CommandEnvelope, exit: ExitResult) {
        if let Some(node) = self.self_arc() {
            tokio::spawn(async move { node.confirm(&original, exit).await });
        }
    }

    async fn retry_parked(&self) {
        for server_id in self.outbox.servers() {
            if let Err(err) = self.outbox.flush(server_id, self.transport.as_ref()).await {
                warn!(%err, server_id = format_args!("{server_id:x}"), "outbox flush failed");
            }
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop the workers and the retry loop. Pending replies resolve with
    /// `Timeout` once their wait expires.
    pub fn shutdown(&self) {
        if !self.cancel.is_cancelled() {
            self.cancel.cancel();
            info!(server_id = format_args!("{:x}", self.server_id()), "mesh node shutting down");
        }
    }

    /// [`shutdown`](Self::shutdown) and wait for the workers to stop.
    pub async fn shutdown_and_wait(&self) {
        self.shutdown();
        if let Some(workers) = self.workers.get() {
            workers.join().await;
        }
    }
}

fn spawn_outbox_retry(node: &Arc<MeshNode>) {
    let weak = Arc::downgrade(node);
    let cancel = node.cancel.clone();
    let period = node.config.outbox_retry_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(node) = weak.upgrade() else { break };
                    node.retry_parked().await;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CounterEntity, TestMesh};
    use crate::types::MessageId;
    use std::time::Duration;

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let mut config = NodeConfig::for_server(1);
        config.worker_count = 0;
        let err = MeshNode::builder(config).build().await.err().unwrap();
        assert!(matches!(err, MeshError::InvalidConfig { .. }));
    }

    #[tokio::test]
    async fn offline_node_runs_commands_locally() {
        let node = MeshNode::builder(NodeConfig::for_server(0))
            .build()
            .await
            .unwrap();
        node.register_entity::<CounterEntity>().unwrap();
        let owner = EntityId::ZERO;
        let id = node.create_entity(CounterEntity::new(owner)).unwrap();
        assert!(id.is_local());

        let value: i64 = node
            .send_command(owner, id, "increment", &3i64)
            .await
            .unwrap()
            .value(Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(value, 3);
        node.shutdown_and_wait().await;
    }

    #[tokio::test]
    async fn foreign_sender_is_rejected() {
        let mesh = TestMesh::new(&[1]).await;
        let node = mesh.node(1);
        let err = node
            .send_command(EntityId::from_parts(2, 1), EntityId::from_parts(1, 1), "increment", &1i64)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, MeshError::MalformedMessage { .. }));
        mesh.shutdown();
    }

    #[tokio::test]
    async fn redelivered_envelope_is_dropped() {
        let mesh = TestMesh::new(&[1]).await;
        let node = mesh.node(1);
        let owner = EntityId::from_parts(1, 1);
        let id = node.create_entity(CounterEntity::new(owner)).unwrap();

        let envelope = CommandEnvelope::with_value(
            owner,
            id,
            MessageId(77),
            "increment",
            &1i64,
        )
        .unwrap();
        node.receive(envelope.clone());
        node.receive(envelope);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(node.metrics().duplicates_suppressed.get(), 1);
        assert_eq!(mesh.counter_value(1, id).await, 1);
        mesh.shutdown();
    }

    #[tokio::test]
    async fn unsigned_envelope_rejected_when_signatures_required() {
        let mut config = NodeConfig::for_server(1);
        config.require_signed_envelopes = true;
        let node = MeshNode::builder(config).build().await.unwrap();
        let mut envelope = CommandEnvelope::new(
            EntityId::from_parts(2, 1),
            EntityId::from_parts(1, 1),
            MessageId(1),
            "increment",
            Vec::new(),
        );
        assert!(matches!(
            node.accept(&mut envelope),
            Err(MeshError::InvalidSignature)
        ));
        node.shutdown();
    }

    #[tokio::test]
    async fn signed_envelope_verifies_against_server_key() {
        let algorithm = Ed25519Signing;
        let keys = Arc::new(KeyStore::new());
        let remote = algorithm.generate_key_pair();
        keys.insert(EntityId::server(2), remote.public.clone());

        let mut config = NodeConfig::for_server(1);
        config.require_signed_envelopes = true;
        let node = MeshNode::builder(config)
            .key_store(Arc::clone(&keys))
            .build()
            .await
            .unwrap();

        let mut envelope = CommandEnvelope::new(
            EntityId::from_parts(2, 9),
            EntityId::from_parts(1, 1),
            MessageId(1),
            "increment",
            vec![1],
        );
        envelope.signature = Some(algorithm.sign(&envelope.signing_bytes(), &remote).unwrap());
        assert!(node.accept(&mut envelope.clone()).is_ok());

        envelope.payload.push(2);
        assert!(matches!(
            node.accept(&mut envelope),
            Err(MeshError::InvalidSignature)
        ));
        node.shutdown();
    }

    #[tokio::test]
    async fn issue_token_requires_local_issuer_and_key() {
        let node = MeshNode::builder(NodeConfig::for_server(1))
            .build()
            .await
            .unwrap();
        let err = node
            .issue_token(EntityId::from_parts(1, 1), Token::builder())
            .unwrap_err();
        assert!(matches!(err, MeshError::TokenInvalid { .. }));
        node.shutdown();

        let node = MeshNode::builder(NodeConfig::for_server(1))
            .key_pair(Ed25519Signing.generate_key_pair())
            .build()
            .await
            .unwrap();
        assert!(node
            .issue_token(EntityId::from_parts(2, 1), Token::builder())
            .is_err());
        let token = node
            .issue_token(EntityId::from_parts(1, 1), Token::builder())
            .unwrap();
        assert_eq!(token.issuer().unwrap(), EntityId::from_parts(1, 1));
        node.shutdown();
    }
}
