//! In-memory mesh and sample entities for unit and integration testing.
//!
//! [`TestMesh`] starts any number of nodes on a shared [`MemoryNetwork`]
//! with memory persistence, per-node Ed25519 keys and a toy session cipher.
//! Every node sees every other node as up.

use crate::access::AccessMode;
use crate::codec::EntityType;
use crate::command::{encode_reply, Command, CommandContext, CommandSettings};
use crate::config::NodeConfig;
use crate::controller::CommandController;
use crate::crypto::{Ed25519Signing, KeyStore, SessionChannel, SigningAlgorithm};
use crate::directory::ServerState;
use crate::entity::{downcast_mut, downcast_ref, Entity, EntityCore};
use crate::error::MeshError;
use crate::hash::hash64;
use crate::node::MeshNode;
use crate::permission::HasAccess;
use crate::storage::memory::MemoryPersistence;
use crate::transport::memory::MemoryNetwork;
use crate::types::EntityId;
use async_trait::async_trait;
use dashmap::DashMap;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

/// A signed 64-bit counter.
///
/// | slug        | payload | reply        | notes                               |
/// |-------------|---------|--------------|-------------------------------------|
/// | `increment` | `i64`   | new value    | distributed, write access           |
/// | `setValue`  | `i64`   | new value    | distributed, applied locally first  |
/// | `setSealed` | `i64`   | new value    | distributed, must travel encrypted  |
/// | `get`       | `()`    | value        | read access                         |
/// | `panic`     | `()`    | never        | handler panics                      |
#[derive(Debug, Clone)]
pub struct CounterEntity {
    pub core: EntityCore,
    pub value: i64,
}

impl CounterEntity {
    pub fn new(owner: EntityId) -> Self {
        Self {
            core: EntityCore::new(owner),
            value: 0,
        }
    }
}

impl Entity for CounterEntity {
    fn type_tag(&self) -> &'static str {
        Self::TAG
    }

    fn core(&self) -> &EntityCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut EntityCore {
        &mut self.core
    }

    fn encode_state(&self) -> Result<Vec<u8>, MeshError> {
        rmp_serde::to_vec(&self.value).map_err(|e| MeshError::encode("counter", e))
    }

    fn apply_state(&mut self, state: &[u8]) -> Result<(), MeshError> {
        self.value = rmp_serde::from_slice(state).map_err(|e| MeshError::decode("counter", e))?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl EntityType for CounterEntity {
    const TAG: &'static str = "counter";

    fn decode(core: EntityCore, state: &[u8]) -> Result<Self, MeshError> {
        let mut counter = Self { core, value: 0 };
        counter.apply_state(state)?;
        Ok(counter)
    }

    fn register_commands(controller: &mut CommandController) -> Result<(), MeshError> {
        controller.register(Increment::new())?;
        controller.register(SetValue::new())?;
        controller.register(SetSealed::new())?;
        controller.register(GetValue::new())?;
        controller.register(Panic::new())?;
        Ok(())
    }
}

/// Add the payload to the counter.
pub struct Increment {
    settings: CommandSettings,
}

impl Increment {
    pub fn new() -> Self {
        Self {
            settings: CommandSettings::distributed().require(HasAccess(AccessMode::WRITE)),
        }
    }
}

impl Default for Increment {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Command for Increment {
    fn slug(&self) -> &str {
        "increment"
    }

    fn settings(&self) -> &CommandSettings {
        &self.settings
    }

    async fn execute(
        &self,
        ctx: &CommandContext<'_>,
        target: &mut dyn Entity,
    ) -> Result<Vec<u8>, MeshError> {
        let delta: i64 = ctx.value()?;
        let counter = downcast_mut::<CounterEntity>(target)?;
        counter.value += delta;
        encode_reply(&counter.value)
    }
}

/// Overwrite the counter. Idempotent, so cached copies apply it before the
/// managing node does.
pub struct SetValue {
    settings: CommandSettings,
}

impl SetValue {
    pub fn new() -> Self {
        Self {
            settings: CommandSettings::distributed()
                .require(HasAccess(AccessMode::WRITE))
                .local_propagation(),
        }
    }
}

impl Default for SetValue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Command for SetValue {
    fn slug(&self) -> &str {
        "setValue"
    }

    fn settings(&self) -> &CommandSettings {
        &self.settings
    }

    async fn execute(
        &self,
        ctx: &CommandContext<'_>,
        target: &mut dyn Entity,
    ) -> Result<Vec<u8>, MeshError> {
        let value: i64 = ctx.value()?;
        let counter = downcast_mut::<CounterEntity>(target)?;
        counter.value = value;
        encode_reply(&counter.value)
    }
}

pub struct SetSealed {
    settings: CommandSettings,
}

impl SetSealed {
    pub fn new() -> Self {
        Self {
            settings: CommandSettings::distributed()
                .require(HasAccess(AccessMode::WRITE))
                .encrypted(),
        }
    }
}

impl Default for SetSealed {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Command for SetSealed {
    fn slug(&self) -> &str {
        "setSealed"
    }

    fn settings(&self) -> &CommandSettings {
        &self.settings
    }

    async fn execute(
        &self,
        ctx: &CommandContext<'_>,
        target: &mut dyn Entity,
    ) -> Result<Vec<u8>, MeshError> {
        let value: i64 = ctx.value()?;
        let counter = downcast_mut::<CounterEntity>(target)?;
        counter.value = value;
        encode_reply(&counter.value)
    }
}

pub struct GetValue {
    settings: CommandSettings,
}

impl GetValue {
    pub fn new() -> Self {
        Self {
            settings: CommandSettings::new().require(HasAccess(AccessMode::READ)),
        }
    }
}

impl Default for GetValue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Command for GetValue {
    fn slug(&self) -> &str {
        "get"
    }

    fn settings(&self) -> &CommandSettings {
        &self.settings
    }

    async fn execute(
        &self,
        _ctx: &CommandContext<'_>,
        target: &mut dyn Entity,
    ) -> Result<Vec<u8>, MeshError> {
        encode_reply(&downcast_ref::<CounterEntity>(target)?.value)
    }
}

/// Always panics.
pub struct Panic {
    settings: CommandSettings,
}

impl Panic {
    pub fn new() -> Self {
        Self {
            settings: CommandSettings::new(),
        }
    }
}

impl Default for Panic {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Command for Panic {
    fn slug(&self) -> &str {
        "panic"
    }

    fn settings(&self) -> &CommandSettings {
        &self.settings
    }

    async fn execute(
        &self,
        _ctx: &CommandContext<'_>,
        _target: &mut dyn Entity,
    ) -> Result<Vec<u8>, MeshError> {
        panic!("counter refused to count");
    }
}

/// An append-only list of lines. `append` is not distributed, so every copy
/// keeps its own lines and arrival order is observable.
#[derive(Debug, Clone)]
pub struct NoteEntity {
    pub core: EntityCore,
    pub lines: Vec<String>,
}

impl NoteEntity {
    pub fn new(owner: EntityId) -> Self {
        Self {
            core: EntityCore::new(owner),
            lines: Vec::new(),
        }
    }
}

impl Entity for NoteEntity {
    fn type_tag(&self) -> &'static str {
        Self::TAG
    }

    fn core(&self) -> &EntityCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut EntityCore {
        &mut self.core
    }

    fn encode_state(&self) -> Result<Vec<u8>, MeshError> {
        rmp_serde::to_vec(&self.lines).map_err(|e| MeshError::encode("note", e))
    }

    fn apply_state(&mut self, state: &[u8]) -> Result<(), MeshError> {
        self.lines = rmp_serde::from_slice(state).map_err(|e| MeshError::decode("note", e))?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl EntityType for NoteEntity {
    const TAG: &'static str = "note";

    fn decode(core: EntityCore, state: &[u8]) -> Result<Self, MeshError> {
        let mut note = Self {
            core,
            lines: Vec::new(),
        };
        note.apply_state(state)?;
        Ok(note)
    }

    fn register_commands(controller: &mut CommandController) -> Result<(), MeshError> {
        controller.register(Append::new())
    }
}

/// Append the payload line, reply with the number of lines.
pub struct Append {
    settings: CommandSettings,
}

impl Append {
    pub fn new() -> Self {
        Self {
            settings: CommandSettings::new().require(HasAccess(AccessMode::WRITE)),
        }
    }
}

impl Default for Append {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Command for Append {
    fn slug(&self) -> &str {
        "append"
    }

    fn settings(&self) -> &CommandSettings {
        &self.settings
    }

    async fn execute(
        &self,
        ctx: &CommandContext<'_>,
        target: &mut dyn Entity,
    ) -> Result<Vec<u8>, MeshError> {
        let line: String = ctx.value()?;
        let note = downcast_mut::<NoteEntity>(target)?;
        note.lines.push(line);
        encode_reply(&note.lines.len())
    }
}

/// Toy cipher: XOR with a keystream derived from the server pair and the
/// pair's ratchet epoch. Good enough to prove a payload was transformed and
/// that both ends agree on the key; not encryption.
pub struct XorSessionChannel {
    server_id: i64,
    epochs: DashMap<i64, u64>,
}

impl XorSessionChannel {
    pub fn new(server_id: i64) -> Self {
        Self {
            server_id,
            epochs: DashMap::new(),
        }
    }

    fn keystream(&self, peer: i64, len: usize) -> Vec<u8> {
        let (low, high) = if self.server_id <= peer {
            (self.server_id, peer)
        } else {
            (peer, self.server_id)
        };
        let epoch = self.epochs.get(&peer).map(|e| *e).unwrap_or(0);
        let mut seed = Vec::with_capacity(24);
        seed.extend_from_slice(&low.to_be_bytes());
        seed.extend_from_slice(&high.to_be_bytes());
        seed.extend_from_slice(&epoch.to_be_bytes());
        let mut stream = Vec::with_capacity(len + 8);
        let mut block = hash64(&seed);
        while stream.len() < len {
            stream.extend_from_slice(&block.to_be_bytes());
            block = hash64(&block.to_be_bytes());
        }
        stream.truncate(len);
        stream
    }

    fn apply(&self, peer: i64, bytes: &[u8]) -> Vec<u8> {
        bytes
            .iter()
            .zip(self.keystream(peer, bytes.len()))
            .map(|(b, k)| b ^ k)
            .collect()
    }
}

impl SessionChannel for XorSessionChannel {
    fn encrypt(&self, peer: i64, plaintext: &[u8]) -> Result<Vec<u8>, MeshError> {
        Ok(self.apply(peer, plaintext))
    }

    fn decrypt(&self, peer: i64, ciphertext: &[u8]) -> Result<Vec<u8>, MeshError> {
        Ok(self.apply(peer, ciphertext))
    }

    fn ratchet(&self, peer: i64) {
        *self.epochs.entry(peer).or_insert(0) += 1;
    }
}

/// A set of in-memory nodes on one [`MemoryNetwork`].
///
/// # Example
///
/// ```ignore
/// let mesh = TestMesh::new(&[1, 2]).await;
/// let id = mesh.node(1).create_entity(CounterEntity::new(owner))?;
/// let value: i64 = mesh.node(2).send_command(owner, id, "increment", &1i64).await?.value(timeout).await?;
/// mesh.shutdown();
/// ```
pub struct TestMesh {
    network: Arc<MemoryNetwork>,
    nodes: Vec<Arc<MeshNode>>,
}

impl TestMesh {
    /// Start one node per server id with short test timeouts.
    pub async fn new(server_ids: &[i64]) -> Self {
        Self::with_config(server_ids, |_| {}).await
    }

    /// Like [`new`](Self::new), letting `configure` adjust each node's config.
    pub async fn with_config(server_ids: &[i64], configure: impl Fn(&mut NodeConfig)) -> Self {
        let network = MemoryNetwork::new();
        let keys = Arc::new(KeyStore::new());
        let mut nodes = Vec::with_capacity(server_ids.len());
        for &server_id in server_ids {
            let mut config = NodeConfig::for_server(server_id);
            config.worker_count = 2;
            config.sibling_confirm_timeout = Duration::from_millis(500);
            config.clone_timeout = Duration::from_secs(1);
            config.reply_timeout = Duration::from_secs(5);
            config.outbox_retry_interval = Duration::from_millis(50);
            configure(&mut config);

            let node = MeshNode::builder(config)
                .transport(network.endpoint(server_id))
                .persistence(Arc::new(MemoryPersistence::new()))
                .key_store(Arc::clone(&keys))
                .key_pair(Ed25519Signing.generate_key_pair())
                .session_channel(Arc::new(XorSessionChannel::new(server_id)))
                .build()
                .await
                .expect("TestMesh config should be valid");
            node.register_entity::<CounterEntity>()
                .expect("counter registers once");
            node.register_entity::<NoteEntity>()
                .expect("note registers once");
            nodes.push(node);
        }
        for node in &nodes {
            for &server_id in server_ids {
                node.set_server_state(server_id, ServerState::Up)
                    .await
                    .expect("nothing is parked yet");
            }
        }
        Self { network, nodes }
    }

    /// The node for `server_id`. Panics if the mesh has none.
    pub fn node(&self, server_id: i64) -> Arc<MeshNode> {
        self.nodes
            .iter()
            .find(|node| node.server_id() == server_id)
            .cloned()
            .unwrap_or_else(|| panic!("no node {server_id} in this mesh"))
    }

    pub fn network(&self) -> &Arc<MemoryNetwork> {
        &self.network
    }

    /// Mark `server_id` as `state` on every other node.
    pub async fn set_state_everywhere(&self, server_id: i64, state: ServerState) {
        for node in &self.nodes {
            if node.server_id() != server_id {
                node.set_server_state(server_id, state)
                    .await
                    .expect("outbox flush should succeed");
            }
        }
    }

    /// Value of the counter `id` as held by `server_id`.
    pub async fn counter_value(&self, server_id: i64, id: EntityId) -> i64 {
        let slot = self
            .node(server_id)
            .table()
            .resolve_required(&id)
            .await
            .expect("counter should be resident");
        let content = slot.lock().await;
        let entity = content.entity().expect("counter should not be a proxy");
        downcast_ref::<CounterEntity>(entity)
            .expect("entity should be a counter")
            .value
    }

    /// Poll until `server_id` holds the counter `id` with `expected`, for
    /// copies updated asynchronously. Returns whether it got there.
    pub async fn wait_for_counter(&self, server_id: i64, id: EntityId, expected: i64) -> bool {
        let node = self.node(server_id);
        for _ in 0..100 {
            if let Ok(Some(slot)) = node.table().resolve(&id).await {
                let content = slot.lock().await;
                if let Some(counter) = content
                    .entity()
                    .and_then(|entity| downcast_ref::<CounterEntity>(entity).ok())
                {
                    if counter.value == expected {
                        return true;
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    /// Lines of the note `id` as held by `server_id`.
    pub async fn note_lines(&self, server_id: i64, id: EntityId) -> Vec<String> {
        let slot = self
            .node(server_id)
            .table()
            .resolve_required(&id)
            .await
            .expect("note should be resident");
        let content = slot.lock().await;
        let entity = content.entity().expect("note should not be a proxy");
        downcast_ref::<NoteEntity>(entity)
            .expect("entity should be a note")
            .lines
            .clone()
    }

    pub fn shutdown(&self) {
        for node in &self.nodes {
            node.shutdown();
        }
    }
}
