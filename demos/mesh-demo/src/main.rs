//! Four nodes in one process: server 1 manages an account, servers 2 and 3
//! hold sibling replicas, and server 4 is a client that deposits into it and
//! keeps a subscribed copy.
//!
//! Run with `RUST_LOG=tessera=debug` to follow envelopes through the mesh.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use prometheus::{Encoder, Registry, TextEncoder};
use tessera::crypto::{Ed25519Signing, KeyStore, SigningAlgorithm};
use tessera::directory::ServerState;
use tessera::metrics::MeshMetrics;
use tessera::prelude::*;
use tessera::transport::memory::MemoryNetwork;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const MANAGER: i64 = 1;
const SIBLINGS: [i64; 2] = [2, 3];
const CLIENT: i64 = 4;

#[derive(Debug, Clone)]
struct Account {
    core: EntityCore,
    balance: u64,
}

impl Entity for Account {
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
        rmp_serde::to_vec(&self.balance).map_err(|e| MeshError::encode("account", e))
    }

    fn apply_state(&mut self, state: &[u8]) -> Result<(), MeshError> {
        self.balance = rmp_serde::from_slice(state).map_err(|e| MeshError::decode("account", e))?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl EntityType for Account {
    const TAG: &'static str = "account";

    fn decode(core: EntityCore, state: &[u8]) -> Result<Self, MeshError> {
        let mut account = Self { core, balance: 0 };
        account.apply_state(state)?;
        Ok(account)
    }

    fn register_commands(controller: &mut CommandController) -> Result<(), MeshError> {
        controller.register(Deposit {
            settings: CommandSettings::distributed().require(HasAccess(AccessMode::WRITE)),
        })?;
        controller.register(Balance {
            settings: CommandSettings::new().require(HasAccess(AccessMode::READ)),
        })?;
        Ok(())
    }
}

struct Deposit {
    settings: CommandSettings,
}

#[async_trait]
impl Command for Deposit {
    fn slug(&self) -> &str {
        "deposit"
    }

    fn settings(&self) -> &CommandSettings {
        &self.settings
    }

    async fn execute(
        &self,
        ctx: &CommandContext<'_>,
        target: &mut dyn Entity,
    ) -> Result<Vec<u8>, MeshError> {
        let amount: u64 = ctx.value()?;
        let account = downcast_mut::<Account>(target)?;
        account.balance = account.balance.saturating_add(amount);
        encode_reply(&account.balance)
    }
}

struct Balance {
    settings: CommandSettings,
}

#[async_trait]
impl Command for Balance {
    fn slug(&self) -> &str {
        "balance"
    }

    fn settings(&self) -> &CommandSettings {
        &self.settings
    }

    async fn execute(
        &self,
        _ctx: &CommandContext<'_>,
        target: &mut dyn Entity,
    ) -> Result<Vec<u8>, MeshError> {
        let account = downcast_ref::<Account>(&*target)?;
        encode_reply(&account.balance)
    }
}

async fn start_node(
    network: &Arc<MemoryNetwork>,
    keys: &Arc<KeyStore>,
    server_id: i64,
    metrics: Option<Arc<MeshMetrics>>,
) -> anyhow::Result<Arc<MeshNode>> {
    let mut config = NodeConfig::for_server(server_id);
    config.require_signed_envelopes = true;
    let mut builder = MeshNode::builder(config)
        .transport(network.endpoint(server_id))
        .key_store(Arc::clone(keys))
        .key_pair(Ed25519Signing.generate_key_pair());
    if let Some(metrics) = metrics {
        builder = builder.metrics(metrics);
    }
    let node = builder.build().await?;
    node.register_entity::<Account>()?;
    Ok(node)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let network = MemoryNetwork::new();
    let keys = Arc::new(KeyStore::new());
    let registry = Registry::new();
    let manager_metrics = Arc::new(MeshMetrics::new(&registry)?);

    let mut nodes = Vec::new();
    for server_id in [MANAGER, SIBLINGS[0], SIBLINGS[1], CLIENT] {
        let metrics = (server_id == MANAGER).then(|| Arc::clone(&manager_metrics));
        nodes.push(start_node(&network, &keys, server_id, metrics).await?);
    }
    for node in &nodes {
        for other in &nodes {
            node.set_server_state(other.server_id(), ServerState::Up)
                .await?;
        }
    }
    let [manager, _, _, client] = &nodes[..] else {
        anyhow::bail!("expected four nodes");
    };

    let holder = EntityId::from_parts(CLIENT, 1);
    let account = manager.create_entity(Account {
        core: EntityCore::new(holder),
        balance: 0,
    })?;
    manager
        .seed_siblings(account, SIBLINGS.to_vec())
        .await
        .context("seeding sibling replicas")?;
    info!(%account, siblings = ?SIBLINGS, "account created");

    let timeout = client.config().reply_timeout;
    for amount in [10u64, 25, 7] {
        let balance: u64 = client
            .send_command(holder, account, "deposit", &amount)
            .await?
            .value(timeout)
            .await?;
        info!(amount, balance, "deposit confirmed");
    }

    client
        .clone_and_subscribe(holder, account)
        .await
        .context("subscribing to the account")?;
    let balance: u64 = client
        .send_command(holder, account, "deposit", &100u64)
        .await?
        .value(timeout)
        .await?;
    info!(balance, "deposit through the subscribed copy");

    tokio::time::sleep(Duration::from_millis(100)).await;
    let local: u64 = client
        .send_command(holder, account, "balance", &())
        .await?
        .value(timeout)
        .await?;
    info!(local, "balance read from the client's copy");

    let stranger = EntityId::from_parts(CLIENT, 2);
    match client
        .send_command(stranger, account, "deposit", &1u64)
        .await?
        .result(timeout)
        .await
    {
        Ok(_) => info!("stranger deposit was accepted"),
        Err(err) => info!(%err, "stranger deposit was refused"),
    }

    let mut text = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut text)?;
    println!("{}", String::from_utf8_lossy(&text));

    for node in &nodes {
        node.shutdown_and_wait().await;
    }
    Ok(())
}
