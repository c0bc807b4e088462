use std::sync::Arc;
use std::time::Duration;
use tessera::config::NodeConfig;
use tessera::crypto::{Ed25519Signing, KeyStore, SigningAlgorithm};
use tessera::error::MeshError;
use tessera::node::MeshNode;
use tessera::testing::{CounterEntity, TestMesh};
use tessera::types::EntityId;

const WAIT: Duration = Duration::from_secs(5);

async fn file_node(root: &std::path::Path) -> Arc<MeshNode> {
    let mut config = NodeConfig::for_server(1);
    config.data_root = Some(root.to_path_buf());
    config.worker_count = 1;
    let node = MeshNode::builder(config).build().await.unwrap();
    node.register_entity::<CounterEntity>().unwrap();
    node
}

#[tokio::test]
async fn evicted_entity_is_hydrated_on_next_command() {
    let dir = tempfile::tempdir().unwrap();
    let node = file_node(dir.path()).await;
    let owner = EntityId::from_parts(1, 1);
    let id = node.create_entity(CounterEntity::new(owner)).unwrap();

    node.send_command(owner, id, "increment", &6i64)
        .await
        .unwrap()
        .result(WAIT)
        .await
        .unwrap();
    node.table().save(&id, true).await.unwrap();
    assert!(!node.table().contains(&id));

    let value: i64 = node
        .send_command(owner, id, "get", &())
        .await
        .unwrap()
        .value(WAIT)
        .await
        .unwrap();
    assert_eq!(value, 6);
    assert!(node.table().contains(&id));
    node.shutdown_and_wait().await;
}

#[tokio::test]
async fn saved_entities_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let owner = EntityId::from_parts(1, 1);
    let id = {
        let node = file_node(dir.path()).await;
        let mut counter = CounterEntity::new(owner);
        counter.value = 40;
        let id = node.create_entity(counter).unwrap();
        node.table().save(&id, false).await.unwrap();
        node.shutdown_and_wait().await;
        id
    };

    let node = file_node(dir.path()).await;
    let value: i64 = node
        .send_command(owner, id, "increment", &2i64)
        .await
        .unwrap()
        .value(WAIT)
        .await
        .unwrap();
    assert_eq!(value, 42);
    node.shutdown_and_wait().await;
}

#[tokio::test]
async fn old_id_keeps_resolving_after_a_redirect() {
    let mesh = TestMesh::new(&[1]).await;
    let node = mesh.node(1);
    let owner = EntityId::from_parts(1, 1);
    let old = node.create_entity(CounterEntity::new(owner)).unwrap();
    let new = EntityId::from_parts(1, 900_000);
    node.table()
        .update_id_and_add_redirect(old, new)
        .await
        .unwrap();

    let value: i64 = node
        .send_command(owner, old, "increment", &1i64)
        .await
        .unwrap()
        .value(WAIT)
        .await
        .unwrap();
    assert_eq!(value, 1);

    let via_old = node.table().resolve(&old).await.unwrap().unwrap();
    let via_new = node.table().resolve(&new).await.unwrap().unwrap();
    assert!(Arc::ptr_eq(&via_old, &via_new));
    assert_eq!(mesh.counter_value(1, new).await, 1);
    mesh.shutdown();
}

#[tokio::test]
async fn signed_node_rejects_unsigned_envelopes() {
    let keys = Arc::new(KeyStore::new());
    let mut config = NodeConfig::for_server(1);
    config.require_signed_envelopes = true;
    let node = MeshNode::builder(config)
        .key_store(Arc::clone(&keys))
        .key_pair(Ed25519Signing.generate_key_pair())
        .build()
        .await
        .unwrap();
    node.register_entity::<CounterEntity>().unwrap();
    assert!(keys.get(&EntityId::server(1)).is_some());

    let owner = EntityId::from_parts(1, 1);
    let id = node.create_entity(CounterEntity::new(owner)).unwrap();

    let unsigned = node.envelope(owner, id, "increment", &5i64).unwrap();
    let rejected = node.callbacks().register(unsigned.message_id);
    node.receive(unsigned);
    let err = rejected.result(WAIT).await.unwrap_err();
    assert!(matches!(err, MeshError::InvalidSignature));

    let mut forged = node.envelope(owner, id, "increment", &5i64).unwrap();
    forged.signature = Some(vec![7; 64]);
    let rejected = node.callbacks().register(forged.message_id);
    node.receive(forged);
    assert!(matches!(
        rejected.result(WAIT).await.unwrap_err(),
        MeshError::InvalidSignature
    ));

    let value: i64 = node
        .send_command(owner, id, "increment", &1i64)
        .await
        .unwrap()
        .value(WAIT)
        .await
        .unwrap();
    assert_eq!(value, 1);
    node.shutdown_and_wait().await;
}
