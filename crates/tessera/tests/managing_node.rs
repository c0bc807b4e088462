use std::time::{Duration, Instant};
use tessera::access::AccessMode;
use tessera::directory::ServerState;
use tessera::entity::downcast_mut;
use tessera::error::MeshError;
use tessera::testing::{CounterEntity, TestMesh};
use tessera::types::{EntityId, RedundantReference};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn write_from_client_is_confirmed_once_after_both_siblings_match() {
    let mesh = TestMesh::new(&[1, 2, 3, 4]).await;
    let home = mesh.node(1);
    let client = mesh.node(4);
    let sender = EntityId::from_parts(4, 1);
    let id = home.create_entity(CounterEntity::new(sender)).unwrap();
    home.seed_siblings(id, vec![2, 3]).await.unwrap();

    let pending = client
        .send_command(sender, id, "increment", &5i64)
        .await
        .unwrap();
    let message_id = pending.message_id();
    let value: i64 = pending.value(WAIT).await.unwrap();

    assert_eq!(value, 5);
    assert_eq!(mesh.network().delivered("siblingUpdate"), 2);
    for server in [1, 2, 3] {
        assert_eq!(mesh.counter_value(server, id).await, 5);
    }
    assert!(client.callbacks().is_empty());
    assert!(home.ledger().is_empty());
    assert!(!client.callbacks().complete(
        message_id,
        tessera::reply::ExitResult::Success(Vec::new())
    ));
    mesh.shutdown();
}

#[tokio::test]
async fn silent_sibling_times_out_and_the_write_is_rolled_back() {
    let mesh = TestMesh::with_config(&[1, 2, 3], |config| {
        config.sibling_confirm_timeout = Duration::from_millis(200);
    })
    .await;
    let home = mesh.node(1);
    let owner = EntityId::from_parts(1, 1);
    let id = home.create_entity(CounterEntity::new(owner)).unwrap();
    home.seed_siblings(id, vec![2, 3]).await.unwrap();

    mesh.network().black_hole(3);
    let err = home
        .send_command(owner, id, "increment", &1i64)
        .await
        .unwrap()
        .result(WAIT)
        .await
        .unwrap_err();

    assert!(matches!(err, MeshError::ReplicationFailed { id: failed, .. } if failed == id));
    assert_eq!(mesh.counter_value(1, id).await, 0);
    assert_eq!(mesh.counter_value(2, id).await, 0);
    assert_eq!(home.metrics().rollbacks.get(), 1);
    assert!(home.ledger().is_empty());
    mesh.shutdown();
}

#[tokio::test]
async fn diverged_sibling_fails_the_hash_check() {
    let mesh = TestMesh::new(&[1, 2]).await;
    let home = mesh.node(1);
    let owner = EntityId::from_parts(1, 1);
    let id = home.create_entity(CounterEntity::new(owner)).unwrap();
    home.seed_siblings(id, vec![2]).await.unwrap();

    {
        let slot = mesh.node(2).table().get(&id).unwrap();
        let mut content = slot.lock().await;
        downcast_mut::<CounterEntity>(content.entity_mut().unwrap())
            .unwrap()
            .value = 100;
    }

    let err = home
        .send_command(owner, id, "increment", &1i64)
        .await
        .unwrap()
        .result(WAIT)
        .await
        .unwrap_err();
    assert!(matches!(err, MeshError::ReplicationFailed { .. }));
    assert_eq!(mesh.counter_value(1, id).await, 0);
    assert_eq!(mesh.counter_value(2, id).await, 0);
    mesh.shutdown();
}

#[tokio::test]
async fn sibling_without_a_copy_receives_the_full_record() {
    let mesh = TestMesh::new(&[1, 2]).await;
    let home = mesh.node(1);
    let owner = EntityId::from_parts(1, 1);
    let id = home.create_entity(CounterEntity::new(owner)).unwrap();
    home.register_reference(&RedundantReference::new(id, vec![2]));

    let value: i64 = home
        .send_command(owner, id, "increment", &3i64)
        .await
        .unwrap()
        .value(WAIT)
        .await
        .unwrap();
    assert_eq!(value, 3);
    assert_eq!(mesh.counter_value(2, id).await, 3);
    assert_eq!(mesh.network().delivered("forceClone"), 1);
    mesh.shutdown();
}

#[tokio::test]
async fn live_sibling_manages_while_home_is_down() {
    let mesh = TestMesh::new(&[1, 2, 3]).await;
    let home = mesh.node(1);
    let sender = EntityId::from_parts(3, 1);
    let id = home.create_entity(CounterEntity::new(sender)).unwrap();
    home.seed_siblings(id, vec![2]).await.unwrap();

    mesh.network().isolate(1);
    mesh.set_state_everywhere(1, ServerState::Down).await;
    let client = mesh.node(3);
    client.register_reference(&RedundantReference::new(id, vec![2]));
    assert_eq!(client.directory().managing_node_for(&id), 2);

    let value: i64 = client
        .send_command(sender, id, "increment", &4i64)
        .await
        .unwrap()
        .value(WAIT)
        .await
        .unwrap();
    assert_eq!(value, 4);
    assert_eq!(mesh.counter_value(2, id).await, 4);
    assert_eq!(mesh.counter_value(1, id).await, 0);
    mesh.shutdown();
}

#[tokio::test]
async fn unreachable_manager_gets_the_envelope_once_it_returns() {
    let mesh = TestMesh::new(&[1, 2]).await;
    let home = mesh.node(1);
    let client = mesh.node(2);
    let sender = EntityId::from_parts(2, 1);
    let id = home.create_entity(CounterEntity::new(sender)).unwrap();

    mesh.network().isolate(1);
    let pending = client
        .send_command(sender, id, "increment", &1i64)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(client.outbox().has_parked(1));

    mesh.network().heal(1);
    let value: i64 = pending.value(WAIT).await.unwrap();
    assert_eq!(value, 1);
    assert!(!client.outbox().has_parked(1));
    assert_eq!(mesh.counter_value(1, id).await, 1);
    mesh.shutdown();
}

#[tokio::test]
async fn replication_wait_does_not_hold_up_other_entities() {
    let mesh = TestMesh::with_config(&[1, 2], |config| {
        config.worker_count = 1;
        config.sibling_confirm_timeout = Duration::from_millis(1500);
    })
    .await;
    let home = mesh.node(1);
    let writer = EntityId::from_parts(1, 1);
    let reader = EntityId::from_parts(1, 2);
    let replicated = home.create_entity(CounterEntity::new(writer)).unwrap();
    let mut plain = CounterEntity::new(reader);
    plain.value = 6;
    let plain = home.create_entity(plain).unwrap();
    home.seed_siblings(replicated, vec![2]).await.unwrap();

    mesh.network().black_hole(2);
    let write = home
        .send_command(writer, replicated, "increment", &1i64)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    let value: i64 = home
        .send_command(reader, plain, "get", &())
        .await
        .unwrap()
        .value(WAIT)
        .await
        .unwrap();
    let elapsed = started.elapsed();
    assert_eq!(value, 6);
    assert!(elapsed < Duration::from_millis(500), "read took {elapsed:?}");

    let err = write.result(WAIT).await.unwrap_err();
    assert!(matches!(err, MeshError::ReplicationFailed { .. }));
    assert_eq!(mesh.counter_value(1, replicated).await, 0);
    mesh.shutdown();
}

#[tokio::test]
async fn commands_behind_a_replicating_write_run_after_it() {
    let mesh = TestMesh::with_config(&[1, 2], |config| {
        config.worker_count = 1;
    })
    .await;
    let home = mesh.node(1);
    let owner = EntityId::from_parts(1, 1);
    let reader = EntityId::from_parts(1, 2);
    let mut counter = CounterEntity::new(owner);
    counter.core.access.authorize(reader, AccessMode::READ);
    let id = home.create_entity(counter).unwrap();
    home.seed_siblings(id, vec![2]).await.unwrap();

    mesh.network().hold(2);
    let write = home
        .send_command(owner, id, "increment", &3i64)
        .await
        .unwrap();
    let read = home.send_command(reader, id, "get", &()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(home.callbacks().len() >= 2);

    mesh.network().release(2);
    assert_eq!(write.value::<i64>(WAIT).await.unwrap(), 3);
    assert_eq!(read.value::<i64>(WAIT).await.unwrap(), 3);
    assert_eq!(mesh.counter_value(2, id).await, 3);
    mesh.shutdown();
}

#[tokio::test]
async fn sibling_taking_over_keeps_pushing_to_subscribers() {
    let mesh = TestMesh::new(&[1, 2, 3]).await;
    let home = mesh.node(1);
    let client = mesh.node(3);
    let owner = EntityId::from_parts(2, 1);
    let requester = EntityId::from_parts(3, 1);
    let mut counter = CounterEntity::new(owner);
    counter.core.access.authorize(requester, AccessMode::READ);
    let id = home.create_entity(counter).unwrap();
    home.seed_siblings(id, vec![2]).await.unwrap();
    client.clone_and_subscribe(requester, id).await.unwrap();

    {
        let slot = mesh.node(2).table().get(&id).unwrap();
        let content = slot.lock().await;
        let subscribers = &content.entity().unwrap().access().subscribers;
        assert!(subscribers.contains(&EntityId::server(3)));
    }

    mesh.network().isolate(1);
    mesh.set_state_everywhere(1, ServerState::Down).await;
    client.register_reference(&RedundantReference::new(id, vec![2]));
    let sibling = mesh.node(2);
    assert_eq!(sibling.directory().managing_node_for(&id), 2);

    let value: i64 = sibling
        .send_command(owner, id, "increment", &5i64)
        .await
        .unwrap()
        .value(WAIT)
        .await
        .unwrap();
    assert_eq!(value, 5);
    assert!(mesh.wait_for_counter(3, id, 5).await);
    mesh.shutdown();
}
