use crate::codec::{EntityRecord, EntityRegistry};
use crate::entity::Entity;
use crate::error::MeshError;
use crate::metrics::MeshMetrics;
use crate::persistence::{Persistence, ROLLBACK_LEDGER_KEY};
use crate::types::{EntityId, MessageId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// A pre-command snapshot of an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub message_id: MessageId,
    pub target_id: EntityId,
    pub snapshot: EntityRecord,
}

/// Snapshots taken before replicated writes so a write the siblings reject
/// can be undone. Snapshots live only in the ledger, never in the entity
/// table, and the ledger is persisted under `rollbackLedger`.
pub struct RollbackLedger {
    entries: Mutex<Vec<LedgerEntry>>,
    registry: Arc<EntityRegistry>,
    persistence: Arc<dyn Persistence>,
    metrics: Arc<MeshMetrics>,
}

impl RollbackLedger {
    pub fn new(
        registry: Arc<EntityRegistry>,
        persistence: Arc<dyn Persistence>,
        metrics: Arc<MeshMetrics>,
    ) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            registry,
            persistence,
            metrics,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn snapshot_for(&self, target_id: &EntityId, message_id: MessageId) -> Option<EntityRecord> {
        self.entries
            .lock()
            .iter()
            .find(|e| e.target_id == *target_id && e.message_id == message_id)
            .map(|e| e.snapshot.clone())
    }

    /// Snapshot `entity` before `message_id` runs against it.
    #[instrument(skip(self, entity), fields(target = %entity.id(), %message_id))]
    pub async fn add(&self, entity: &dyn Entity, message_id: MessageId) -> Result<(), MeshError> {
        let snapshot = self.registry.encode(entity, true)?;
        self.entries.lock().push(LedgerEntry {
            message_id,
            target_id: entity.id(),
            snapshot,
        });
        self.persist().await?;
        debug!("took rollback snapshot");
        Ok(())
    }

    /// Restore `target` to the snapshot taken for `message_id` and drop the
    /// snapshot. Returns `false` when there was none.
    #[instrument(skip(self, target), fields(target = %target.id(), %message_id))]
    pub async fn rollback(
        &self,
        target: &mut dyn Entity,
        message_id: MessageId,
    ) -> Result<bool, MeshError> {
        let target_id = target.id();
        let Some(snapshot) = self.snapshot_for(&target_id, message_id) else {
            warn!("no rollback snapshot");
            return Ok(false);
        };
        self.registry.restore_into(target, &snapshot)?;
        self.metrics.rollbacks.inc();
        self.remove(&target_id, message_id).await?;
        debug!("rolled back");
        Ok(true)
    }

    /// Discard the snapshot for `message_id` once the write is confirmed.
    pub async fn remove(&self, target_id: &EntityId, message_id: MessageId) -> Result<(), MeshError> {
        let removed = {
            let mut entries = self.entries.lock();
            let before = entries.len();
            entries.retain(|e| !(e.target_id == *target_id && e.message_id == message_id));
            before - entries.len()
        };
        if removed == 0 {
            return Ok(());
        }
        self.persist().await
    }

    async fn persist(&self) -> Result<(), MeshError> {
        let bytes = {
            let entries = self.entries.lock();
            rmp_serde::to_vec(&*entries).map_err(|e| MeshError::encode("rollback ledger", e))?
        };
        self.persistence
            .write_bytes(ROLLBACK_LEDGER_KEY, &bytes)
            .await
    }

    /// Reload the ledger left behind by a previous run.
    pub async fn load(&self) -> Result<(), MeshError> {
        let Some(bytes) = self.persistence.read_bytes(ROLLBACK_LEDGER_KEY).await? else {
            return Ok(());
        };
        let loaded: Vec<LedgerEntry> = rmp_serde::from_slice(&bytes)
            .map_err(|e| MeshError::decode("rollback ledger", e))?;
        *self.entries.lock() = loaded;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::CommandController;
    use crate::entity::downcast_ref;
    use crate::entity_table::EntityTable;
    use crate::storage::memory::MemoryPersistence;
    use crate::testing::CounterEntity;

    struct Fixture {
        ledger: RollbackLedger,
        table: Arc<EntityTable>,
        registry: Arc<EntityRegistry>,
        persistence: Arc<MemoryPersistence>,
        metrics: Arc<MeshMetrics>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(EntityRegistry::new(Arc::new(CommandController::new())));
        registry.register::<CounterEntity>().unwrap();
        let persistence = Arc::new(MemoryPersistence::new());
        let metrics = Arc::new(MeshMetrics::unregistered());
        let table = Arc::new(EntityTable::new(
            7,
            Arc::clone(&registry),
            persistence.clone(),
            16,
            Arc::clone(&metrics),
        ));
        let ledger = RollbackLedger::new(
            Arc::clone(&registry),
            persistence.clone(),
            Arc::clone(&metrics),
        );
        Fixture {
            ledger,
            table,
            registry,
            persistence,
            metrics,
        }
    }

    fn counter(value: i64) -> CounterEntity {
        let mut counter = CounterEntity::new(EntityId::from_parts(7, 1));
        counter.core.id = EntityId::from_parts(7, 100);
        counter.value = value;
        counter
    }

    #[tokio::test]
    async fn rollback_restores_snapshot() {
        let f = fixture();
        let mut target = counter(5);
        f.ledger.add(&target, MessageId(1)).await.unwrap();
        assert_eq!(f.ledger.len(), 1);

        target.value = 99;
        target.core.version = 1;
        target.core.access.owner = EntityId::from_parts(7, 2);
        assert!(f.ledger.rollback(&mut target, MessageId(1)).await.unwrap());

        assert_eq!(target.value, 5);
        assert_eq!(target.core.version, 0);
        assert_eq!(target.core.access.owner, EntityId::from_parts(7, 1));
        assert_eq!(target.core.id, EntityId::from_parts(7, 100));
        assert!(f.ledger.is_empty());
        assert_eq!(f.metrics.rollbacks.get(), 1);
    }

    #[tokio::test]
    async fn snapshots_are_not_entities() {
        let f = fixture();
        let target = counter(2);
        f.table.insert_if_absent(Box::new(target.clone())).unwrap();
        let assigned = f.table.len();
        f.ledger.add(&target, MessageId(9)).await.unwrap();

        assert_eq!(f.table.len(), assigned);
        let snapshot = f.ledger.snapshot_for(&target.core.id, MessageId(9)).unwrap();
        assert_eq!(snapshot.id, target.core.id);
        assert!(f.table.resolve(&EntityId::from_parts(7, 101)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remove_drops_snapshot() {
        let f = fixture();
        let target = counter(1);
        f.ledger.add(&target, MessageId(2)).await.unwrap();
        f.ledger.remove(&target.core.id, MessageId(2)).await.unwrap();
        assert!(f.ledger.is_empty());
        assert!(f.ledger.snapshot_for(&target.core.id, MessageId(2)).is_none());
    }

    #[tokio::test]
    async fn rollback_without_snapshot_is_noop() {
        let f = fixture();
        let mut target = counter(3);
        assert!(!f.ledger.rollback(&mut target, MessageId(3)).await.unwrap());
        assert_eq!(target.value, 3);
    }

    #[tokio::test]
    async fn ledger_survives_restart() {
        let f = fixture();
        let mut target = counter(8);
        f.ledger.add(&target, MessageId(4)).await.unwrap();

        let reloaded = RollbackLedger::new(
            Arc::clone(&f.registry),
            f.persistence.clone(),
            Arc::clone(&f.metrics),
        );
        reloaded.load().await.unwrap();
        assert_eq!(reloaded.len(), 1);

        target.value = 0;
        assert!(reloaded.rollback(&mut target, MessageId(4)).await.unwrap());
        assert_eq!(downcast_ref::<CounterEntity>(&target).unwrap().value, 8);
    }
}
