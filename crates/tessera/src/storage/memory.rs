use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::MeshError;
use crate::persistence::Persistence;

/// In-memory persistence for testing and offline nodes.
#[derive(Default)]
pub struct MemoryPersistence {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    values: HashMap<String, Vec<u8>>,
    records: HashMap<String, Vec<Vec<u8>>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys currently holding a value or record log, sorted.
    pub fn keys(&self) -> Vec<String> {
        let inner = self.inner.lock();
        let mut keys: Vec<String> = inner
            .values
            .keys()
            .chain(inner.records.keys())
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn exists(&self, key: &str) -> Result<bool, MeshError> {
        let inner = self.inner.lock();
        Ok(inner.values.contains_key(key) || inner.records.contains_key(key))
    }

    async fn read_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, MeshError> {
        Ok(self.inner.lock().values.get(key).cloned())
    }

    async fn write_bytes(&self, key: &str, bytes: &[u8]) -> Result<(), MeshError> {
        self.inner
            .lock()
            .values
            .insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), MeshError> {
        let mut inner = self.inner.lock();
        inner.values.remove(key);
        inner.records.remove(key);
        Ok(())
    }

    async fn append_record(&self, key: &str, record: &[u8]) -> Result<(), MeshError> {
        self.inner
            .lock()
            .records
            .entry(key.to_string())
            .or_default()
            .push(record.to_vec());
        Ok(())
    }

    async fn read_records(&self, key: &str) -> Result<Vec<Vec<u8>>, MeshError> {
        Ok(self
            .inner
            .lock()
            .records
            .get(key)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_read_delete() {
        let store = MemoryPersistence::new();
        assert!(!store.exists("res/1:1").await.unwrap());
        store.write_bytes("res/1:1", b"abc").await.unwrap();
        assert!(store.exists("res/1:1").await.unwrap());
        assert_eq!(
            store.read_bytes("res/1:1").await.unwrap(),
            Some(b"abc".to_vec())
        );
        store.delete("res/1:1").await.unwrap();
        assert_eq!(store.read_bytes("res/1:1").await.unwrap(), None);
        store.delete("res/1:1").await.unwrap();
    }

    #[tokio::test]
    async fn records_append_in_order() {
        let store = MemoryPersistence::new();
        store.append_record("outbox/2", b"one").await.unwrap();
        store.append_record("outbox/2", b"two").await.unwrap();
        assert_eq!(
            store.read_records("outbox/2").await.unwrap(),
            vec![b"one".to_vec(), b"two".to_vec()]
        );
        assert_eq!(store.keys(), vec!["outbox/2".to_string()]);
        assert!(store.read_records("outbox/3").await.unwrap().is_empty());
    }
}
