use crate::error::MeshError;
use crate::types::EntityId;
use async_trait::async_trait;

/// Key of the authoritative record (state + access) of an entity.
pub fn resource_key(id: &EntityId) -> String {
    format!("res/{id}")
}

/// Key of the public copy of an entity (state without access).
pub fn public_key(id: &EntityId) -> String {
    format!("pub/{id}")
}

/// Key of the parked envelopes for one destination server.
pub fn outbox_key(server_id: i64) -> String {
    format!("outbox/{server_id:x}")
}

pub const ROLLBACK_LEDGER_KEY: &str = "rollbackLedger";

pub const TOKENS_KEY: &str = "tokens";

/// Byte-oriented key/value store the node persists entities, tombstones,
/// ledgers and parked envelopes into.
///
/// Keys are `/`-separated paths such as `res/<id>`.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn exists(&self, key: &str) -> Result<bool, MeshError>;

    /// Read a value. Returns `None` if the key does not exist.
    async fn read_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, MeshError>;

    /// Write a value, replacing any previous one.
    async fn write_bytes(&self, key: &str, bytes: &[u8]) -> Result<(), MeshError>;

    /// Delete a value or record log. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), MeshError>;

    /// Append one record to the append-only log stored under `key`.
    async fn append_record(&self, key: &str, record: &[u8]) -> Result<(), MeshError>;

    /// All records appended under `key`, oldest first.
    async fn read_records(&self, key: &str) -> Result<Vec<Vec<u8>>, MeshError>;
}
