//! File-backed persistence.
//!
//! Every key maps to a file below `root`: `/` separated segments become
//! directories, `:` is stored as `_`. Record logs are a sequence of
//! `u32` big-endian length prefixes followed by the record bytes.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::MeshError;
use crate::persistence::Persistence;

#[derive(Debug, Clone)]
pub struct FilePersistence {
    root: PathBuf,
}

fn io_error(reason: String, err: std::io::Error) -> MeshError {
    MeshError::PersistenceError {
        reason,
        source: Some(Box::new(err)),
    }
}

impl FilePersistence {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, MeshError> {
        let relative = PathBuf::from(key.replace(':', "_"));
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if key.is_empty() || escapes {
            return Err(MeshError::PersistenceError {
                reason: format!("invalid key `{key}`"),
                source: None,
            });
        }
        Ok(self.root.join(relative))
    }

    async fn ensure_parent(path: &Path) -> Result<(), MeshError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(format!("create {}", parent.display()), e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Persistence for FilePersistence {
    async fn exists(&self, key: &str) -> Result<bool, MeshError> {
        let path = self.path_for(key)?;
        match fs::metadata(&path).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_error(format!("stat {}", path.display()), e)),
        }
    }

    async fn read_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, MeshError> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(format!("read {}", path.display()), e)),
        }
    }

    async fn write_bytes(&self, key: &str, bytes: &[u8]) -> Result<(), MeshError> {
        let path = self.path_for(key)?;
        Self::ensure_parent(&path).await?;
        // Write to a sibling temp file and rename so readers never see a torn value.
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes)
            .await
            .map_err(|e| io_error(format!("write {}", tmp.display()), e))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| io_error(format!("rename {}", path.display()), e))
    }

    async fn delete(&self, key: &str) -> Result<(), MeshError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(format!("delete {}", path.display()), e)),
        }
    }

    async fn append_record(&self, key: &str, record: &[u8]) -> Result<(), MeshError> {
        let path = self.path_for(key)?;
        Self::ensure_parent(&path).await?;
        let len = u32::try_from(record.len()).map_err(|_| MeshError::PersistenceError {
            reason: format!("record of {} bytes is too large", record.len()),
            source: None,
        })?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| io_error(format!("open {}", path.display()), e))?;
        let mut frame = Vec::with_capacity(4 + record.len());
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(record);
        file.write_all(&frame)
            .await
            .map_err(|e| io_error(format!("append {}", path.display()), e))?;
        file.flush()
            .await
            .map_err(|e| io_error(format!("flush {}", path.display()), e))
    }

    async fn read_records(&self, key: &str) -> Result<Vec<Vec<u8>>, MeshError> {
        let Some(bytes) = self.read_bytes(key).await? else {
            return Ok(Vec::new());
        };
        let mut records = Vec::new();
        let mut rest = bytes.as_slice();
        while !rest.is_empty() {
            if rest.len() < 4 {
                return Err(MeshError::PersistenceError {
                    reason: format!("truncated record header in `{key}`"),
                    source: None,
                });
            }
            let len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
            rest = &rest[4..];
            if rest.len() < len {
                return Err(MeshError::PersistenceError {
                    reason: format!("truncated record in `{key}`"),
                    source: None,
                });
            }
            records.push(rest[..len].to_vec());
            rest = &rest[len..];
        }
        Ok(records)
    }
}
