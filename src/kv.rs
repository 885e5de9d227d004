//! Key-value client contract shared by the bootstrap store and the listener's
//! durable certificate layer.

pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryKv;

/// A record as returned by the store. `revision` is the store-assigned
/// modification marker used for compare-and-swap updates and deletes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    pub revision: u64,
}

#[async_trait]
pub trait KvClient: Send + Sync {
    /// Writes `value` only if `key` is absent.
    async fn create(&self, key: &str, value: Vec<u8>) -> Result<(), KvError>;

    /// Replaces `key` if its current revision equals `revision`.
    async fn update(&self, key: &str, revision: u64, value: Vec<u8>) -> Result<(), KvError>;

    /// Removes `key`. A `revision` of zero skips the revision check.
    async fn delete(&self, key: &str, revision: u64) -> Result<(), KvError>;

    /// Records whose key starts with `prefix`, ordered by key. A `limit` of
    /// zero means unbounded.
    async fn list(&self, prefix: &str, limit: usize) -> Result<Vec<KeyValue>, KvError>;

    /// Single-key read built on `list`.
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, KvError> {
        let records = self.list(key, 0).await?;
        Ok(records.into_iter().find(|record| record.key == key))
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KvError {
    #[error("key exists: {key}")]
    KeyExists { key: String },
    #[error("revision mismatch for {key}")]
    RevisionMismatch { key: String },
    #[error("key not found: {key}")]
    NotFound { key: String },
    #[error("write not supported for learner")]
    LearnerRestricted,
    #[error("operation cancelled")]
    Cancelled,
    #[error("datastore unavailable: {0}")]
    Unavailable(String),
    #[error("datastore error: {0}")]
    Backend(String),
}
