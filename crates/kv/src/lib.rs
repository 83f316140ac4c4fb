//! Key-value store abstraction for meta-server persistence
//!
//! The meta server keeps all durable state (cluster records, shard views,
//! procedures, the leader key) in a replicated key-value store. This crate
//! defines the store interface plus an in-memory implementation used by the
//! standalone deployment and by tests.

pub mod memory;

pub use memory::MemKv;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Lease identifier granted by the store
pub type LeaseId = u64;

/// Key-value store error
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("key not found: {0}")]
    KeyNotFound(String),
    #[error("lease not found: {0}")]
    LeaseNotFound(LeaseId),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Event delivered to prefix watchers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// Key was written
    Put { key: String, value: Vec<u8> },
    /// Key was deleted explicitly
    Delete { key: String },
    /// Key was removed because its lease expired
    Expired { key: String },
}

/// Guard evaluated before transaction ops are applied
#[derive(Debug, Clone)]
pub enum Compare {
    /// Key holds exactly this value
    ValueEquals(String, Vec<u8>),
    /// Key does not exist
    NotExists(String),
}

/// Mutation applied atomically by a transaction
#[derive(Debug, Clone)]
pub enum Op {
    Put { key: String, value: Vec<u8> },
    PutWithLease { key: String, value: Vec<u8>, lease: LeaseId },
    Delete { key: String },
}

/// Replicated key-value store interface
///
/// The production deployment backs this with an etcd quorum; tests and the
/// single-binary mode use [`MemKv`]. All keys are UTF-8 paths.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), KvError>;

    /// Put a key bound to a lease; the key is removed when the lease expires.
    async fn put_with_lease(&self, key: &str, value: Vec<u8>, lease: LeaseId) -> Result<(), KvError>;

    async fn delete(&self, key: &str) -> Result<(), KvError>;

    /// Return up to `limit` key-value pairs under `prefix`, sorted by key.
    /// A `limit` of zero means no limit.
    async fn scan_prefix(&self, prefix: &str, limit: usize) -> Result<Vec<(String, Vec<u8>)>, KvError>;

    /// Atomically apply `ops` when every compare holds. Returns whether the
    /// transaction committed.
    async fn txn(&self, compares: Vec<Compare>, ops: Vec<Op>) -> Result<bool, KvError>;

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, KvError>;

    /// Extend the lease by its original TTL.
    async fn keep_alive(&self, lease: LeaseId) -> Result<(), KvError>;

    /// Drop the lease and delete every key bound to it.
    async fn revoke_lease(&self, lease: LeaseId) -> Result<(), KvError>;

    /// Subscribe to changes under `prefix`. The receiver stays alive until
    /// dropped; events are delivered in commit order.
    async fn watch_prefix(&self, prefix: &str) -> Result<mpsc::UnboundedReceiver<WatchEvent>, KvError>;
}
