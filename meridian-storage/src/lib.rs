//! # Meridian Commit Storage
//!
//! Durable storage for accepted decisions. The consensus engine persists a
//! [`CommitRecord`] for every decision it accepts *before* notifying any
//! acceptor hook, so a crash between persistence and notification can be
//! healed by replaying the store. The engine only needs the small
//! [`CommitStore`] surface; hosts pick a backend:
//!
//! - [`MemoryStore`]: concurrent in-process map, for tests and simulations
//! - [`SledStore`]: sled-backed persistent store for single-node deployments

use chrono::{DateTime, Utc};
use meridian_core::Id;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod backends;

pub use backends::{MemoryStore, SledStore};

/// Key prefix under which commit records are stored.
const COMMIT_PREFIX: &[u8] = b"commit/";

/// Storage failures. All variants are host-recoverable in principle, but
/// the engine treats a failed commit batch as fatal for the affected chain.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("stored value is corrupt: {0}")]
    Corrupt(String),
}

impl From<sled::Error> for StorageError {
    fn from(err: sled::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

/// One operation inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// An ordered group of writes applied together. Backends with atomic batch
/// support (sled) apply it atomically; the in-memory backend applies ops in
/// order.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Put {
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Delete { key: key.into() });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }
}

/// Minimal key-value surface the consensus engine persists through.
pub trait CommitStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError>;

    /// Apply a batch of writes, atomically where the backend allows.
    fn apply_batch(&self, batch: WriteBatch) -> Result<(), StorageError>;
}

/// The persisted form of an accepted decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub id: Id,
    pub height: u64,
    pub parents: Vec<Id>,
    pub payload: Vec<u8>,
    /// Opaque finality certificate, when a signer is configured.
    pub certificate: Option<Vec<u8>>,
    pub accepted_at: DateTime<Utc>,
}

impl CommitRecord {
    /// The store key for this record's decision id.
    pub fn key(id: &Id) -> Vec<u8> {
        let mut key = Vec::with_capacity(COMMIT_PREFIX.len() + Id::LEN);
        key.extend_from_slice(COMMIT_PREFIX);
        key.extend_from_slice(id.as_bytes());
        key
    }

    pub fn encode(&self) -> Result<Vec<u8>, StorageError> {
        bincode::serialize(self).map_err(|e| StorageError::Corrupt(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        bincode::deserialize(bytes).map_err(|e| StorageError::Corrupt(e.to_string()))
    }
}

/// Read back the commit record for `id`, if one was persisted.
pub fn load_commit(store: &dyn CommitStore, id: &Id) -> Result<Option<CommitRecord>, StorageError> {
    match store.get(&CommitRecord::key(id))? {
        Some(bytes) => Ok(Some(CommitRecord::decode(&bytes)?)),
        None => Ok(None),
    }
}
