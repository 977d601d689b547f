//! Commit store backends.
//!
//! Two implementations of [`CommitStore`](crate::CommitStore) ship with the
//! engine: an in-memory map for tests and simulations, and a sled-backed
//! store for deployments that need commits to survive a restart.

use std::path::Path;

use dashmap::DashMap;
use tracing::{debug, info};

use crate::{BatchOp, CommitStore, StorageError, WriteBatch};

/// In-memory commit store backed by a concurrent map.
///
/// Writes are applied in order but the batch is not atomic with respect to
/// concurrent readers; that is acceptable for the simulations and tests this
/// backend exists for.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: DashMap<Vec<u8>, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl CommitStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.data.get(key).map(|entry| entry.value().clone()))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.data.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn apply_batch(&self, batch: WriteBatch) -> Result<(), StorageError> {
        for op in batch.ops() {
            match op {
                BatchOp::Put { key, value } => {
                    self.data.insert(key.clone(), value.clone());
                }
                BatchOp::Delete { key } => {
                    self.data.remove(key);
                }
            }
        }
        Ok(())
    }
}

/// Persistent commit store backed by sled.
///
/// Batches map onto `sled::Batch`, so a commit batch lands atomically and a
/// crash can never expose half of an acceptance.
#[derive(Debug, Clone)]
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    /// Open (or create) a store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        info!("opening sled commit store at {}", path.display());
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// An ephemeral store that is discarded on drop. Used by tests.
    pub fn temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    /// Block until all pending writes reach disk.
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

impl CommitStore for SledStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.db.get(key)?.map(|value| value.to_vec()))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.db.insert(key, value)?;
        Ok(())
    }

    fn apply_batch(&self, batch: WriteBatch) -> Result<(), StorageError> {
        let mut sled_batch = sled::Batch::default();
        for op in batch.ops() {
            match op {
                BatchOp::Put { key, value } => sled_batch.insert(key.as_slice(), value.as_slice()),
                BatchOp::Delete { key } => sled_batch.remove(key.as_slice()),
            }
        }
        debug!("applying commit batch of {} ops", batch.len());
        self.db.apply_batch(sled_batch)?;
        Ok(())
    }
}
