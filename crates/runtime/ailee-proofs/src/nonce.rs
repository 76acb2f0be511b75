use crate::proof::VerificationError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NonceStoreError {
    #[error("storage failure: {0}")]
    Storage(String),

    #[error("corrupt record for {0}")]
    Corrupt(String),
}

/// Per-worker replay ceiling. Any nonce at or below `max_nonce_seen` is a
/// replay; records whose ceiling sits below `horizon` may be evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NonceRecord {
    pub max_nonce_seen: u64,
    pub horizon: u64,
}

/// Narrow put/get/snapshot interface over whatever holds the ceilings.
pub trait NonceStore: Send + Sync {
    fn put(&self, worker: &str, record: NonceRecord) -> Result<(), NonceStoreError>;
    fn get(&self, worker: &str) -> Result<Option<NonceRecord>, NonceStoreError>;
    fn remove(&self, worker: &str) -> Result<(), NonceStoreError>;
    fn snapshot(&self) -> Result<Vec<(String, NonceRecord)>, NonceStoreError>;
}

/// Default store: ceilings live only in process memory.
#[derive(Debug, Default)]
pub struct MemoryNonceStore {
    records: Mutex<HashMap<String, NonceRecord>>,
}

impl NonceStore for MemoryNonceStore {
    fn put(&self, worker: &str, record: NonceRecord) -> Result<(), NonceStoreError> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(worker.to_string(), record);
        Ok(())
    }

    fn get(&self, worker: &str) -> Result<Option<NonceRecord>, NonceStoreError> {
        Ok(self
            .records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(worker)
            .copied())
    }

    fn remove(&self, worker: &str) -> Result<(), NonceStoreError> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(worker);
        Ok(())
    }

    fn snapshot(&self) -> Result<Vec<(String, NonceRecord)>, NonceStoreError> {
        let mut all: Vec<(String, NonceRecord)> = self
            .records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(all)
    }
}

/// Durable store: ceilings survive restarts in a sled tree.
pub struct SledNonceStore {
    tree: sled::Tree,
}

impl SledNonceStore {
    pub fn open(db: &sled::Db) -> Result<Self, NonceStoreError> {
        let tree = db
            .open_tree("nonce_ceilings")
            .map_err(|e| NonceStoreError::Storage(e.to_string()))?;
        Ok(Self { tree })
    }
}

impl NonceStore for SledNonceStore {
    fn put(&self, worker: &str, record: NonceRecord) -> Result<(), NonceStoreError> {
        let bytes = bincode::serialize(&record)
            .map_err(|e| NonceStoreError::Storage(e.to_string()))?;
        self.tree
            .insert(worker.as_bytes(), bytes)
            .map_err(|e| NonceStoreError::Storage(e.to_string()))?;
        Ok(())
    }

    fn get(&self, worker: &str) -> Result<Option<NonceRecord>, NonceStoreError> {
        match self
            .tree
            .get(worker.as_bytes())
            .map_err(|e| NonceStoreError::Storage(e.to_string()))?
        {
            Some(bytes) => bincode::deserialize(&bytes)
                .map(Some)
                .map_err(|_| NonceStoreError::Corrupt(worker.to_string())),
            None => Ok(None),
        }
    }

    fn remove(&self, worker: &str) -> Result<(), NonceStoreError> {
        self.tree
            .remove(worker.as_bytes())
            .map_err(|e| NonceStoreError::Storage(e.to_string()))?;
        Ok(())
    }

    fn snapshot(&self) -> Result<Vec<(String, NonceRecord)>, NonceStoreError> {
        let mut all = Vec::new();
        for entry in self.tree.iter() {
            let (key, value) = entry.map_err(|e| NonceStoreError::Storage(e.to_string()))?;
            let worker = String::from_utf8_lossy(&key).into_owned();
            let record = bincode::deserialize(&value)
                .map_err(|_| NonceStoreError::Corrupt(worker.clone()))?;
            all.push((worker, record));
        }
        all.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(all)
    }
}

/// Replay guard: enforces strict nonce monotonicity per worker over a
/// pluggable store.
pub struct NonceRegistry {
    store: Box<dyn NonceStore>,
}

impl NonceRegistry {
    pub fn new(store: Box<dyn NonceStore>) -> Self {
        Self { store }
    }

    /// Accept `nonce` for `worker` iff it is strictly above the recorded
    /// ceiling, then raise the ceiling to it.
    pub fn check_and_record(&self, worker: &str, nonce: u64) -> Result<(), VerificationError> {
        let current = self
            .store
            .get(worker)
            .map_err(|_| VerificationError::NonceReplayDetected {
                peer: worker.to_string(),
                nonce,
            })?
            .unwrap_or_default();

        if nonce <= current.max_nonce_seen {
            return Err(VerificationError::NonceReplayDetected {
                peer: worker.to_string(),
                nonce,
            });
        }

        self.store
            .put(
                worker,
                NonceRecord {
                    max_nonce_seen: nonce,
                    horizon: current.horizon,
                },
            )
            .map_err(|_| VerificationError::NonceReplayDetected {
                peer: worker.to_string(),
                nonce,
            })
    }

    pub fn ceiling(&self, worker: &str) -> u64 {
        self.store
            .get(worker)
            .ok()
            .flatten()
            .map(|r| r.max_nonce_seen)
            .unwrap_or(0)
    }

    /// Raise a worker's horizon; ceilings below it become evictable.
    pub fn advance_horizon(&self, worker: &str, horizon: u64) -> Result<(), NonceStoreError> {
        let mut record = self.store.get(worker)?.unwrap_or_default();
        record.horizon = record.horizon.max(horizon);
        self.store.put(worker, record)
    }

    /// Drop every record whose ceiling has fallen below its horizon.
    /// Returns how many were evicted.
    pub fn evict_below_horizon(&self) -> Result<usize, NonceStoreError> {
        let mut evicted = 0;
        for (worker, record) in self.store.snapshot()? {
            if record.max_nonce_seen < record.horizon {
                self.store.remove(&worker)?;
                evicted += 1;
            }
        }
        Ok(evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_monotonicity_per_worker() {
        let registry = NonceRegistry::new(Box::new(MemoryNonceStore::default()));
        assert!(registry.check_and_record("w1", 7).is_ok());
        assert!(registry.check_and_record("w1", 7).is_err());
        assert!(registry.check_and_record("w1", 3).is_err());
        assert!(registry.check_and_record("w1", 8).is_ok());
        // Independent per worker.
        assert!(registry.check_and_record("w2", 1).is_ok());
        assert_eq!(registry.ceiling("w1"), 8);
    }

    #[test]
    fn horizon_eviction_drops_stale_ceilings() {
        let registry = NonceRegistry::new(Box::new(MemoryNonceStore::default()));
        registry.check_and_record("w1", 5).unwrap();
        registry.check_and_record("w2", 50).unwrap();
        registry.advance_horizon("w1", 10).unwrap();
        registry.advance_horizon("w2", 10).unwrap();
        assert_eq!(registry.evict_below_horizon().unwrap(), 1);
        // Evicted worker starts fresh; surviving one keeps its ceiling.
        assert_eq!(registry.ceiling("w1"), 0);
        assert_eq!(registry.ceiling("w2"), 50);
    }

    #[test]
    fn sled_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = sled::open(dir.path()).unwrap();
            let registry =
                NonceRegistry::new(Box::new(SledNonceStore::open(&db).unwrap()));
            registry.check_and_record("w1", 41).unwrap();
        }
        let db = sled::open(dir.path()).unwrap();
        let registry = NonceRegistry::new(Box::new(SledNonceStore::open(&db).unwrap()));
        assert_eq!(registry.ceiling("w1"), 41);
        assert!(registry.check_and_record("w1", 41).is_err());
        assert!(registry.check_and_record("w1", 42).is_ok());
    }
}
