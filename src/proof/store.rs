use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{PoisonError, RwLock},
    thread,
    time::Duration,
};

use hashbrown::HashMap;
use rkyv::AlignedVec;
use thiserror::Error;
use tracing::{debug, warn};

use super::{DocumentKey, PartitionKey, ProofDocument};

const PROOF_EXTENSION: &str = "proof";

#[derive(Debug, Error)]
pub enum StoreError {
    /// The write could not be made durable, even after recovering from a
    /// missing directory.
    #[error("failed to sync document {key}: {reason}")]
    SyncFailed { key: String, reason: String },
    #[error("failed to encode document {key}: {reason}")]
    Encode { key: String, reason: String },
    #[error("failed to decode {path}: {reason}")]
    Decode { path: PathBuf, reason: String },
    #[error("store i/o on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

/// Where proof documents live between restarts. The engine only relies on
/// these operations, not on how they're implemented.
pub trait DocumentStore: Send + Sync {
    fn load(&self, key: &DocumentKey) -> Result<Option<ProofDocument>, StoreError>;

    fn save(&self, doc: &ProofDocument, key: &DocumentKey) -> Result<(), StoreError>;

    fn update(&self, doc: &ProofDocument, key: &DocumentKey) -> Result<(), StoreError>;

    fn delete(&self, key: &DocumentKey, doc: &ProofDocument) -> Result<(), StoreError>;

    fn find_all_by_partition_key(
        &self,
        partition: &PartitionKey,
    ) -> Result<Vec<ProofDocument>, StoreError>;

    fn find_all_by_partition_key_and_state_less_than(
        &self,
        partition: &PartitionKey,
        state: u8,
    ) -> Result<Vec<ProofDocument>, StoreError> {
        let mut docs = self.find_all_by_partition_key(partition)?;
        docs.retain(|doc| doc.state < state);
        Ok(docs)
    }
}

/// How many times a failed store call is attempted, and how long to wait
/// between attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    /// Runs `op` until it succeeds or the attempts run out, returning the
    /// last error. Blocks the calling thread between attempts.
    pub fn run<T, F>(&self, what: &str, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Result<T, StoreError>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if attempt < attempts => {
                    warn!(attempt, attempts, error = %e, "store {} failed, retrying", what);
                    thread::sleep(self.backoff);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Keeps documents in memory only. Everything is lost on restart.
#[derive(Default)]
pub struct MemoryStore {
    docs: RwLock<HashMap<DocumentKey, ProofDocument>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.docs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DocumentStore for MemoryStore {
    fn load(&self, key: &DocumentKey) -> Result<Option<ProofDocument>, StoreError> {
        Ok(self
            .docs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    fn save(&self, doc: &ProofDocument, key: &DocumentKey) -> Result<(), StoreError> {
        self.docs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(*key, doc.clone());
        Ok(())
    }

    fn update(&self, doc: &ProofDocument, key: &DocumentKey) -> Result<(), StoreError> {
        self.save(doc, key)
    }

    fn delete(&self, key: &DocumentKey, _doc: &ProofDocument) -> Result<(), StoreError> {
        self.docs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }

    fn find_all_by_partition_key(
        &self,
        partition: &PartitionKey,
    ) -> Result<Vec<ProofDocument>, StoreError> {
        Ok(self
            .docs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(key, _)| key.partition() == *partition)
            .map(|(_, doc)| doc.clone())
            .collect())
    }
}

/// Stores each document as an rkyv archive under
/// `<root>/<kind>/<port>/<consumer>_<source>-<id>.proof`.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn partition_dir(&self, partition: &PartitionKey) -> PathBuf {
        self.root
            .join(partition.kind.name())
            .join(partition.port.to_string())
    }

    fn path(&self, key: &DocumentKey) -> PathBuf {
        let consumer = key
            .consumer
            .map(|node| node.to_string())
            .unwrap_or_else(|| "all".into());
        self.partition_dir(&key.partition())
            .join(format!("{}_{}.{}", consumer, key.uid, PROOF_EXTENSION))
    }

    fn write(&self, doc: &ProofDocument, key: &DocumentKey) -> Result<(), StoreError> {
        let bytes = rkyv::to_bytes::<_, 256>(doc).map_err(|e| StoreError::Encode {
            key: key.to_string(),
            reason: format!("{:?}", e),
        })?;
        let path = self.path(key);
        let tmp = path.with_extension("tmp");
        let sync_failed = |e: io::Error| StoreError::SyncFailed {
            key: key.to_string(),
            reason: e.to_string(),
        };

        match fs::write(&tmp, bytes.as_slice()) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // first document in this partition
                let dir = self.partition_dir(&key.partition());
                debug!("creating proof directory {}", dir.display());
                fs::create_dir_all(&dir).map_err(sync_failed)?;
                fs::write(&tmp, bytes.as_slice()).map_err(sync_failed)?;
            }
            other => other.map_err(sync_failed)?,
        }
        fs::rename(&tmp, &path).map_err(sync_failed)
    }

    fn read(path: &Path) -> Result<ProofDocument, StoreError> {
        let bytes = fs::read(path).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        // archives must be read from aligned memory
        let mut aligned = AlignedVec::with_capacity(bytes.len());
        aligned.extend_from_slice(&bytes);
        rkyv::from_bytes::<ProofDocument>(aligned.as_slice()).map_err(|e| StoreError::Decode {
            path: path.to_path_buf(),
            reason: format!("{:?}", e),
        })
    }
}

impl DocumentStore for FileStore {
    fn load(&self, key: &DocumentKey) -> Result<Option<ProofDocument>, StoreError> {
        let path = self.path(key);
        if !path.exists() {
            return Ok(None);
        }
        Self::read(&path).map(Some)
    }

    fn save(&self, doc: &ProofDocument, key: &DocumentKey) -> Result<(), StoreError> {
        self.write(doc, key)
    }

    fn update(&self, doc: &ProofDocument, key: &DocumentKey) -> Result<(), StoreError> {
        self.write(doc, key)
    }

    fn delete(&self, key: &DocumentKey, _doc: &ProofDocument) -> Result<(), StoreError> {
        let path = self.path(key);
        match fs::remove_file(&path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(StoreError::SyncFailed {
                key: key.to_string(),
                reason: e.to_string(),
            }),
            _ => Ok(()),
        }
    }

    fn find_all_by_partition_key(
        &self,
        partition: &PartitionKey,
    ) -> Result<Vec<ProofDocument>, StoreError> {
        let dir = self.partition_dir(partition);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(StoreError::Io { path: dir, source }),
        };

        let mut docs = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|source| StoreError::Io {
                    path: dir.clone(),
                    source,
                })?
                .path();
            if path.extension().map_or(false, |ext| ext == PROOF_EXTENSION) {
                docs.push(Self::read(&path)?);
            }
        }
        Ok(docs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proof::{DeliveryState, ProofKind};
    use std::cell::Cell;
    use tempfile::TempDir;

    fn doc(id: u64, state: DeliveryState) -> ProofDocument {
        ProofDocument::builder()
            .kind(ProofKind::Publish)
            .port(4100)
            .producer(12)
            .event_type(3)
            .message_id(id)
            .state(state.into())
            .payload(b"event".to_vec())
            .build()
    }

    #[test]
    fn test_file_store_creates_missing_directories() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path().join("nested/proofs"));
        let d = doc(4001, DeliveryState::Written);

        store.save(&d, &d.key()).unwrap();
        assert_eq!(store.load(&d.key()).unwrap(), Some(d.clone()));
    }

    #[test]
    fn test_file_store_update_and_delete() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());
        let mut d = doc(1, DeliveryState::Written);
        store.save(&d, &d.key()).unwrap();

        d.advance(DeliveryState::AckReceived);
        store.update(&d, &d.key()).unwrap();
        let loaded = store.load(&d.key()).unwrap().unwrap();
        assert_eq!(loaded.delivery_state(), Some(DeliveryState::AckReceived));

        store.delete(&d.key(), &d).unwrap();
        assert_eq!(store.load(&d.key()).unwrap(), None);
        // deleting twice is fine
        store.delete(&d.key(), &d).unwrap();
    }

    #[test]
    fn test_file_store_partition_queries() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());
        for (id, state) in [
            (1, DeliveryState::Written),
            (2, DeliveryState::AckReceived),
            (3, DeliveryState::Done),
        ] {
            let d = doc(id, state);
            store.save(&d, &d.key()).unwrap();
        }
        let partition = doc(1, DeliveryState::Written).key().partition();

        assert_eq!(store.find_all_by_partition_key(&partition).unwrap().len(), 3);
        let mut pending: Vec<_> = store
            .find_all_by_partition_key_and_state_less_than(&partition, DeliveryState::Done.into())
            .unwrap()
            .into_iter()
            .map(|d| d.message_id)
            .collect();
        pending.sort_unstable();
        assert_eq!(pending, vec![1, 2]);

        let empty = PartitionKey {
            kind: ProofKind::Relay,
            port: 4100,
        };
        assert!(store.find_all_by_partition_key(&empty).unwrap().is_empty());
    }

    #[test]
    fn test_memory_store_partitions_by_port() {
        let store = MemoryStore::new();
        let a = doc(1, DeliveryState::Written);
        let mut b = doc(2, DeliveryState::Written);
        b.port = 4200;
        store.save(&a, &a.key()).unwrap();
        store.save(&b, &b.key()).unwrap();

        let found = store.find_all_by_partition_key(&a.key().partition()).unwrap();
        assert_eq!(found, vec![a]);
    }

    #[test]
    fn test_retry_policy_gives_up_after_attempts() {
        let policy = RetryPolicy {
            attempts: 3,
            backoff: Duration::from_millis(1),
        };
        let calls = Cell::new(0);
        let result: Result<(), _> = policy.run("save", || {
            calls.set(calls.get() + 1);
            Err(StoreError::SyncFailed {
                key: "k".into(),
                reason: "disk full".into(),
            })
        });
        assert!(matches!(result, Err(StoreError::SyncFailed { .. })));
        assert_eq!(calls.get(), 3);

        let calls = Cell::new(0);
        let result = policy.run("save", || {
            calls.set(calls.get() + 1);
            if calls.get() < 2 {
                Err(StoreError::SyncFailed {
                    key: "k".into(),
                    reason: "busy".into(),
                })
            } else {
                Ok(7)
            }
        });
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.get(), 2);
    }
}
