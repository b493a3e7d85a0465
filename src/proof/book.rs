use std::{
    hash::{BuildHasher, Hash, Hasher},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tracing::{debug, trace};

use super::{
    cache::DocumentCache,
    store::{DocumentStore, RetryPolicy, StoreError},
    DocumentKey, PartitionKey, ProofDocument,
};

/// Number of mutexes documents are striped over. Two documents sharing a
/// stripe only serialize with each other, which is harmless.
const LOCK_STRIPES: usize = 64;

/// Outcome of moving a document along its ladder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    /// No such document in the cache or the store. The delivery has most
    /// likely completed already.
    NotFound,
    /// The document was already at or past the requested state.
    Unchanged(ProofDocument),
    Advanced(ProofDocument),
}

impl Advance {
    pub fn document(&self) -> Option<&ProofDocument> {
        match self {
            Advance::NotFound => None,
            Advance::Unchanged(doc) | Advance::Advanced(doc) => Some(doc),
        }
    }
}

/// The single entry point for reading and mutating proofs. Reads go to the
/// cache first and fall back to the store; every mutation of a document
/// happens while holding that document's stripe lock, so two handlers
/// finishing at once can't lose each other's update.
pub struct ProofBook {
    cache: DocumentCache,
    store: Arc<dyn DocumentStore>,
    retry: RetryPolicy,
    locks: Vec<Mutex<()>>,
    hasher: ahash::RandomState,
}

impl ProofBook {
    pub fn new(store: Arc<dyn DocumentStore>, retry: RetryPolicy) -> Self {
        Self {
            cache: DocumentCache::new(),
            store,
            retry,
            locks: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            hasher: ahash::RandomState::new(),
        }
    }

    pub fn cache(&self) -> &DocumentCache {
        &self.cache
    }

    fn lock(&self, key: &DocumentKey) -> MutexGuard<'_, ()> {
        let mut hasher = self.hasher.build_hasher();
        key.hash(&mut hasher);
        let stripe = (hasher.finish() % LOCK_STRIPES as u64) as usize;
        self.locks[stripe]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Persists a new document and caches it.
    pub fn create(&self, doc: ProofDocument) -> Result<(), StoreError> {
        let key = doc.key();
        let _guard = self.lock(&key);
        self.retry.run("save", || self.store.save(&doc, &key))?;
        trace!(%key, state = doc.state, "created proof");
        self.cache.put(doc);
        Ok(())
    }

    /// Like [`ProofBook::create`], but leaves an existing document alone.
    /// Returns true if the document was created.
    pub fn create_if_absent(&self, doc: ProofDocument) -> Result<bool, StoreError> {
        let key = doc.key();
        let _guard = self.lock(&key);
        if self.load_locked(&key)?.is_some() {
            return Ok(false);
        }
        self.retry.run("save", || self.store.save(&doc, &key))?;
        trace!(%key, state = doc.state, "created proof");
        self.cache.put(doc);
        Ok(true)
    }

    pub fn load(&self, key: &DocumentKey) -> Result<Option<ProofDocument>, StoreError> {
        let _guard = self.lock(key);
        self.load_locked(key)
    }

    fn load_locked(&self, key: &DocumentKey) -> Result<Option<ProofDocument>, StoreError> {
        if let Some(doc) = self.cache.get(key) {
            return Ok(Some(doc));
        }
        let doc = self.retry.run("load", || self.store.load(key))?;
        if let Some(doc) = &doc {
            // evicted or never cached, e.g. written before a restart
            self.cache.put(doc.clone());
        }
        Ok(doc)
    }

    fn persist_locked(&self, doc: &ProofDocument) -> Result<(), StoreError> {
        let key = doc.key();
        if doc.is_terminal() {
            self.retry.run("delete", || self.store.delete(&key, doc))?;
            self.cache.evict(&key);
            debug!(%key, "proof reached terminal state");
        } else {
            self.retry.run("update", || self.store.update(doc, &key))?;
            self.cache.put(doc.clone());
        }
        Ok(())
    }

    /// Moves the document to `state` if that's further along its ladder and
    /// persists it. Reaching the terminal state deletes it.
    pub fn advance(&self, key: &DocumentKey, state: impl Into<u8>) -> Result<Advance, StoreError> {
        let state = state.into();
        let _guard = self.lock(key);
        let mut doc = match self.load_locked(key)? {
            Some(doc) => doc,
            None => return Ok(Advance::NotFound),
        };
        if !doc.advance(state) {
            return Ok(Advance::Unchanged(doc));
        }
        self.persist_locked(&doc)?;
        Ok(Advance::Advanced(doc))
    }

    /// Records a transmission of the document's message.
    pub fn stamp_attempt(&self, key: &DocumentKey) -> Result<Option<ProofDocument>, StoreError> {
        let _guard = self.lock(key);
        let mut doc = match self.load_locked(key)? {
            Some(doc) => doc,
            None => return Ok(None),
        };
        doc.stamp_attempt();
        self.persist_locked(&doc)?;
        Ok(Some(doc))
    }

    /// Deletes a document regardless of its state.
    pub fn remove(&self, key: &DocumentKey) -> Result<bool, StoreError> {
        let _guard = self.lock(key);
        match self.load_locked(key)? {
            Some(doc) => {
                self.retry.run("delete", || self.store.delete(key, &doc))?;
                self.cache.evict(key);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Cached documents matching `filter`, oldest message first.
    pub fn in_flight<F>(&self, filter: F) -> Vec<ProofDocument>
    where
        F: Fn(&ProofDocument) -> bool,
    {
        self.cache.select(filter)
    }

    /// Loads every document in the partition that hasn't reached its terminal
    /// state into the cache and returns them.
    pub fn rebuild(&self, partition: &PartitionKey) -> Result<Vec<ProofDocument>, StoreError> {
        let docs = match partition.kind.terminal_state() {
            Some(terminal) => self.retry.run("query", || {
                self.store
                    .find_all_by_partition_key_and_state_less_than(partition, terminal)
            })?,
            None => self
                .retry
                .run("query", || self.store.find_all_by_partition_key(partition))?,
        };
        for doc in &docs {
            self.cache.put(doc.clone());
        }
        Ok(docs)
    }

    /// Deletes every document in the partition.
    pub fn purge(&self, partition: &PartitionKey) -> Result<usize, StoreError> {
        let docs = self
            .retry
            .run("query", || self.store.find_all_by_partition_key(partition))?;
        for doc in &docs {
            let key = doc.key();
            let _guard = self.lock(&key);
            self.retry.run("delete", || self.store.delete(&key, doc))?;
            self.cache.evict(&key);
        }
        Ok(docs.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proof::{store::MemoryStore, DeliveryState, ProofKind};
    use std::thread;

    fn book() -> (ProofBook, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (ProofBook::new(store.clone(), RetryPolicy::default()), store)
    }

    fn publish(id: u64, state: DeliveryState) -> ProofDocument {
        ProofDocument::builder()
            .kind(ProofKind::Publish)
            .port(4100)
            .producer(12)
            .message_id(id)
            .state(state.into())
            .build()
    }

    #[test]
    fn test_duplicate_ack_does_not_regress() {
        let (book, _) = book();
        let doc = publish(4001, DeliveryState::Written);
        let key = doc.key();
        book.create(doc).unwrap();
        assert_eq!(
            book.load(&key).unwrap().unwrap().delivery_state(),
            Some(DeliveryState::Written)
        );

        assert!(matches!(
            book.advance(&key, DeliveryState::AckReceived).unwrap(),
            Advance::Advanced(_)
        ));
        for _ in 0..3 {
            match book.advance(&key, DeliveryState::AckReceived).unwrap() {
                Advance::Unchanged(doc) => {
                    assert_eq!(doc.delivery_state(), Some(DeliveryState::AckReceived))
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert!(matches!(
            book.advance(&key, DeliveryState::Written).unwrap(),
            Advance::Unchanged(_)
        ));
    }

    #[test]
    fn test_create_if_absent_keeps_progress() {
        let (book, _) = book();
        let doc = publish(5, DeliveryState::Written);
        let key = doc.key();
        assert!(book.create_if_absent(doc.clone()).unwrap());
        book.advance(&key, DeliveryState::AckReceived).unwrap();

        assert!(!book.create_if_absent(doc).unwrap());
        assert_eq!(
            book.load(&key).unwrap().unwrap().delivery_state(),
            Some(DeliveryState::AckReceived)
        );
    }

    #[test]
    fn test_missing_document_is_not_found() {
        let (book, _) = book();
        let key = publish(1, DeliveryState::Written).key();
        assert_eq!(book.advance(&key, DeliveryState::AckReceived).unwrap(), Advance::NotFound);
        assert_eq!(book.stamp_attempt(&key).unwrap(), None);
        assert!(!book.remove(&key).unwrap());
    }

    #[test]
    fn test_terminal_state_deletes_document() {
        let (book, store) = book();
        let doc = publish(7, DeliveryState::Written);
        let key = doc.key();
        book.create(doc).unwrap();

        book.advance(&key, DeliveryState::Done).unwrap();
        assert!(store.is_empty());
        assert!(book.cache().is_empty());
        assert_eq!(book.advance(&key, DeliveryState::Done).unwrap(), Advance::NotFound);
    }

    #[test]
    fn test_load_falls_back_to_store() {
        let (book, store) = book();
        let doc = publish(9, DeliveryState::AckReceived);
        store.save(&doc, &doc.key()).unwrap();

        assert!(!book.cache().contains(&doc.key()));
        assert_eq!(book.load(&doc.key()).unwrap(), Some(doc.clone()));
        assert!(book.cache().contains(&doc.key()));
    }

    #[test]
    fn test_concurrent_advances_keep_maximum_state() {
        let (book, _) = book();
        let book = Arc::new(book);
        let doc = publish(4001, DeliveryState::Written);
        let key = doc.key();
        book.create(doc).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let book = book.clone();
                let state = if i % 2 == 0 {
                    DeliveryState::AckReceived
                } else {
                    DeliveryState::ThreeWayAckSent
                };
                thread::spawn(move || {
                    for _ in 0..50 {
                        book.advance(&key, state).unwrap();
                        book.stamp_attempt(&key).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let doc = book.load(&key).unwrap().unwrap();
        assert_eq!(doc.delivery_state(), Some(DeliveryState::ThreeWayAckSent));
        assert_eq!(doc.attempts, 400);
    }

    #[test]
    fn test_rebuild_loads_only_in_flight_documents() {
        let (book, store) = book();
        for (id, state) in [
            (1, DeliveryState::Written),
            (2, DeliveryState::AckReceived),
            (3, DeliveryState::ThreeWayAckSent),
            (4, DeliveryState::Done),
        ] {
            let doc = publish(id, state);
            store.save(&doc, &doc.key()).unwrap();
        }
        let partition = publish(1, DeliveryState::Written).key().partition();

        let docs = book.rebuild(&partition).unwrap();
        assert_eq!(docs.len(), 3);
        assert_eq!(book.cache().len(), 3);
        assert_eq!(book.purge(&partition).unwrap(), 4);
        assert!(store.is_empty());
        assert!(book.cache().is_empty());
    }
}
