use std::sync::{PoisonError, RwLock};

use hashbrown::HashMap;

use super::{DocumentKey, ProofDocument};

/// In-memory index of in-flight proofs. Documents that reach their terminal
/// state are evicted rather than stored, so the cache is bounded by the
/// number of unconfirmed messages.
#[derive(Default)]
pub struct DocumentCache {
    docs: RwLock<HashMap<DocumentKey, ProofDocument>>,
}

impl DocumentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &DocumentKey) -> Option<ProofDocument> {
        self.docs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Caches `doc`, or evicts it if it has reached its terminal state.
    pub fn put(&self, doc: ProofDocument) {
        let mut docs = self.docs.write().unwrap_or_else(PoisonError::into_inner);
        if doc.is_terminal() {
            docs.remove(&doc.key());
        } else {
            docs.insert(doc.key(), doc);
        }
    }

    pub fn evict(&self, key: &DocumentKey) -> Option<ProofDocument> {
        self.docs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    pub fn contains(&self, key: &DocumentKey) -> bool {
        self.docs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.docs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the cached documents matching `filter`, oldest message
    /// first.
    pub fn select<F>(&self, filter: F) -> Vec<ProofDocument>
    where
        F: Fn(&ProofDocument) -> bool,
    {
        let mut docs: Vec<_> = self
            .docs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|doc| filter(doc))
            .cloned()
            .collect();
        docs.sort_by_key(|doc| doc.uid());
        docs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proof::{DeliveryState, ProofKind};

    fn doc(id: u64) -> ProofDocument {
        ProofDocument::builder()
            .kind(ProofKind::Relay)
            .port(4100)
            .producer(3)
            .consumer(Some(9))
            .message_id(id)
            .state(DeliveryState::Written.into())
            .build()
    }

    #[test]
    fn test_terminal_documents_are_evicted() {
        let cache = DocumentCache::new();
        let mut d = doc(1);
        cache.put(d.clone());
        assert!(cache.contains(&d.key()));

        d.advance(DeliveryState::Done);
        cache.put(d.clone());
        assert!(!cache.contains(&d.key()));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_select_orders_by_message() {
        let cache = DocumentCache::new();
        for id in [30, 10, 20] {
            cache.put(doc(id));
        }
        let ids: Vec<_> = cache.select(|_| true).iter().map(|d| d.message_id).collect();
        assert_eq!(ids, vec![10, 20, 30]);
    }
}
