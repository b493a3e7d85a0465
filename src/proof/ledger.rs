use std::sync::{PoisonError, RwLock};

use hashbrown::{HashMap, HashSet};

use crate::net::{EventType, NodeId};

/// The message ids seen per producing node and event type. Used to reject
/// duplicates and rebuilt from the store's in-flight documents at startup.
/// Entries are only dropped to undo a record whose handling failed.
#[derive(Default)]
pub struct MasterMessageLedger {
    entries: RwLock<HashMap<(NodeId, EventType), HashSet<u64>>>,
}

impl MasterMessageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the id, returning true if it wasn't already recorded.
    pub fn record(&self, producer: NodeId, event_type: EventType, message_id: u64) -> bool {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry((producer, event_type))
            .or_default()
            .insert(message_id)
    }

    /// Drops an id recorded by a delivery that didn't go through, so a
    /// retransmission is handled again.
    pub fn forget(&self, producer: NodeId, event_type: EventType, message_id: u64) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let Some(ids) = entries.get_mut(&(producer, event_type)) else {
            return false;
        };
        let removed = ids.remove(&message_id);
        if ids.is_empty() {
            entries.remove(&(producer, event_type));
        }
        removed
    }

    pub fn contains(&self, producer: NodeId, event_type: EventType, message_id: u64) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(producer, event_type))
            .map_or(false, |ids| ids.contains(&message_id))
    }

    /// Total ids recorded across all producers and event types.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(HashSet::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self, producer: NodeId, event_type: EventType) -> Vec<u64> {
        let mut ids: Vec<_> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(producer, event_type))
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }
}
