use std::collections::{HashSet, VecDeque};

use crate::events::DedupKey;

/// Size that triggers a trim.
pub const C_MAX: usize = 10_000;
/// Entries retained after a trim.
pub const C_KEEP: usize = 5_000;

/// Insertion-ordered set of seen event keys. Trimming drops the oldest
/// entries; lookups do not refresh an entry's position.
#[derive(Debug, Default)]
pub struct EventCache {
    order: VecDeque<DedupKey>,
    seen: HashSet<DedupKey>,
}

impl EventCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &DedupKey) -> bool {
        self.seen.contains(key)
    }

    /// Returns false if the key was already present.
    pub fn insert(&mut self, key: DedupKey) -> bool {
        if !self.seen.insert(key.clone()) {
            return false;
        }
        self.order.push_back(key);
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Returns the number of keys dropped.
    pub fn trim(&mut self) -> usize {
        if self.order.len() <= C_MAX {
            return 0;
        }
        let drop = self.order.len() - C_KEEP;
        for key in self.order.drain(..drop) {
            self.seen.remove(&key);
        }
        drop
    }
}
