//! Bounded "already known" set
//!
//! Remembers the most recent items a peer has seen so the same inventory is
//! not announced to it twice. The oldest entry is evicted once full.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;

/// Number of inventory items remembered per peer
pub const MAX_KNOWN_INVENTORY: usize = 1000;

#[derive(Debug, Clone)]
pub struct BoundedSet<T> {
    items: HashSet<T>,
    order: VecDeque<T>,
    capacity: usize,
}

impl<T: Eq + Hash + Clone> BoundedSet<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Insert an item, evicting the oldest one when full.
    /// Returns false if the item was already present.
    pub fn insert(&mut self, item: T) -> bool {
        if self.items.contains(&item) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.items.remove(&oldest);
            }
        }
        self.items.insert(item.clone());
        self.order.push_back(item);
        true
    }

    pub fn contains(&self, item: &T) -> bool {
        self.items.contains(item)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
