//! Bounded insertion-ordered dedup window.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;

/// Remembers the last `capacity` inserted keys. Older keys are evicted in
/// insertion order, after which they can be seen again.
pub struct BoundedDedup<T: Eq + Hash + Clone> {
    order: VecDeque<T>,
    seen: HashSet<T>,
    capacity: usize,
}

impl<T: Eq + Hash + Clone> BoundedDedup<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Returns true when the key was not in the window.
    pub fn insert(&mut self, key: T) -> bool {
        if self.seen.contains(&key) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(key.clone());
        self.seen.insert(key);
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_insert_is_rejected() {
        let mut dedup = BoundedDedup::new(4);
        assert!(dedup.insert("a"));
        assert!(!dedup.insert("a"));
        assert_eq!(dedup.len(), 1);
    }

    #[test]
    fn eviction_is_oldest_first() {
        let mut dedup = BoundedDedup::new(3);
        for key in [1, 2, 3] {
            assert!(dedup.insert(key));
        }
        // 4 evicts 1.
        assert!(dedup.insert(4));
        assert_eq!(dedup.len(), 3);
        assert!(dedup.insert(1));
        assert!(!dedup.insert(4));
    }

    #[test]
    fn capacity_of_zero_is_clamped() {
        let mut dedup = BoundedDedup::new(0);
        assert!(dedup.insert("a"));
        assert!(!dedup.insert("a"));
        assert!(dedup.insert("b"));
        assert!(dedup.insert("a"));
    }
}
