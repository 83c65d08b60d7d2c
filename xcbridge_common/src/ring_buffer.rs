//! # Bounded Ring Buffer
//!
//! A fixed-capacity FIFO that keeps the most recently appended items and
//! counts every item it had to evict to stay within capacity.
//!
//! ```rust
//! use xcbridge_common::RingBuffer;
//!
//! let mut buf = RingBuffer::new(2);
//! buf.push("a");
//! buf.push("b");
//! buf.push("c");
//!
//! assert_eq!(buf.to_vec(), vec!["b", "c"]);
//! assert_eq!(buf.dropped_count(), 1);
//! ```

use std::collections::VecDeque;

/// Fixed-capacity FIFO with eviction counting.
///
/// Appending to a full buffer evicts exactly the oldest retained item and
/// increments [`RingBuffer::dropped_count`] by one. The drop counter never
/// decreases.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
    dropped: u64,
}

impl<T> RingBuffer<T> {
    /// Create an empty buffer holding at most `capacity` items.
    ///
    /// A capacity of zero is raised to one, so the buffer always retains the
    /// most recent item.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
            dropped: 0,
        }
    }

    /// Append an item, evicting the oldest one if the buffer is full.
    ///
    /// Returns the evicted item, if any.
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.items.len() >= self.capacity {
            self.dropped += 1;
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    /// Number of items currently retained.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total number of items evicted by capacity overflow since creation.
    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }

    /// Iterate over retained items, oldest first.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.items.iter()
    }

    /// Consume the buffer, returning retained items oldest first.
    pub fn into_vec(self) -> Vec<T> {
        self.items.into()
    }
}

impl<T: Clone> RingBuffer<T> {
    /// Copy of the retained items, oldest first.
    pub fn to_vec(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }

    /// Copy of the newest `limit` items, oldest first.
    pub fn tail(&self, limit: usize) -> Vec<T> {
        let skip = self.items.len().saturating_sub(limit);
        self.items.iter().skip(skip).cloned().collect()
    }
}
