//! Bounded observation buffer
//!
//! Every device keeps its most recent readings (or frames, or audio chunks)
//! in an [`ObservationBuffer`]. Appending to a full buffer evicts the oldest
//! entry. Readers always get a cloned snapshot, so a producer thread can keep
//! appending while a consumer iterates.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

/// Default number of observations a device keeps
pub const DEFAULT_CAPACITY: usize = 100;

/// Thread-safe bounded FIFO with drop-oldest semantics
///
/// Cloning the buffer clones the handle, not the contents.
#[derive(Debug)]
pub struct ObservationBuffer<T> {
    inner: Arc<Mutex<VecDeque<T>>>,
    capacity: usize,
}

impl<T> Clone for ObservationBuffer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            capacity: self.capacity,
        }
    }
}

impl<T: Clone> ObservationBuffer<T> {
    /// Create a buffer holding at most `capacity` items (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    /// Append an item, evicting the head when full
    ///
    /// Returns the evicted item, if any.
    pub fn append(&self, item: T) -> Option<T> {
        let mut queue = self.inner.lock();
        let evicted = if queue.len() >= self.capacity {
            queue.pop_front()
        } else {
            None
        };
        queue.push_back(item);
        evicted
    }

    /// Most recent item
    pub fn latest(&self) -> Option<T> {
        self.inner.lock().back().cloned()
    }

    /// Oldest item still held
    pub fn oldest(&self) -> Option<T> {
        self.inner.lock().front().cloned()
    }

    /// Copy of the current contents, oldest first
    pub fn snapshot(&self) -> Vec<T> {
        self.inner.lock().iter().cloned().collect()
    }

    /// Remove and return every item, oldest first
    pub fn drain(&self) -> Vec<T> {
        self.inner.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

impl<T: Clone> Default for ObservationBuffer<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_is_min_of_appends_and_capacity() {
        for k in 0..12usize {
            let buffer = ObservationBuffer::new(5);
            for i in 0..k {
                buffer.append(i);
            }
            assert_eq!(buffer.len(), k.min(5));
            let expected: Vec<usize> = (k.saturating_sub(5)..k).collect();
            assert_eq!(buffer.snapshot(), expected);
        }
    }

    #[test]
    fn test_append_returns_evicted() {
        let buffer = ObservationBuffer::new(2);
        assert_eq!(buffer.append('a'), None);
        assert_eq!(buffer.append('b'), None);
        assert_eq!(buffer.append('c'), Some('a'));
        assert_eq!(buffer.oldest(), Some('b'));
        assert_eq!(buffer.latest(), Some('c'));
    }

    #[test]
    fn test_snapshot_is_detached() {
        let buffer = ObservationBuffer::new(3);
        buffer.append(1);
        let snap = buffer.snapshot();
        buffer.append(2);
        assert_eq!(snap, vec![1]);
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn test_clone_shares_contents() {
        let producer = ObservationBuffer::default();
        let consumer = producer.clone();
        producer.append(7u8);
        assert_eq!(consumer.latest(), Some(7));
        assert_eq!(consumer.capacity(), DEFAULT_CAPACITY);
        assert_eq!(consumer.drain(), vec![7]);
        assert!(producer.is_empty());
    }

    #[test]
    fn test_concurrent_appends_keep_bound() {
        let buffer = ObservationBuffer::new(10);
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let b = buffer.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        b.append(t * 1000 + i);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(buffer.len(), 10);
    }
}
