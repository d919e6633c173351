//! K-way merge sorter over keyed, sequence-stamped sources.
//!
//! Entries pop in ascending key order. Entries with equal keys pop newest
//! first, so a consumer that keeps the first occurrence of each key and skips
//! the rest sees exactly the winning version.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

struct HeapEntry<K: Ord> {
    key: K,
    source: usize,
    seq: u64,
}

impl<K: Ord> Ord for HeapEntry<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse the key comparison so the
        // smallest key surfaces first. Equal keys surface by descending
        // sequence number.
        other
            .key
            .cmp(&self.key)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl<K: Ord> PartialOrd for HeapEntry<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K: Ord> PartialEq for HeapEntry<K> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<K: Ord> Eq for HeapEntry<K> {}

pub struct MergeSorter<K: Ord> {
    heap: BinaryHeap<HeapEntry<K>>,
}

impl<K: Ord> MergeSorter<K> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
        }
    }

    /// Offer `key` from `source`, stamped with `seq`.
    pub fn push(&mut self, source: usize, key: K, seq: u64) {
        self.heap.push(HeapEntry { key, source, seq });
    }

    /// The key that would pop next, if any.
    pub fn peek(&self) -> Option<&K> {
        self.heap.peek().map(|entry| &entry.key)
    }

    /// Remove and return the next entry as `(key, source, seq)`.
    pub fn pop(&mut self) -> Option<(K, usize, u64)> {
        self.heap
            .pop()
            .map(|entry| (entry.key, entry.source, entry.seq))
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }
}

impl<K: Ord> Default for MergeSorter<K> {
    fn default() -> Self {
        Self::new()
    }
}
