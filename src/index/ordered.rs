//! Ordered string index.
//!
//! A lock-free skip list keyed by raw bytes with lexicographic ordering.
//! Readers iterate without blocking each other; mutation arrives
//! serialized under the string datatype's write lock, which lets the
//! element count live in a plain atomic.

use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_skiplist::SkipMap;

use super::{Index, IndexNode};

pub struct OrderedIndex {
    map: SkipMap<Vec<u8>, IndexNode>,
    len: AtomicUsize,
}

impl OrderedIndex {
    pub fn new() -> Self {
        Self {
            map: SkipMap::new(),
            len: AtomicUsize::new(0),
        }
    }

    /// Visits entries inside `bounds` in key order (reversed when asked)
    /// until `f` returns false.
    pub fn range_scan(
        &self,
        bounds: (Bound<Vec<u8>>, Bound<Vec<u8>>),
        reverse: bool,
        f: &mut dyn FnMut(&[u8], &IndexNode) -> bool,
    ) {
        let range = self.map.range(bounds);
        if reverse {
            for entry in range.rev() {
                if !f(entry.key(), entry.value()) {
                    return;
                }
            }
        } else {
            for entry in range {
                if !f(entry.key(), entry.value()) {
                    return;
                }
            }
        }
    }
}

impl Default for OrderedIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl Index for OrderedIndex {
    fn put(&mut self, key: Vec<u8>, node: IndexNode) -> Option<IndexNode> {
        let old = self.map.get(&key).map(|e| e.value().clone());
        self.map.insert(key, node);
        if old.is_none() {
            self.len.fetch_add(1, Ordering::Relaxed);
        }
        old
    }

    fn get(&self, key: &[u8]) -> Option<IndexNode> {
        self.map.get(key).map(|e| e.value().clone())
    }

    fn delete(&mut self, key: &[u8]) -> Option<IndexNode> {
        let removed = self.map.remove(key).map(|e| e.value().clone());
        if removed.is_some() {
            self.len.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    fn ascend(&self, f: &mut dyn FnMut(&[u8], &IndexNode) -> bool) {
        for entry in self.map.iter() {
            if !f(entry.key(), entry.value()) {
                return;
            }
        }
    }

    fn descend(&self, f: &mut dyn FnMut(&[u8], &IndexNode) -> bool) {
        for entry in self.map.iter().rev() {
            if !f(entry.key(), entry.value()) {
                return;
            }
        }
    }

    fn prefix_scan(&self, prefix: &[u8], f: &mut dyn FnMut(&[u8], &IndexNode) -> bool) {
        for entry in self
            .map
            .range((Bound::Included(prefix.to_vec()), Bound::Unbounded))
        {
            if !entry.key().starts_with(prefix) {
                return;
            }
            if !f(entry.key(), entry.value()) {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{check_index_contract, node};
    use super::*;

    #[test]
    fn test_index_contract() {
        let mut index = OrderedIndex::new();
        check_index_contract(&mut index);
    }

    #[test]
    fn test_range_scan() {
        let mut index = OrderedIndex::new();
        for (i, key) in [b"a", b"b", b"c", b"d", b"e"].iter().enumerate() {
            index.put(key.to_vec(), node(1, i as u64));
        }

        let mut keys = Vec::new();
        index.range_scan(
            (
                Bound::Included(b"b".to_vec()),
                Bound::Included(b"d".to_vec()),
            ),
            false,
            &mut |k, _| {
                keys.push(k.to_vec());
                true
            },
        );
        assert_eq!(keys, vec![b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);

        let mut keys = Vec::new();
        index.range_scan(
            (
                Bound::Included(b"b".to_vec()),
                Bound::Excluded(b"d".to_vec()),
            ),
            true,
            &mut |k, _| {
                keys.push(k.to_vec());
                true
            },
        );
        assert_eq!(keys, vec![b"c".to_vec(), b"b".to_vec()]);
    }
}
