//! Compressed radix tree for internal encoded keys.
//!
//! Every compound user key (hash, list, set, zset) owns one tree holding
//! its internal keys: field keys, list sequences, members, score/member
//! pairs. Edges carry multi-byte labels; children are kept in vectors
//! sorted by leading byte, so in-order traversal yields keys in
//! lexicographic order. The owning map hands out `&mut` access under the
//! datatype lock, which keeps the structure free of interior locking.

use super::{Index, IndexNode};

pub struct RadixTree {
    root: Node,
    len: usize,
}

struct Node {
    /// Edge label from the parent; empty only at the root.
    prefix: Vec<u8>,
    value: Option<IndexNode>,
    /// Sorted by leading prefix byte; labels are never empty.
    children: Vec<Node>,
}

impl Node {
    fn leaf(prefix: Vec<u8>, value: IndexNode) -> Self {
        Self {
            prefix,
            value: Some(value),
            children: Vec::new(),
        }
    }

    fn child_slot(&self, byte: u8) -> std::result::Result<usize, usize> {
        self.children.binary_search_by_key(&byte, |c| c.prefix[0])
    }
}

fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

impl RadixTree {
    pub fn new() -> Self {
        Self {
            root: Node {
                prefix: Vec::new(),
                value: None,
                children: Vec::new(),
            },
            len: 0,
        }
    }

    fn insert_rec(node: &mut Node, key: &[u8], value: IndexNode) -> Option<IndexNode> {
        let lcp = common_prefix_len(&node.prefix, key);
        if lcp < node.prefix.len() {
            // Split this node: push its tail, value and children down
            // into a new child, keeping only the shared label here.
            let tail = node.prefix.split_off(lcp);
            let split = Node {
                prefix: tail,
                value: node.value.take(),
                children: std::mem::take(&mut node.children),
            };
            node.children.push(split);
        }

        let rest = &key[lcp..];
        if rest.is_empty() {
            return node.value.replace(value);
        }
        match node.child_slot(rest[0]) {
            Ok(i) => Self::insert_rec(&mut node.children[i], rest, value),
            Err(i) => {
                node.children.insert(i, Node::leaf(rest.to_vec(), value));
                None
            }
        }
    }

    fn get_rec<'a>(node: &'a Node, key: &[u8]) -> Option<&'a IndexNode> {
        if !key.starts_with(&node.prefix) {
            return None;
        }
        let rest = &key[node.prefix.len()..];
        if rest.is_empty() {
            return node.value.as_ref();
        }
        let i = node.child_slot(rest[0]).ok()?;
        Self::get_rec(&node.children[i], rest)
    }

    fn delete_rec(node: &mut Node, key: &[u8]) -> Option<IndexNode> {
        if !key.starts_with(&node.prefix) {
            return None;
        }
        let rest = &key[node.prefix.len()..];
        if rest.is_empty() {
            return node.value.take();
        }
        let i = node.child_slot(rest[0]).ok()?;
        let removed = Self::delete_rec(&mut node.children[i], rest)?;

        // Prune: drop an empty leaf, or splice a pass-through child into
        // its only grandchild so paths stay compressed.
        let child = &mut node.children[i];
        if child.value.is_none() {
            if child.children.is_empty() {
                node.children.remove(i);
            } else if child.children.len() == 1 {
                let mut grand = child.children.pop().expect("len checked");
                let mut label = std::mem::take(&mut child.prefix);
                label.extend_from_slice(&grand.prefix);
                grand.prefix = label;
                *child = grand;
            }
        }
        Some(removed)
    }

    fn ascend_rec(
        node: &Node,
        acc: &mut Vec<u8>,
        f: &mut dyn FnMut(&[u8], &IndexNode) -> bool,
    ) -> bool {
        acc.extend_from_slice(&node.prefix);
        let mut keep_going = true;
        if let Some(v) = &node.value {
            keep_going = f(acc, v);
        }
        if keep_going {
            for child in &node.children {
                if !Self::ascend_rec(child, acc, f) {
                    keep_going = false;
                    break;
                }
            }
        }
        acc.truncate(acc.len() - node.prefix.len());
        keep_going
    }

    fn descend_rec(
        node: &Node,
        acc: &mut Vec<u8>,
        f: &mut dyn FnMut(&[u8], &IndexNode) -> bool,
    ) -> bool {
        acc.extend_from_slice(&node.prefix);
        let mut keep_going = true;
        for child in node.children.iter().rev() {
            if !Self::descend_rec(child, acc, f) {
                keep_going = false;
                break;
            }
        }
        // A node's own key is a prefix of its children's keys, so in
        // descending order it comes after all of them.
        if keep_going {
            if let Some(v) = &node.value {
                keep_going = f(acc, v);
            }
        }
        acc.truncate(acc.len() - node.prefix.len());
        keep_going
    }

    fn scan_rec(
        node: &Node,
        acc: &mut Vec<u8>,
        remaining: &[u8],
        f: &mut dyn FnMut(&[u8], &IndexNode) -> bool,
    ) -> bool {
        if remaining.len() <= node.prefix.len() {
            if node.prefix.starts_with(remaining) {
                return Self::ascend_rec(node, acc, f);
            }
            return true;
        }
        if !remaining.starts_with(&node.prefix) {
            return true;
        }
        let rest = &remaining[node.prefix.len()..];
        acc.extend_from_slice(&node.prefix);
        let keep_going = match node.child_slot(rest[0]) {
            Ok(i) => Self::scan_rec(&node.children[i], acc, rest, f),
            Err(_) => true,
        };
        acc.truncate(acc.len() - node.prefix.len());
        keep_going
    }
}

impl Default for RadixTree {
    fn default() -> Self {
        Self::new()
    }
}

impl Index for RadixTree {
    fn put(&mut self, key: Vec<u8>, node: IndexNode) -> Option<IndexNode> {
        let old = Self::insert_rec(&mut self.root, &key, node);
        if old.is_none() {
            self.len += 1;
        }
        old
    }

    fn get(&self, key: &[u8]) -> Option<IndexNode> {
        Self::get_rec(&self.root, key).cloned()
    }

    fn delete(&mut self, key: &[u8]) -> Option<IndexNode> {
        let removed = Self::delete_rec(&mut self.root, key);
        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }

    fn len(&self) -> usize {
        self.len
    }

    fn ascend(&self, f: &mut dyn FnMut(&[u8], &IndexNode) -> bool) {
        Self::ascend_rec(&self.root, &mut Vec::new(), f);
    }

    fn descend(&self, f: &mut dyn FnMut(&[u8], &IndexNode) -> bool) {
        Self::descend_rec(&self.root, &mut Vec::new(), f);
    }

    fn prefix_scan(&self, prefix: &[u8], f: &mut dyn FnMut(&[u8], &IndexNode) -> bool) {
        Self::scan_rec(&self.root, &mut Vec::new(), prefix, f);
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{check_index_contract, node};
    use super::super::Index;
    use super::*;

    #[test]
    fn test_index_contract() {
        let mut tree = RadixTree::new();
        check_index_contract(&mut tree);
    }

    #[test]
    fn test_split_and_merge_paths() {
        let mut tree = RadixTree::new();
        tree.put(b"romane".to_vec(), node(1, 1));
        tree.put(b"romanus".to_vec(), node(1, 2));
        tree.put(b"romulus".to_vec(), node(1, 3));
        tree.put(b"rubens".to_vec(), node(1, 4));
        tree.put(b"ruber".to_vec(), node(1, 5));
        assert_eq!(tree.len(), 5);

        for (key, offset) in [
            (&b"romane"[..], 1),
            (b"romanus", 2),
            (b"romulus", 3),
            (b"rubens", 4),
            (b"ruber", 5),
        ] {
            assert_eq!(tree.get(key).unwrap().offset, offset, "key {key:?}");
        }
        assert!(tree.get(b"rom").is_none());
        assert!(tree.get(b"romanes").is_none());

        // deleting leaves merges pass-through nodes back together
        tree.delete(b"romanus").unwrap();
        tree.delete(b"romulus").unwrap();
        assert_eq!(tree.get(b"romane").unwrap().offset, 1);
        assert_eq!(tree.len(), 3);

        let mut keys = Vec::new();
        tree.ascend(&mut |k, _| {
            keys.push(k.to_vec());
            true
        });
        assert_eq!(
            keys,
            vec![b"romane".to_vec(), b"rubens".to_vec(), b"ruber".to_vec()]
        );
    }

    #[test]
    fn test_key_is_prefix_of_other_key() {
        let mut tree = RadixTree::new();
        tree.put(b"app".to_vec(), node(1, 1));
        tree.put(b"apple".to_vec(), node(1, 2));
        tree.put(b"applesauce".to_vec(), node(1, 3));

        assert_eq!(tree.get(b"app").unwrap().offset, 1);
        assert_eq!(tree.get(b"apple").unwrap().offset, 2);

        tree.delete(b"apple").unwrap();
        assert!(tree.get(b"apple").is_none());
        assert_eq!(tree.get(b"app").unwrap().offset, 1);
        assert_eq!(tree.get(b"applesauce").unwrap().offset, 3);
    }

    #[test]
    fn test_prefix_scan_binary_keys() {
        let mut tree = RadixTree::new();
        // list-style internal keys: 4-byte little-endian seq + user key
        for seq in [7u32, 8, 9, 260] {
            let mut key = seq.to_le_bytes().to_vec();
            key.extend_from_slice(b"mylist");
            tree.put(key, node(1, seq as u64));
        }

        let mut offsets = Vec::new();
        tree.prefix_scan(&8u32.to_le_bytes(), &mut |_, n| {
            offsets.push(n.offset);
            true
        });
        assert_eq!(offsets, vec![8]);

        // seq 260 = [4, 1, 0, 0] shares no 4-byte prefix with seq 9
        let mut offsets = Vec::new();
        tree.prefix_scan(&9u32.to_le_bytes(), &mut |_, n| {
            offsets.push(n.offset);
            true
        });
        assert_eq!(offsets, vec![9]);
    }

    #[test]
    fn test_descend_nested_prefixes() {
        let mut tree = RadixTree::new();
        tree.put(b"a".to_vec(), node(1, 1));
        tree.put(b"ab".to_vec(), node(1, 2));
        tree.put(b"abc".to_vec(), node(1, 3));
        tree.put(b"b".to_vec(), node(1, 4));

        let mut keys = Vec::new();
        tree.descend(&mut |k, _| {
            keys.push(k.to_vec());
            true
        });
        assert_eq!(
            keys,
            vec![
                b"b".to_vec(),
                b"abc".to_vec(),
                b"ab".to_vec(),
                b"a".to_vec()
            ]
        );
    }
}
