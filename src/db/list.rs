//! List operations.
//!
//! A list is a window of 32-bit sequence numbers: elements live at
//! `seq | user_key` for `head < seq < tail`, and a `ListMeta` record
//! keyed by the user key persists the window bounds after every
//! mutation. Pushing left takes `head` and moves it down; pushing right
//! takes `tail` and moves it up; pops do the reverse and reset the
//! window once the list empties.

use crate::encoding::{self, INITIAL_LIST_SEQ};
use crate::error::{Error, Result};
use crate::index::Index;
use crate::logfile::entry::{Entry, EntryType};
use crate::logfile::DataType;

use super::{CompoundState, Db};

impl Db {
    /// Prepends values to the list at `key`, creating it if needed.
    pub fn lpush(&self, key: &[u8], values: &[&[u8]]) -> Result<()> {
        self.push(key, values, true, true)
    }

    /// Prepends values only when the list already exists.
    pub fn lpushx(&self, key: &[u8], values: &[&[u8]]) -> Result<()> {
        self.push(key, values, true, false)
    }

    /// Appends values to the list at `key`, creating it if needed.
    pub fn rpush(&self, key: &[u8], values: &[&[u8]]) -> Result<()> {
        self.push(key, values, false, true)
    }

    /// Appends values only when the list already exists.
    pub fn rpushx(&self, key: &[u8], values: &[&[u8]]) -> Result<()> {
        self.push(key, values, false, false)
    }

    fn push(&self, key: &[u8], values: &[&[u8]], left: bool, create: bool) -> Result<()> {
        let inner = &self.inner;
        let mut state = inner.lists.write()?;
        if !create && !state.trees.contains_key(key) {
            return Err(Error::KeyNotFound);
        }
        for value in values {
            self.push_locked(&mut state, key, value, left)?;
        }
        inner.sync_on_commit(DataType::List)
    }

    /// Removes and returns the first element.
    pub fn lpop(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut state = self.inner.lists.write()?;
        let popped = self.pop_locked(&mut state, key, true)?;
        self.inner.sync_on_commit(DataType::List)?;
        Ok(popped)
    }

    /// Removes and returns the last element.
    pub fn rpop(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut state = self.inner.lists.write()?;
        let popped = self.pop_locked(&mut state, key, false)?;
        self.inner.sync_on_commit(DataType::List)?;
        Ok(popped)
    }

    /// Atomically pops from `src` and pushes onto `dst`. With
    /// `src == dst` this rotates the list between its ends.
    pub fn lmove(
        &self,
        src: &[u8],
        dst: &[u8],
        src_left: bool,
        dst_left: bool,
    ) -> Result<Option<Vec<u8>>> {
        let inner = &self.inner;
        let mut state = inner.lists.write()?;

        let Some(value) = self.pop_locked(&mut state, src, src_left)? else {
            return Ok(None);
        };
        self.push_locked(&mut state, dst, &value, dst_left)?;
        inner.sync_on_commit(DataType::List)?;
        Ok(Some(value))
    }

    /// Length of the list at `key`; absent lists count as empty.
    pub fn llen(&self, key: &[u8]) -> Result<usize> {
        let inner = &self.inner;
        let state = inner.lists.read()?;
        let Some(tree) = state.trees.get(key) else {
            return Ok(0);
        };
        let (head, tail) = self.list_meta(tree, key)?;
        Ok((tail - head - 1) as usize)
    }

    /// The element at logical `index`; negative indexes count from the
    /// tail (-1 is the last element).
    pub fn lindex(&self, key: &[u8], index: i64) -> Result<Vec<u8>> {
        let inner = &self.inner;
        let state = inner.lists.read()?;
        let tree = state.trees.get(key).ok_or(Error::KeyNotFound)?;
        let (head, tail) = self.list_meta(tree, key)?;
        let seq = sequence(head, tail, index)?;

        let node = tree
            .get(&encoding::list_key(key, seq))
            .ok_or(Error::KeyNotFound)?;
        inner.node_value(DataType::List, &node)
    }

    /// Overwrites the element at logical `index`.
    pub fn lset(&self, key: &[u8], index: i64, value: &[u8]) -> Result<()> {
        let inner = &self.inner;
        let mut state = inner.lists.write()?;
        let tree = state.trees.get(key).ok_or(Error::KeyNotFound)?;
        let (head, tail) = self.list_meta(tree, key)?;
        let seq = sequence(head, tail, index)?;

        let element_key = encoding::list_key(key, seq);
        let entry = Entry::new(element_key.clone(), value.to_vec(), EntryType::Put);
        let pos = inner.append_entry(DataType::List, &entry)?;
        let node = inner.make_node(pos, 0, value);
        let tree = state.trees.get_mut(key).expect("checked above");
        inner.tree_put(DataType::List, tree, element_key, node);
        inner.sync_on_commit(DataType::List)
    }

    /// Elements between logical `start` and `end` inclusive, with
    /// redis-style negative indexes and clamping.
    pub fn lrange(&self, key: &[u8], start: i64, end: i64) -> Result<Vec<Vec<u8>>> {
        let inner = &self.inner;
        let state = inner.lists.read()?;
        let tree = state.trees.get(key).ok_or(Error::KeyNotFound)?;
        let (head, tail) = self.list_meta(tree, key)?;

        // Clamp into the live window before validating, so an oversized
        // end just means "through the last element". Comparisons stay in
        // i64 until the bounds are known to fit the window.
        let start_seq = raw_sequence(head, tail, start).max(head as i64 + 1);
        let end_seq = raw_sequence(head, tail, end).min(tail as i64 - 1);
        if start_seq >= tail as i64 || end_seq <= head as i64 || start_seq > end_seq {
            return Err(Error::WrongIndex);
        }
        let (start_seq, end_seq) = (start_seq as u32, end_seq as u32);

        let mut out = Vec::with_capacity((end_seq - start_seq + 1) as usize);
        for seq in start_seq..=end_seq {
            let node = tree
                .get(&encoding::list_key(key, seq))
                .ok_or(Error::KeyNotFound)?;
            out.push(inner.node_value(DataType::List, &node)?);
        }
        Ok(out)
    }

    /// Keys of the lists that currently hold at least one element.
    pub fn list_keys(&self) -> Result<Vec<Vec<u8>>> {
        let state = self.inner.lists.read()?;
        let mut out = Vec::new();
        for (key, tree) in &state.trees {
            if state.is_expired(key) {
                continue;
            }
            let (head, tail) = self.list_meta(tree, key)?;
            if tail - head - 1 > 0 {
                out.push(key.clone());
            }
        }
        Ok(out)
    }

    /// Reads the head/tail window from the meta record, defaulting to an
    /// empty window for a list that has never persisted one.
    fn list_meta(&self, tree: &crate::index::RadixTree, key: &[u8]) -> Result<(u32, u32)> {
        match tree.get(key) {
            Some(node) => {
                let value = self.inner.node_value(DataType::List, &node)?;
                encoding::decode_list_meta(&value)
            }
            None => Ok((INITIAL_LIST_SEQ, INITIAL_LIST_SEQ + 1)),
        }
    }

    fn save_meta_locked(
        &self,
        state: &mut CompoundState,
        key: &[u8],
        head: u32,
        tail: u32,
    ) -> Result<()> {
        let inner = &self.inner;
        let value = encoding::list_meta_value(head, tail);
        let entry = Entry::new(key.to_vec(), value.clone(), EntryType::ListMeta);
        let pos = inner.append_entry(DataType::List, &entry)?;
        let node = inner.make_node(pos, 0, &value);
        let tree = state.trees.entry(key.to_vec()).or_default();
        inner.tree_put(DataType::List, tree, key.to_vec(), node);
        Ok(())
    }

    fn push_locked(
        &self,
        state: &mut CompoundState,
        key: &[u8],
        value: &[u8],
        left: bool,
    ) -> Result<()> {
        let inner = &self.inner;
        let tree = state.trees.entry(key.to_vec()).or_default();
        let (mut head, mut tail) = self.list_meta(tree, key)?;

        let seq = if left { head } else { tail };
        let element_key = encoding::list_key(key, seq);
        let entry = Entry::new(element_key.clone(), value.to_vec(), EntryType::Put);
        let pos = inner.append_entry(DataType::List, &entry)?;
        let node = inner.make_node(pos, 0, value);
        let tree = state.trees.get_mut(key).expect("created above");
        inner.tree_put(DataType::List, tree, element_key, node);

        if left {
            head -= 1;
        } else {
            tail += 1;
        }
        self.save_meta_locked(state, key, head, tail)
    }

    fn pop_locked(
        &self,
        state: &mut CompoundState,
        key: &[u8],
        left: bool,
    ) -> Result<Option<Vec<u8>>> {
        let inner = &self.inner;
        let Some(tree) = state.trees.get(key) else {
            return Ok(None);
        };
        let (mut head, mut tail) = self.list_meta(tree, key)?;

        if tail - head - 1 == 0 {
            // Stale non-initial bounds get reset so sequences cannot
            // creep toward the window edges across many push/pop cycles.
            if head != INITIAL_LIST_SEQ || tail != INITIAL_LIST_SEQ + 1 {
                self.save_meta_locked(state, key, INITIAL_LIST_SEQ, INITIAL_LIST_SEQ + 1)?;
            }
            return Ok(None);
        }

        let seq = if left { head + 1 } else { tail - 1 };
        let element_key = encoding::list_key(key, seq);
        let node = tree.get(&element_key).ok_or(Error::KeyNotFound)?;
        let value = inner.node_value(DataType::List, &node)?;

        let tombstone = Entry::new(element_key.clone(), Vec::new(), EntryType::Delete);
        let pos = inner.append_entry(DataType::List, &tombstone)?;
        let tree = state.trees.get_mut(key).expect("checked above");
        if let Some(old) = tree.delete(&element_key) {
            inner.discard_node(DataType::List, &old);
        }
        inner.discard_position(DataType::List, pos);

        if left {
            head += 1;
        } else {
            tail -= 1;
        }
        if tail - head - 1 == 0 {
            head = INITIAL_LIST_SEQ;
            tail = INITIAL_LIST_SEQ + 1;
        }
        self.save_meta_locked(state, key, head, tail)?;
        Ok(Some(value))
    }
}

/// Logical index -> sequence, without range validation.
fn raw_sequence(head: u32, tail: u32, index: i64) -> i64 {
    if index >= 0 {
        head as i64 + index + 1
    } else {
        tail as i64 + index
    }
}

/// Logical index -> sequence, failing with `WrongIndex` outside the
/// live window.
fn sequence(head: u32, tail: u32, index: i64) -> Result<u32> {
    let seq = raw_sequence(head, tail, index);
    if seq <= head as i64 || seq >= tail as i64 {
        return Err(Error::WrongIndex);
    }
    Ok(seq as u32)
}
