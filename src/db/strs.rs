//! String operations.
//!
//! Strings keep their deadline embedded in the data entry itself, so a
//! key's whole history lives in one log stream and recovery needs no
//! side records. Reads hold the shared lock across the index lookup and
//! the log read; an expired key is removed lazily under the exclusive
//! lock before reporting not-found.

use std::ops::{Bound, RangeBounds};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::index::Index;
use crate::logfile::entry::{Entry, EntryType};
use crate::logfile::DataType;

use super::{now, Db};

impl Db {
    /// Stores `value` under `key`, replacing any previous value.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.put_inner(key, value, 0)
    }

    /// Stores `value` under `key` with a time-to-live. The key reads as
    /// absent once the deadline passes.
    pub fn put_with_ttl(&self, key: &[u8], value: &[u8], ttl: Duration) -> Result<()> {
        if ttl.as_secs() == 0 {
            return Err(Error::InvalidTtl);
        }
        self.put_inner(key, value, now() + ttl.as_secs())
    }

    fn put_inner(&self, key: &[u8], value: &[u8], expire_at: u64) -> Result<()> {
        let inner = &self.inner;
        let mut index = inner.strs.write()?;

        let entry =
            Entry::with_expire(key.to_vec(), value.to_vec(), EntryType::Put, expire_at);
        let pos = inner.append_entry(DataType::Str, &entry)?;
        let node = inner.make_node(pos, expire_at, value);
        if let Some(old) = index.put(key.to_vec(), node) {
            inner.discard_node(DataType::Str, &old);
        }
        inner.sync_on_commit(DataType::Str)
    }

    /// Fetches the value stored under `key`.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        let inner = &self.inner;
        {
            let index = inner.strs.read()?;
            let node = index.get(key).ok_or(Error::KeyNotFound)?;
            if node.expire_at == 0 || node.expire_at > now() {
                return inner.node_value(DataType::Str, &node);
            }
        }

        // Expired: upgrade to the exclusive lock and drop the stale
        // index entry. The log entry's own deadline makes replay agree.
        let mut index = inner.strs.write()?;
        if let Some(node) = index.get(key) {
            if node.expire_at != 0 && node.expire_at <= now() {
                index.delete(key);
                inner.discard_node(DataType::Str, &node);
            } else {
                return inner.node_value(DataType::Str, &node);
            }
        }
        Err(Error::KeyNotFound)
    }

    /// Removes `key`. Deleting an absent key is a no-op.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        let inner = &self.inner;
        let mut index = inner.strs.write()?;
        if index.get(key).is_none() {
            return Ok(());
        }

        let tombstone = Entry::new(key.to_vec(), Vec::new(), EntryType::Delete);
        let pos = inner.append_entry(DataType::Str, &tombstone)?;
        if let Some(old) = index.delete(key) {
            inner.discard_node(DataType::Str, &old);
        }
        // The tombstone itself is dead weight the moment it lands.
        inner.discard_position(DataType::Str, pos);
        inner.sync_on_commit(DataType::Str)
    }

    /// Remaining time-to-live of `key`; `None` when no deadline is set.
    pub fn ttl(&self, key: &[u8]) -> Result<Option<Duration>> {
        let index = self.inner.strs.read()?;
        let node = index.get(key).ok_or(Error::KeyNotFound)?;
        match node.expire_at {
            0 => Ok(None),
            deadline if deadline <= now() => Err(Error::KeyExpired),
            deadline => Ok(Some(Duration::from_secs(deadline.saturating_sub(now())))),
        }
    }

    /// Number of live string keys, counting lazily expired ones until a
    /// read sweeps them out.
    pub fn str_len(&self) -> Result<usize> {
        Ok(self.inner.strs.read()?.len())
    }

    /// Returns key/value pairs inside `range` in key order, last-first
    /// when `reverse` is set. Expired keys are skipped.
    pub fn range(
        &self,
        range: impl RangeBounds<Vec<u8>>,
        reverse: bool,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let inner = &self.inner;
        let index = inner.strs.read()?;

        let bounds = (
            clone_bound(range.start_bound()),
            clone_bound(range.end_bound()),
        );
        let mut out = Vec::new();
        let mut read_error = None;
        index.range_scan(bounds, reverse, &mut |key, node| {
            if node.expire_at != 0 && node.expire_at <= now() {
                return true;
            }
            match inner.node_value(DataType::Str, node) {
                Ok(value) => {
                    out.push((key.to_vec(), value));
                    true
                }
                Err(e) => {
                    read_error = Some(e);
                    false
                }
            }
        });
        match read_error {
            Some(e) => Err(e),
            None => Ok(out),
        }
    }

    /// Returns key/value pairs whose key starts with `prefix`, in key
    /// order.
    pub fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let inner = &self.inner;
        let index = inner.strs.read()?;

        let mut out = Vec::new();
        let mut read_error = None;
        index.prefix_scan(prefix, &mut |key, node| {
            if node.expire_at != 0 && node.expire_at <= now() {
                return true;
            }
            match inner.node_value(DataType::Str, node) {
                Ok(value) => {
                    out.push((key.to_vec(), value));
                    true
                }
                Err(e) => {
                    read_error = Some(e);
                    false
                }
            }
        });
        match read_error {
            Some(e) => Err(e),
            None => Ok(out),
        }
    }
}

fn clone_bound(bound: Bound<&Vec<u8>>) -> Bound<Vec<u8>> {
    match bound {
        Bound::Included(v) => Bound::Included(v.clone()),
        Bound::Excluded(v) => Bound::Excluded(v.clone()),
        Bound::Unbounded => Bound::Unbounded,
    }
}
