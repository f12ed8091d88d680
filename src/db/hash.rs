//! Hash operations: one field -> value map per user key.
//!
//! Field entries are logged under `key | 0xFE | field`; clearing a hash
//! writes one whole-key tombstone, and TTLs are separate expiry records
//! covering the entire key.

use std::time::Duration;

use crate::encoding;
use crate::error::{Error, Result};
use crate::index::Index;
use crate::logfile::entry::{Entry, EntryType};
use crate::logfile::DataType;

use super::{now, CompoundState, Db};

impl Db {
    /// Sets `field` in the hash at `key`, creating the hash if needed.
    /// Returns true when the field was new, false on overwrite.
    pub fn hset(&self, key: &[u8], field: &[u8], value: &[u8]) -> Result<bool> {
        let inner = &self.inner;
        let mut state = inner.hashes.write()?;
        inner.purge_if_expired(DataType::Hash, &mut state, key);

        let inserted = self.hset_locked(&mut state, key, field, value)?;
        inner.sync_on_commit(DataType::Hash)?;
        Ok(inserted)
    }

    fn hset_locked(
        &self,
        state: &mut CompoundState,
        key: &[u8],
        field: &[u8],
        value: &[u8],
    ) -> Result<bool> {
        let inner = &self.inner;
        let field_key = encoding::member_key(key, field);
        let entry = Entry::new(field_key.clone(), value.to_vec(), EntryType::Put);
        let pos = inner.append_entry(DataType::Hash, &entry)?;
        let node = inner.make_node(pos, 0, value);
        let tree = state.trees.entry(key.to_vec()).or_default();
        Ok(inner.tree_put(DataType::Hash, tree, field_key, node))
    }

    /// Sets `field` only if it does not exist yet; returns whether it
    /// was inserted.
    pub fn hsetnx(&self, key: &[u8], field: &[u8], value: &[u8]) -> Result<bool> {
        let inner = &self.inner;
        let mut state = inner.hashes.write()?;
        inner.purge_if_expired(DataType::Hash, &mut state, key);

        let field_key = encoding::member_key(key, field);
        if state
            .trees
            .get(key)
            .is_some_and(|tree| tree.get(&field_key).is_some())
        {
            return Ok(false);
        }
        self.hset_locked(&mut state, key, field, value)?;
        inner.sync_on_commit(DataType::Hash)?;
        Ok(true)
    }

    /// Fetches the value of `field` in the hash at `key`. A read that
    /// finds the key expired evicts it before reporting absence.
    pub fn hget(&self, key: &[u8], field: &[u8]) -> Result<Option<Vec<u8>>> {
        let inner = &self.inner;
        let state = self.compound_read(&inner.hashes, DataType::Hash, key)?;
        let Some(tree) = state.live_tree(key) else {
            return Ok(None);
        };
        match tree.get(&encoding::member_key(key, field)) {
            Some(node) => Ok(Some(inner.node_value(DataType::Hash, &node)?)),
            None => Ok(None),
        }
    }

    /// Fetches several fields at once, `None` for the absent ones.
    pub fn hmget(&self, key: &[u8], fields: &[&[u8]]) -> Result<Vec<Option<Vec<u8>>>> {
        let inner = &self.inner;
        let state = self.compound_read(&inner.hashes, DataType::Hash, key)?;
        let tree = state.live_tree(key);

        let mut out = Vec::with_capacity(fields.len());
        for field in fields {
            let value = match tree.and_then(|t| t.get(&encoding::member_key(key, field))) {
                Some(node) => Some(inner.node_value(DataType::Hash, &node)?),
                None => None,
            };
            out.push(value);
        }
        Ok(out)
    }

    /// Sets fields from a flat `field, value, field, value, ...` slice.
    pub fn hmset(&self, key: &[u8], fields_and_values: &[&[u8]]) -> Result<()> {
        if fields_and_values.len() % 2 != 0 {
            return Err(Error::WrongNumberOfArgs);
        }
        let inner = &self.inner;
        let mut state = inner.hashes.write()?;
        inner.purge_if_expired(DataType::Hash, &mut state, key);

        for pair in fields_and_values.chunks_exact(2) {
            self.hset_locked(&mut state, key, pair[0], pair[1])?;
        }
        inner.sync_on_commit(DataType::Hash)
    }

    /// Removes fields, returning how many existed.
    pub fn hdel(&self, key: &[u8], fields: &[&[u8]]) -> Result<usize> {
        let inner = &self.inner;
        let mut state = inner.hashes.write()?;
        inner.purge_if_expired(DataType::Hash, &mut state, key);

        let Some(tree) = state.trees.get_mut(key) else {
            return Ok(0);
        };
        let mut removed = 0;
        for field in fields {
            let field_key = encoding::member_key(key, field);
            if tree.get(&field_key).is_none() {
                continue;
            }
            let tombstone = Entry::new(field_key.clone(), Vec::new(), EntryType::Delete);
            let pos = inner.append_entry(DataType::Hash, &tombstone)?;
            if let Some(old) = tree.delete(&field_key) {
                inner.discard_node(DataType::Hash, &old);
            }
            inner.discard_position(DataType::Hash, pos);
            removed += 1;
        }
        if removed > 0 {
            inner.sync_on_commit(DataType::Hash)?;
        }
        Ok(removed)
    }

    /// Whether `field` exists in the hash at `key`.
    pub fn hexists(&self, key: &[u8], field: &[u8]) -> Result<bool> {
        let state = self.compound_read(&self.inner.hashes, DataType::Hash, key)?;
        Ok(state
            .live_tree(key)
            .is_some_and(|tree| tree.get(&encoding::member_key(key, field)).is_some()))
    }

    /// Number of fields in the hash at `key`.
    pub fn hlen(&self, key: &[u8]) -> Result<usize> {
        let state = self.compound_read(&self.inner.hashes, DataType::Hash, key)?;
        Ok(state.live_tree(key).map_or(0, |tree| tree.len()))
    }

    /// All field names, in unspecified order.
    pub fn hkeys(&self, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        let state = self.compound_read(&self.inner.hashes, DataType::Hash, key)?;
        let mut out = Vec::new();
        if let Some(tree) = state.live_tree(key) {
            let skip = key.len() + 1;
            tree.ascend(&mut |field_key, _| {
                out.push(field_key[skip..].to_vec());
                true
            });
        }
        Ok(out)
    }

    /// All field values, in unspecified order.
    pub fn hvals(&self, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        let inner = &self.inner;
        let state = self.compound_read(&inner.hashes, DataType::Hash, key)?;
        let mut nodes = Vec::new();
        if let Some(tree) = state.live_tree(key) {
            tree.ascend(&mut |_, node| {
                nodes.push(node.clone());
                true
            });
        }
        nodes
            .iter()
            .map(|node| inner.node_value(DataType::Hash, node))
            .collect()
    }

    /// Removes the whole hash. Errors with `KeyNotFound` when there is
    /// nothing to clear.
    pub fn hclear(&self, key: &[u8]) -> Result<()> {
        let inner = &self.inner;
        let mut state = inner.hashes.write()?;
        inner.purge_if_expired(DataType::Hash, &mut state, key);
        if !state.trees.contains_key(key) {
            return Err(Error::KeyNotFound);
        }

        let tombstone = Entry::new(key.to_vec(), Vec::new(), EntryType::Delete);
        let pos = inner.append_entry(DataType::Hash, &tombstone)?;
        if let Some(tree) = state.trees.remove(key) {
            tree.ascend(&mut |_, node| {
                inner.discard_node(DataType::Hash, node);
                true
            });
        }
        state.expires.remove(key);
        inner.discard_position(DataType::Hash, pos);
        inner.sync_on_commit(DataType::Hash)
    }

    /// Sets a whole-key time-to-live on the hash at `key`.
    pub fn hexpire(&self, key: &[u8], ttl: Duration) -> Result<()> {
        if ttl.as_secs() == 0 {
            return Err(Error::InvalidTtl);
        }
        let inner = &self.inner;
        let mut state = inner.hashes.write()?;
        inner.purge_if_expired(DataType::Hash, &mut state, key);
        if !state.trees.contains_key(key) {
            return Err(Error::KeyNotFound);
        }

        let deadline = now() + ttl.as_secs();
        let entry =
            Entry::with_expire(key.to_vec(), Vec::new(), EntryType::Expire, deadline);
        inner.append_entry(DataType::Hash, &entry)?;
        state.expires.insert(key.to_vec(), deadline);
        inner.sync_on_commit(DataType::Hash)
    }

    /// Remaining time-to-live of the hash at `key`; `None` when no
    /// deadline is set. An expired key is evicted by the lookup itself
    /// and reads as not found.
    pub fn httl(&self, key: &[u8]) -> Result<Option<Duration>> {
        let state = self.compound_read(&self.inner.hashes, DataType::Hash, key)?;
        if !state.trees.contains_key(key) {
            return Err(Error::KeyNotFound);
        }
        match state.expires.get(key) {
            // The deadline can lapse between the eviction check and this
            // read of the clean state.
            Some(&deadline) if deadline <= now() => Err(Error::KeyExpired),
            Some(&deadline) => Ok(Some(Duration::from_secs(deadline.saturating_sub(now())))),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> Db {
        Db::open(Options::new(dir.path())).expect("failed to open db")
    }

    #[test]
    fn test_hset_overwrite_and_delete() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);

        assert!(db.hset(b"H", b"f", b"v1").unwrap());
        assert!(!db.hset(b"H", b"f", b"v2").unwrap());
        assert_eq!(db.hget(b"H", b"f").unwrap().unwrap(), b"v2");

        assert_eq!(db.hdel(b"H", &[b"f"]).unwrap(), 1);
        assert_eq!(db.hdel(b"H", &[b"f"]).unwrap(), 0);
        assert_eq!(db.hlen(b"H").unwrap(), 0);
        assert_eq!(db.hget(b"H", b"f").unwrap(), None);
    }

    #[test]
    fn test_hsetnx() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);

        assert!(db.hsetnx(b"H", b"f", b"first").unwrap());
        assert!(!db.hsetnx(b"H", b"f", b"second").unwrap());
        assert_eq!(db.hget(b"H", b"f").unwrap().unwrap(), b"first");
    }

    #[test]
    fn test_hmset_hmget() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);

        assert_eq!(
            db.hmset(b"H", &[b"odd".as_slice()]).err(),
            Some(Error::WrongNumberOfArgs)
        );

        db.hmset(b"H", &[b"a", b"1", b"b", b"2"]).unwrap();
        let got = db.hmget(b"H", &[b"a", b"missing", b"b"]).unwrap();
        assert_eq!(
            got,
            vec![Some(b"1".to_vec()), None, Some(b"2".to_vec())]
        );
    }

    #[test]
    fn test_hkeys_hvals_hexists() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        db.hmset(b"H", &[b"x", b"10", b"y", b"20"]).unwrap();

        let mut keys = db.hkeys(b"H").unwrap();
        keys.sort();
        assert_eq!(keys, vec![b"x".to_vec(), b"y".to_vec()]);

        let mut vals = db.hvals(b"H").unwrap();
        vals.sort();
        assert_eq!(vals, vec![b"10".to_vec(), b"20".to_vec()]);

        assert!(db.hexists(b"H", b"x").unwrap());
        assert!(!db.hexists(b"H", b"z").unwrap());
        assert!(!db.hexists(b"other", b"x").unwrap());
    }

    #[test]
    fn test_hclear() {
        let dir = TempDir::new().unwrap();
        {
            let db = open(&dir);
            db.hmset(b"H", &[b"a", b"1", b"b", b"2"]).unwrap();
            db.hclear(b"H").unwrap();
            assert_eq!(db.hlen(b"H").unwrap(), 0);
            assert_eq!(db.hclear(b"H").err(), Some(Error::KeyNotFound));
        }

        let db = open(&dir);
        assert_eq!(db.hlen(b"H").unwrap(), 0);
        assert_eq!(db.hget(b"H", b"a").unwrap(), None);
    }

    #[test]
    fn test_hash_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let db = open(&dir);
            db.hset(b"cfg", b"host", b"localhost").unwrap();
            db.hset(b"cfg", b"port", b"6379").unwrap();
            db.hset(b"cfg", b"port", b"7000").unwrap();
            db.hdel(b"cfg", &[b"host"]).unwrap();
        }

        let db = open(&dir);
        assert_eq!(db.hget(b"cfg", b"host").unwrap(), None);
        assert_eq!(db.hget(b"cfg", b"port").unwrap().unwrap(), b"7000");
        assert_eq!(db.hlen(b"cfg").unwrap(), 1);
    }

    #[test]
    fn test_hexpire_httl() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);

        assert_eq!(
            db.hexpire(b"none", Duration::from_secs(10)).err(),
            Some(Error::KeyNotFound)
        );
        db.hset(b"H", b"f", b"v").unwrap();
        assert_eq!(
            db.hexpire(b"H", Duration::ZERO).err(),
            Some(Error::InvalidTtl)
        );
        assert_eq!(db.httl(b"H").unwrap(), None);

        db.hexpire(b"H", Duration::from_secs(100)).unwrap();
        let ttl = db.httl(b"H").unwrap().expect("deadline set");
        assert!(ttl.as_secs() > 90 && ttl.as_secs() <= 100);

        db.hexpire(b"H", Duration::from_secs(1)).unwrap();
        std::thread::sleep(Duration::from_millis(1100));
        assert_eq!(db.hget(b"H", b"f").unwrap(), None);
        assert!(!db.hexists(b"H", b"f").unwrap());

        // a write to the expired key starts a fresh hash
        assert!(db.hset(b"H", b"g", b"new").unwrap());
        assert_eq!(db.hlen(b"H").unwrap(), 1);
        assert_eq!(db.httl(b"H").unwrap(), None);
    }

    #[test]
    fn test_read_evicts_expired_hash() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        db.hset(b"H", b"f", b"v").unwrap();
        db.hexpire(b"H", Duration::from_secs(1)).unwrap();
        std::thread::sleep(Duration::from_millis(1100));

        // the read itself reclaims the key, it does not just mask it
        assert_eq!(db.hget(b"H", b"f").unwrap(), None);
        {
            let state = db.inner.hashes.read().unwrap();
            assert!(!state.trees.contains_key(&b"H".to_vec()));
            assert!(!state.expires.contains_key(&b"H".to_vec()));
        }
        assert_eq!(db.httl(b"H").err(), Some(Error::KeyNotFound));
    }

    #[test]
    fn test_hash_expiry_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let db = open(&dir);
            db.hset(b"H", b"f", b"v").unwrap();
            db.hexpire(b"H", Duration::from_secs(1)).unwrap();
        }
        std::thread::sleep(Duration::from_millis(1100));

        let db = open(&dir);
        assert_eq!(db.hget(b"H", b"f").unwrap(), None);
        assert_eq!(db.hlen(b"H").unwrap(), 0);
    }
}
