//! Set operations.
//!
//! Members are logged under `key | 0xFE | member` with an empty value;
//! membership is the existence of the internal key. The algebra
//! operations work over snapshots taken under one shared lock, so each
//! result is consistent even though member order is unspecified.

use std::collections::HashSet;

use crate::encoding;
use crate::error::{Error, Result};
use crate::index::Index;
use crate::logfile::entry::{Entry, EntryType};
use crate::logfile::DataType;

use super::{CompoundState, Db};

impl Db {
    /// Adds members to the set at `key`, returning how many were new.
    pub fn sadd(&self, key: &[u8], members: &[&[u8]]) -> Result<usize> {
        let inner = &self.inner;
        let mut state = inner.sets.write()?;
        inner.purge_if_expired(DataType::Set, &mut state, key);

        let mut added = 0;
        for member in members {
            let member_key = encoding::member_key(key, member);
            if state
                .trees
                .get(key)
                .is_some_and(|tree| tree.get(&member_key).is_some())
            {
                continue;
            }
            let entry = Entry::new(member_key.clone(), Vec::new(), EntryType::Put);
            let pos = inner.append_entry(DataType::Set, &entry)?;
            let node = inner.make_node(pos, 0, &[]);
            let tree = state.trees.entry(key.to_vec()).or_default();
            inner.tree_put(DataType::Set, tree, member_key, node);
            added += 1;
        }
        if added > 0 {
            inner.sync_on_commit(DataType::Set)?;
        }
        Ok(added)
    }

    /// Removes members, returning how many were present.
    pub fn srem(&self, key: &[u8], members: &[&[u8]]) -> Result<usize> {
        let inner = &self.inner;
        let mut state = inner.sets.write()?;
        inner.purge_if_expired(DataType::Set, &mut state, key);

        let Some(tree) = state.trees.get_mut(key) else {
            return Ok(0);
        };
        let mut removed = 0;
        for member in members {
            let member_key = encoding::member_key(key, member);
            if tree.get(&member_key).is_none() {
                continue;
            }
            let tombstone = Entry::new(member_key.clone(), Vec::new(), EntryType::Delete);
            let pos = inner.append_entry(DataType::Set, &tombstone)?;
            if let Some(old) = tree.delete(&member_key) {
                inner.discard_node(DataType::Set, &old);
            }
            inner.discard_position(DataType::Set, pos);
            removed += 1;
        }
        if removed > 0 {
            inner.sync_on_commit(DataType::Set)?;
        }
        Ok(removed)
    }

    /// Whether `member` is in the set at `key`.
    pub fn sismember(&self, key: &[u8], member: &[u8]) -> Result<bool> {
        let state = self.inner.sets.read()?;
        Ok(state
            .live_tree(key)
            .is_some_and(|tree| tree.get(&encoding::member_key(key, member)).is_some()))
    }

    /// Number of members in the set at `key`.
    pub fn scard(&self, key: &[u8]) -> Result<usize> {
        let state = self.inner.sets.read()?;
        Ok(state.live_tree(key).map_or(0, |tree| tree.len()))
    }

    /// All members of the set at `key`, order unspecified.
    pub fn smembers(&self, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        let state = self.inner.sets.read()?;
        Ok(members_of(&state, key))
    }

    /// Members present in any of the given sets.
    pub fn sunion(&self, keys: &[&[u8]]) -> Result<Vec<Vec<u8>>> {
        if keys.is_empty() {
            return Err(Error::WrongNumberOfArgs);
        }
        let state = self.inner.sets.read()?;
        let mut union: HashSet<Vec<u8>> = HashSet::new();
        for key in keys {
            union.extend(members_of(&state, key));
        }
        Ok(union.into_iter().collect())
    }

    /// Members present in every one of the given sets.
    pub fn sinter(&self, keys: &[&[u8]]) -> Result<Vec<Vec<u8>>> {
        if keys.is_empty() {
            return Err(Error::WrongNumberOfArgs);
        }
        let state = self.inner.sets.read()?;
        let mut inter: HashSet<Vec<u8>> = members_of(&state, keys[0]).into_iter().collect();
        for key in &keys[1..] {
            if inter.is_empty() {
                break;
            }
            let other: HashSet<Vec<u8>> = members_of(&state, key).into_iter().collect();
            inter.retain(|m| other.contains(m));
        }
        Ok(inter.into_iter().collect())
    }

    /// Members of the first set that appear in none of the others.
    pub fn sdiff(&self, keys: &[&[u8]]) -> Result<Vec<Vec<u8>>> {
        if keys.is_empty() {
            return Err(Error::WrongNumberOfArgs);
        }
        let state = self.inner.sets.read()?;
        let mut diff: HashSet<Vec<u8>> = members_of(&state, keys[0]).into_iter().collect();
        for key in &keys[1..] {
            for member in members_of(&state, key) {
                diff.remove(&member);
            }
        }
        Ok(diff.into_iter().collect())
    }
}

fn members_of(state: &CompoundState, key: &[u8]) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    if let Some(tree) = state.live_tree(key) {
        let skip = key.len() + 1;
        tree.ascend(&mut |member_key, _| {
            out.push(member_key[skip..].to_vec());
            true
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> Db {
        Db::open(Options::new(dir.path())).expect("failed to open db")
    }

    fn sorted(mut v: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
        v.sort();
        v
    }

    #[test]
    fn test_add_remove_membership() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);

        assert_eq!(db.sadd(b"S", &[b"a", b"b", b"a"]).unwrap(), 2);
        assert_eq!(db.scard(b"S").unwrap(), 2);
        assert!(db.sismember(b"S", b"a").unwrap());
        assert!(!db.sismember(b"S", b"c").unwrap());

        assert_eq!(db.srem(b"S", &[b"a", b"missing"]).unwrap(), 1);
        assert_eq!(db.scard(b"S").unwrap(), 1);
        assert_eq!(db.srem(b"nothing", &[b"x"]).unwrap(), 0);
    }

    #[test]
    fn test_set_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let db = open(&dir);
            db.sadd(b"S", &[b"keep", b"drop"]).unwrap();
            db.srem(b"S", &[b"drop"]).unwrap();
        }

        let db = open(&dir);
        assert_eq!(sorted(db.smembers(b"S").unwrap()), vec![b"keep".to_vec()]);
        assert!(db.sismember(b"S", b"keep").unwrap());
        assert!(!db.sismember(b"S", b"drop").unwrap());
    }

    #[test]
    fn test_algebra() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        db.sadd(b"a", &[b"1", b"2", b"3"]).unwrap();
        db.sadd(b"b", &[b"2", b"3", b"4"]).unwrap();
        db.sadd(b"c", &[b"3"]).unwrap();

        assert_eq!(
            sorted(db.sunion(&[b"a", b"b", b"c"]).unwrap()),
            vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec(), b"4".to_vec()]
        );
        assert_eq!(
            sorted(db.sinter(&[b"a", b"b", b"c"]).unwrap()),
            vec![b"3".to_vec()]
        );
        assert_eq!(
            sorted(db.sdiff(&[b"a", b"b"]).unwrap()),
            vec![b"1".to_vec()]
        );
        assert_eq!(
            sorted(db.sdiff(&[b"a", b"missing"]).unwrap()),
            vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()]
        );

        assert_eq!(db.sunion(&[]).err(), Some(Error::WrongNumberOfArgs));
        assert_eq!(db.sinter(&[]).err(), Some(Error::WrongNumberOfArgs));
        assert_eq!(db.sdiff(&[]).err(), Some(Error::WrongNumberOfArgs));
    }
}
