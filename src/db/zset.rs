//! Sorted-set operations.
//!
//! Each member is logged under `key | 0xFE | score | member` with the
//! score encoded so byte order equals numeric order; walking the tree
//! already yields (score, member) order, ties broken by member bytes.
//! A per-key member -> score map answers score lookups directly and
//! lets rescoring drop the old slot without a tree scan.

use crate::encoding;
use crate::error::{Error, Result};
use crate::index::Index;
use crate::logfile::entry::{Entry, EntryType};
use crate::logfile::DataType;

use super::Db;

impl Db {
    /// Adds `member` with `score`, rescoring it if present. Returns true
    /// when the member was new.
    pub fn zadd(&self, key: &[u8], score: f64, member: &[u8]) -> Result<bool> {
        let inner = &self.inner;
        let mut state = inner.zsets.write()?;

        let old_score = state
            .scores
            .get(key)
            .and_then(|scores| scores.get(member))
            .copied();
        if old_score == Some(score) {
            return Ok(false);
        }

        let entry_key = encoding::zset_key(key, score, member);
        let entry = Entry::new(entry_key.clone(), Vec::new(), EntryType::Put);
        let pos = inner.append_entry(DataType::ZSet, &entry)?;
        let node = inner.make_node(pos, 0, &[]);

        let tree = state.trees.entry(key.to_vec()).or_default();
        if let Some(old) = old_score {
            let old_key = encoding::zset_key(key, old, member);
            if let Some(old_node) = tree.delete(&old_key) {
                inner.discard_node(DataType::ZSet, &old_node);
            }
        }
        if let Some(old_node) = tree.put(entry_key, node) {
            inner.discard_node(DataType::ZSet, &old_node);
        }
        state
            .scores
            .entry(key.to_vec())
            .or_default()
            .insert(member.to_vec(), score);
        inner.sync_on_commit(DataType::ZSet)?;
        Ok(old_score.is_none())
    }

    /// Removes `member`; returns whether it was present.
    pub fn zrem(&self, key: &[u8], member: &[u8]) -> Result<bool> {
        let inner = &self.inner;
        let mut state = inner.zsets.write()?;

        let Some(score) = state
            .scores
            .get_mut(key)
            .and_then(|scores| scores.remove(member))
        else {
            return Ok(false);
        };

        let entry_key = encoding::zset_key(key, score, member);
        let tombstone = Entry::new(entry_key.clone(), Vec::new(), EntryType::Delete);
        let pos = inner.append_entry(DataType::ZSet, &tombstone)?;
        if let Some(tree) = state.trees.get_mut(key) {
            if let Some(old) = tree.delete(&entry_key) {
                inner.discard_node(DataType::ZSet, &old);
            }
        }
        inner.discard_position(DataType::ZSet, pos);
        inner.sync_on_commit(DataType::ZSet)?;
        Ok(true)
    }

    /// The score of `member`, if present.
    pub fn zscore(&self, key: &[u8], member: &[u8]) -> Result<Option<f64>> {
        let state = self.inner.zsets.read()?;
        Ok(state
            .scores
            .get(key)
            .and_then(|scores| scores.get(member))
            .copied())
    }

    /// Zero-based rank of `member` in ascending (score, member) order.
    pub fn zrank(&self, key: &[u8], member: &[u8]) -> Result<Option<usize>> {
        let state = self.inner.zsets.read()?;
        let Some(target) = state
            .scores
            .get(key)
            .and_then(|scores| scores.get(member))
            .copied()
        else {
            return Ok(None);
        };
        let Some(tree) = state.trees.get(key) else {
            return Ok(None);
        };

        let target_key = encoding::zset_key(key, target, member);
        let mut rank = 0usize;
        let mut found = false;
        tree.ascend(&mut |entry_key, _| {
            if entry_key == &target_key[..] {
                found = true;
                return false;
            }
            rank += 1;
            true
        });
        Ok(found.then_some(rank))
    }

    /// Members between logical positions `start` and `end` inclusive,
    /// with redis-style negative indexes, as (member, score) pairs in
    /// ascending order.
    pub fn zrange(&self, key: &[u8], start: i64, end: i64) -> Result<Vec<(Vec<u8>, f64)>> {
        let state = self.inner.zsets.read()?;
        let Some(tree) = state.trees.get(key) else {
            return Ok(Vec::new());
        };

        let len = tree.len() as i64;
        let start = if start < 0 { (len + start).max(0) } else { start };
        let end = if end < 0 { len + end } else { end.min(len - 1) };
        if start > end || start >= len || end < 0 {
            return Ok(Vec::new());
        }

        let mut out = Vec::with_capacity((end - start + 1) as usize);
        let mut position = 0i64;
        let mut decode_error = None;
        tree.ascend(&mut |entry_key, _| {
            if position > end {
                return false;
            }
            if position >= start {
                match decode_entry(entry_key) {
                    Ok(pair) => out.push(pair),
                    Err(e) => {
                        decode_error = Some(e);
                        return false;
                    }
                }
            }
            position += 1;
            true
        });
        match decode_error {
            Some(e) => Err(e),
            None => Ok(out),
        }
    }

    /// Members whose score lies in `[lo, hi]`, ascending.
    pub fn zrange_by_score(&self, key: &[u8], lo: f64, hi: f64) -> Result<Vec<(Vec<u8>, f64)>> {
        let state = self.inner.zsets.read()?;
        let Some(tree) = state.trees.get(key) else {
            return Ok(Vec::new());
        };

        let mut out = Vec::new();
        let mut decode_error = None;
        tree.ascend(&mut |entry_key, _| {
            match decode_entry(entry_key) {
                Ok((member, score)) => {
                    if score > hi {
                        return false; // past the window, scores only grow
                    }
                    if score >= lo {
                        out.push((member, score));
                    }
                    true
                }
                Err(e) => {
                    decode_error = Some(e);
                    false
                }
            }
        });
        match decode_error {
            Some(e) => Err(e),
            None => Ok(out),
        }
    }
}

fn decode_entry(entry_key: &[u8]) -> Result<(Vec<u8>, f64)> {
    let (_, suffix) = encoding::split_member_key(entry_key)?;
    let (score, member) = encoding::split_zset_suffix(suffix)?;
    Ok((member.to_vec(), score))
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
    fn test_add_score_rank() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);

        assert!(db.zadd(b"Z", 3.0, b"c").unwrap());
        assert!(db.zadd(b"Z", 1.0, b"a").unwrap());
        assert!(db.zadd(b"Z", 2.0, b"b").unwrap());
        // same member, same score: no-op
        assert!(!db.zadd(b"Z", 1.0, b"a").unwrap());

        assert_eq!(db.zscore(b"Z", b"b").unwrap(), Some(2.0));
        assert_eq!(db.zscore(b"Z", b"nope").unwrap(), None);
        assert_eq!(db.zrank(b"Z", b"a").unwrap(), Some(0));
        assert_eq!(db.zrank(b"Z", b"c").unwrap(), Some(2));
        assert_eq!(db.zrank(b"Z", b"nope").unwrap(), None);
    }

    #[test]
    fn test_rescore_moves_member() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        db.zadd(b"Z", 1.0, b"m").unwrap();
        db.zadd(b"Z", 2.0, b"other").unwrap();

        assert!(!db.zadd(b"Z", 9.0, b"m").unwrap());
        assert_eq!(db.zscore(b"Z", b"m").unwrap(), Some(9.0));
        assert_eq!(db.zrank(b"Z", b"m").unwrap(), Some(1));

        let range = db.zrange(b"Z", 0, -1).unwrap();
        assert_eq!(
            range,
            vec![(b"other".to_vec(), 2.0), (b"m".to_vec(), 9.0)]
        );
    }

    #[test]
    fn test_ties_break_on_member_bytes() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        db.zadd(b"Z", 5.0, b"bravo").unwrap();
        db.zadd(b"Z", 5.0, b"alpha").unwrap();
        db.zadd(b"Z", -1.0, b"last-but-first").unwrap();

        let range = db.zrange(b"Z", 0, -1).unwrap();
        assert_eq!(
            range.iter().map(|(m, _)| m.as_slice()).collect::<Vec<_>>(),
            vec![&b"last-but-first"[..], b"alpha", b"bravo"]
        );
    }

    #[test]
    fn test_zrange_windows() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        for (score, member) in [(1.0, "a"), (2.0, "b"), (3.0, "c"), (4.0, "d")] {
            db.zadd(b"Z", score, member.as_bytes()).unwrap();
        }

        assert_eq!(db.zrange(b"Z", 1, 2).unwrap().len(), 2);
        assert_eq!(db.zrange(b"Z", -2, -1).unwrap().len(), 2);
        assert_eq!(db.zrange(b"Z", 0, 100).unwrap().len(), 4);
        assert!(db.zrange(b"Z", 3, 1).unwrap().is_empty());
        assert!(db.zrange(b"missing", 0, -1).unwrap().is_empty());

        let mid = db.zrange_by_score(b"Z", 1.5, 3.5).unwrap();
        assert_eq!(
            mid,
            vec![(b"b".to_vec(), 2.0), (b"c".to_vec(), 3.0)]
        );
        assert!(db.zrange_by_score(b"Z", 10.0, 20.0).unwrap().is_empty());
    }

    #[test]
    fn test_zrem() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        db.zadd(b"Z", 1.0, b"gone").unwrap();
        db.zadd(b"Z", 2.0, b"stays").unwrap();

        assert!(db.zrem(b"Z", b"gone").unwrap());
        assert!(!db.zrem(b"Z", b"gone").unwrap());
        assert_eq!(db.zscore(b"Z", b"gone").unwrap(), None);
        assert_eq!(db.zrange(b"Z", 0, -1).unwrap().len(), 1);
    }

    #[test]
    fn test_zset_survives_reopen_with_rescore() {
        let dir = TempDir::new().unwrap();
        {
            let db = open(&dir);
            db.zadd(b"board", 10.0, b"alice").unwrap();
            db.zadd(b"board", 20.0, b"bob").unwrap();
            db.zadd(b"board", 5.0, b"bob").unwrap();
            db.zrem(b"board", b"alice").unwrap();
            db.zadd(b"board", 7.5, b"carol").unwrap();
        }

        let db = open(&dir);
        assert_eq!(db.zscore(b"board", b"alice").unwrap(), None);
        assert_eq!(db.zscore(b"board", b"bob").unwrap(), Some(5.0));
        assert_eq!(
            db.zrange(b"board", 0, -1).unwrap(),
            vec![(b"bob".to_vec(), 5.0), (b"carol".to_vec(), 7.5)]
        );
    }
}
