//! Reclamation: rewriting the live remainder of stale segments.
//!
//! Candidates are archived segments whose dead-bytes ratio meets the
//! configured threshold, most-stale first. Each source is rewritten into
//! a sibling `.merge` file carrying the same file id; under a brief
//! exclusive lock the index is repointed entry by entry (only where it
//! still references the old offset, so concurrent writes always win) and
//! the output atomically renamed over its source. Replay order is
//! untouched because the id never changes, and a crash before the rename
//! just leaves a `.merge` orphan for the next open to sweep up.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::encoding;
use crate::error::Result;
use crate::index::Index;
use crate::logfile::entry::{Entry, EntryType, Position};
use crate::logfile::{segment_path, DataType, LogFile, DATA_TYPES, MERGE_EXT};
use crate::scheduler::BackgroundTask;

use super::{now, DbInner};

/// Periodic driver for the reclamation pass.
pub(crate) struct MergeTask {
    inner: Arc<DbInner>,
}

impl MergeTask {
    pub fn new(inner: Arc<DbInner>) -> Self {
        Self { inner }
    }
}

impl BackgroundTask for MergeTask {
    fn name(&self) -> &'static str {
        "merge"
    }

    fn interval(&self) -> Duration {
        self.inner.opts.merge_interval
    }

    fn execute(&self) -> Result<()> {
        for dtype in DATA_TYPES {
            merge_datatype(&self.inner, dtype)?;
        }
        Ok(())
    }
}

/// One rewritten live entry: where it was and where its copy went.
struct Rewrite {
    entry: Entry,
    old: Position,
    new: Position,
}

pub(crate) fn merge_datatype(inner: &DbInner, dtype: DataType) -> Result<()> {
    let candidates = {
        let log = inner.logs[dtype.index()].read()?;
        let counters = inner.discards[dtype.index()].snapshot();
        let mut scored: Vec<(u32, f64)> = log
            .archived()
            .values()
            .filter_map(|file| {
                let size = file.size();
                if size == 0 {
                    return None;
                }
                let dead = counters.get(&file.id()).copied().unwrap_or(0);
                let ratio = dead as f64 / size as f64;
                (ratio >= inner.opts.merge_ratio).then_some((file.id(), ratio))
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        scored
    };

    for (fid, ratio) in candidates {
        tracing::info!(%dtype, file_id = fid, ratio, "merging segment");
        merge_file(inner, dtype, fid)?;
    }
    Ok(())
}

fn merge_file(inner: &DbInner, dtype: DataType, fid: u32) -> Result<()> {
    let (source, merge_path) = {
        let log = inner.logs[dtype.index()].read()?;
        let Ok(source) = log.file(fid) else {
            return Ok(()); // already reclaimed
        };
        (source, segment_path(log.dir(), fid, MERGE_EXT))
    };

    let mut merged = LogFile::open(
        merge_path.clone(),
        fid,
        inner.opts.io_type,
        inner.opts.segment_size,
    )?;

    // Phase 1, no locks: copy whatever the index still points at. The
    // source is archived and immutable, so this races only with entries
    // dying, which the CAS below resolves.
    let mut rewrites = Vec::new();
    let mut offset = 0u64;
    while offset < source.size() {
        let (entry, size) = match source.read_entry(offset) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!(file_id = fid, offset, error = %e, "merge scan stopped early");
                break;
            }
        };
        let old = Position {
            file_id: fid,
            offset,
            size: size as u32,
        };
        if is_live(inner, dtype, &entry, old)? {
            let new_offset = merged.append(&entry.encode())?;
            rewrites.push(Rewrite {
                entry,
                old,
                new: Position {
                    file_id: fid,
                    offset: new_offset,
                    size: size as u32,
                },
            });
        }
        offset += size;
    }
    merged.sync()?;

    if rewrites.is_empty() {
        // Nothing lives here, and nothing can come back to life in an
        // archived segment: drop the source outright. Readers that still
        // hold the old handle keep their fd; the name just goes away.
        inner.logs[dtype.index()].write()?.remove_archived(fid);
        std::fs::remove_file(source.path())?;
        merged.remove()?;
        inner.discards[dtype.index()].zero(fid);
        tracing::info!(%dtype, file_id = fid, "dropped fully dead segment");
        return Ok(());
    }

    // Phase 2, exclusive: repoint surviving index entries and swap the
    // file. Readers hold the shared lock across position resolution and
    // the disk read, so no read can straddle the swap.
    let dead_copies = match dtype {
        DataType::Str => {
            let mut index = inner.strs.write()?;
            let dead = cas_strings(&mut index, &rewrites);
            swap_segment(inner, dtype, merged, &source, fid)?;
            dead
        }
        DataType::Hash | DataType::Set | DataType::List => {
            let state_lock = match dtype {
                DataType::Hash => &inner.hashes,
                DataType::Set => &inner.sets,
                _ => &inner.lists,
            };
            let mut state = state_lock.write()?;
            let dead = cas_compound(dtype, &mut state, &rewrites);
            swap_segment(inner, dtype, merged, &source, fid)?;
            dead
        }
        DataType::ZSet => {
            let mut state = inner.zsets.write()?;
            let dead = cas_zset(&mut state, &rewrites);
            swap_segment(inner, dtype, merged, &source, fid)?;
            dead
        }
    };

    inner.discards[dtype.index()].zero(fid);
    for pos in dead_copies {
        inner.discard_position(dtype, pos);
    }
    tracing::info!(%dtype, file_id = fid, live = rewrites.len(), "merged segment");
    Ok(())
}

/// Renames the merge output over its source and swaps the open handle.
/// Caller holds the datatype's exclusive lock.
fn swap_segment(
    inner: &DbInner,
    dtype: DataType,
    mut merged: LogFile,
    source: &Arc<LogFile>,
    fid: u32,
) -> Result<()> {
    let mut log = inner.logs[dtype.index()].write()?;
    merged.rename(source.path().to_path_buf())?;
    log.replace_archived(fid, merged);
    Ok(())
}

/// Whether any remaining segment holds entries older than `fid`. While
/// one does, tombstones in `fid` still shadow puts that replay before
/// them and must be carried over; only the oldest segment may drop them.
fn has_older_segment(inner: &DbInner, dtype: DataType, fid: u32) -> Result<bool> {
    let log = inner.logs[dtype.index()].read()?;
    Ok(log.archived().keys().any(|&id| id < fid))
}

/// Liveness: the entry is worth keeping iff the index still references
/// exactly this position (or, for expiry records, this deadline; or, for
/// tombstones, an older segment that could still resurrect the key).
fn is_live(inner: &DbInner, dtype: DataType, entry: &Entry, pos: Position) -> Result<bool> {
    if entry.entry_type == EntryType::Delete {
        return has_older_segment(inner, dtype, pos.file_id);
    }
    let live = match dtype {
        DataType::Str => match entry.entry_type {
            EntryType::Put => {
                // An expired put replays as a delete, so it shadows
                // older values the same way a tombstone does.
                if entry.expire_at != 0 && entry.expire_at <= now() {
                    return has_older_segment(inner, dtype, pos.file_id);
                }
                let index = inner.strs.read()?;
                index.get(&entry.key).map(|n| n.position()) == Some(pos)
            }
            _ => false,
        },
        DataType::Hash | DataType::Set | DataType::List => {
            let state_lock = match dtype {
                DataType::Hash => &inner.hashes,
                DataType::Set => &inner.sets,
                _ => &inner.lists,
            };
            let state = state_lock.read()?;
            match entry.entry_type {
                EntryType::Put | EntryType::ListMeta => {
                    let user_key = match dtype {
                        DataType::List if entry.entry_type == EntryType::Put => {
                            match encoding::split_list_key(&entry.key) {
                                Ok((user, _)) => user.to_vec(),
                                Err(_) => return Ok(false),
                            }
                        }
                        DataType::List => entry.key.clone(),
                        _ => match encoding::split_member_key(&entry.key) {
                            Ok((user, _)) => user.to_vec(),
                            Err(_) => return Ok(false),
                        },
                    };
                    state
                        .trees
                        .get(&user_key)
                        .and_then(|tree| tree.get(&entry.key))
                        .map(|n| n.position())
                        == Some(pos)
                }
                EntryType::Expire => {
                    // A lapsed deadline clears the key at replay, which
                    // makes it a tombstone in disguise.
                    if entry.expire_at != 0 && entry.expire_at <= now() {
                        return has_older_segment(inner, dtype, pos.file_id);
                    }
                    state.expires.get(&entry.key) == Some(&entry.expire_at)
                }
                _ => false,
            }
        }
        DataType::ZSet => match entry.entry_type {
            EntryType::Put => {
                let state = inner.zsets.read()?;
                let Ok((user_key, _)) = encoding::split_member_key(&entry.key) else {
                    return Ok(false);
                };
                state
                    .trees
                    .get(user_key)
                    .and_then(|tree| tree.get(&entry.key))
                    .map(|n| n.position())
                    == Some(pos)
            }
            _ => false,
        },
    };
    Ok(live)
}

fn cas_strings(index: &mut crate::index::OrderedIndex, rewrites: &[Rewrite]) -> Vec<Position> {
    let mut dead = Vec::new();
    for rw in rewrites {
        if rw.entry.entry_type == EntryType::Delete
            || (rw.entry.expire_at != 0 && rw.entry.expire_at <= now())
        {
            continue; // carried-over tombstone, nothing points at it
        }
        match index.get(&rw.entry.key) {
            Some(current) if current.position() == rw.old => {
                let mut node = current;
                node.fid = rw.new.file_id;
                node.offset = rw.new.offset;
                node.size = rw.new.size;
                index.put(rw.entry.key.clone(), node);
            }
            _ => dead.push(rw.new),
        }
    }
    dead
}

fn cas_compound(
    dtype: DataType,
    state: &mut super::CompoundState,
    rewrites: &[Rewrite],
) -> Vec<Position> {
    let mut dead = Vec::new();
    for rw in rewrites {
        match rw.entry.entry_type {
            EntryType::Expire => {
                // Nothing points at expiry records; the copy is only
                // wasted if a still-pending deadline moved meanwhile.
                let lapsed = rw.entry.expire_at != 0 && rw.entry.expire_at <= now();
                if !lapsed && state.expires.get(&rw.entry.key) != Some(&rw.entry.expire_at) {
                    dead.push(rw.new);
                }
                continue;
            }
            EntryType::Delete => continue, // carried-over tombstone
            EntryType::Put | EntryType::ListMeta => {}
            _ => {
                dead.push(rw.new);
                continue;
            }
        }

        let user_key = match dtype {
            DataType::List if rw.entry.entry_type == EntryType::Put => {
                match encoding::split_list_key(&rw.entry.key) {
                    Ok((user, _)) => user.to_vec(),
                    Err(_) => {
                        dead.push(rw.new);
                        continue;
                    }
                }
            }
            DataType::List => rw.entry.key.clone(),
            _ => match encoding::split_member_key(&rw.entry.key) {
                Ok((user, _)) => user.to_vec(),
                Err(_) => {
                    dead.push(rw.new);
                    continue;
                }
            },
        };

        let repointed = state.trees.get_mut(&user_key).is_some_and(|tree| {
            match tree.get(&rw.entry.key) {
                Some(current) if current.position() == rw.old => {
                    let mut node = current;
                    node.fid = rw.new.file_id;
                    node.offset = rw.new.offset;
                    node.size = rw.new.size;
                    tree.put(rw.entry.key.clone(), node);
                    true
                }
                _ => false,
            }
        });
        if !repointed {
            dead.push(rw.new);
        }
    }
    dead
}

fn cas_zset(state: &mut super::ZSetState, rewrites: &[Rewrite]) -> Vec<Position> {
    let mut dead = Vec::new();
    for rw in rewrites {
        if rw.entry.entry_type == EntryType::Delete {
            continue; // carried-over tombstone
        }
        let Ok((user_key, _)) = encoding::split_member_key(&rw.entry.key) else {
            dead.push(rw.new);
            continue;
        };
        let repointed = state.trees.get_mut(user_key).is_some_and(|tree| {
            match tree.get(&rw.entry.key) {
                Some(current) if current.position() == rw.old => {
                    let mut node = current;
                    node.fid = rw.new.file_id;
                    node.offset = rw.new.offset;
                    node.size = rw.new.size;
                    tree.put(rw.entry.key.clone(), node);
                    true
                }
                _ => false,
            }
        });
        if !repointed {
            dead.push(rw.new);
        }
    }
    dead
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use crate::db::Db;
    use crate::error::Error;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    fn dir_bytes(path: &Path) -> u64 {
        std::fs::read_dir(path)
            .unwrap()
            .map(|e| e.unwrap().metadata().unwrap().len())
            .sum()
    }

    /// Discard events drain on a background thread; candidate selection
    /// reads the folded counters, so tests wait for them to land.
    fn wait_for_discard(db: &Db, dtype: DataType, at_least: u64) {
        for _ in 0..400 {
            let total: u64 = db.inner.discards[dtype.index()]
                .snapshot()
                .values()
                .sum();
            if total >= at_least {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("discard counters never reached {at_least}");
    }

    #[test]
    fn test_merge_reclaims_deleted_space() {
        let dir = TempDir::new().unwrap();
        let opts = Options::new(dir.path())
            .segment_size(16 * 1024)
            .merge_ratio(0.3);
        let db = Db::open(opts.clone()).unwrap();

        let value = vec![b'v'; 1024];
        for i in 0..100 {
            db.put(format!("key-{i:03}").as_bytes(), &value).unwrap();
        }
        for i in (0..100).step_by(2) {
            db.delete(format!("key-{i:03}").as_bytes()).unwrap();
        }
        wait_for_discard(&db, DataType::Str, 40 * 1024);

        let string_dir = dir.path().join("string");
        let before = dir_bytes(&string_dir);
        db.merge(DataType::Str).unwrap();
        let after = dir_bytes(&string_dir);

        assert!(
            (after as f64) <= (before as f64) * 0.6,
            "expected >=40% shrink, got {before} -> {after}"
        );
        for i in 0..100 {
            let key = format!("key-{i:03}");
            if i % 2 == 0 {
                assert_eq!(db.get(key.as_bytes()).err(), Some(Error::KeyNotFound));
            } else {
                assert_eq!(db.get(key.as_bytes()).unwrap(), value, "lost {key}");
            }
        }

        drop(db);
        let db = Db::open(opts).unwrap();
        for i in (1..100).step_by(2) {
            assert_eq!(db.get(format!("key-{i:03}").as_bytes()).unwrap(), value);
        }
    }

    #[test]
    fn test_merge_equivalence_across_datatypes() {
        let dir = TempDir::new().unwrap();
        // ratio 0 makes every archived segment a candidate, so the pass
        // runs deterministically without waiting on discard drains
        let opts = Options::new(dir.path())
            .segment_size(256)
            .merge_ratio(0.0);
        let db = Db::open(opts.clone()).unwrap();

        for i in 0..50 {
            db.put(format!("s{i}").as_bytes(), format!("v{i}").as_bytes())
                .unwrap();
            db.hset(b"H", format!("f{i}").as_bytes(), b"old").unwrap();
            db.hset(b"H", format!("f{i}").as_bytes(), format!("h{i}").as_bytes())
                .unwrap();
            db.rpush(b"L", &[format!("l{i}").as_bytes()]).unwrap();
            db.sadd(b"S", &[format!("m{i}").as_bytes()]).unwrap();
            db.zadd(b"Z", i as f64, format!("z{i}").as_bytes()).unwrap();
            db.zadd(b"Z", (i + 100) as f64, format!("z{i}").as_bytes())
                .unwrap();
        }
        for i in 0..10 {
            db.lpop(b"L").unwrap().unwrap();
            db.srem(b"S", &[format!("m{i}").as_bytes()]).unwrap();
        }
        db.hexpire(b"H", Duration::from_secs(3600)).unwrap();

        let check = |db: &Db| {
            for i in 0..50 {
                assert_eq!(
                    db.get(format!("s{i}").as_bytes()).unwrap(),
                    format!("v{i}").as_bytes()
                );
                assert_eq!(
                    db.hget(b"H", format!("f{i}").as_bytes()).unwrap().unwrap(),
                    format!("h{i}").as_bytes()
                );
                assert_eq!(
                    db.zscore(b"Z", format!("z{i}").as_bytes()).unwrap(),
                    Some((i + 100) as f64)
                );
            }
            assert_eq!(db.llen(b"L").unwrap(), 40);
            assert_eq!(db.lindex(b"L", 0).unwrap(), b"l10");
            assert_eq!(db.lindex(b"L", -1).unwrap(), b"l49");
            assert_eq!(db.scard(b"S").unwrap(), 40);
            assert!(!db.sismember(b"S", b"m3").unwrap());
            assert!(db.sismember(b"S", b"m17").unwrap());
            assert!(db.httl(b"H").unwrap().is_some());
        };

        check(&db);
        for dtype in DATA_TYPES {
            db.merge(dtype).unwrap();
        }
        check(&db);

        // merging twice in a row must be a no-op semantically
        for dtype in DATA_TYPES {
            db.merge(dtype).unwrap();
        }
        check(&db);

        drop(db);
        let db = Db::open(opts.clone()).unwrap();
        check(&db);

        // recovery idempotence: another replay of the same logs
        drop(db);
        let db = Db::open(opts).unwrap();
        check(&db);
    }

    #[test]
    fn test_merge_preserves_string_ttl() {
        let dir = TempDir::new().unwrap();
        let opts = Options::new(dir.path())
            .segment_size(1024)
            .merge_ratio(0.0);
        let db = Db::open(opts.clone()).unwrap();

        db.put_with_ttl(b"expiring", b"payload", Duration::from_secs(3600))
            .unwrap();
        for i in 0..50 {
            db.put(format!("filler{i}").as_bytes(), &[b'x'; 64]).unwrap();
        }
        db.merge(DataType::Str).unwrap();
        assert_eq!(db.get(b"expiring").unwrap(), b"payload");

        drop(db);
        let db = Db::open(opts).unwrap();
        assert_eq!(db.get(b"expiring").unwrap(), b"payload");
    }

    #[test]
    fn test_dead_bytes_never_exceed_file_size() {
        let dir = TempDir::new().unwrap();
        let opts = Options::new(dir.path()).segment_size(4 * 1024);
        let db = Db::open(opts).unwrap();

        for round in 0..5 {
            for i in 0..50 {
                db.put(
                    format!("churn{i}").as_bytes(),
                    format!("round{round}-{}", "y".repeat(50)).as_bytes(),
                )
                .unwrap();
            }
        }
        for i in 0..25 {
            db.delete(format!("churn{i}").as_bytes()).unwrap();
        }
        wait_for_discard(&db, DataType::Str, 1);
        // give the drainer a moment to fold the full backlog
        std::thread::sleep(Duration::from_millis(100));

        let log = db.inner.logs[DataType::Str.index()].read().unwrap();
        let counters = db.inner.discards[DataType::Str.index()].snapshot();
        for (fid, dead) in &counters {
            if let Some(file) = log.archived().get(fid) {
                assert!(
                    *dead <= file.size(),
                    "file {fid}: {dead} dead > {} total",
                    file.size()
                );
            }
        }
    }
}
