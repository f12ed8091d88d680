//! Index reconstruction from the logs.
//!
//! Each datatype's segments replay in ascending file-id order, applying
//! puts, tombstones, expiry records and list metadata exactly as the
//! write path would have. Replay also rebuilds the discard counters
//! exactly: every superseded or dead entry discovered along the way is
//! tallied locally and installed wholesale, superseding whatever the
//! sidecar snapshot had drifted to.
//!
//! A CRC failure truncates the replay of that segment at the last entry
//! that decoded cleanly; for the active segment the append cursor is
//! reset there, so later writes overwrite the bad tail.

use std::collections::HashMap;

use crate::encoding;
use crate::error::Result;
use crate::index::{Index, IndexNode, OrderedIndex};
use crate::logfile::entry::{Entry, EntryType, Position};
use crate::logfile::{DataType, LogFile, DATA_TYPES};

use super::{now, CompoundState, DbInner, ZSetState};

/// Dead-bytes tally built during replay, keyed by file id.
type DeadMap = HashMap<u32, u64>;

pub(crate) fn load_indexes(inner: &DbInner) -> Result<()> {
    for dtype in DATA_TYPES {
        let mut dead = DeadMap::new();
        match dtype {
            DataType::Str => replay_strings(inner, &mut dead)?,
            DataType::Hash | DataType::Set | DataType::List => {
                replay_compound(inner, dtype, &mut dead)?
            }
            DataType::ZSet => replay_zset(inner, &mut dead)?,
        }
        inner.discards[dtype.index()].store(dead);
    }
    Ok(())
}

fn tally(dead: &mut DeadMap, fid: u32, bytes: u64) {
    *dead.entry(fid).or_insert(0) += bytes;
}

fn tally_node(dead: &mut DeadMap, node: &IndexNode) {
    tally(dead, node.fid, node.size as u64);
}

/// Walks one segment, feeding each cleanly decoded entry to `apply`.
/// Returns the offset just past the last good entry.
fn replay_file(
    file: &LogFile,
    mut apply: impl FnMut(Entry, Position) -> Result<()>,
) -> Result<u64> {
    let size = file.size();
    let mut offset = 0u64;
    while offset < size {
        let (entry, entry_size) = match file.read_entry(offset) {
            Ok(decoded) => decoded,
            Err(e) => {
                // A bad tail is survivable; everything before it stays.
                tracing::warn!(
                    file_id = file.id(),
                    offset,
                    error = %e,
                    "truncating replay at corrupt entry"
                );
                break;
            }
        };
        let pos = Position {
            file_id: file.id(),
            offset,
            size: entry_size as u32,
        };
        apply(entry, pos)?;
        offset += entry_size;
    }
    Ok(offset)
}

fn replay_datatype(
    inner: &DbInner,
    dtype: DataType,
    mut apply: impl FnMut(Entry, Position) -> Result<()>,
) -> Result<()> {
    let files = inner.logs[dtype.index()].read()?.files_in_order();
    for file in &files {
        let end = replay_file(file, &mut apply)?;
        // Trailing bytes past the last good entry are logically gone;
        // for the active segment this also repositions the append
        // cursor over them.
        file.set_size(end);
    }
    Ok(())
}

// ---------------------------------------------------------------- strings

fn replay_strings(inner: &DbInner, dead: &mut DeadMap) -> Result<()> {
    let files = inner.logs[DataType::Str.index()].read()?.files_in_order();
    let mut index = inner.strs.write()?;
    // Entries between a batch-begin and its commit stay buffered; a
    // batch whose commit never made it to disk is dropped wholesale.
    let mut pending_batch: Option<(Position, Vec<(Entry, Position)>)> = None;

    for file in &files {
        let end = replay_file(file, |entry, pos| {
            match entry.entry_type {
                EntryType::BatchBegin => {
                    if let Some((_, stale)) = pending_batch.take() {
                        tracing::warn!("batch without commit marker, discarding");
                        for (_, stale_pos) in stale {
                            tally(dead, stale_pos.file_id, stale_pos.size as u64);
                        }
                    }
                    pending_batch = Some((pos, Vec::new()));
                    tally(dead, pos.file_id, pos.size as u64);
                }
                EntryType::BatchCommit => {
                    if let Some((_, entries)) = pending_batch.take() {
                        for (entry, pos) in entries {
                            apply_string_entry(inner, &mut index, entry, pos, dead);
                        }
                    }
                    tally(dead, pos.file_id, pos.size as u64);
                }
                EntryType::Put | EntryType::Delete => match &mut pending_batch {
                    Some((_, buffer)) => buffer.push((entry, pos)),
                    None => apply_string_entry(inner, &mut index, entry, pos, dead),
                },
                other => {
                    tracing::warn!(entry_type = ?other, "unexpected entry in string log");
                    tally(dead, pos.file_id, pos.size as u64);
                }
            }
            Ok(())
        })?;
        file.set_size(end);
    }

    // A batch that never committed sits at the very tail of the stream.
    // Truncate back to its begin marker so later appends cannot end up
    // inside the half-written frame.
    if let Some((begin, uncommitted)) = pending_batch {
        tracing::warn!(
            entries = uncommitted.len(),
            "dropping uncommitted batch tail"
        );
        for file in &files {
            if file.id() > begin.file_id {
                file.set_size(0);
            } else if file.id() == begin.file_id {
                file.set_size(begin.offset.min(file.size()));
            }
        }
    }
    Ok(())
}

fn apply_string_entry(
    inner: &DbInner,
    index: &mut OrderedIndex,
    entry: Entry,
    pos: Position,
    dead: &mut DeadMap,
) {
    match entry.entry_type {
        EntryType::Put => {
            if entry.expire_at != 0 && entry.expire_at <= now() {
                // Already past its deadline: equivalent to a tombstone.
                if let Some(old) = index.delete(&entry.key) {
                    tally_node(dead, &old);
                }
                tally(dead, pos.file_id, pos.size as u64);
                return;
            }
            let node = inner.make_node(pos, entry.expire_at, &entry.value);
            if let Some(old) = index.put(entry.key, node) {
                tally_node(dead, &old);
            }
        }
        EntryType::Delete => {
            if let Some(old) = index.delete(&entry.key) {
                tally_node(dead, &old);
            }
            tally(dead, pos.file_id, pos.size as u64);
        }
        _ => unreachable!("filtered by caller"),
    }
}

// ----------------------------------------------------- hash / set / list

fn replay_compound(inner: &DbInner, dtype: DataType, dead: &mut DeadMap) -> Result<()> {
    let state_lock = match dtype {
        DataType::Hash => &inner.hashes,
        DataType::Set => &inner.sets,
        DataType::List => &inner.lists,
        _ => unreachable!("compound replay only handles hash/set/list"),
    };
    let mut state = state_lock.write()?;

    replay_datatype(inner, dtype, |entry, pos| {
        apply_compound_entry(inner, dtype, &mut state, entry, pos, dead);
        Ok(())
    })?;

    if dtype == DataType::List {
        compact_lists(inner, &mut state, dead)?;
    }
    state.trees.retain(|_, tree| !tree.is_empty());
    Ok(())
}

fn apply_compound_entry(
    inner: &DbInner,
    dtype: DataType,
    state: &mut CompoundState,
    entry: Entry,
    pos: Position,
    dead: &mut DeadMap,
) {
    let user_key = match compound_user_key(dtype, &entry) {
        Ok(user_key) => user_key,
        Err(e) => {
            tracing::warn!(%dtype, error = %e, "skipping undecodable entry");
            tally(dead, pos.file_id, pos.size as u64);
            return;
        }
    };

    match entry.entry_type {
        EntryType::Put => {
            let node = inner.make_node(pos, 0, &entry.value);
            let tree = state.trees.entry(user_key).or_default();
            if let Some(old) = tree.put(entry.key, node) {
                tally_node(dead, &old);
            }
        }
        EntryType::ListMeta => {
            let node = inner.make_node(pos, 0, &entry.value);
            let tree = state.trees.entry(user_key).or_default();
            if let Some(old) = tree.put(entry.key, node) {
                tally_node(dead, &old);
            }
        }
        EntryType::Delete if entry.key == user_key => {
            // Whole-key tombstone (hash/set clear).
            clear_tree(state, &user_key, dead);
            tally(dead, pos.file_id, pos.size as u64);
        }
        EntryType::Delete => {
            if let Some(tree) = state.trees.get_mut(&user_key) {
                if let Some(old) = tree.delete(&entry.key) {
                    tally_node(dead, &old);
                }
            }
            tally(dead, pos.file_id, pos.size as u64);
        }
        EntryType::Expire => {
            if entry.expire_at != 0 && entry.expire_at <= now() {
                clear_tree(state, &user_key, dead);
                state.expires.remove(&user_key);
                tally(dead, pos.file_id, pos.size as u64);
            } else {
                state.expires.insert(user_key, entry.expire_at);
            }
        }
        other => {
            tracing::warn!(%dtype, entry_type = ?other, "unexpected entry type");
            tally(dead, pos.file_id, pos.size as u64);
        }
    }
}

fn compound_user_key(dtype: DataType, entry: &Entry) -> Result<Vec<u8>> {
    match dtype {
        DataType::List => match entry.entry_type {
            // Meta, whole-key expiry: keyed by the raw user key.
            EntryType::ListMeta | EntryType::Expire => Ok(entry.key.clone()),
            _ => Ok(encoding::split_list_key(&entry.key)?.0.to_vec()),
        },
        _ => match entry.entry_type {
            // Whole-key tombstones and expiry carry the raw user key.
            _ if !entry.key.contains(&encoding::SEPARATOR) => Ok(entry.key.clone()),
            _ => Ok(encoding::split_member_key(&entry.key)?.0.to_vec()),
        },
    }
}

fn clear_tree(state: &mut CompoundState, user_key: &[u8], dead: &mut DeadMap) {
    if let Some(tree) = state.trees.remove(user_key) {
        tree.ascend(&mut |_, node| {
            tally_node(dead, node);
            true
        });
    }
}

/// Drops list elements whose sequence fell outside the live window; a
/// pop's tombstone may have been lost with a corrupt tail, but the meta
/// record is authoritative.
fn compact_lists(inner: &DbInner, state: &mut CompoundState, dead: &mut DeadMap) -> Result<()> {
    for (user_key, tree) in state.trees.iter_mut() {
        let (head, tail) = match tree.get(user_key) {
            Some(meta) => encoding::decode_list_meta(&inner.node_value(DataType::List, &meta)?)?,
            None => (encoding::INITIAL_LIST_SEQ, encoding::INITIAL_LIST_SEQ + 1),
        };

        let mut stale = Vec::new();
        tree.ascend(&mut |key, _| {
            if key != &user_key[..] {
                if let Ok((_, seq)) = encoding::split_list_key(key) {
                    if seq <= head || seq >= tail {
                        stale.push(key.to_vec());
                    }
                }
            }
            true
        });
        for key in stale {
            if let Some(old) = tree.delete(&key) {
                tally_node(dead, &old);
            }
        }
    }
    Ok(())
}

// ------------------------------------------------------------------ zset

fn replay_zset(inner: &DbInner, dead: &mut DeadMap) -> Result<()> {
    let mut state = inner.zsets.write()?;

    replay_datatype(inner, DataType::ZSet, |entry, pos| {
        apply_zset_entry(inner, &mut state, entry, pos, dead);
        Ok(())
    })?;

    state.trees.retain(|_, tree| !tree.is_empty());
    Ok(())
}

fn apply_zset_entry(
    inner: &DbInner,
    state: &mut ZSetState,
    entry: Entry,
    pos: Position,
    dead: &mut DeadMap,
) {
    let decoded = encoding::split_member_key(&entry.key)
        .and_then(|(user, suffix)| Ok((user, encoding::split_zset_suffix(suffix)?)));
    let (user_key, (score, member)) = match decoded {
        Ok(parts) => parts,
        Err(e) => {
            tracing::warn!(error = %e, "skipping undecodable zset entry");
            tally(dead, pos.file_id, pos.size as u64);
            return;
        }
    };
    let (user_key, member) = (user_key.to_vec(), member.to_vec());

    match entry.entry_type {
        EntryType::Put => {
            let tree = state.trees.entry(user_key.clone()).or_default();
            let member_scores = state.scores.entry(user_key.clone()).or_default();

            // A rescored member leaves its old tree slot behind.
            if let Some(&old_score) = member_scores.get(&member) {
                if old_score != score {
                    let old_key = encoding::zset_key(&user_key, old_score, &member);
                    if let Some(old) = tree.delete(&old_key) {
                        tally_node(dead, &old);
                    }
                }
            }

            let node = inner.make_node(pos, 0, &entry.value);
            if let Some(old) = tree.put(entry.key, node) {
                tally_node(dead, &old);
            }
            member_scores.insert(member, score);
        }
        EntryType::Delete => {
            if let Some(tree) = state.trees.get_mut(&user_key) {
                if let Some(old) = tree.delete(&entry.key) {
                    tally_node(dead, &old);
                }
            }
            if let Some(member_scores) = state.scores.get_mut(&user_key) {
                member_scores.remove(&member);
            }
            tally(dead, pos.file_id, pos.size as u64);
        }
        other => {
            tracing::warn!(entry_type = ?other, "unexpected entry in zset log");
            tally(dead, pos.file_id, pos.size as u64);
        }
    }
}
