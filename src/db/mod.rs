//! Database core: shared state, the write/read plumbing every datatype
//! operation goes through, and the open/close lifecycle.
//!
//! Locking discipline: each datatype has one RwLock guarding its indexes;
//! inside it sits the per-datatype log manager lock. Operations take the
//! index lock first and hold it across any log IO they do, which is what
//! lets the merge swap a segment safely under the index write lock.
//! The fixed cross-datatype order is string < hash < set < zset < list.

pub mod batch;
pub mod hash;
pub mod list;
pub mod merge;
pub mod recovery;
pub mod set;
pub mod strs;
pub mod zset;

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::{IndexMode, Options};
use crate::discard::Discard;
use crate::error::{Error, Result};
use crate::index::{Index, IndexNode, OrderedIndex, RadixTree};
use crate::logfile::entry::{Entry, Position};
use crate::logfile::manager::LogManager;
use crate::logfile::{DataType, DATA_TYPES};
use crate::scheduler::Scheduler;

use self::batch::{Batch, BatchOptions};

const LOCK_FILE: &str = "LOCK";
const DISCARD_DIR: &str = "discard";

/// Takes the exclusive advisory lock on `dir/LOCK` and records our pid
/// in it. The lock lives exactly as long as the returned handle, so a
/// crashed owner releases it the moment the OS reaps its descriptors.
/// The file is deliberately not truncated before locking: when the
/// directory is busy, the loser gets to read and report who holds it.
fn acquire_dir_lock(dir: &Path) -> Result<File> {
    let path = dir.join(LOCK_FILE);
    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(&path)?;

    if !try_exclusive(&file) {
        let mut owner = String::new();
        let _ = file.read_to_string(&mut owner);
        tracing::warn!(
            path = %path.display(),
            owner = owner.trim(),
            "database directory is held by another process"
        );
        return Err(Error::DirLocked);
    }

    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    writeln!(file, "{}", std::process::id())?;
    file.flush()?;
    Ok(file)
}

#[cfg(unix)]
fn try_exclusive(file: &File) -> bool {
    use std::os::unix::io::AsRawFd;

    unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) == 0 }
}

#[cfg(not(unix))]
fn try_exclusive(_file: &File) -> bool {
    // No advisory locking on this platform; single-process use only.
    true
}

/// Current time in epoch seconds; expiry deadlines compare against this.
pub(crate) fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Index state of one compound datatype: a radix tree per user key plus
/// the whole-key expiry deadlines.
#[derive(Default)]
pub(crate) struct CompoundState {
    pub trees: HashMap<Vec<u8>, RadixTree>,
    pub expires: HashMap<Vec<u8>, u64>,
}

impl CompoundState {
    pub fn is_expired(&self, key: &[u8]) -> bool {
        matches!(self.expires.get(key), Some(&deadline) if deadline != 0 && deadline <= now())
    }

    /// The key's tree, unless the key is past its deadline.
    pub fn live_tree(&self, key: &[u8]) -> Option<&RadixTree> {
        if self.is_expired(key) {
            return None;
        }
        self.trees.get(key)
    }
}

/// Sorted sets add an in-memory member -> score map on top of the
/// score-ordered tree, giving score lookups without a tree walk.
#[derive(Default)]
pub(crate) struct ZSetState {
    pub trees: HashMap<Vec<u8>, RadixTree>,
    pub scores: HashMap<Vec<u8>, HashMap<Vec<u8>, f64>>,
}

/// State shared between the public handle, the merge task and the
/// discard drainers.
pub(crate) struct DbInner {
    pub(crate) opts: Options,
    /// Holds the directory lock; dropping the handle releases it.
    lock_file: Mutex<Option<File>>,
    pub(crate) logs: [RwLock<LogManager>; 5],
    pub(crate) strs: RwLock<OrderedIndex>,
    pub(crate) hashes: RwLock<CompoundState>,
    pub(crate) sets: RwLock<CompoundState>,
    pub(crate) zsets: RwLock<ZSetState>,
    pub(crate) lists: RwLock<CompoundState>,
    pub(crate) discards: [Discard; 5],
    closed: AtomicBool,
}

impl DbInner {
    /// Appends one encoded entry to the datatype's active segment,
    /// rotating if needed. Callers hold the datatype's write lock.
    pub(crate) fn append_entry(&self, dtype: DataType, entry: &Entry) -> Result<Position> {
        let mut log = self.logs[dtype.index()].write()?;
        log.append(&entry.encode())
    }

    /// Commit boundary: flush the active segment when configured to.
    pub(crate) fn sync_on_commit(&self, dtype: DataType) -> Result<()> {
        if self.opts.sync_writes {
            self.logs[dtype.index()].read()?.active().sync()?;
        }
        Ok(())
    }

    /// Reads the entry a position points at. Callers must hold the
    /// datatype lock (shared is enough) so the merge cannot swap the
    /// segment out from underneath the read.
    pub(crate) fn read_position(&self, dtype: DataType, pos: Position) -> Result<Entry> {
        let file = self.logs[dtype.index()].read()?.file(pos.file_id)?;
        let (entry, _) = file.read_entry(pos.offset)?;
        Ok(entry)
    }

    /// Value bytes for an index node: the in-memory copy when the index
    /// carries values, a log read otherwise.
    pub(crate) fn node_value(&self, dtype: DataType, node: &IndexNode) -> Result<Vec<u8>> {
        if let Some(value) = &node.value {
            return Ok(value.clone());
        }
        Ok(self.read_position(dtype, node.position())?.value)
    }

    /// Builds the node for a freshly appended entry, caching the value
    /// in key-value mode.
    pub(crate) fn make_node(&self, pos: Position, expire_at: u64, value: &[u8]) -> IndexNode {
        let cached = match self.opts.index_mode {
            IndexMode::KeyValue => Some(value.to_vec()),
            IndexMode::KeyOnly => None,
        };
        IndexNode::new(pos, expire_at, cached)
    }

    pub(crate) fn discard(&self, dtype: DataType, fid: u32, bytes: u64) {
        self.discards[dtype.index()].send(fid, bytes);
    }

    pub(crate) fn discard_node(&self, dtype: DataType, node: &IndexNode) {
        self.discard(dtype, node.fid, node.size as u64);
    }

    pub(crate) fn discard_position(&self, dtype: DataType, pos: Position) {
        self.discard(dtype, pos.file_id, pos.size as u64);
    }

    /// Puts into a tree and routes the superseded entry's bytes to the
    /// discard tracker.
    pub(crate) fn tree_put(
        &self,
        dtype: DataType,
        tree: &mut RadixTree,
        key: Vec<u8>,
        node: IndexNode,
    ) -> bool {
        match tree.put(key, node) {
            Some(old) => {
                self.discard_node(dtype, &old);
                false
            }
            None => true,
        }
    }

    /// Drops a whole compound key once its deadline has passed: every
    /// node in its tree becomes dead bytes. Called from write paths,
    /// which hold the exclusive lock.
    pub(crate) fn purge_if_expired(
        &self,
        dtype: DataType,
        state: &mut CompoundState,
        key: &[u8],
    ) {
        if !state.is_expired(key) {
            return;
        }
        if let Some(tree) = state.trees.remove(key) {
            tree.ascend(&mut |_, node| {
                self.discard_node(dtype, node);
                true
            });
        }
        state.expires.remove(key);
    }
}

/// An embedded multi-datatype key-value store over per-datatype
/// append-only logs.
///
/// All methods take `&self`; the handle is internally synchronized and
/// can be shared behind an `Arc` across threads.
pub struct Db {
    pub(crate) inner: Arc<DbInner>,
    scheduler: Mutex<Scheduler>,
}

impl Db {
    /// Opens (creating if necessary) the database under
    /// `opts.dir_path`, replays the logs into fresh indexes and starts
    /// the background merge.
    pub fn open(opts: Options) -> Result<Db> {
        std::fs::create_dir_all(&opts.dir_path)?;
        let lock_file = acquire_dir_lock(&opts.dir_path)?;

        let discard_dir = opts.dir_path.join(DISCARD_DIR);
        std::fs::create_dir_all(&discard_dir)?;
        let open_discard = |dtype: DataType| {
            Discard::open(
                discard_dir.join(format!("{}.meta", dtype.as_str())),
                opts.discard_channel_size,
            )
        };
        let discards = [
            open_discard(DataType::Str)?,
            open_discard(DataType::Hash)?,
            open_discard(DataType::Set)?,
            open_discard(DataType::ZSet)?,
            open_discard(DataType::List)?,
        ];

        let open_log = |dtype: DataType| -> Result<RwLock<LogManager>> {
            Ok(RwLock::new(LogManager::open(
                opts.dir_path.join(dtype.as_str()),
                opts.io_type,
                opts.segment_size,
            )?))
        };
        let logs = [
            open_log(DataType::Str)?,
            open_log(DataType::Hash)?,
            open_log(DataType::Set)?,
            open_log(DataType::ZSet)?,
            open_log(DataType::List)?,
        ];

        let inner = Arc::new(DbInner {
            opts,
            lock_file: Mutex::new(Some(lock_file)),
            logs,
            strs: RwLock::new(OrderedIndex::new()),
            hashes: RwLock::new(CompoundState::default()),
            sets: RwLock::new(CompoundState::default()),
            zsets: RwLock::new(ZSetState::default()),
            lists: RwLock::new(CompoundState::default()),
            discards,
            closed: AtomicBool::new(false),
        });

        recovery::load_indexes(&inner)?;

        let mut scheduler = Scheduler::new();
        scheduler.register(Arc::new(merge::MergeTask::new(Arc::clone(&inner))))?;

        Ok(Db {
            inner,
            scheduler: Mutex::new(scheduler),
        })
    }

    /// Flushes every active segment to disk.
    pub fn sync(&self) -> Result<()> {
        for dtype in DATA_TYPES {
            self.inner.logs[dtype.index()].read()?.active().sync()?;
        }
        Ok(())
    }

    /// Runs a reclamation pass over one datatype now, regardless of the
    /// periodic schedule. Candidate selection still honors the
    /// configured dead-bytes ratio.
    pub fn merge(&self, dtype: DataType) -> Result<()> {
        merge::merge_datatype(&self.inner, dtype)
    }

    /// Starts a write batch over string keys.
    pub fn new_batch(&self, opts: BatchOptions) -> Batch<'_> {
        Batch::new(self, opts)
    }

    /// Stops background work, flushes everything and releases the
    /// directory lock. Idempotent; also runs on drop.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.scheduler.lock()?.shutdown();

        // Locks acquired in the fixed datatype order; each active
        // segment is flushed and physically trimmed to its logical size
        // so corrupt or preallocated tails do not survive a clean close.
        for dtype in DATA_TYPES {
            let log = self.inner.logs[dtype.index()].write()?;
            log.active().sync()?;
            log.active().truncate_to_size()?;
        }
        for discard in &self.inner.discards {
            discard.close()?;
        }
        self.inner.lock_file.lock()?.take();
        Ok(())
    }

    /// Shared-lock acquisition with the lazy-expiry upgrade: a read that
    /// finds `key` past its deadline evicts the whole key under the
    /// exclusive lock first, the way the string path does, then proceeds
    /// against the now-clean state.
    pub(crate) fn compound_read<'a>(
        &self,
        lock: &'a RwLock<CompoundState>,
        dtype: DataType,
        key: &[u8],
    ) -> Result<RwLockReadGuard<'a, CompoundState>> {
        {
            let state = lock.read()?;
            if !state.is_expired(key) {
                return Ok(state);
            }
        }
        {
            let mut state = lock.write()?;
            self.inner.purge_if_expired(dtype, &mut state, key);
        }
        Ok(lock.read()?)
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::error!(error = %e, "close on drop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> Db {
        Db::open(Options::new(dir.path())).expect("failed to open db")
    }

    #[test]
    fn test_open_creates_layout() {
        let dir = TempDir::new().unwrap();
        let _db = open(&dir);

        for name in ["string", "hash", "set", "zset", "list", "discard"] {
            assert!(dir.path().join(name).is_dir(), "missing {name}/");
        }
        let lock = std::fs::read_to_string(dir.path().join("LOCK")).unwrap();
        assert_eq!(lock.trim(), std::process::id().to_string());
    }

    #[test]
    fn test_second_open_is_locked_out() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);

        match Db::open(Options::new(dir.path())) {
            Err(Error::DirLocked) => {}
            Err(e) => panic!("expected DirLocked, got Err({e:?})"),
            Ok(_) => panic!("expected DirLocked, got Ok"),
        }

        db.close().unwrap();
        let _db = open(&dir);
    }

    #[test]
    fn test_close_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        db.close().unwrap();
        db.close().unwrap();
    }

    #[test]
    fn test_empty_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let _db = open(&dir);
        }
        let db = open(&dir);
        assert_eq!(db.get(b"anything").err(), Some(Error::KeyNotFound));
    }
}
