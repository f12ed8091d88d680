//! Per-datatype segment set: one active append target plus the archived
//! remainder.
//!
//! The manager owns rotation (sealing the active segment once an append
//! would push it past the size budget) and the directory scan at open:
//! orphaned merge outputs are deleted, duplicate file ids are resolved
//! by mtime with the loser quarantined, and unrecognizable names are
//! skipped with a warning.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use crate::config::IoType;
use crate::error::{Error, Result};

use super::entry::Position;
use super::{parse_file_id, segment_path, LogFile, MERGE_EXT, QUARANTINE_EXT, SEGMENT_EXT};

pub struct LogManager {
    dir: PathBuf,
    io_type: IoType,
    segment_size: u64,
    active: Arc<LogFile>,
    archived: HashMap<u32, Arc<LogFile>>,
    next_fid: u32,
}

impl LogManager {
    /// Scans `dir` and opens every segment, the highest id as the active
    /// one unless it is already full.
    pub fn open(dir: PathBuf, io_type: IoType, segment_size: u64) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;

        let mut ids: HashMap<u32, PathBuf> = HashMap::new();
        for dirent in std::fs::read_dir(&dir)? {
            let path = dirent?.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some(MERGE_EXT) => {
                    // An orphaned merge output: its source still exists,
                    // so the rewrite never completed.
                    tracing::warn!(path = %path.display(), "deleting orphaned merge segment");
                    std::fs::remove_file(&path)?;
                }
                Some(SEGMENT_EXT) => match parse_file_id(&path) {
                    Some(id) => {
                        if let Some(loser) = Self::tie_break(&mut ids, id, path)? {
                            let quarantined = loser.with_extension(QUARANTINE_EXT);
                            tracing::warn!(
                                path = %loser.display(),
                                "duplicate file id, quarantining older segment"
                            );
                            std::fs::rename(&loser, quarantined)?;
                        }
                    }
                    None => {
                        tracing::warn!(path = %path.display(), "ignoring segment with corrupt name");
                    }
                },
                _ => {}
            }
        }

        let mut sorted: Vec<u32> = ids.keys().copied().collect();
        sorted.sort_unstable();

        let mut archived = HashMap::new();
        for &id in &sorted {
            let file = LogFile::open(ids.remove(&id).expect("scanned"), id, io_type, segment_size)?;
            archived.insert(id, Arc::new(file));
        }

        let mut next_fid = sorted.last().copied().unwrap_or(0) + 1;
        let active = match sorted.last().and_then(|id| archived.remove(id)) {
            Some(last) if last.size() < segment_size => last,
            Some(full) => {
                // Already at budget; keep it sealed and start fresh.
                archived.insert(full.id(), full);
                let id = next_fid;
                next_fid += 1;
                Arc::new(LogFile::open(
                    segment_path(&dir, id, SEGMENT_EXT),
                    id,
                    io_type,
                    segment_size,
                )?)
            }
            None => {
                let id = next_fid;
                next_fid += 1;
                Arc::new(LogFile::open(
                    segment_path(&dir, id, SEGMENT_EXT),
                    id,
                    io_type,
                    segment_size,
                )?)
            }
        };

        Ok(Self {
            dir,
            io_type,
            segment_size,
            active,
            archived,
            next_fid,
        })
    }

    /// Keeps the newer of two same-id paths, returning the one to
    /// quarantine.
    fn tie_break(
        ids: &mut HashMap<u32, PathBuf>,
        id: u32,
        path: PathBuf,
    ) -> Result<Option<PathBuf>> {
        let Some(existing) = ids.get(&id) else {
            ids.insert(id, path);
            return Ok(None);
        };
        let mtime = |p: &PathBuf| {
            std::fs::metadata(p)
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH)
        };
        if mtime(&path) > mtime(existing) {
            let loser = ids.insert(id, path).expect("checked above");
            Ok(Some(loser))
        } else {
            Ok(Some(path))
        }
    }

    /// Appends encoded bytes, rotating first when the active segment
    /// would outgrow its budget. Callers serialize through the datatype
    /// write lock.
    pub fn append(&mut self, data: &[u8]) -> Result<Position> {
        if self.active.size() > 0 && self.active.size() + data.len() as u64 > self.segment_size {
            self.rotate()?;
        }
        let offset = self.active.append(data)?;
        Ok(Position {
            file_id: self.active.id(),
            offset,
            size: data.len() as u32,
        })
    }

    /// Seals the active segment and allocates the next file id.
    fn rotate(&mut self) -> Result<()> {
        self.active.sync()?;
        self.active.truncate_to_size()?;

        let id = self.next_fid;
        self.next_fid += 1;
        let fresh = Arc::new(LogFile::open(
            segment_path(&self.dir, id, SEGMENT_EXT),
            id,
            self.io_type,
            self.segment_size,
        )?);
        let sealed = std::mem::replace(&mut self.active, fresh);
        tracing::debug!(sealed = sealed.id(), active = id, "rotated segment");
        self.archived.insert(sealed.id(), sealed);
        Ok(())
    }

    /// Resolves a file id to its open segment.
    pub fn file(&self, fid: u32) -> Result<Arc<LogFile>> {
        if self.active.id() == fid {
            return Ok(Arc::clone(&self.active));
        }
        self.archived
            .get(&fid)
            .cloned()
            .ok_or_else(|| Error::Corrupt(format!("segment {fid} is gone")))
    }

    pub fn active(&self) -> &Arc<LogFile> {
        &self.active
    }

    pub fn archived(&self) -> &HashMap<u32, Arc<LogFile>> {
        &self.archived
    }

    /// Every segment in replay order: archived by ascending id, then the
    /// active one.
    pub fn files_in_order(&self) -> Vec<Arc<LogFile>> {
        let mut ids: Vec<u32> = self.archived.keys().copied().collect();
        ids.sort_unstable();
        let mut files: Vec<Arc<LogFile>> = ids
            .iter()
            .map(|id| Arc::clone(&self.archived[id]))
            .collect();
        files.push(Arc::clone(&self.active));
        files
    }

    /// Directory this manager's segments live in.
    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    /// Swaps an archived segment for its merged replacement.
    pub fn replace_archived(&mut self, fid: u32, merged: LogFile) {
        self.archived.insert(fid, Arc::new(merged));
    }

    /// Drops an archived segment whose merge produced no live entries;
    /// the caller unlinks the file.
    pub fn remove_archived(&mut self, fid: u32) -> Option<Arc<LogFile>> {
        self.archived.remove(&fid)
    }
}

#[cfg(test)]
mod tests {
    use super::super::entry::{Entry, EntryType};
    use super::*;
    use tempfile::TempDir;

    fn manager(dir: &TempDir, segment_size: u64) -> LogManager {
        LogManager::open(dir.path().to_path_buf(), IoType::StandardIo, segment_size)
            .expect("failed to open manager")
    }

    #[test]
    fn test_fresh_directory_starts_at_one() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, 1024);
        assert_eq!(manager.active().id(), 1);
        assert!(manager.archived().is_empty());
    }

    #[test]
    fn test_rotation_on_size_budget() {
        let dir = TempDir::new().unwrap();
        let mut manager = manager(&dir, 256);

        let entry = Entry::new(b"key".to_vec(), vec![b'x'; 100], EntryType::Put).encode();
        let mut last_fid = 1;
        for _ in 0..8 {
            last_fid = manager.append(&entry).unwrap().file_id;
        }
        assert!(last_fid > 1, "budget never triggered rotation");
        assert_eq!(manager.active().id(), last_fid);
        assert!(!manager.archived().is_empty());

        // every archived segment respects the budget
        for file in manager.archived().values() {
            assert!(file.size() <= 256);
        }
    }

    #[test]
    fn test_reopen_picks_highest_as_active() {
        let dir = TempDir::new().unwrap();
        let entry = Entry::new(b"key".to_vec(), vec![b'x'; 100], EntryType::Put).encode();
        let (last_fid, archived_count) = {
            let mut manager = manager(&dir, 256);
            for _ in 0..8 {
                manager.append(&entry).unwrap();
            }
            manager.active().sync().unwrap();
            (manager.active().id(), manager.archived().len())
        };

        let reopened = manager(&dir, 256);
        assert_eq!(reopened.active().id(), last_fid);
        assert_eq!(reopened.archived().len(), archived_count);

        let order: Vec<u32> = reopened.files_in_order().iter().map(|f| f.id()).collect();
        let mut sorted = order.clone();
        sorted.sort_unstable();
        assert_eq!(order, sorted);
    }

    #[test]
    fn test_full_active_is_sealed_on_open() {
        let dir = TempDir::new().unwrap();
        {
            let mut manager = manager(&dir, 64);
            let entry = Entry::new(b"key".to_vec(), vec![b'x'; 80], EntryType::Put).encode();
            manager.append(&entry).unwrap();
            manager.active().sync().unwrap();
        }

        let reopened = manager(&dir, 64);
        assert_eq!(reopened.active().id(), 2);
        assert!(reopened.archived().contains_key(&1));
    }

    #[test]
    fn test_orphaned_merge_segment_deleted() {
        let dir = TempDir::new().unwrap();
        let orphan = segment_path(dir.path(), 3, MERGE_EXT);
        std::fs::write(&orphan, b"half-finished").unwrap();

        let _manager = manager(&dir, 1024);
        assert!(!orphan.exists());
    }

    #[test]
    fn test_unparseable_name_ignored() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("not-a-number.data"), b"junk").unwrap();

        let manager = manager(&dir, 1024);
        assert_eq!(manager.active().id(), 1);
        assert!(dir.path().join("not-a-number.data").exists());
    }
}
