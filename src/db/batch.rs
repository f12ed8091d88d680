//! Write batches over string keys.
//!
//! A batch buffers its writes in memory and publishes nothing until
//! commit. The commit frames the entries between begin/commit markers
//! under the string write lock, syncs when asked to, and only then
//! updates the index, so a crash anywhere before the commit marker
//! reaches disk makes recovery drop the whole group. Batches touch only
//! the string datatype, which keeps the fixed lock-order rule (string
//! first) trivially satisfied.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::index::Index;
use crate::logfile::entry::{Entry, EntryType};
use crate::logfile::DataType;

use super::{now, Db};

#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    /// Fsync as part of commit even when the database default says not
    /// to.
    pub sync_on_commit: bool,
}

/// A group of string writes that commits atomically.
pub struct Batch<'a> {
    db: &'a Db,
    opts: BatchOptions,
    pending: Vec<Entry>,
}

impl<'a> Batch<'a> {
    pub(crate) fn new(db: &'a Db, opts: BatchOptions) -> Self {
        Self {
            db,
            opts,
            pending: Vec::new(),
        }
    }

    /// Buffers a put.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.push(Entry::new(key.to_vec(), value.to_vec(), EntryType::Put))
    }

    /// Buffers a put with a time-to-live.
    pub fn put_with_ttl(&mut self, key: &[u8], value: &[u8], ttl: Duration) -> Result<()> {
        if ttl.as_secs() == 0 {
            return Err(Error::InvalidTtl);
        }
        self.push(Entry::with_expire(
            key.to_vec(),
            value.to_vec(),
            EntryType::Put,
            now() + ttl.as_secs(),
        ))
    }

    /// Buffers a delete.
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.push(Entry::new(key.to_vec(), Vec::new(), EntryType::Delete))
    }

    fn push(&mut self, entry: Entry) -> Result<()> {
        if self.pending.len() >= self.db.inner.opts.max_batch_count {
            return Err(Error::BatchTooLarge);
        }
        self.pending.push(entry);
        Ok(())
    }

    /// Reads a key as the batch would leave it: pending writes shadow
    /// the committed state.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        for entry in self.pending.iter().rev() {
            if entry.key == key {
                return match entry.entry_type {
                    EntryType::Delete => Err(Error::KeyNotFound),
                    _ if entry.expire_at != 0 && entry.expire_at <= now() => {
                        Err(Error::KeyNotFound)
                    }
                    _ => Ok(entry.value.clone()),
                };
            }
        }
        self.db.get(key)
    }

    /// Discards every pending write.
    pub fn rollback(mut self) {
        self.pending.clear();
    }

    /// Writes the batch: begin marker, entries, commit marker, optional
    /// sync, then the index updates.
    pub fn commit(self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let inner = &self.db.inner;
        let mut index = inner.strs.write()?;

        let begin = Entry::new(Vec::new(), Vec::new(), EntryType::BatchBegin);
        let begin_pos = inner.append_entry(DataType::Str, &begin)?;

        let mut written = Vec::with_capacity(self.pending.len());
        for entry in &self.pending {
            let pos = inner.append_entry(DataType::Str, entry)?;
            written.push(pos);
        }

        let commit = Entry::new(Vec::new(), Vec::new(), EntryType::BatchCommit);
        let commit_pos = inner.append_entry(DataType::Str, &commit)?;

        if self.opts.sync_on_commit || inner.opts.sync_writes {
            inner.logs[DataType::Str.index()].read()?.active().sync()?;
        }

        // Durable now; publish. The markers are dead bytes from birth.
        for (entry, pos) in self.pending.iter().zip(written) {
            match entry.entry_type {
                EntryType::Put => {
                    let node = inner.make_node(pos, entry.expire_at, &entry.value);
                    if let Some(old) = index.put(entry.key.clone(), node) {
                        inner.discard_node(DataType::Str, &old);
                    }
                }
                EntryType::Delete => {
                    if let Some(old) = index.delete(&entry.key) {
                        inner.discard_node(DataType::Str, &old);
                    }
                    inner.discard_position(DataType::Str, pos);
                }
                _ => unreachable!("batches only buffer puts and deletes"),
            }
        }
        inner.discard_position(DataType::Str, begin_pos);
        inner.discard_position(DataType::Str, commit_pos);
        Ok(())
    }
}
