//! Append-only segment files.
//!
//! Each datatype owns a directory of numbered segments
//! (`dir/<datatype>/NNNNNNNNN.data`). Exactly one segment per datatype is
//! active and receives appends; the rest are archived and read-only.
//! Appends are serialized by the owning datatype's write lock, so the
//! segment itself only needs an atomic append cursor; reads are
//! positional and run concurrently with writes.

pub mod entry;
pub mod manager;

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use memmap2::MmapMut;

use crate::config::IoType;
use crate::error::{Error, Result};

use self::entry::{Entry, EntryHeader, MAX_HEADER_SIZE};

/// Segment file extension.
pub const SEGMENT_EXT: &str = "data";
/// Extension of an in-progress merge output; renamed to `data` once the
/// merge of its source completes.
pub const MERGE_EXT: &str = "merge";
/// Extension given to the loser of a duplicate-file-id tie-break.
pub const QUARANTINE_EXT: &str = "quarantine";

/// The five logical datatypes, in lock-acquisition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Str,
    Hash,
    Set,
    ZSet,
    List,
}

/// All datatypes in lock-acquisition order (string < hash < set < zset
/// < list); batch commit and close walk this slice to stay deadlock-free.
pub const DATA_TYPES: [DataType; 5] = [
    DataType::Str,
    DataType::Hash,
    DataType::Set,
    DataType::ZSet,
    DataType::List,
];

impl DataType {
    /// Directory name of this datatype's segments.
    pub fn as_str(self) -> &'static str {
        match self {
            DataType::Str => "string",
            DataType::Hash => "hash",
            DataType::Set => "set",
            DataType::ZSet => "zset",
            DataType::List => "list",
        }
    }

    pub fn index(self) -> usize {
        match self {
            DataType::Str => 0,
            DataType::Hash => 1,
            DataType::Set => 2,
            DataType::ZSet => 3,
            DataType::List => 4,
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds the path of a segment file: `<dir>/NNNNNNNNN.<ext>`.
pub fn segment_path(dir: &Path, file_id: u32, ext: &str) -> PathBuf {
    dir.join(format!("{file_id:09}.{ext}"))
}

/// Parses a file id out of a segment file name.
pub fn parse_file_id(path: &Path) -> Option<u32> {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .and_then(|stem| stem.parse::<u32>().ok())
}

/// Positional IO over one segment, selected by `Options::io_type`.
trait SegmentIo: Send + Sync {
    /// Reads up to `buf.len()` bytes at `offset`; returns how many were
    /// available. Shorter-than-requested reads mean end of data.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<()>;

    fn sync(&self) -> Result<()>;

    fn truncate(&self, len: u64) -> Result<()>;
}

struct StandardIo {
    file: File,
}

impl SegmentIo for StandardIo {
    fn read_at(&self, buf: &mut [u8], mut offset: u64) -> Result<usize> {
        use std::os::unix::fs::FileExt;

        let mut read = 0;
        while read < buf.len() {
            match self.file.read_at(&mut buf[read..], offset) {
                Ok(0) => break,
                Ok(n) => {
                    read += n;
                    offset += n as u64;
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(read)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        use std::os::unix::fs::FileExt;
        Ok(self.file.write_all_at(buf, offset)?)
    }

    fn sync(&self) -> Result<()> {
        Ok(self.file.sync_all()?)
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        Ok(self.file.sync_all()?)
    }
}

/// Memory-mapped segment. The backing file is preallocated to the
/// segment size and remapped if a single oversized entry outgrows it;
/// sealing truncates the file back to its logical length.
struct MmapIo {
    file: File,
    map: RwLock<MmapMut>,
}

impl MmapIo {
    fn open(file: File, capacity: u64) -> Result<Self> {
        // Preallocate fresh segments to their full budget; reopened ones
        // keep their length (sealed files were truncated, and a mapping
        // of a zero-length file is invalid anyway). Appends that outgrow
        // the mapping extend it on demand.
        if file.metadata()?.len() == 0 {
            file.set_len(capacity)?;
        }
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            file,
            map: RwLock::new(map),
        })
    }
}

impl SegmentIo for MmapIo {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let map = self.map.read()?;
        if offset >= map.len() as u64 {
            return Ok(0);
        }
        let available = (map.len() as u64 - offset).min(buf.len() as u64) as usize;
        let start = offset as usize;
        buf[..available].copy_from_slice(&map[start..start + available]);
        Ok(available)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        let mut map = self.map.write()?;
        let end = offset + buf.len() as u64;
        if end > map.len() as u64 {
            self.file.set_len(end)?;
            *map = unsafe { MmapMut::map_mut(&self.file)? };
        }
        let start = offset as usize;
        map[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.map.read()?.flush()?;
        Ok(())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        let mut map = self.map.write()?;
        map.flush()?;
        self.file.set_len(len)?;
        *map = unsafe { MmapMut::map_mut(&self.file)? };
        Ok(self.file.sync_all()?)
    }
}

/// One append-only segment of a datatype's log.
pub struct LogFile {
    id: u32,
    path: PathBuf,
    io: Box<dyn SegmentIo>,
    /// Logical end of data; the next append lands here. Recovery resets
    /// it past the last entry that decodes cleanly.
    write_offset: AtomicU64,
}

impl std::fmt::Debug for LogFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogFile")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("size", &self.size())
            .finish()
    }
}

impl LogFile {
    /// Opens (creating if needed) the segment at `path`.
    pub fn open(path: PathBuf, id: u32, io_type: IoType, capacity: u64) -> Result<Self> {
        let existing_len = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;

        let io: Box<dyn SegmentIo> = match io_type {
            IoType::StandardIo => Box::new(StandardIo { file }),
            IoType::MemoryMap => Box::new(MmapIo::open(file, capacity)?),
        };

        Ok(Self {
            id,
            path,
            io,
            write_offset: AtomicU64::new(existing_len),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Logical size: the byte offset the next append will use.
    pub fn size(&self) -> u64 {
        self.write_offset.load(Ordering::Acquire)
    }

    /// Resets the logical end of data. Used by recovery after a corrupt
    /// tail, and when the preallocated length of an mmap segment exceeds
    /// the decoded data.
    pub fn set_size(&self, offset: u64) {
        self.write_offset.store(offset, Ordering::Release);
    }

    /// Appends encoded bytes, returning the offset they were written at.
    /// Callers serialize appends through the datatype write lock.
    pub fn append(&self, data: &[u8]) -> Result<u64> {
        let offset = self.write_offset.load(Ordering::Acquire);
        self.io.write_at(data, offset)?;
        self.write_offset
            .store(offset + data.len() as u64, Ordering::Release);
        Ok(offset)
    }

    /// Reads and decodes the entry at `offset`, returning it with its
    /// on-disk size.
    pub fn read_entry(&self, offset: u64) -> Result<(Entry, u64)> {
        let mut header_buf = [0u8; MAX_HEADER_SIZE];
        let n = self.io.read_at(&mut header_buf, offset)?;
        if n == 0 {
            return Err(Error::Corrupt("read past end of segment".into()));
        }
        let header = EntryHeader::decode(&header_buf[..n])?;

        let total = header.total_size() as usize;
        let mut buf = vec![0u8; total];
        let n = self.io.read_at(&mut buf, offset)?;
        if n < total {
            return Err(Error::Corrupt("truncated entry payload".into()));
        }
        Entry::decode(&buf)
    }

    /// Flushes the segment to disk.
    pub fn sync(&self) -> Result<()> {
        self.io.sync()
    }

    /// Physically truncates the file to its logical size. Called on
    /// clean shutdown so corrupt or preallocated tails do not survive.
    pub fn truncate_to_size(&self) -> Result<()> {
        self.io.truncate(self.size())
    }

    /// Closes the segment and unlinks its file.
    pub fn remove(self) -> Result<()> {
        let path = self.path.clone();
        drop(self);
        Ok(std::fs::remove_file(path)?)
    }

    /// Renames the underlying file, e.g. `.merge` -> `.data` when a merge
    /// completes.
    pub fn rename(&mut self, to: PathBuf) -> Result<()> {
        std::fs::rename(&self.path, &to)?;
        self.path = to;
        Ok(())
    }
}
