use std::path::PathBuf;
use std::time::Duration;

/// How segment files are read and written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoType {
    /// Positional reads and writes on a plain file descriptor.
    StandardIo,
    /// Memory-mapped segments, preallocated to the segment size.
    MemoryMap,
}

/// What the in-memory indexes hold for each key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexMode {
    /// Index nodes hold only the on-disk position; reads hit the log.
    KeyOnly,
    /// Index nodes also cache the value bytes; reads never touch disk.
    KeyValue,
}

/// Configuration for opening a database.
#[derive(Debug, Clone)]
pub struct Options {
    /// Directory holding segments, the discard sidecars and the LOCK file.
    pub dir_path: PathBuf,

    /// Maximum size of an active segment before rotation (default: 512MB).
    pub segment_size: u64,

    /// Segment IO backend (default: standard file IO).
    pub io_type: IoType,

    /// Fsync after every commit boundary (default: false).
    pub sync_writes: bool,

    /// How often the background merge looks for reclaimable segments
    /// (default: 8h).
    pub merge_interval: Duration,

    /// Dead-bytes ratio above which an archived segment is merged
    /// (default: 0.5).
    pub merge_ratio: f64,

    /// Index payload mode (default: key only).
    pub index_mode: IndexMode,

    /// Capacity of each datatype's discard event channel (default: 1024).
    pub discard_channel_size: usize,

    /// Maximum number of pending writes in one batch (default: 10_000).
    pub max_batch_count: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            dir_path: PathBuf::from("./emberdb"),
            segment_size: 512 * 1024 * 1024,
            io_type: IoType::StandardIo,
            sync_writes: false,
            merge_interval: Duration::from_secs(8 * 60 * 60),
            merge_ratio: 0.5,
            index_mode: IndexMode::KeyOnly,
            discard_channel_size: 1024,
            max_batch_count: 10_000,
        }
    }
}

impl Options {
    /// Create options rooted at the given directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir_path: dir.into(),
            ..Default::default()
        }
    }

    /// Set the active segment rotation threshold.
    pub fn segment_size(mut self, size: u64) -> Self {
        self.segment_size = size;
        self
    }

    /// Select the segment IO backend.
    pub fn io_type(mut self, io_type: IoType) -> Self {
        self.io_type = io_type;
        self
    }

    /// Fsync on every commit boundary.
    pub fn sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }

    /// Set the background merge interval.
    pub fn merge_interval(mut self, interval: Duration) -> Self {
        self.merge_interval = interval;
        self
    }

    /// Set the dead-bytes ratio that makes a segment a merge candidate.
    pub fn merge_ratio(mut self, ratio: f64) -> Self {
        self.merge_ratio = ratio;
        self
    }

    /// Select the index payload mode.
    pub fn index_mode(mut self, mode: IndexMode) -> Self {
        self.index_mode = mode;
        self
    }

    /// Set the discard channel capacity.
    pub fn discard_channel_size(mut self, size: usize) -> Self {
        self.discard_channel_size = size;
        self
    }

    /// Set the per-batch pending write limit.
    pub fn max_batch_count(mut self, count: usize) -> Self {
        self.max_batch_count = count;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let opts = Options::default();
        assert_eq!(opts.dir_path, PathBuf::from("./emberdb"));
        assert_eq!(opts.segment_size, 512 * 1024 * 1024);
        assert_eq!(opts.io_type, IoType::StandardIo);
        assert!(!opts.sync_writes);
        assert_eq!(opts.index_mode, IndexMode::KeyOnly);
    }

    #[test]
    fn test_options_builder() {
        let opts = Options::new("/tmp/ember-test")
            .segment_size(64 * 1024)
            .io_type(IoType::MemoryMap)
            .sync_writes(true)
            .merge_ratio(0.3)
            .merge_interval(Duration::from_secs(60));

        assert_eq!(opts.dir_path, PathBuf::from("/tmp/ember-test"));
        assert_eq!(opts.segment_size, 64 * 1024);
        assert_eq!(opts.io_type, IoType::MemoryMap);
        assert!(opts.sync_writes);
        assert_eq!(opts.merge_ratio, 0.3);
        assert_eq!(opts.merge_interval, Duration::from_secs(60));
    }
}
