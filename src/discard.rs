//! Dead-bytes bookkeeping for merge candidate selection.
//!
//! Every index update that supersedes or removes an old position makes
//! the superseded entry's bytes dead in their segment. Writers report
//! those bytes through a bounded channel with a non-blocking send (a
//! full channel drops the event with a warning; the counters are an
//! eventually-accurate heuristic, not ground truth). A dedicated drainer
//! thread per datatype folds events into a `file_id -> dead_bytes` map
//! and snapshots it to a sidecar file, periodically and on shutdown.
//!
//! The sidecar is a flat run of `file_id:u32 LE | dead_bytes:u64 LE`
//! records, written to a temp file and renamed into place so a torn
//! write can never corrupt the previous snapshot.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use crossbeam_channel::{bounded, select, tick, Receiver, Sender};

use crate::error::Result;

const RECORD_SIZE: usize = 4 + 8;
const PERSIST_INTERVAL: Duration = Duration::from_secs(30);

enum Message {
    Dead { fid: u32, bytes: u64 },
    Shutdown,
}

/// Per-datatype discard tracker.
pub struct Discard {
    tx: Sender<Message>,
    counters: Arc<Mutex<HashMap<u32, u64>>>,
    path: PathBuf,
    drainer: Mutex<Option<JoinHandle<()>>>,
}

impl Discard {
    /// Loads the sidecar snapshot (if any) and starts the drainer.
    pub fn open(path: PathBuf, channel_size: usize) -> Result<Self> {
        let counters = Arc::new(Mutex::new(load_snapshot(&path)?));
        let (tx, rx) = bounded(channel_size);

        let drainer_counters = Arc::clone(&counters);
        let drainer_path = path.clone();
        let drainer = std::thread::Builder::new()
            .name(format!("discard-{}", path_label(&path)))
            .spawn(move || drain(rx, drainer_counters, drainer_path))?;

        Ok(Self {
            tx,
            counters,
            path,
            drainer: Mutex::new(Some(drainer)),
        })
    }

    /// Reports `bytes` newly dead bytes in segment `fid`. Never blocks;
    /// a full channel drops the event.
    pub fn send(&self, fid: u32, bytes: u64) {
        if self.tx.try_send(Message::Dead { fid, bytes }).is_err() {
            tracing::warn!(file_id = fid, bytes, "discard channel full, dropping event");
        }
    }

    /// Current counters, as of the events drained so far.
    pub fn snapshot(&self) -> HashMap<u32, u64> {
        self.counters.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Forgets a segment after the merge deleted it.
    pub fn zero(&self, fid: u32) {
        if let Ok(mut counters) = self.counters.lock() {
            counters.remove(&fid);
        }
    }

    /// Replaces every counter at once. Recovery rebuilds exact counts
    /// from the replay and installs them here, superseding whatever the
    /// sidecar snapshot had drifted to before the last shutdown.
    pub fn store(&self, map: HashMap<u32, u64>) {
        if let Ok(mut counters) = self.counters.lock() {
            *counters = map;
        }
    }

    /// Stops the drainer and writes a final snapshot.
    pub fn close(&self) -> Result<()> {
        let handle = self.drainer.lock()?.take();
        if let Some(handle) = handle {
            let _ = self.tx.send(Message::Shutdown);
            if handle.join().is_err() {
                tracing::error!(path = %self.path.display(), "discard drainer panicked");
            }
        }
        Ok(())
    }
}

impl Drop for Discard {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn drain(rx: Receiver<Message>, counters: Arc<Mutex<HashMap<u32, u64>>>, path: PathBuf) {
    let ticker = tick(PERSIST_INTERVAL);
    loop {
        select! {
            recv(rx) -> msg => match msg {
                Ok(Message::Dead { fid, bytes }) => {
                    if let Ok(mut counters) = counters.lock() {
                        *counters.entry(fid).or_insert(0) += bytes;
                    }
                }
                Ok(Message::Shutdown) | Err(_) => break,
            },
            recv(ticker) -> _ => {
                if let Err(e) = persist(&counters, &path) {
                    tracing::warn!(path = %path.display(), error = %e, "failed to persist discard state");
                }
            }
        }
    }
    if let Err(e) = persist(&counters, &path) {
        tracing::warn!(path = %path.display(), error = %e, "failed to persist discard state on shutdown");
    }
}

fn persist(counters: &Mutex<HashMap<u32, u64>>, path: &Path) -> Result<()> {
    let snapshot = counters.lock().map(|c| c.clone()).unwrap_or_default();

    let mut buf = Vec::with_capacity(snapshot.len() * RECORD_SIZE);
    for (fid, bytes) in &snapshot {
        let mut record = [0u8; RECORD_SIZE];
        LittleEndian::write_u32(&mut record[..4], *fid);
        LittleEndian::write_u64(&mut record[4..], *bytes);
        buf.extend_from_slice(&record);
    }

    let tmp = path.with_extension("meta.tmp");
    let mut file = File::create(&tmp)?;
    file.write_all(&buf)?;
    file.sync_all()?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn load_snapshot(path: &Path) -> Result<HashMap<u32, u64>> {
    let mut counters = HashMap::new();
    let mut buf = Vec::new();
    match File::open(path) {
        Ok(mut file) => {
            file.read_to_end(&mut buf)?;
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(counters),
        Err(e) => return Err(e.into()),
    }

    // Trailing partial records are ignored; the rename discipline makes
    // them unlikely, but an unclean filesystem is not a reason to fail
    // the open.
    for record in buf.chunks_exact(RECORD_SIZE) {
        let fid = LittleEndian::read_u32(&record[..4]);
        let bytes = LittleEndian::read_u64(&record[4..]);
        counters.insert(fid, bytes);
    }
    Ok(counters)
}

fn path_label(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("condition never became true");
    }

    #[test]
    fn test_accumulates_events() {
        let dir = TempDir::new().unwrap();
        let discard = Discard::open(dir.path().join("string.meta"), 64).unwrap();

        discard.send(1, 100);
        discard.send(1, 50);
        discard.send(2, 7);

        wait_for(|| discard.snapshot().get(&1) == Some(&150));
        let snapshot = discard.snapshot();
        assert_eq!(snapshot.get(&1), Some(&150));
        assert_eq!(snapshot.get(&2), Some(&7));
    }

    #[test]
    fn test_zero_clears_counter() {
        let dir = TempDir::new().unwrap();
        let discard = Discard::open(dir.path().join("list.meta"), 64).unwrap();
        discard.send(3, 42);
        wait_for(|| discard.snapshot().contains_key(&3));

        discard.zero(3);
        assert!(!discard.snapshot().contains_key(&3));
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hash.meta");
        {
            let discard = Discard::open(path.clone(), 64).unwrap();
            discard.send(9, 1024);
            wait_for(|| discard.snapshot().contains_key(&9));
            discard.close().unwrap();
        }

        let discard = Discard::open(path, 64).unwrap();
        assert_eq!(discard.snapshot().get(&9), Some(&1024));
    }

    #[test]
    fn test_torn_sidecar_tail_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("set.meta");

        let mut buf = Vec::new();
        let mut record = [0u8; RECORD_SIZE];
        LittleEndian::write_u32(&mut record[..4], 5);
        LittleEndian::write_u64(&mut record[4..], 999);
        buf.extend_from_slice(&record);
        buf.extend_from_slice(&[0xAB; 3]); // torn tail
        std::fs::write(&path, &buf).unwrap();

        let discard = Discard::open(path, 64).unwrap();
        let snapshot = discard.snapshot();
        assert_eq!(snapshot.get(&5), Some(&999));
        assert_eq!(snapshot.len(), 1);
    }
}
