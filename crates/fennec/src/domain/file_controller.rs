//! Bounded pool of file descriptors over a channel's segment files.
//!
//! Segment files are named `<fileKey>.domain` with keys allocated
//! sequentially from 1. At most one writer may be outstanding per file; the
//! size limit is advisory and checked at acquisition time only. Reader
//! acquisition blocks when the descriptor budget is exhausted until another
//! handle is released.

use crate::error::{FennecError, Result};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex};

/// File extension of segment files.
pub const SEGMENT_EXTENSION: &str = "domain";

/// Fraction of the configured file size past which a file stops accepting
/// new writers.
pub const WRITER_SIZE_CUTOFF: f64 = 0.8;

/// A checked-out append handle on one segment file.
#[derive(Debug)]
pub struct WriterHandle {
    /// Key of the file the handle appends to.
    pub key: u16,
    /// The underlying descriptor, positioned at the file's end.
    pub file: File,
    /// File size at acquisition time, which is also the append offset.
    pub base_offset: u64,
}

/// A checked-out read handle on one segment file.
#[derive(Debug)]
pub struct ReaderHandle {
    /// Key of the file the handle reads.
    pub key: u16,
    /// The underlying descriptor. Position is owned by the holder.
    pub file: File,
}

#[derive(Debug, Default)]
struct PoolState {
    /// Total open descriptors, pooled or checked out.
    descriptors: usize,
    /// Keys with a checked-out writer.
    writers_in_use: HashMap<u16, ()>,
    /// Idle pooled writer descriptors.
    idle_writers: HashMap<u16, File>,
    /// Idle pooled reader descriptors.
    idle_readers: HashMap<u16, Vec<File>>,
    /// Known segment file keys.
    keys: Vec<u16>,
    /// Next key to allocate.
    next_key: u16,
}

/// Descriptor pool for one domain database.
#[derive(Debug)]
pub struct FileController {
    dir: PathBuf,
    file_size_limit: u64,
    max_descriptors: usize,
    state: Mutex<PoolState>,
    released: Condvar,
}

/// Path of the segment file `key` under `dir`.
pub fn segment_path(dir: &Path, key: u16) -> PathBuf {
    dir.join(format!("{key}.{SEGMENT_EXTENSION}"))
}

/// Path of the temporary rewrite target used while collecting `key`.
pub fn segment_temp_path(dir: &Path, key: u16) -> PathBuf {
    dir.join(format!("{key}_temp.{SEGMENT_EXTENSION}"))
}

impl FileController {
    /// Opens the pool over `dir`, discovering existing segment files.
    pub fn open(dir: &Path, file_size_limit: u64, max_descriptors: usize) -> Result<Self> {
        let mut keys = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(stem) = name.strip_suffix(&format!(".{SEGMENT_EXTENSION}")) else {
                continue;
            };
            if let Ok(key) = stem.parse::<u16>() {
                keys.push(key);
            }
        }
        keys.sort_unstable();
        let next_key = keys.last().map(|k| k + 1).unwrap_or(1);
        Ok(Self {
            dir: dir.to_path_buf(),
            file_size_limit,
            max_descriptors,
            state: Mutex::new(PoolState {
                keys,
                next_key,
                ..Default::default()
            }),
            released: Condvar::new(),
        })
    }

    fn size_cutoff(&self) -> u64 {
        (self.file_size_limit as f64 * WRITER_SIZE_CUTOFF) as u64
    }

    fn file_size(&self, key: u16) -> u64 {
        std::fs::metadata(segment_path(&self.dir, key))
            .map(|m| m.len())
            .unwrap_or(0)
    }

    /// Acquires an append handle on a file whose size is under the cutoff,
    /// preferring pooled descriptors, then existing under-limit files, then
    /// a freshly created file with the next sequential key.
    pub fn acquire_writer(&self) -> Result<WriterHandle> {
        let mut state = self.state.lock().expect("file pool lock poisoned");
        loop {
            // Pooled writer on an under-limit file.
            let pooled = state
                .idle_writers
                .keys()
                .copied()
                .find(|k| self.file_size(*k) < self.size_cutoff());
            if let Some(key) = pooled {
                let mut file = state.idle_writers.remove(&key).expect("pooled writer");
                state.writers_in_use.insert(key, ());
                let base_offset = file.seek(SeekFrom::End(0))?;
                return Ok(WriterHandle {
                    key,
                    file,
                    base_offset,
                });
            }
            // Opening anything below needs a free descriptor slot.
            if state.descriptors >= self.max_descriptors && !self.evict_idle(&mut state) {
                state = self.released.wait(state).expect("file pool lock poisoned");
                continue;
            }
            // Existing file with no outstanding writer and room to grow,
            // otherwise a fresh file under the next sequential key.
            let existing = state.keys.iter().copied().find(|k| {
                !state.writers_in_use.contains_key(k)
                    && !state.idle_writers.contains_key(k)
                    && self.file_size(*k) < self.size_cutoff()
            });
            let key = match existing {
                Some(key) => key,
                None => {
                    let key = state.next_key;
                    state.next_key += 1;
                    state.keys.push(key);
                    key
                }
            };
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .read(true)
                .open(segment_path(&self.dir, key))
                .map_err(|e| FennecError::ResourceExhausted(format!("open segment {key}: {e}")))?;
            let base_offset = file.seek(SeekFrom::End(0))?;
            state.descriptors += 1;
            state.writers_in_use.insert(key, ());
            return Ok(WriterHandle {
                key,
                file,
                base_offset,
            });
        }
    }

    /// Returns a writer handle to the pool.
    pub fn release_writer(&self, handle: WriterHandle) {
        let mut state = self.state.lock().expect("file pool lock poisoned");
        state.writers_in_use.remove(&handle.key);
        state.idle_writers.insert(handle.key, handle.file);
        drop(state);
        self.released.notify_all();
    }

    /// Acquires a shared read handle on `key`. Blocks while the descriptor
    /// budget is exhausted and nothing idle can be evicted.
    pub fn acquire_reader(&self, key: u16) -> Result<ReaderHandle> {
        let mut state = self.state.lock().expect("file pool lock poisoned");
        loop {
            if let Some(pool) = state.idle_readers.get_mut(&key) {
                if let Some(file) = pool.pop() {
                    return Ok(ReaderHandle { key, file });
                }
            }
            if state.descriptors >= self.max_descriptors && !self.evict_idle(&mut state) {
                state = self.released.wait(state).expect("file pool lock poisoned");
                continue;
            }
            let file = File::open(segment_path(&self.dir, key))
                .map_err(|e| FennecError::ResourceExhausted(format!("open segment {key}: {e}")))?;
            state.descriptors += 1;
            return Ok(ReaderHandle { key, file });
        }
    }

    /// Returns a reader handle to the pool.
    pub fn release_reader(&self, handle: ReaderHandle) {
        let mut state = self.state.lock().expect("file pool lock poisoned");
        state
            .idle_readers
            .entry(handle.key)
            .or_default()
            .push(handle.file);
        drop(state);
        self.released.notify_all();
    }

    /// Closes one idle descriptor to make room. Returns false when every
    /// descriptor is checked out.
    fn evict_idle(&self, state: &mut PoolState) -> bool {
        if let Some(key) = state.idle_readers.iter().find(|(_, v)| !v.is_empty()).map(|(k, _)| *k)
        {
            let pool = state.idle_readers.get_mut(&key).expect("reader pool");
            pool.pop();
            state.descriptors -= 1;
            return true;
        }
        if let Some(key) = state.idle_writers.keys().next().copied() {
            state.idle_writers.remove(&key);
            state.descriptors -= 1;
            return true;
        }
        false
    }

    /// Returns true when a writer is currently checked out on `key`.
    pub fn has_active_writer(&self, key: u16) -> bool {
        let state = self.state.lock().expect("file pool lock poisoned");
        state.writers_in_use.contains_key(&key)
    }

    /// Evicts every pooled descriptor of `key` and runs `swap` while holding
    /// the pool lock, so no acquisition can interleave with a file swap.
    /// Fails when a writer is checked out on the file.
    pub fn with_file_removed<F>(&self, key: u16, swap: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        let mut state = self.state.lock().expect("file pool lock poisoned");
        if state.writers_in_use.contains_key(&key) {
            return Err(FennecError::ResourceExhausted(format!(
                "segment {key} has an active writer"
            )));
        }
        if state.idle_writers.remove(&key).is_some() {
            state.descriptors -= 1;
        }
        if let Some(pool) = state.idle_readers.remove(&key) {
            state.descriptors -= pool.len();
        }
        let res = swap();
        drop(state);
        self.released.notify_all();
        res
    }

    /// Closes all pooled descriptors. Outstanding handles stay valid until
    /// released.
    pub fn close(&self) {
        let mut state = self.state.lock().expect("file pool lock poisoned");
        let idle_readers: usize = state.idle_readers.values().map(|v| v.len()).sum();
        let freed = idle_readers + state.idle_writers.len();
        state.descriptors -= freed;
        state.idle_readers.clear();
        state.idle_writers.clear();
    }
}
