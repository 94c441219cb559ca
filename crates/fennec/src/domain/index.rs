//! Pointer index: an ordered map from time ranges to file extents, plus the
//! per-file tombstones awaiting garbage collection.
//!
//! The index is persisted as two sibling files in the channel directory:
//!
//! ```text
//! index.idx       u32 count, then per pointer:
//!                 u64 start, u64 end, u16 fileKey, u32 offset, u32 length
//! tombstones.idx  u32 count, then per tombstone:
//!                 u16 fileKey, u32 offset, u32 length
//! ```
//!
//! All fields are little-endian. Both files are replaced atomically via a
//! temp-file rename. A load that yields unsorted or overlapping pointers is
//! a fatal inconsistency: the engine refuses to open.

use crate::error::{FennecError, Result};
use crate::telem::{TimeRange, TimeStamp};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// File name of the persisted pointer list.
pub const INDEX_FILE: &str = "index.idx";

/// File name of the persisted tombstone list.
pub const TOMBSTONE_FILE: &str = "tombstones.idx";

const POINTER_RECORD_SIZE: usize = 8 + 8 + 2 + 4 + 4;
const TOMBSTONE_RECORD_SIZE: usize = 2 + 4 + 4;

/// Metadata locating one domain of samples on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pointer {
    /// Interval of samples stored in the extent.
    pub time_range: TimeRange,
    /// Segment file holding the extent.
    pub file_key: u16,
    /// Byte offset of the extent within the file.
    pub offset: u32,
    /// Byte length of the extent.
    pub length: u32,
}

/// An extent freed by deletion, occupying file bytes until collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tombstone {
    /// Byte offset of the freed extent.
    pub offset: u32,
    /// Byte length of the freed extent.
    pub length: u32,
}

/// Mutable index contents, guarded by [`PointerIndex`]'s lock.
#[derive(Debug, Default)]
pub struct IndexState {
    /// Pointers sorted by `time_range.start`; no two overlap.
    pub pointers: Vec<Pointer>,
    /// Tombstones per file, sorted by offset.
    pub tombstones: BTreeMap<u16, Vec<Tombstone>>,
}

impl IndexState {
    /// Inserts `p`, keeping the list sorted. Fails with a write conflict
    /// when `p` overlaps an existing pointer.
    pub fn insert(&mut self, p: Pointer) -> Result<()> {
        let pos = self
            .pointers
            .partition_point(|q| q.time_range.start < p.time_range.start);
        for neighbor in self.pointers[pos.saturating_sub(1)..(pos + 1).min(self.pointers.len())]
            .iter()
        {
            if neighbor.time_range.overlaps_with(&p.time_range) {
                return Err(FennecError::WriteConflict {
                    range: p.time_range,
                    overlap: neighbor.time_range.intersection(&p.time_range),
                });
            }
        }
        self.pointers.insert(pos, p);
        Ok(())
    }

    /// Position of the greatest pointer with `start <= ts`, or -1.
    pub fn search_le(&self, ts: TimeStamp) -> i64 {
        self.pointers.partition_point(|p| p.time_range.start <= ts) as i64 - 1
    }

    /// Position of the least pointer with `end > ts`; `len` when none.
    pub fn search_ge(&self, ts: TimeStamp) -> i64 {
        self.pointers.partition_point(|p| p.time_range.end <= ts) as i64
    }

    /// Pointer at `pos`, if within bounds.
    pub fn get(&self, pos: i64) -> Option<Pointer> {
        if pos < 0 {
            return None;
        }
        self.pointers.get(pos as usize).copied()
    }

    /// Records a freed extent for later garbage collection, keeping the
    /// file's list sorted by offset.
    pub fn insert_tombstone(&mut self, file_key: u16, t: Tombstone) {
        if t.length == 0 {
            return;
        }
        let list = self.tombstones.entry(file_key).or_default();
        let pos = list.partition_point(|q| q.offset < t.offset);
        list.insert(pos, t);
    }

    /// Total tombstoned bytes in `file_key`.
    pub fn tombstone_bytes(&self, file_key: u16) -> u64 {
        self.tombstones
            .get(&file_key)
            .map(|l| l.iter().map(|t| t.length as u64).sum())
            .unwrap_or(0)
    }

    fn verify(&self) -> Result<()> {
        for pair in self.pointers.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            if a.time_range.start > b.time_range.start
                || a.time_range.overlaps_with(&b.time_range)
            {
                return Err(FennecError::Validation(format!(
                    "pointer index is inconsistent: {} and {} out of order or overlapping",
                    a.time_range, b.time_range
                )));
            }
        }
        Ok(())
    }
}

/// The pointer index of one domain database. A single readers/writer lock
/// guards the state: searches and gets take the read side; inserts, deletes,
/// persistence, and garbage collection take the write side.
#[derive(Debug)]
pub struct PointerIndex {
    dir: PathBuf,
    state: RwLock<IndexState>,
}

impl PointerIndex {
    /// Opens the index stored in `dir`, creating an empty one when no
    /// persisted state exists.
    pub fn open(dir: &Path) -> Result<Self> {
        let mut state = IndexState {
            pointers: load_pointers(&dir.join(INDEX_FILE))?,
            tombstones: load_tombstones(&dir.join(TOMBSTONE_FILE))?,
        };
        for list in state.tombstones.values_mut() {
            list.sort_by_key(|t| t.offset);
        }
        state.verify()?;
        Ok(Self {
            dir: dir.to_path_buf(),
            state: RwLock::new(state),
        })
    }

    /// Acquires the read side of the index lock.
    pub fn read(&self) -> RwLockReadGuard<'_, IndexState> {
        self.state.read().expect("index lock poisoned")
    }

    /// Acquires the write side of the index lock.
    pub fn write(&self) -> RwLockWriteGuard<'_, IndexState> {
        self.state.write().expect("index lock poisoned")
    }

    /// Inserts a pointer under the write lock.
    pub fn insert(&self, p: Pointer) -> Result<()> {
        self.write().insert(p)
    }

    /// Persists the current state atomically.
    pub fn persist(&self) -> Result<()> {
        let state = self.read();
        self.persist_state(&state)
    }

    /// Persists an already-locked state. Used by callers that must persist
    /// while still holding the write lock.
    pub fn persist_state(&self, state: &IndexState) -> Result<()> {
        write_atomic(&self.dir.join(INDEX_FILE), &encode_pointers(&state.pointers))?;
        write_atomic(
            &self.dir.join(TOMBSTONE_FILE),
            &encode_tombstones(&state.tombstones),
        )?;
        Ok(())
    }
}

fn encode_pointers(pointers: &[Pointer]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + pointers.len() * POINTER_RECORD_SIZE);
    buf.extend_from_slice(&(pointers.len() as u32).to_le_bytes());
    for p in pointers {
        buf.extend_from_slice(&(p.time_range.start as u64).to_le_bytes());
        buf.extend_from_slice(&(p.time_range.end as u64).to_le_bytes());
        buf.extend_from_slice(&p.file_key.to_le_bytes());
        buf.extend_from_slice(&p.offset.to_le_bytes());
        buf.extend_from_slice(&p.length.to_le_bytes());
    }
    buf
}

fn encode_tombstones(tombstones: &BTreeMap<u16, Vec<Tombstone>>) -> Vec<u8> {
    let count: usize = tombstones.values().map(|l| l.len()).sum();
    let mut buf = Vec::with_capacity(4 + count * TOMBSTONE_RECORD_SIZE);
    buf.extend_from_slice(&(count as u32).to_le_bytes());
    for (file_key, list) in tombstones {
        for t in list {
            buf.extend_from_slice(&file_key.to_le_bytes());
            buf.extend_from_slice(&t.offset.to_le_bytes());
            buf.extend_from_slice(&t.length.to_le_bytes());
        }
    }
    buf
}

fn load_pointers(path: &Path) -> Result<Vec<Pointer>> {
    let Some(buf) = read_if_exists(path)? else {
        return Ok(Vec::new());
    };
    let count = decode_count(&buf, POINTER_RECORD_SIZE, path)?;
    let mut pointers = Vec::with_capacity(count);
    for i in 0..count {
        let rec = &buf[4 + i * POINTER_RECORD_SIZE..4 + (i + 1) * POINTER_RECORD_SIZE];
        pointers.push(Pointer {
            time_range: TimeRange {
                start: u64::from_le_bytes(rec[0..8].try_into().unwrap()) as i64,
                end: u64::from_le_bytes(rec[8..16].try_into().unwrap()) as i64,
            },
            file_key: u16::from_le_bytes(rec[16..18].try_into().unwrap()),
            offset: u32::from_le_bytes(rec[18..22].try_into().unwrap()),
            length: u32::from_le_bytes(rec[22..26].try_into().unwrap()),
        });
    }
    Ok(pointers)
}

fn load_tombstones(path: &Path) -> Result<BTreeMap<u16, Vec<Tombstone>>> {
    let Some(buf) = read_if_exists(path)? else {
        return Ok(BTreeMap::new());
    };
    let count = decode_count(&buf, TOMBSTONE_RECORD_SIZE, path)?;
    let mut tombstones: BTreeMap<u16, Vec<Tombstone>> = BTreeMap::new();
    for i in 0..count {
        let rec = &buf[4 + i * TOMBSTONE_RECORD_SIZE..4 + (i + 1) * TOMBSTONE_RECORD_SIZE];
        let file_key = u16::from_le_bytes(rec[0..2].try_into().unwrap());
        tombstones.entry(file_key).or_default().push(Tombstone {
            offset: u32::from_le_bytes(rec[2..6].try_into().unwrap()),
            length: u32::from_le_bytes(rec[6..10].try_into().unwrap()),
        });
    }
    Ok(tombstones)
}

fn read_if_exists(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(buf) => Ok(Some(buf)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn decode_count(buf: &[u8], record_size: usize, path: &Path) -> Result<usize> {
    if buf.len() < 4 {
        return Err(FennecError::Validation(format!(
            "persisted index {path:?} is truncated"
        )));
    }
    let count = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
    if buf.len() != 4 + count * record_size {
        return Err(FennecError::Validation(format!(
            "persisted index {path:?} has inconsistent length"
        )));
    }
    Ok(count)
}

fn write_atomic(path: &Path, buf: &[u8]) -> Result<()> {
    let tmp = path.with_extension("idx.tmp");
    fs::write(&tmp, buf)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
