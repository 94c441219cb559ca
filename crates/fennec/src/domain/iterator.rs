//! Domain iterator and bounded extent readers.

use crate::domain::file_controller::ReaderHandle;
use crate::domain::index::Pointer;
use crate::domain::Db;
use crate::error::{FennecError, Result};
use crate::telem::{TimeRange, TimeStamp};
use std::io::{Read as _, Seek, SeekFrom};
use std::sync::Arc;

/// Iterates over the telemetry domains of a [`Db`] in time order. The
/// iterator reads no sample data itself; [`Iterator::new_reader`] hands out
/// bounded readers over the current domain's bytes.
///
/// Iterators do not run over a snapshot: concurrent writes or deletions may
/// shift positions under a held iterator. Multiple iterators over one
/// database are safe; a single iterator is not for concurrent use.
#[derive(Debug)]
pub struct Iterator {
    db: Arc<Db>,
    bounds: TimeRange,
    position: i64,
    value: Option<Pointer>,
    valid: bool,
}

impl Iterator {
    pub(crate) fn new(db: Arc<Db>, bounds: TimeRange) -> Self {
        Self {
            db,
            bounds,
            position: -1,
            value: None,
            valid: false,
        }
    }

    /// Sets new bounds and invalidates the iterator until the next seek.
    pub fn set_bounds(&mut self, bounds: TimeRange) {
        self.bounds = bounds;
        self.valid = false;
    }

    /// The iterator's bounds.
    pub fn bounds(&self) -> TimeRange {
        self.bounds
    }

    /// Seeks to the first domain within bounds.
    pub fn seek_first(&mut self) -> bool {
        self.seek_ge(self.bounds.start)
    }

    /// Seeks to the last domain within bounds.
    pub fn seek_last(&mut self) -> bool {
        self.seek_le(self.bounds.end.saturating_sub(1))
    }

    /// Seeks to the domain containing `stamp`, or the closest domain before
    /// it. Returns false when no such domain exists within bounds.
    pub fn seek_le(&mut self, stamp: TimeStamp) -> bool {
        self.valid = true;
        self.position = self.db.idx.read().search_le(stamp);
        self.reload()
    }

    /// Seeks to the domain containing `stamp`, or the closest domain after
    /// it. Returns false when no such domain exists within bounds.
    pub fn seek_ge(&mut self, stamp: TimeStamp) -> bool {
        self.valid = true;
        self.position = self.db.idx.read().search_ge(stamp);
        self.reload()
    }

    /// Advances to the next domain. Returns false once exhausted.
    pub fn next(&mut self) -> bool {
        if !self.valid {
            return false;
        }
        self.position += 1;
        self.reload()
    }

    /// Steps back to the previous domain. Returns false once exhausted.
    pub fn prev(&mut self) -> bool {
        if !self.valid {
            return false;
        }
        self.position -= 1;
        self.reload()
    }

    /// Returns true while the iterator points at a domain within bounds.
    pub fn valid(&self) -> bool {
        self.valid
    }

    /// Time interval of the current domain.
    pub fn time_range(&self) -> TimeRange {
        self.value.map(|p| p.time_range).unwrap_or_default()
    }

    /// Byte length of the current domain.
    pub fn len(&self) -> i64 {
        self.value.map(|p| p.length as i64).unwrap_or(0)
    }

    /// Returns true when the current domain holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The current pointer, when valid.
    pub fn pointer(&self) -> Option<Pointer> {
        self.valid.then_some(self.value).flatten()
    }

    /// Opens a bounded reader over the current domain's bytes.
    pub fn new_reader(&self) -> Result<Reader> {
        let ptr = self
            .pointer()
            .ok_or_else(|| FennecError::RangeNotFound(self.bounds))?;
        Reader::open(Arc::clone(&self.db), ptr)
    }

    fn reload(&mut self) -> bool {
        if self.position < 0 {
            self.valid = false;
            return false;
        }
        let ptr = self.db.idx.read().get(self.position);
        match ptr {
            Some(p) if p.time_range.overlaps_with(&self.bounds) => {
                self.value = Some(p);
                self.valid = true;
            }
            // Leave the previous value in place so time_range() keeps
            // reporting the last visited domain.
            _ => self.valid = false,
        }
        self.valid
    }
}

/// A bounded reader over one domain's extent, backed by a pooled file
/// descriptor. The descriptor returns to the pool on close or drop.
#[derive(Debug)]
pub struct Reader {
    db: Arc<Db>,
    ptr: Pointer,
    handle: Option<ReaderHandle>,
}

impl Reader {
    fn open(db: Arc<Db>, ptr: Pointer) -> Result<Self> {
        let handle = db.files.acquire_reader(ptr.file_key)?;
        Ok(Self {
            db,
            ptr,
            handle: Some(handle),
        })
    }

    /// Byte length of the extent.
    pub fn len(&self) -> i64 {
        self.ptr.length as i64
    }

    /// Returns true when the extent holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.ptr.length == 0
    }

    /// Time interval of the extent.
    pub fn time_range(&self) -> TimeRange {
        self.ptr.time_range
    }

    /// Reads up to `buf.len()` bytes starting `off` bytes into the extent.
    /// Returns the number of bytes read, clamped at the extent's end.
    pub fn read_at(&mut self, buf: &mut [u8], off: i64) -> Result<usize> {
        if off < 0 || off > self.ptr.length as i64 {
            return Err(FennecError::validation(
                "read offset outside the domain extent",
            ));
        }
        let n = (buf.len() as i64).min(self.ptr.length as i64 - off) as usize;
        if n == 0 {
            return Ok(0);
        }
        let handle = self.handle.as_mut().expect("open reader holds a handle");
        handle
            .file
            .seek(SeekFrom::Start(self.ptr.offset as u64 + off as u64))?;
        handle.file.read_exact(&mut buf[..n])?;
        Ok(n)
    }

    /// Reads the full extent into a fresh buffer.
    pub fn read_all(&mut self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.ptr.length as usize];
        self.read_at(&mut buf, 0)?;
        Ok(buf)
    }

    /// Returns the descriptor to the pool.
    pub fn close(mut self) -> Result<()> {
        self.release();
        Ok(())
    }

    fn release(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.db.files.release_reader(handle);
        }
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        self.release();
    }
}
