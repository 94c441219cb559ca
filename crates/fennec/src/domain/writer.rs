//! Domain writer: appends raw bytes to an acquired segment file and commits
//! them as pointers in the index.

use crate::domain::file_controller::WriterHandle;
use crate::domain::index::Pointer;
use crate::domain::Db;
use crate::error::{FennecError, Result};
use crate::telem::{TimeRange, TimeStamp};
use std::io::{Seek, SeekFrom, Write as _};
use std::sync::Arc;

/// Configuration for opening a domain writer.
#[derive(Debug, Clone, Copy)]
pub struct WriterConfig {
    /// Starting bound of the first committed domain.
    pub start: TimeStamp,
    /// Optional ending cap. When set, commits may not exceed it.
    pub end: Option<TimeStamp>,
}

/// Writes a blob of telemetry occupying a particular time domain.
///
/// The lifecycle is write → commit → (write → commit …) → close. Each
/// commit turns the bytes written since the previous commit into one
/// pointer `[start, end)` and advances `start` to `end`. A commit that
/// conflicts with existing data rolls the pending bytes back by truncation;
/// closing without a commit discards pending bytes the same way.
#[derive(Debug)]
pub struct Writer {
    db: Arc<Db>,
    handle: Option<WriterHandle>,
    start: TimeStamp,
    end_cap: Option<TimeStamp>,
    /// Absolute file offset where the pending (uncommitted) extent begins.
    pending_offset: u64,
    /// Bytes written since the last commit.
    pending_len: u64,
    closed: bool,
}

impl Writer {
    pub(crate) fn open(db: Arc<Db>, cfg: WriterConfig) -> Result<Self> {
        if let Some(end) = cfg.end {
            if end < cfg.start {
                return Err(FennecError::validation(
                    "writer end must be at or after start",
                ));
            }
        }
        let handle = db.files.acquire_writer()?;
        let pending_offset = handle.base_offset;
        Ok(Self {
            db,
            handle: Some(handle),
            start: cfg.start,
            end_cap: cfg.end,
            pending_offset,
            pending_len: 0,
            closed: false,
        })
    }

    /// Appends `data` to the acquired segment file. The bytes become
    /// readable only after a successful commit.
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        if self.closed {
            return Err(FennecError::EntityClosed("domain.writer"));
        }
        let handle = self.handle.as_mut().expect("open writer holds a handle");
        handle.file.write_all(data)?;
        self.pending_len += data.len() as u64;
        Ok(data.len())
    }

    /// Bytes written since the last commit.
    pub fn pending_len(&self) -> u64 {
        self.pending_len
    }

    /// Starting bound of the pending domain.
    pub fn start(&self) -> TimeStamp {
        self.start
    }

    /// Commits the pending bytes as the domain `[start, end)` and persists
    /// the index.
    pub fn commit(&mut self, end: TimeStamp) -> Result<()> {
        self.commit_with_persist(end, true)
    }

    /// Commits the pending bytes, persisting the index only when `persist`
    /// is set. Auto-committing callers batch persistence on a cadence.
    pub fn commit_with_persist(&mut self, end: TimeStamp, persist: bool) -> Result<()> {
        if self.closed {
            return Err(FennecError::EntityClosed("domain.writer"));
        }
        if self.pending_len == 0 {
            return Err(FennecError::validation("commit with no written data"));
        }
        if end <= self.start {
            return Err(FennecError::Validation(format!(
                "commit end {} must be after domain start {}",
                end, self.start
            )));
        }
        if let Some(cap) = self.end_cap {
            if end > cap {
                return Err(FennecError::Validation(format!(
                    "commit end {end} exceeds the writer's end bound {cap}"
                )));
            }
        }
        let handle = self.handle.as_mut().expect("open writer holds a handle");
        handle.file.flush()?;
        let ptr = Pointer {
            time_range: TimeRange::new(self.start, end),
            file_key: handle.key,
            offset: self.pending_offset as u32,
            length: self.pending_len as u32,
        };
        match self.db.idx.insert(ptr) {
            Ok(()) => {}
            Err(e) => {
                if e.is_write_conflict() {
                    self.rollback()?;
                }
                return Err(e);
            }
        }
        self.start = end;
        self.pending_offset += self.pending_len;
        self.pending_len = 0;
        if persist {
            self.db.idx.persist()?;
        }
        Ok(())
    }

    /// Discards the pending extent by truncating the file back to the
    /// offset where it began.
    fn rollback(&mut self) -> Result<()> {
        let handle = self.handle.as_mut().expect("open writer holds a handle");
        handle.file.set_len(self.pending_offset)?;
        handle.file.seek(SeekFrom::Start(self.pending_offset))?;
        self.pending_len = 0;
        Ok(())
    }

    /// Releases the writer. Uncommitted bytes are discarded by truncation.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if self.pending_len > 0 {
            self.rollback()?;
        }
        let handle = self.handle.take().expect("open writer holds a handle");
        self.db.files.release_writer(handle);
        Ok(())
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        // Descriptors must return to the pool even on unclean exits; errors
        // here have no caller to surface to.
        let _ = self.close();
    }
}
