//! Append-oriented segmented store mapping half-open time intervals to byte
//! extents.
//!
//! A domain database provides two access types:
//!
//! - [`Writer`] writes a blob of telemetry occupying a particular time
//!   domain.
//! - [`Iterator`] walks the stored domains in time order and hands out
//!   bounded [`Reader`]s over their bytes.
//!
//! The database is optimized for large append-only writes. Small or
//! out-of-order writes are valid but slow. Deletion is tombstone-based:
//! freed extents occupy file bytes until [`Db::garbage_collect`] rewrites
//! the file without them.

pub mod delete;
pub mod file_controller;
pub mod index;
pub mod iterator;
pub mod writer;

pub use file_controller::FileController;
pub use index::{IndexState, Pointer, PointerIndex, Tombstone};
pub use iterator::{Iterator, Reader};
pub use writer::{Writer, WriterConfig};

use crate::error::{FennecError, Result};
use crate::telem::TimeRange;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Default maximum segment file size: 1 GiB.
pub const DEFAULT_FILE_SIZE: u64 = 1 << 30;

/// Default tombstone fraction of the file size that triggers collection.
pub const DEFAULT_GC_THRESHOLD: f32 = 0.2;

/// Default descriptor pool size.
pub const DEFAULT_MAX_DESCRIPTORS: usize = 100;

/// Default garbage-collection streaming buffer: 20 MiB.
pub const DEFAULT_READ_CHUNK_SIZE: u32 = 20 * (1 << 20);

/// Configuration for opening a domain database.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum size, in bytes, for a writer to be created on a file. A file
    /// may still exceed this while a writer finishes an in-progress append.
    pub file_size: u64,
    /// Minimum tombstone proportion of `file_size` that triggers a per-file
    /// garbage collection. Must be in (0, 1].
    pub gc_threshold: f32,
    /// Maximum number of file descriptors the database will hold open.
    pub max_descriptors: usize,
    /// Buffer size used when streaming live extents during collection.
    pub read_chunk_size: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            file_size: DEFAULT_FILE_SIZE,
            gc_threshold: DEFAULT_GC_THRESHOLD,
            max_descriptors: DEFAULT_MAX_DESCRIPTORS,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
        }
    }
}

impl Config {
    fn validate(&self) -> Result<()> {
        if self.file_size == 0 {
            return Err(FennecError::validation("file size must be positive"));
        }
        if self.max_descriptors == 0 {
            return Err(FennecError::validation("max descriptors must be positive"));
        }
        if !(0.0..=1.0).contains(&self.gc_threshold) {
            return Err(FennecError::validation("gc threshold must be in [0, 1]"));
        }
        Ok(())
    }
}

/// A persistent, concurrent store for domains of telemetry under one
/// directory. Safe for concurrent use; multiple writers and iterators may
/// access the database at once.
#[derive(Debug)]
pub struct Db {
    pub(crate) cfg: Config,
    pub(crate) dir: PathBuf,
    pub(crate) idx: PointerIndex,
    pub(crate) files: FileController,
    closed: AtomicBool,
}

impl Db {
    /// Opens the database rooted at `dir`, loading any persisted index.
    pub fn open(dir: &Path, cfg: Config) -> Result<Arc<Self>> {
        cfg.validate()?;
        std::fs::create_dir_all(dir)?;
        let idx = PointerIndex::open(dir)?;
        let files = FileController::open(dir, cfg.file_size, cfg.max_descriptors)?;
        Ok(Arc::new(Self {
            cfg,
            dir: dir.to_path_buf(),
            idx,
            files,
            closed: AtomicBool::new(false),
        }))
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(FennecError::EntityClosed("domain.db"));
        }
        Ok(())
    }

    /// Opens a new invalidated iterator over `bounds`. A seeking call is
    /// required before the iterator can be used.
    pub fn new_iterator(self: &Arc<Self>, bounds: TimeRange) -> Iterator {
        Iterator::new(Arc::clone(self), bounds)
    }

    /// Opens a writer for a domain starting at `cfg.start`.
    pub fn new_writer(self: &Arc<Self>, cfg: WriterConfig) -> Result<Writer> {
        self.check_open()?;
        Writer::open(Arc::clone(self), cfg)
    }

    /// Returns true when any stored domain overlaps `tr`.
    pub fn has_data_for(self: &Arc<Self>, tr: TimeRange) -> Result<bool> {
        self.check_open()?;
        let mut iter = self.new_iterator(TimeRange::MAX);
        if iter.seek_ge(tr.start) && iter.time_range().overlaps_with(&tr) {
            return Ok(true);
        }
        if iter.seek_le(tr.end) && iter.time_range().overlaps_with(&tr) {
            return Ok(true);
        }
        Ok(false)
    }

    /// Persists the index and closes pooled descriptors. Not safe to call
    /// concurrently with other methods.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.idx.persist()?;
        self.files.close();
        Ok(())
    }
}

/// Writes `data` as a single committed domain spanning `tr`. Convenience
/// used by tests and by auto-committing callers.
pub fn write(db: &Arc<Db>, tr: TimeRange, data: &[u8]) -> Result<()> {
    let mut w = db.new_writer(WriterConfig {
        start: tr.start,
        end: Some(tr.end),
    })?;
    w.write(data)?;
    w.commit(tr.end)?;
    w.close()
}
