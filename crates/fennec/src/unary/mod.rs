//! Per-channel engine layering sample semantics over a domain database.
//!
//! A unary database interprets the raw bytes of its domain store as
//! fixed-width samples, resolves timestamps through a rate or domain-backed
//! index, and arbitrates write access through a controller.

pub mod delete;
pub mod iterator;
pub mod writer;

pub use iterator::Iterator;
pub use writer::{Writer, WriterConfig};

use crate::channel::{Channel, ChannelKey};
use crate::controller::{Controlled, Controller};
use crate::domain;
use crate::error::{FennecError, Result};
use crate::frame::Frame;
use crate::index::{self, Index};
use crate::telem::{TimeRange, TIME_SPAN_MAX};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// The region entity of a unary controller: a handle on the domain writer
/// shared by every gate of the region. Gates opened for deletes carry no
/// writer.
#[derive(Debug, Clone)]
pub(crate) struct WriterEntity {
    channel_key: ChannelKey,
    pub(crate) writer: Arc<Mutex<Option<domain::Writer>>>,
}

impl WriterEntity {
    fn new(channel_key: ChannelKey, writer: Option<domain::Writer>) -> Self {
        Self {
            channel_key,
            writer: Arc::new(Mutex::new(writer)),
        }
    }
}

impl Controlled for WriterEntity {
    fn channel_key(&self) -> ChannelKey {
        self.channel_key
    }
}

/// A single channel's storage engine.
#[derive(Debug)]
pub struct Db {
    /// Descriptor of the stored channel.
    pub channel: Channel,
    pub(crate) domain: Arc<domain::Db>,
    pub(crate) controller: Controller<WriterEntity>,
    idx: RwLock<Option<Arc<dyn Index>>>,
    /// Open writers and iterators. Checked before closing.
    open_entities: AtomicI32,
    delete_gate_seq: AtomicU64,
    closed: AtomicBool,
}

/// Opens the unary database for `channel` rooted at `dir`.
///
/// Self-indexing and rate channels select their index immediately; channels
/// indexed by a sibling are wired by the engine via [`Db::set_index`] once
/// the sibling is open.
pub fn open(dir: &Path, channel: Channel, domain_cfg: domain::Config) -> Result<Arc<Db>> {
    channel.validate()?;
    if channel.is_virtual {
        return Err(FennecError::validation(
            "virtual channels do not open a unary database",
        ));
    }
    let domain_db = domain::Db::open(dir, domain_cfg)?;
    let db = Arc::new(Db {
        controller: Controller::new(channel.concurrency),
        domain: Arc::clone(&domain_db),
        idx: RwLock::new(None),
        open_entities: AtomicI32::new(0),
        delete_gate_seq: AtomicU64::new(0),
        closed: AtomicBool::new(false),
        channel,
    });
    if db.channel.is_index {
        db.set_index(Arc::new(index::Domain::new(domain_db)));
    } else if db.channel.index.is_zero() {
        db.set_index(Arc::new(index::Rate::new(db.channel.rate)));
    }
    Ok(db)
}

impl Db {
    pub(crate) fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(FennecError::EntityClosed("unary.db"));
        }
        Ok(())
    }

    /// Installs the index strategy. Used by the engine to wire channels to
    /// their sibling index channel.
    pub fn set_index(&self, idx: Arc<dyn Index>) {
        *self.idx.write().expect("index slot poisoned") = Some(idx);
    }

    /// The channel's index strategy.
    pub(crate) fn index(&self) -> Result<Arc<dyn Index>> {
        self.idx
            .read()
            .expect("index slot poisoned")
            .clone()
            .ok_or_else(|| {
                FennecError::Validation(format!("channel {} index is not set", self.channel.key))
            })
    }

    /// The index strategy this channel provides to the channels it indexes.
    /// Only meaningful for index channels.
    pub fn shared_index(&self) -> Result<Arc<dyn Index>> {
        if !self.channel.is_index {
            return Err(FennecError::Validation(format!(
                "channel {} is not an index channel",
                self.channel.key
            )));
        }
        self.index()
    }

    pub(crate) fn entity_opened(&self) {
        self.open_entities.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn entity_closed(&self) {
        self.open_entities.fetch_sub(1, Ordering::AcqRel);
    }

    /// Number of writers and iterators currently open.
    pub fn open_entity_count(&self) -> i32 {
        self.open_entities.load(Ordering::Acquire)
    }

    /// Opens an iterator over `bounds`.
    pub fn open_iterator(self: &Arc<Self>, bounds: TimeRange) -> Result<Iterator> {
        self.check_open()?;
        Iterator::open(Arc::clone(self), bounds)
    }

    /// Reads every sample in `tr`, one series per stored domain.
    pub fn read(self: &Arc<Self>, tr: TimeRange) -> Result<Frame> {
        self.check_open()?;
        let mut frame = Frame::empty();
        let mut iter = self.open_iterator(tr)?;
        if !iter.seek_first() {
            iter.close()?;
            return Ok(frame);
        }
        loop {
            match iter.next(TIME_SPAN_MAX) {
                Ok(true) => {
                    if let Some(series) = iter.value() {
                        if !series.is_empty() {
                            frame.push(self.channel.key, series.clone());
                        }
                    }
                }
                Ok(false) => break,
                Err(e) => {
                    iter.close()?;
                    return Err(e);
                }
            }
        }
        iter.close()?;
        Ok(frame)
    }

    /// Returns true when any stored domain overlaps `tr`.
    pub fn has_data_for(self: &Arc<Self>, tr: TimeRange) -> Result<bool> {
        self.check_open()?;
        self.domain.has_data_for(tr)
    }

    /// The leading control state across the channel's regions.
    pub fn leading_control_state(&self) -> Option<crate::control::State> {
        self.controller.leading_state()
    }

    /// Closes the database, refusing while any writer or iterator is open.
    pub fn try_close(&self) -> Result<()> {
        let open = self.open_entity_count();
        if open > 0 {
            return Err(FennecError::Validation(format!(
                "cannot close channel {} because there are currently {} unclosed writers/iterators accessing it",
                self.channel.key, open
            )));
        }
        self.close()
    }

    /// Closes the database unconditionally. Outstanding handles error on
    /// their next operation.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.domain.close()
    }

    /// Subject keys for internally opened gates (convenience writes and
    /// delete fences). Unique per database so they never collide within a
    /// region.
    pub(crate) fn next_internal_subject(&self) -> String {
        let seq = self.delete_gate_seq.fetch_add(1, Ordering::Relaxed);
        format!("internal-writer-{}-{seq}", self.channel.key)
    }
}

/// Writes `series` at `start` through a short-lived absolute-authority
/// writer. Convenience for tests and the engine's write path.
pub fn write(
    db: &Arc<Db>,
    start: crate::telem::TimeStamp,
    series: crate::telem::Series,
) -> Result<()> {
    let (mut w, _) = writer::open(
        db,
        WriterConfig {
            start,
            subject: crate::control::Subject::new(db.next_internal_subject()),
            ..Default::default()
        },
    )?;
    let res = w.write(series).and_then(|_| w.commit().map(|_| ()));
    let close_res = w.close().map(|_| ());
    res.and(close_res)
}
