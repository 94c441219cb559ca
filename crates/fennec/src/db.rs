//! Engine root: the channel registry and multi-channel frame operations.

use crate::channel::{Channel, ChannelKey};
use crate::control::{Authority, Subject, Transfer, ABSOLUTE_AUTHORITY};
use crate::domain;
use crate::error::{FennecError, Result};
use crate::frame::Frame;
use crate::gc::{GcTask, Semaphore, Shutdown};
use crate::meta;
use crate::relay::{ControlUpdates, Relay};
use crate::telem::{Series, TimeRange, TimeSpan, TimeStamp, SECOND};
use crate::unary;
use crate::virtual_db::{VirtualDb, VirtualWriter};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, error, info};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct Options {
    /// Maximum segment file size; writers roll to a new file at 80% of it.
    pub file_size: u64,
    /// Tombstone fraction of `file_size` that triggers per-file collection.
    pub gc_threshold: f32,
    /// Descriptor pool size per channel.
    pub max_descriptors: usize,
    /// Collection streaming buffer size.
    pub read_chunk_size: u32,
    /// Interval between background collection passes.
    pub gc_try_interval: Duration,
    /// Bound on concurrent per-channel collection passes.
    pub max_gc_concurrency: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            file_size: domain::DEFAULT_FILE_SIZE,
            gc_threshold: domain::DEFAULT_GC_THRESHOLD,
            max_descriptors: domain::DEFAULT_MAX_DESCRIPTORS,
            read_chunk_size: domain::DEFAULT_READ_CHUNK_SIZE,
            gc_try_interval: Duration::from_secs(30),
            max_gc_concurrency: 10,
        }
    }
}

impl Options {
    fn domain_config(&self) -> domain::Config {
        domain::Config {
            file_size: self.file_size,
            gc_threshold: self.gc_threshold,
            max_descriptors: self.max_descriptors,
            read_chunk_size: self.read_chunk_size,
        }
    }
}

#[derive(Debug, Clone)]
enum Slot {
    Unary(Arc<unary::Db>),
    Virtual(Arc<VirtualDb>),
}

#[derive(Debug, Clone)]
struct Entry {
    channel: Channel,
    slot: Slot,
}

/// The telemetry storage engine: a registry of per-channel databases under
/// one root directory.
#[derive(Debug)]
pub struct Db {
    dir: PathBuf,
    options: Options,
    channels: RwLock<HashMap<ChannelKey, Entry>>,
    relay: Arc<Relay>,
    gc_task: Mutex<Option<GcTask>>,
    writer_seq: AtomicU64,
    closed: AtomicBool,
}

/// Opens the engine rooted at `dir` with default options.
pub fn open(dir: &Path) -> Result<Arc<Db>> {
    open_with(dir, Options::default())
}

/// Opens the engine rooted at `dir`.
///
/// Numeric subdirectories are channels and must carry a descriptor;
/// anything else in the root is tolerated and ignored. A background
/// collection task starts immediately and runs until close.
pub fn open_with(dir: &Path, options: Options) -> Result<Arc<Db>> {
    std::fs::create_dir_all(dir)?;
    let db = Arc::new(Db {
        dir: dir.to_path_buf(),
        options,
        channels: RwLock::new(HashMap::new()),
        relay: Arc::new(Relay::new()),
        gc_task: Mutex::new(None),
        writer_seq: AtomicU64::new(0),
        closed: AtomicBool::new(false),
    });
    info!(dir = %dir.display(), "opening telemetry storage engine");

    let mut keys = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !entry.file_type()?.is_dir() {
            debug!(name, "ignoring non-directory in engine root");
            continue;
        }
        match name.parse::<u32>() {
            Ok(raw) => keys.push(ChannelKey(raw)),
            Err(_) => debug!(name, "ignoring non-numeric directory in engine root"),
        }
    }
    keys.sort_unstable();
    {
        let mut map = db.channels.write().expect("channel registry poisoned");
        for key in keys {
            db.open_stored(&mut map, key)?;
        }
    }
    db.start_gc();
    Ok(db)
}

impl Db {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(FennecError::EntityClosed("fennec.db"));
        }
        Ok(())
    }

    fn channel_dir(&self, key: ChannelKey) -> PathBuf {
        self.dir.join(key.0.to_string())
    }

    /// Opens a stored channel and, recursively, the index channel it
    /// depends on.
    fn open_stored(&self, map: &mut HashMap<ChannelKey, Entry>, key: ChannelKey) -> Result<()> {
        if map.contains_key(&key) {
            return Ok(());
        }
        let dir = self.channel_dir(key);
        if !dir.is_dir() {
            return Err(FennecError::ChannelNotFound(key));
        }
        let ch = meta::read_or_create(&dir, None)?;
        let slot = if ch.is_virtual {
            Slot::Virtual(VirtualDb::open(ch.clone())?)
        } else {
            let udb = unary::open(&dir, ch.clone(), self.options.domain_config())?;
            if !ch.index.is_zero() && !ch.is_index {
                self.open_stored(map, ch.index)?;
                let dep = map.get(&ch.index).expect("dependency opened above");
                match &dep.slot {
                    Slot::Unary(idx_db) => udb.set_index(idx_db.shared_index()?),
                    Slot::Virtual(_) => {
                        return Err(FennecError::Validation(format!(
                            "channel {} is not an index",
                            ch.index
                        )))
                    }
                }
            }
            Slot::Unary(udb)
        };
        map.insert(key, Entry { channel: ch, slot });
        Ok(())
    }

    /// Creates a channel, validating its descriptor against the registry
    /// and persisting it to `<key>/meta.json`.
    pub fn create_channel(&self, mut ch: Channel) -> Result<()> {
        self.check_open()?;
        ch.validate()?;
        let mut map = self.channels.write().expect("channel registry poisoned");
        if map.contains_key(&ch.key) {
            return Err(FennecError::Validation(format!(
                "channel {} already exists",
                ch.key
            )));
        }
        if !ch.index.is_zero() && !ch.is_index {
            let dep = map.get(&ch.index).ok_or_else(|| {
                FennecError::Validation(format!("index {} does not exist", ch.index))
            })?;
            if !dep.channel.is_index {
                return Err(FennecError::Validation(format!(
                    "channel {} is not an index",
                    ch.index
                )));
            }
        }
        if ch.is_index {
            ch.index = ch.key;
        }
        let dir = self.channel_dir(ch.key);
        meta::create(&dir, &ch)?;
        let slot = if ch.is_virtual {
            Slot::Virtual(VirtualDb::open(ch.clone())?)
        } else {
            let udb = unary::open(&dir, ch.clone(), self.options.domain_config())?;
            if !ch.index.is_zero() && !ch.is_index {
                if let Slot::Unary(idx_db) = &map.get(&ch.index).expect("validated above").slot {
                    udb.set_index(idx_db.shared_index()?);
                }
            }
            Slot::Unary(udb)
        };
        map.insert(ch.key, Entry { channel: ch, slot });
        Ok(())
    }

    /// The descriptor of `key`.
    pub fn retrieve_channel(&self, key: ChannelKey) -> Result<Channel> {
        self.check_open()?;
        let map = self.channels.read().expect("channel registry poisoned");
        map.get(&key)
            .map(|e| e.channel.clone())
            .ok_or(FennecError::ChannelNotFound(key))
    }

    /// Descriptors of every channel in the engine.
    pub fn channels(&self) -> Vec<Channel> {
        let map = self.channels.read().expect("channel registry poisoned");
        map.values().map(|e| e.channel.clone()).collect()
    }

    /// Renames a channel. Refuses while the channel has open writers or
    /// iterators.
    pub fn rename_channel(&self, key: ChannelKey, name: impl Into<String>) -> Result<()> {
        self.check_open()?;
        let mut map = self.channels.write().expect("channel registry poisoned");
        let entry = map.get_mut(&key).ok_or(FennecError::ChannelNotFound(key))?;
        match &entry.slot {
            Slot::Unary(u) => {
                let open = u.open_entity_count();
                if open > 0 {
                    return Err(FennecError::Validation(format!(
                        "cannot rename channel {key}: {open} unclosed writers/iterators"
                    )));
                }
            }
            Slot::Virtual(v) => {
                let open = v.open_writer_count();
                if open > 0 {
                    return Err(FennecError::Validation(format!(
                        "cannot rename channel {key}: {open} unclosed writers"
                    )));
                }
            }
        }
        entry.channel.name = name.into();
        meta::create(&self.channel_dir(key), &entry.channel)
    }

    /// Deletes a channel and its directory. Refuses for an index channel
    /// that other channels depend on, and while the channel is in use.
    pub fn delete_channel(&self, key: ChannelKey) -> Result<()> {
        self.check_open()?;
        let mut map = self.channels.write().expect("channel registry poisoned");
        let entry = map.get(&key).ok_or(FennecError::ChannelNotFound(key))?;
        if entry.channel.is_index {
            for (other_key, other) in map.iter() {
                if *other_key != key && other.channel.index == key {
                    return Err(FennecError::validation(
                        "could not delete index channel with other channels depending on it",
                    ));
                }
            }
        }
        match &entry.slot {
            Slot::Unary(u) => u.try_close()?,
            Slot::Virtual(v) => v.try_close()?,
        }
        map.remove(&key);
        drop(map);
        std::fs::remove_dir_all(self.channel_dir(key))?;
        Ok(())
    }

    /// Deletes a time range of data in one channel. Refuses for an index
    /// channel whose dependents hold data overlapping the range.
    pub fn delete_time_range(&self, key: ChannelKey, tr: TimeRange) -> Result<()> {
        self.check_open()?;
        let map = self.channels.write().expect("channel registry poisoned");
        let entry = map.get(&key).ok_or(FennecError::ChannelNotFound(key))?;
        let Slot::Unary(udb) = &entry.slot else {
            return Err(FennecError::ChannelNotFound(key));
        };
        if entry.channel.is_index {
            for (other_key, other) in map.iter() {
                if *other_key == key || other.channel.index != key {
                    continue;
                }
                if let Slot::Unary(o) = &other.slot {
                    if o.has_data_for(tr)? {
                        return Err(FennecError::Validation(format!(
                            "could not delete index channel {key} with other channels depending on it"
                        )));
                    }
                }
            }
        }
        udb.delete(tr)
    }

    /// Writes `frame` at `start`: one writer spanning the frame's channels,
    /// one commit, then close.
    pub fn write(&self, start: TimeStamp, frame: Frame) -> Result<()> {
        self.check_open()?;
        let mut keys: Vec<ChannelKey> = Vec::new();
        for key in &frame.keys {
            if !keys.contains(key) {
                keys.push(*key);
            }
        }
        let mut w = self.open_writer(FrameWriterConfig {
            channels: keys,
            start,
            ..Default::default()
        })?;
        let res = w
            .write(&frame)
            .and_then(|_| w.commit().map(|_| ()));
        let close_res = w.close();
        res.and(close_res)
    }

    /// Writes a single channel's series at `start`.
    pub fn write_series(&self, key: ChannelKey, start: TimeStamp, series: Series) -> Result<()> {
        self.write(start, Frame::unary(key, series))
    }

    /// Reads every sample in `tr` across `keys` into one frame.
    pub fn read(&self, tr: TimeRange, keys: &[ChannelKey]) -> Result<Frame> {
        self.check_open()?;
        let mut frame = Frame::empty();
        for key in keys {
            let udb = self.unary_db(*key)?;
            frame.append(udb.read(tr)?);
        }
        Ok(frame)
    }

    fn unary_db(&self, key: ChannelKey) -> Result<Arc<unary::Db>> {
        let map = self.channels.read().expect("channel registry poisoned");
        match map.get(&key) {
            Some(Entry {
                slot: Slot::Unary(u),
                ..
            }) => Ok(Arc::clone(u)),
            Some(Entry {
                slot: Slot::Virtual(v),
                ..
            }) => Err(FennecError::Validation(format!(
                "cannot open iterator on virtual channel {}",
                v.channel.key
            ))),
            None => Err(FennecError::ChannelNotFound(key)),
        }
    }

    /// Opens a frame writer over `cfg.channels`.
    pub fn open_writer(&self, cfg: FrameWriterConfig) -> Result<FrameWriter> {
        self.check_open()?;
        if cfg.channels.is_empty() {
            return Err(FennecError::validation(
                "a writer needs at least one channel",
            ));
        }
        let subject = if cfg.subject.key.is_empty() {
            Subject::new(format!(
                "writer-{}",
                self.writer_seq.fetch_add(1, Ordering::Relaxed)
            ))
        } else {
            cfg.subject.clone()
        };
        let map = self.channels.read().expect("channel registry poisoned");
        // Index channels commit first so dependent commits resolve against
        // fresh timestamps; order them first overall.
        let mut keys = cfg.channels.clone();
        keys.sort_by_key(|k| {
            map.get(k)
                .map(|e| !e.channel.is_index)
                .unwrap_or(true)
        });
        let mut entries = Vec::with_capacity(keys.len());
        let mut transfers: Vec<(ChannelKey, Transfer)> = Vec::new();
        for key in keys {
            let entry = map
                .get(&key)
                .ok_or(FennecError::ChannelNotFound(key))?
                .clone();
            let ucfg = unary::WriterConfig {
                start: cfg.start,
                end: cfg.end,
                subject: subject.clone(),
                authority: cfg.authority,
                persist: cfg.persist,
                auto_commit: cfg.auto_commit,
                auto_index_persist_interval: cfg.auto_index_persist_interval,
            };
            match entry.slot {
                Slot::Unary(u) => {
                    let (writer, transfer) = u.open_writer(ucfg)?;
                    transfers.push((key, transfer));
                    entries.push(WriterEntry::Unary { key, writer });
                }
                Slot::Virtual(v) => {
                    let (writer, transfer) = v.open_writer(&ucfg)?;
                    transfers.push((key, transfer));
                    entries.push(WriterEntry::Virtual { key, writer });
                }
            }
        }
        drop(map);
        for (key, transfer) in &transfers {
            self.relay.publish(*key, transfer);
        }
        Ok(FrameWriter {
            // Frame writers hold their own relay handle so transfers on
            // close still fan out after the engine reference is gone.
            relay: Arc::clone(&self.relay),
            start: cfg.start,
            entries,
            closed: false,
        })
    }

    /// Opens a frame iterator over `cfg.channels` bounded by `cfg.bounds`.
    pub fn open_iterator(&self, cfg: FrameIteratorConfig) -> Result<FrameIterator> {
        self.check_open()?;
        let mut iters = Vec::with_capacity(cfg.channels.len());
        for key in &cfg.channels {
            let udb = self.unary_db(*key)?;
            iters.push((*key, udb.open_iterator(cfg.bounds)?));
        }
        Ok(FrameIterator {
            iters,
            closed: false,
        })
    }

    /// Subscribes to control transfer events.
    pub fn control_updates(&self) -> ControlUpdates {
        self.relay.subscribe()
    }

    /// Runs one synchronous collection pass over every channel.
    pub fn garbage_collect(&self) -> Result<()> {
        self.check_open()?;
        let dbs: Vec<Arc<unary::Db>> = {
            let map = self.channels.read().expect("channel registry poisoned");
            map.values()
                .filter_map(|e| match &e.slot {
                    Slot::Unary(u) => Some(Arc::clone(u)),
                    Slot::Virtual(_) => None,
                })
                .collect()
        };
        for u in dbs {
            u.garbage_collect()?;
        }
        Ok(())
    }

    fn start_gc(self: &Arc<Self>) {
        let shutdown = Arc::new(Shutdown::default());
        let db = Arc::clone(self);
        let signal = Arc::clone(&shutdown);
        let interval = self.options.gc_try_interval;
        let concurrency = self.options.max_gc_concurrency;
        let handle = std::thread::spawn(move || {
            let sem = Semaphore::new(concurrency);
            loop {
                if signal.sleep(interval) {
                    break;
                }
                let dbs: Vec<Arc<unary::Db>> = {
                    let map = db.channels.read().expect("channel registry poisoned");
                    map.values()
                        .filter_map(|e| match &e.slot {
                            Slot::Unary(u) => Some(Arc::clone(u)),
                            Slot::Virtual(_) => None,
                        })
                        .collect()
                };
                std::thread::scope(|scope| {
                    for u in &dbs {
                        sem.acquire();
                        let sem = &sem;
                        scope.spawn(move || {
                            if let Err(e) = u.garbage_collect() {
                                error!(channel = %u.channel.key, error = %e, "garbage collection failed");
                            }
                            sem.release();
                        });
                    }
                });
            }
        });
        *self.gc_task.lock().expect("gc task slot poisoned") = Some(GcTask { shutdown, handle });
    }

    /// Closes the engine: refuses while any writer or iterator is open,
    /// then stops background collection and closes every channel.
    pub fn close(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        {
            let map = self.channels.read().expect("channel registry poisoned");
            for entry in map.values() {
                let open = match &entry.slot {
                    Slot::Unary(u) => u.open_entity_count(),
                    Slot::Virtual(v) => v.open_writer_count(),
                };
                if open > 0 {
                    return Err(FennecError::Validation(format!(
                        "cannot close engine: channel {} has {} unclosed writers/iterators",
                        entry.channel.key, open
                    )));
                }
            }
        }
        self.closed.store(true, Ordering::Release);
        if let Some(task) = self.gc_task.lock().expect("gc task slot poisoned").take() {
            task.stop();
        }
        let map = self.channels.write().expect("channel registry poisoned");
        let mut result = Ok(());
        for entry in map.values() {
            if let Slot::Unary(u) = &entry.slot {
                if let Err(e) = u.close() {
                    result = Err(e);
                }
            }
        }
        result
    }
}

/// Configuration for opening a frame writer.
#[derive(Debug, Clone)]
pub struct FrameWriterConfig {
    /// Channels the writer spans.
    pub channels: Vec<ChannelKey>,
    /// Starting bound of the written domains.
    pub start: TimeStamp,
    /// Optional ending bound.
    pub end: Option<TimeStamp>,
    /// Control subject; generated when left empty.
    pub subject: Subject,
    /// Control authority.
    pub authority: Authority,
    /// Whether written data reaches the file system.
    pub persist: bool,
    /// Whether every write commits immediately.
    pub auto_commit: bool,
    /// Index flush cadence under auto-commit.
    pub auto_index_persist_interval: TimeSpan,
}

impl Default for FrameWriterConfig {
    fn default() -> Self {
        Self {
            channels: Vec::new(),
            start: 0,
            end: None,
            subject: Subject::default(),
            authority: ABSOLUTE_AUTHORITY,
            persist: true,
            auto_commit: false,
            auto_index_persist_interval: SECOND,
        }
    }
}

#[derive(Debug)]
enum WriterEntry {
    Unary {
        key: ChannelKey,
        writer: unary::Writer,
    },
    Virtual {
        key: ChannelKey,
        writer: VirtualWriter,
    },
}

/// A writer spanning one or more channels. Series are routed to member
/// channels by key; commits land index channels first.
#[derive(Debug)]
pub struct FrameWriter {
    relay: Arc<Relay>,
    start: TimeStamp,
    entries: Vec<WriterEntry>,
    closed: bool,
}

impl FrameWriter {
    /// Routes each series of `frame` to its channel's writer.
    pub fn write(&mut self, frame: &Frame) -> Result<()> {
        if self.closed {
            return Err(FennecError::EntityClosed("frame.writer"));
        }
        for (key, series) in frame.keys.iter().zip(frame.series.iter()) {
            let entry = self
                .entries
                .iter_mut()
                .find(|e| e.key() == *key)
                .ok_or_else(|| {
                    FennecError::Validation(format!("channel {key} is not open on this writer"))
                })?;
            match entry {
                WriterEntry::Unary { writer, .. } => {
                    writer.write(series.clone())?;
                }
                WriterEntry::Virtual { writer, .. } => writer.write(series)?,
            }
        }
        Ok(())
    }

    /// Commits every member writer and returns the greatest committed end.
    pub fn commit(&mut self) -> Result<TimeStamp> {
        if self.closed {
            return Err(FennecError::EntityClosed("frame.writer"));
        }
        let mut end = self.start;
        for entry in self.entries.iter_mut() {
            if let WriterEntry::Unary { writer, .. } = entry {
                end = end.max(writer.commit()?);
            }
        }
        Ok(end)
    }

    /// Changes every member gate's authority, publishing any transfers.
    pub fn set_authority(&mut self, authority: Authority) {
        for entry in self.entries.iter() {
            let (key, transfer) = match entry {
                WriterEntry::Unary { key, writer } => (*key, writer.set_authority(authority)),
                WriterEntry::Virtual { key, writer } => (*key, writer.set_authority(authority)),
            };
            self.relay.publish(key, &transfer);
        }
    }

    /// Closes every member writer, publishing release transfers.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut result = Ok(());
        for entry in self.entries.iter_mut() {
            let outcome = match entry {
                WriterEntry::Unary { key, writer } => writer.close().map(|t| (*key, t)),
                WriterEntry::Virtual { key, writer } => writer.close().map(|t| (*key, t)),
            };
            match outcome {
                Ok((key, transfer)) => self.relay.publish(key, &transfer),
                Err(e) => result = Err(e),
            }
        }
        result
    }
}

impl WriterEntry {
    fn key(&self) -> ChannelKey {
        match self {
            WriterEntry::Unary { key, .. } | WriterEntry::Virtual { key, .. } => *key,
        }
    }
}

impl Drop for FrameWriter {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Configuration for opening a frame iterator.
#[derive(Debug, Clone)]
pub struct FrameIteratorConfig {
    /// Channels to iterate.
    pub channels: Vec<ChannelKey>,
    /// Interval the iterator may access.
    pub bounds: TimeRange,
}

/// An iterator merging per-channel sample runs into frame views.
#[derive(Debug)]
pub struct FrameIterator {
    iters: Vec<(ChannelKey, unary::Iterator)>,
    closed: bool,
}

impl FrameIterator {
    /// Seeks every member to its first domain. Returns true when at least
    /// one channel has data in bounds.
    pub fn seek_first(&mut self) -> bool {
        let mut any = false;
        for (_, iter) in self.iters.iter_mut() {
            any |= iter.seek_first();
        }
        any
    }

    /// Advances every member by at most `span`. Returns true while any
    /// channel produced samples.
    pub fn next(&mut self, span: TimeSpan) -> Result<bool> {
        if self.closed {
            return Err(FennecError::EntityClosed("frame.iterator"));
        }
        let mut any = false;
        for (_, iter) in self.iters.iter_mut() {
            any |= iter.next(span)?;
        }
        Ok(any)
    }

    /// The frame produced by the last [`FrameIterator::next`].
    pub fn value(&self) -> Frame {
        let mut frame = Frame::empty();
        for (key, iter) in self.iters.iter() {
            if let Some(series) = iter.value() {
                if !series.is_empty() {
                    frame.push(*key, series.clone());
                }
            }
        }
        frame
    }

    /// Closes every member iterator.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        for (_, iter) in self.iters.iter_mut() {
            iter.close()?;
        }
        Ok(())
    }
}

impl Drop for FrameIterator {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
