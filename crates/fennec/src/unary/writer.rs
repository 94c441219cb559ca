//! Gated sample writer for one channel.

use crate::control::{Authority, Subject, Transfer, ABSOLUTE_AUTHORITY};
use crate::controller::{Gate, GateConfig};
use crate::domain;
use crate::error::{FennecError, Result};
use crate::telem::{Series, TimeRange, TimeSpan, TimeStamp, SECOND, TIME_STAMP_MAX};
use crate::unary::{Db, WriterEntity};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Auto-commit index-persist interval meaning "persist on every commit".
pub const ALWAYS_PERSIST_ON_AUTO_COMMIT: TimeSpan = -1;

/// Configuration for opening a unary writer.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Starting bound of the writer's first domain.
    pub start: TimeStamp,
    /// Optional ending bound. When set, the control region covers exactly
    /// `[start, end)` and commits may not exceed it; otherwise the region
    /// extends to the end of time.
    pub end: Option<TimeStamp>,
    /// Control subject held by the writer.
    pub subject: Subject,
    /// Control authority held by the writer.
    pub authority: Authority,
    /// Whether written data reaches the file system. When off, writes only
    /// exercise control.
    pub persist: bool,
    /// Whether every write is followed by a commit.
    pub auto_commit: bool,
    /// How often auto-commits flush the pointer index to disk. Negative
    /// persists on every auto-commit.
    pub auto_index_persist_interval: TimeSpan,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
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

/// A writer over one channel, authorized through a control gate.
///
/// Writes append samples to the channel's current segment file; commits
/// resolve the trailing timestamp through the channel's index and record a
/// pointer for the written extent. On a write conflict the pending extent
/// is rolled back and the writer may retry with an adjusted start.
#[derive(Debug)]
pub struct Writer {
    db: Arc<Db>,
    gate: Option<Gate<WriterEntity>>,
    subject: Subject,
    start: TimeStamp,
    end_cap: Option<TimeStamp>,
    persist: bool,
    auto_commit: bool,
    auto_index_persist_interval: TimeSpan,
    last_index_persist: Instant,
    /// Highest timestamp written. Only meaningful on index channels.
    hwm: Option<TimeStamp>,
    closed: bool,
}

impl Db {
    /// Opens a writer on the channel. Registers a control region spanning
    /// the writer's time range when none exists, opens a gate on it, and
    /// reports any control transfer that resulted.
    pub fn open_writer(self: &Arc<Self>, cfg: WriterConfig) -> Result<(Writer, Transfer)> {
        open(self, cfg)
    }
}

pub(crate) fn open(db: &Arc<Db>, cfg: WriterConfig) -> Result<(Writer, Transfer)> {
    db.check_open()?;
    if cfg.subject.key.is_empty() {
        return Err(FennecError::validation("writer subject key must be set"));
    }
    if let Some(end) = cfg.end {
        if end < cfg.start {
            return Err(FennecError::validation(
                "writer end must be at or after its start",
            ));
        }
    }
    let control_range = TimeRange::new(cfg.start, cfg.end.unwrap_or(TIME_STAMP_MAX));
    let gate_cfg = GateConfig {
        time_range: control_range,
        authority: cfg.authority,
        subject: cfg.subject.clone(),
    };
    let channel_key = db.channel.key;
    let domain_db = Arc::clone(&db.domain);
    let domain_cfg = domain::WriterConfig {
        start: cfg.start,
        end: cfg.end,
    };
    let (gate, transfer) = db.controller.open_gate_and_maybe_register(gate_cfg, || {
        let dw = domain_db.new_writer(domain_cfg)?;
        Ok(WriterEntity::new(channel_key, Some(dw)))
    })?;
    db.entity_opened();
    Ok((
        Writer {
            db: Arc::clone(db),
            gate: Some(gate),
            subject: cfg.subject,
            start: cfg.start,
            end_cap: cfg.end,
            persist: cfg.persist,
            auto_commit: cfg.auto_commit,
            auto_index_persist_interval: cfg.auto_index_persist_interval,
            last_index_persist: Instant::now(),
            hwm: None,
            closed: false,
        },
        transfer,
    ))
}

impl Writer {
    fn gate(&self) -> &Gate<WriterEntity> {
        self.gate.as_ref().expect("open writer holds a gate")
    }

    /// Validates and writes `series`, returning the number of samples
    /// accepted. Fails with `Unauthorized` while another gate controls the
    /// region.
    pub fn write(&mut self, series: Series) -> Result<i64> {
        if self.closed {
            return Err(FennecError::EntityClosed("unary.writer"));
        }
        self.db.channel.validate_series(&series)?;
        if self.db.channel.is_index {
            self.validate_monotonic(&series)?;
        }
        let entity = self.gate().authorize()?;
        if self.persist && !series.is_empty() {
            let mut guard = entity.writer.lock().expect("writer entity poisoned");
            if guard.is_none() {
                // The region was registered without a writer (by a delete
                // gate); attach one now.
                *guard = Some(self.db.domain.new_writer(domain::WriterConfig {
                    start: self.start,
                    end: self.end_cap,
                })?);
            }
            let dw = guard.as_mut().expect("writer attached above");
            dw.write(&series.data)?;
        }
        let n = series.len();
        if self.db.channel.is_index && n > 0 {
            self.hwm = Some(series.i64_at(n as usize - 1));
        }
        if self.auto_commit {
            let due = self.auto_index_persist_interval < 0
                || self.last_index_persist.elapsed()
                    >= Duration::from_nanos(self.auto_index_persist_interval as u64);
            self.commit_inner(due)?;
        }
        Ok(n)
    }

    fn validate_monotonic(&self, series: &Series) -> Result<()> {
        let mut prev = self.hwm;
        for i in 0..series.len() as usize {
            let ts = series.i64_at(i);
            if let Some(p) = prev {
                if ts <= p {
                    return Err(FennecError::Validation(format!(
                        "index channel timestamps must be strictly increasing, got {ts} after {p}"
                    )));
                }
            }
            prev = Some(ts);
        }
        Ok(())
    }

    /// Commits the samples written since the last commit, resolving the
    /// exclusive end timestamp through the channel's index (`hwm + 1` on
    /// index channels). Returns the committed end.
    pub fn commit(&mut self) -> Result<TimeStamp> {
        if self.closed {
            return Err(FennecError::EntityClosed("unary.writer"));
        }
        self.commit_inner(true)
    }

    fn commit_inner(&mut self, persist_index: bool) -> Result<TimeStamp> {
        let entity = self.gate().authorize()?;
        let mut guard = entity.writer.lock().expect("writer entity poisoned");
        let dw = guard
            .as_mut()
            .ok_or(FennecError::EntityClosed("domain.writer"))?;
        // Gates share the region's domain writer, so the pending length and
        // start are read from it rather than tracked per gate.
        let density = self.db.channel.density() as i64;
        let written = dw.pending_len() as i64 / density;
        let end = self.resolve_commit_end(dw.start(), written)?;
        dw.commit_with_persist(end, persist_index)?;
        drop(guard);
        if persist_index {
            self.last_index_persist = Instant::now();
        }
        self.start = end;
        Ok(end)
    }

    fn resolve_commit_end(&self, domain_start: TimeStamp, written: i64) -> Result<TimeStamp> {
        if self.db.channel.is_index {
            return self
                .hwm
                .map(|hwm| hwm + 1)
                .ok_or_else(|| FennecError::validation("commit with no written samples"));
        }
        if written == 0 {
            return Err(FennecError::validation("commit with no written samples"));
        }
        let idx = self.db.index()?;
        let approx = idx.stamp(domain_start, written - 1, true)?;
        if !approx.exact() {
            return Err(FennecError::Validation(format!(
                "writer start {domain_start} cannot be resolved exactly in the index"
            )));
        }
        // The resolved stamp is the last written sample; the domain end is
        // exclusive.
        Ok(approx.lower + 1)
    }

    /// Changes the writer's control authority.
    pub fn set_authority(&self, authority: Authority) -> Transfer {
        self.gate().set_authority(authority)
    }

    /// Toggles whether writes reach the file system.
    pub fn set_persist(&mut self, persist: bool) {
        self.persist = persist;
    }

    /// The writer's control subject.
    pub fn subject(&self) -> &Subject {
        &self.subject
    }

    /// Releases the gate and, when this was the region's last gate, closes
    /// the underlying domain writer. Uncommitted bytes are discarded.
    pub fn close(&mut self) -> Result<Transfer> {
        if self.closed {
            return Ok(Transfer::default());
        }
        self.closed = true;
        let gate = self.gate.take().expect("open writer holds a gate");
        let (entity, transfer) = gate.release();
        let mut result = Ok(());
        if transfer.is_release() {
            let mut guard = entity.writer.lock().expect("writer entity poisoned");
            if let Some(mut dw) = guard.take() {
                result = dw.close();
            }
        }
        self.db.entity_closed();
        result.map(|_| transfer)
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
