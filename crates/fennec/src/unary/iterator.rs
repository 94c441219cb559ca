//! Sample iterator for one channel.

use crate::domain;
use crate::error::{FennecError, Result};
use crate::index::Index;
use crate::telem::{Series, TimeRange, TimeSpan, TimeStamp};
use crate::unary::Db;
use std::sync::Arc;

/// Iterates a channel's samples in time order, one series per call to
/// [`Iterator::next`]. The iterator wraps a domain iterator with the
/// channel's sample-width knowledge, so values are frames of samples rather
/// than raw bytes.
///
/// Like the domain iterator it wraps, it is not snapshot-isolated:
/// concurrent writes and deletes may shift positions underneath it.
#[derive(Debug)]
pub struct Iterator {
    db: Arc<Db>,
    inner: domain::Iterator,
    idx: Arc<dyn Index>,
    bounds: TimeRange,
    /// Next unread instant within bounds.
    cursor: TimeStamp,
    series: Option<Series>,
    closed: bool,
}

impl Iterator {
    pub(crate) fn open(db: Arc<Db>, bounds: TimeRange) -> Result<Self> {
        let idx = db.index()?;
        let inner = db.domain.new_iterator(bounds);
        db.entity_opened();
        Ok(Self {
            cursor: bounds.start,
            inner,
            idx,
            bounds,
            db,
            series: None,
            closed: false,
        })
    }

    /// The iterator's bounds.
    pub fn bounds(&self) -> TimeRange {
        self.bounds
    }

    /// Seeks to the first domain within bounds. Returns false when the
    /// bounds hold no data.
    pub fn seek_first(&mut self) -> bool {
        self.cursor = self.bounds.start;
        self.series = None;
        self.inner.seek_first()
    }

    /// Reads the next run of samples covering at most `span` from the
    /// cursor. Returns false once the bounds are exhausted.
    pub fn next(&mut self, span: TimeSpan) -> Result<bool> {
        if self.closed {
            return Err(FennecError::EntityClosed("unary.iterator"));
        }
        if !self.inner.valid() {
            self.series = None;
            return Ok(false);
        }
        // A span covering the rest of the bounds clamps to their end; the
        // subtraction form avoids overflowing `cursor + span`.
        let window_end = if span >= self.bounds.end.saturating_sub(self.cursor) {
            self.bounds.end
        } else {
            self.cursor + span
        };
        let window = TimeRange::new(self.cursor, window_end);
        if window.is_empty() {
            self.series = None;
            return Ok(false);
        }
        let domain_range = self.inner.time_range();
        if window.end <= domain_range.start {
            // The span stops short of the next stored domain.
            self.cursor = window.end;
            self.series = None;
            return Ok(false);
        }
        let read_range = window.intersection(&domain_range);
        let series = self.read_slice(read_range)?;
        self.cursor = read_range.end;
        if read_range.end >= domain_range.end {
            self.inner.next();
        }
        self.series = Some(series);
        Ok(true)
    }

    /// The series produced by the last successful [`Iterator::next`].
    pub fn value(&self) -> Option<&Series> {
        self.series.as_ref()
    }

    /// Reads the samples of the current domain that fall inside
    /// `read_range`, trimming partial overlaps through the channel's index.
    fn read_slice(&mut self, read_range: TimeRange) -> Result<Series> {
        let density = self.db.channel.density() as i64;
        let domain_range = self.inner.time_range();
        let total = self.inner.len() / density;
        let start_idx = if read_range.start <= domain_range.start {
            0
        } else {
            self.idx
                .distance(
                    TimeRange::new(domain_range.start, read_range.start),
                    false,
                )?
                .upper
        };
        let trailing = if read_range.end >= domain_range.end {
            0
        } else {
            self.idx
                .distance(TimeRange::new(read_range.end, domain_range.end), false)?
                .lower
                + 1
        };
        let count = (total - start_idx - trailing).max(0);
        let mut series = Series {
            data_type: self.db.channel.data_type,
            time_range: read_range,
            data: Vec::new(),
        };
        if count > 0 {
            let mut reader = self.inner.new_reader()?;
            let mut buf = vec![0u8; (count * density) as usize];
            reader.read_at(&mut buf, start_idx * density)?;
            reader.close()?;
            series.data = buf;
        }
        Ok(series)
    }

    /// Closes the iterator, releasing its slot on the channel.
    pub fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.db.entity_closed();
        }
        Ok(())
    }
}

impl Drop for Iterator {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
