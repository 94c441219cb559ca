//! Index backed by a sibling domain database of stored timestamps.

use crate::domain;
use crate::domain::Reader;
use crate::error::{FennecError, Result};
use crate::index::{Approximation, Index};
use crate::telem::{TimeRange, TimeStamp, TIME_STAMP_MAX};
use std::sync::Arc;

const STAMP_SIZE: i64 = 8;

/// Resolves timestamps by binary-searching 64-bit stamps stored in a domain
/// database. Lookups within a single extent are exact when the endpoint
/// equals a stored stamp; cross-extent lookups sum whole-extent counts with
/// endpoint uncertainty contributed by the searches.
#[derive(Debug, Clone)]
pub struct Domain {
    db: Arc<domain::Db>,
}

impl Domain {
    /// Creates an index over the timestamps stored in `db`.
    pub fn new(db: Arc<domain::Db>) -> Self {
        Self { db }
    }
}

/// Approximates the number of stamps before `ts` in the extent behind `r`.
/// Exact when `ts` is itself stored.
fn search(ts: TimeStamp, r: &mut Reader) -> Result<Approximation> {
    let mut start: i64 = 0;
    let mut end: i64 = r.len() / STAMP_SIZE - 1;
    while start <= end {
        let mid = (start + end) / 2;
        let mid_ts = read_stamp(r, mid * STAMP_SIZE)?;
        if ts == mid_ts {
            return Ok(Approximation::exactly(mid));
        } else if mid_ts < ts {
            start = mid + 1;
        } else {
            end = mid - 1;
        }
    }
    Ok(Approximation::between(end, end + 1))
}

fn read_stamp(r: &mut Reader, byte_offset: i64) -> Result<TimeStamp> {
    let mut buf = [0u8; 8];
    r.read_at(&mut buf, byte_offset)?;
    Ok(TimeStamp::from_le_bytes(buf))
}

/// Extends the current extent through every immediately continuous
/// successor (one extent's end equal to the next one's start), returning
/// the combined bounds and byte length. Leaves the iterator past the run.
fn resolve_effective_domain(iter: &mut domain::Iterator) -> (TimeRange, i64) {
    let mut bounds = iter.time_range();
    let mut len = iter.len();
    loop {
        let current_end = iter.time_range().end;
        if !iter.next() {
            return (bounds, len);
        }
        if iter.time_range().start != current_end {
            return (bounds, len);
        }
        bounds.end = iter.time_range().end;
        len += iter.len();
    }
}

impl Index for Domain {
    fn distance(&self, tr: TimeRange, continuous: bool) -> Result<Approximation> {
        let mut iter = self.db.new_iterator(tr);
        if !iter.seek_first() || (continuous && !iter.time_range().contains_range(&tr)) {
            return Err(FennecError::Discontinuous(tr));
        }
        if tr.is_empty() {
            return Ok(Approximation::exactly(0));
        }
        let mut r = iter.new_reader()?;
        let start_approx = search(tr.start, &mut r)?;

        if iter.time_range().contains_stamp(tr.end) || tr.end == iter.time_range().end {
            let end_approx = search(tr.end, &mut r)?;
            return Ok(Approximation::between(
                end_approx.lower - start_approx.upper,
                end_approx.upper - start_approx.lower,
            ));
        }
        if continuous {
            return Err(FennecError::Discontinuous(tr));
        }

        // The end stamp lies beyond the first extent: walk forward summing
        // whole-extent counts until the extent containing it.
        let first_len = r.len() / STAMP_SIZE;
        let start_to_first_end = Approximation::between(
            first_len - start_approx.upper,
            first_len - start_approx.lower,
        );
        let mut gap: i64 = 0;
        loop {
            if !iter.next() || tr.end <= iter.time_range().start {
                // Out of data before reaching the end stamp: every remaining
                // sample counts.
                return Ok(Approximation::between(
                    start_to_first_end.lower + gap,
                    start_to_first_end.upper + gap,
                ));
            }
            if iter.time_range().contains_stamp(tr.end) || tr.end == iter.time_range().end {
                let mut er = iter.new_reader()?;
                let end_approx = search(tr.end, &mut er)?;
                return Ok(Approximation::between(
                    start_to_first_end.lower + gap + end_approx.lower,
                    start_to_first_end.upper + gap + end_approx.upper,
                ));
            }
            gap += iter.len() / STAMP_SIZE;
        }
    }

    fn stamp(&self, reference: TimeStamp, offset: i64, continuous: bool) -> Result<Approximation> {
        let query = TimeRange::new(reference, reference);
        if offset < 0 {
            return Err(FennecError::validation("stamp offset must be non-negative"));
        }
        let mut iter = self
            .db
            .new_iterator(TimeRange::new(reference, TIME_STAMP_MAX));
        if !iter.seek_first() {
            return Err(FennecError::Discontinuous(query));
        }
        let (effective_bounds, effective_len_bytes) = resolve_effective_domain(&mut iter);
        let effective_len = effective_len_bytes / STAMP_SIZE;
        if !effective_bounds.contains_stamp(reference)
            || (continuous && offset >= effective_len)
        {
            return Err(FennecError::Discontinuous(query));
        }
        if offset == 0 {
            return Ok(Approximation::exactly(reference));
        }

        if !iter.seek_first() {
            return Err(FennecError::Discontinuous(query));
        }
        let mut r = iter.new_reader()?;
        let start_approx = search(reference, &mut r)?;
        let mut end_offset = start_approx.upper + offset;

        if continuous {
            // With an inexact start, the last sample cannot bound the target
            // from above, so the reach shrinks by one.
            let limit = if start_approx.exact() {
                effective_len
            } else {
                effective_len - 1
            };
            if start_approx.lower + offset >= limit {
                return Err(FennecError::Discontinuous(query));
            }
        }

        // Walk extents until the one holding the target sample.
        let mut covered = iter.len() / STAMP_SIZE;
        if end_offset >= covered {
            loop {
                if !iter.next() {
                    if continuous {
                        return Err(FennecError::Discontinuous(query));
                    }
                    return Ok(Approximation::between(
                        iter.time_range().end,
                        TIME_STAMP_MAX,
                    ));
                }
                let this_len = iter.len() / STAMP_SIZE;
                covered += this_len;
                if end_offset < covered {
                    r = iter.new_reader()?;
                    end_offset -= covered - this_len;
                    break;
                }
            }
        }

        let upper_ts = read_stamp(&mut r, end_offset * STAMP_SIZE)?;
        let spread = start_approx.upper - start_approx.lower;
        let lower_index = end_offset - spread;
        if lower_index >= 0 {
            let lower_ts = read_stamp(&mut r, lower_index * STAMP_SIZE)?;
            return Ok(Approximation::between(lower_ts, upper_ts));
        }
        // The lower bound sits in the previous extent.
        if !iter.prev() {
            return Err(FennecError::Discontinuous(query));
        }
        let mut pr = iter.new_reader()?;
        let pr_len = pr.len();
        let lower_ts = read_stamp(&mut pr, pr_len + lower_index * STAMP_SIZE)?;
        Ok(Approximation::between(lower_ts, upper_ts))
    }
}
