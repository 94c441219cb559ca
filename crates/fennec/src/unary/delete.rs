//! Time-range deletion and garbage collection entry points for a channel.

use crate::control::{Subject, ABSOLUTE_AUTHORITY};
use crate::controller::GateConfig;
use crate::error::{FennecError, Result};
use crate::telem::TimeRange;
use crate::unary::{Db, WriterEntity};
use std::sync::Arc;

impl Db {
    /// Deletes every sample in `tr`.
    ///
    /// An absolute-authority exclusive gate is opened over the range to
    /// fence out concurrent writers; an incumbent absolute writer refuses
    /// the delete with `Unauthorized`. The range is snapped to pointer
    /// edges where its endpoints fall outside stored data, endpoints inside
    /// a pointer split it, and the freed bytes become tombstones awaiting
    /// collection. Deleting an empty or fully out-of-range interval is a
    /// no-op.
    pub fn delete(self: &Arc<Self>, tr: TimeRange) -> Result<()> {
        self.check_open()?;
        if !tr.valid() {
            return Err(FennecError::Validation(format!(
                "delete start {} cannot be after delete end {}",
                tr.start, tr.end
            )));
        }
        if tr.is_empty() {
            return Ok(());
        }
        let channel_key = self.channel.key;
        let (gate, _) = self.controller.open_gate_and_maybe_register(
            GateConfig {
                time_range: tr,
                authority: ABSOLUTE_AUTHORITY,
                subject: Subject::new(self.next_internal_subject()),
            },
            || Ok(WriterEntity::new(channel_key, None)),
        )?;
        let result = match gate.authorize() {
            Ok(_) => self.delete_inner(tr),
            Err(e) => Err(e),
        };
        let _ = gate.release();
        result
    }

    fn delete_inner(self: &Arc<Self>, tr: TimeRange) -> Result<()> {
        let mut tr = tr;
        let idx = self.index()?;
        let density = self.channel.density() as i64;
        let mut iter = self.domain.new_iterator(tr);

        if !iter.seek_first() {
            // No stored domain overlaps the range: nothing to delete.
            return Ok(());
        }
        let first = iter.time_range();
        let start_offset = if first.start >= tr.start {
            tr.start = first.start;
            0
        } else {
            idx.distance(TimeRange::new(first.start, tr.start), false)?
                .upper
        };

        if !iter.seek_last() {
            return Ok(());
        }
        let last = iter.time_range();
        let end_offset = if last.end <= tr.end {
            tr.end = last.end;
            0
        } else {
            // The lower bound lands on the last sample inside the surviving
            // suffix; one more accounts for the first sample out of it.
            idx.distance(TimeRange::new(tr.end, last.end), false)?.lower + 1
        };

        self.domain
            .delete(start_offset * density, end_offset * density, tr)
    }

    /// Runs a garbage-collection pass over the channel's segment files.
    pub fn garbage_collect(&self) -> Result<()> {
        self.check_open()?;
        self.domain.garbage_collect()
    }
}
