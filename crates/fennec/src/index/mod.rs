//! Timestamp resolution strategies.
//!
//! An index answers two questions about a channel's samples:
//!
//! - [`Index::distance`]: approximately how many samples lie between the two
//!   ends of a time range.
//! - [`Index::stamp`]: approximately which timestamp is reached by advancing
//!   a number of samples from a reference stamp.
//!
//! Answers are [`Approximation`]s: exact when the endpoints land on stored
//! samples, otherwise bounded by the two nearest ones. When `continuous` is
//! requested and the query crosses a gap in the underlying data, the lookup
//! fails with a discontinuity error.

mod domain;
mod rate;

pub use domain::Domain;
pub use rate::Rate;

use crate::error::Result;
use crate::telem::{TimeRange, TimeStamp};

/// An inclusive `[lower, upper]` bound on a resolved value, either a sample
/// count or a timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Approximation {
    /// Smallest value consistent with the stored samples.
    pub lower: i64,
    /// Largest value consistent with the stored samples.
    pub upper: i64,
}

impl Approximation {
    /// An exact resolution.
    pub fn exactly(v: i64) -> Self {
        Self { lower: v, upper: v }
    }

    /// A bounded resolution.
    pub fn between(lower: i64, upper: i64) -> Self {
        Self { lower, upper }
    }

    /// Returns true when the bounds coincide.
    pub fn exact(&self) -> bool {
        self.lower == self.upper
    }
}

/// A channel's timestamp resolution strategy.
pub trait Index: Send + Sync + std::fmt::Debug {
    /// Approximates the number of samples between `tr.start` and `tr.end`.
    /// With `continuous`, fails when the range crosses a gap in the data.
    fn distance(&self, tr: TimeRange, continuous: bool) -> Result<Approximation>;

    /// Approximates the timestamp reached by advancing `offset` samples
    /// from `reference`. With `continuous`, fails when the target falls
    /// outside the contiguous run of data containing `reference`.
    fn stamp(&self, reference: TimeStamp, offset: i64, continuous: bool) -> Result<Approximation>;
}
