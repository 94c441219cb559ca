//! Error and Result types for Fennec engine operations.

use crate::channel::ChannelKey;
use crate::telem::TimeRange;
use std::io;
use thiserror::Error;

/// A convenience `Result` type for Fennec operations.
pub type Result<T> = std::result::Result<T, FennecError>;

/// The error type for engine operations.
#[derive(Debug, Error)]
pub enum FennecError {
    /// Invalid user input: bad configuration, non-monotonic index timestamps,
    /// mixed-width writes. Returned immediately with no state change.
    #[error("validation: {0}")]
    Validation(String),

    /// Requested channel was not found in the engine.
    #[error("channel {0} not found")]
    ChannelNotFound(ChannelKey),

    /// Requested time range holds no data.
    #[error("time range {0} not found")]
    RangeNotFound(TimeRange),

    /// A committed domain overlaps with an existing domain.
    #[error("write for {range} overlaps with existing data occupying {overlap}")]
    WriteConflict {
        /// Time range of the rejected commit.
        range: TimeRange,
        /// Intersection with the existing domain.
        overlap: TimeRange,
    },

    /// An index lookup could not be resolved within a continuous domain.
    #[error("discontinuity encountered resolving {0}")]
    Discontinuous(TimeRange),

    /// Operation attempted by a gate that is not currently authorized.
    #[error("{subject} does not have control authority over channel {channel}")]
    Unauthorized {
        /// Name (or key) of the rejected control subject.
        subject: String,
        /// Channel the subject attempted to operate on.
        channel: ChannelKey,
    },

    /// Operation on a database or writer that has been closed.
    #[error("{0} is already closed")]
    EntityClosed(&'static str),

    /// File descriptors, disk space, or another finite resource ran out.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Underlying I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl FennecError {
    /// Shorthand for a [`FennecError::Validation`] with a formatted message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Returns true if the error is a write conflict.
    pub fn is_write_conflict(&self) -> bool {
        matches!(self, Self::WriteConflict { .. })
    }

    /// Returns true if the error reports a discontinuous index lookup.
    pub fn is_discontinuous(&self) -> bool {
        matches!(self, Self::Discontinuous(_))
    }

    /// Returns true if the error reports an unauthorized control attempt.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized { .. })
    }
}
