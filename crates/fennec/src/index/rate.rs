//! Virtual index derived from a constant sample rate.

use crate::error::{FennecError, Result};
use crate::index::{Approximation, Index};
use crate::telem::{TimeRange, TimeStamp, SECOND};

/// Resolves timestamps for channels sampled at a fixed rate. No data is
/// consulted: positions follow directly from `start + n / rate`.
#[derive(Debug, Clone, Copy)]
pub struct Rate {
    /// Sample rate in Hz.
    pub rate: f64,
}

impl Rate {
    /// Creates a rate index. The rate must be positive.
    pub fn new(rate: f64) -> Self {
        Self { rate }
    }

    /// Nanoseconds between consecutive samples.
    fn period(&self) -> f64 {
        SECOND as f64 / self.rate
    }
}

impl Index for Rate {
    fn distance(&self, tr: TimeRange, _continuous: bool) -> Result<Approximation> {
        if !tr.valid() {
            return Err(FennecError::validation(
                "distance range start must not exceed end",
            ));
        }
        if tr.is_empty() {
            return Ok(Approximation::exactly(0));
        }
        // The sample grid is anchored at the enclosing domain's start, which
        // this index cannot see, so the count can land on either side of a
        // grid line: `upper` assumes the range ends just past a sample,
        // `lower` just short of one.
        let upper = (tr.span() as f64 * self.rate / SECOND as f64).ceil() as i64;
        Ok(Approximation::between(upper - 1, upper))
    }

    fn stamp(&self, reference: TimeStamp, offset: i64, _continuous: bool) -> Result<Approximation> {
        let span = (offset as f64 * self.period()).round() as i64;
        Ok(Approximation::exactly(reference + span))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_spans_grid_boundaries() {
        let idx = Rate::new(1.0);
        // Exactly three periods: between 2 and 3 samples.
        let a = idx
            .distance(TimeRange::new(16 * SECOND + 1, 19 * SECOND + 1), false)
            .unwrap();
        assert_eq!((a.lower, a.upper), (2, 3));
        // Just past two periods: between 2 and 3 samples.
        let a = idx
            .distance(TimeRange::new(10 * SECOND, 12 * SECOND + 1), false)
            .unwrap();
        assert_eq!((a.lower, a.upper), (2, 3));
        // Empty span resolves to zero.
        let a = idx
            .distance(TimeRange::new(SECOND, SECOND), false)
            .unwrap();
        assert_eq!((a.lower, a.upper), (0, 0));
    }

    #[test]
    fn test_stamp_is_exact() {
        let idx = Rate::new(4.0);
        let a = idx.stamp(10 * SECOND, 8, false).unwrap();
        assert!(a.exact());
        assert_eq!(a.lower, 12 * SECOND);
    }
}
