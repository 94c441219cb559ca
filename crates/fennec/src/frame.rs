//! Multi-channel frames: parallel vectors of channel keys and series.

use crate::channel::ChannelKey;
use crate::telem::Series;

/// A view over one or more channels' samples. `keys[i]` identifies the
/// channel that produced `series[i]`; a key may repeat when a read spans
/// several domains of the same channel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    /// Channel of each series, index-aligned with `series`.
    pub keys: Vec<ChannelKey>,
    /// Sample runs, index-aligned with `keys`.
    pub series: Vec<Series>,
}

impl Frame {
    /// Creates a frame from parallel key and series vectors.
    pub fn new(keys: Vec<ChannelKey>, series: Vec<Series>) -> Self {
        debug_assert_eq!(keys.len(), series.len());
        Self { keys, series }
    }

    /// An empty frame.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Creates a frame holding a single channel's series.
    pub fn unary(key: ChannelKey, series: Series) -> Self {
        Self {
            keys: vec![key],
            series: vec![series],
        }
    }

    /// Appends one series for `key`.
    pub fn push(&mut self, key: ChannelKey, series: Series) {
        self.keys.push(key);
        self.series.push(series);
    }

    /// Appends all entries of `other`.
    pub fn append(&mut self, other: Frame) {
        self.keys.extend(other.keys);
        self.series.extend(other.series);
    }

    /// Number of series in the frame.
    pub fn len(&self) -> usize {
        self.series.len()
    }

    /// Returns true when the frame holds no series.
    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    /// All series recorded for `key`, in frame order.
    pub fn get(&self, key: ChannelKey) -> Vec<&Series> {
        self.keys
            .iter()
            .zip(self.series.iter())
            .filter_map(|(k, s)| (*k == key).then_some(s))
            .collect()
    }
}
