//! Channel descriptors and their structural validation.
//!
//! A channel is a named, typed sequence of time-ordered samples from one
//! source. Exactly one of `{is_index, index != 0, rate > 0, is_virtual}`
//! determines how sample timestamps are resolved.

use crate::control::Concurrency;
use crate::error::{FennecError, Result};
use crate::telem::DataType;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Globally unique 32-bit channel key: leaseholder node in the high 16 bits,
/// node-local key in the low 16. Leaseholder 0 marks a free (virtual) key.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ChannelKey(pub u32);

impl ChannelKey {
    /// Composes a key from a leaseholder node and a node-local key.
    pub fn new(leaseholder: u16, local: u16) -> Self {
        Self(((leaseholder as u32) << 16) | local as u32)
    }

    /// The leaseholder node component.
    pub fn leaseholder(&self) -> u16 {
        (self.0 >> 16) as u16
    }

    /// The node-local component.
    pub fn local(&self) -> u16 {
        self.0 as u16
    }

    /// Returns true for the zero key, used to mean "no channel".
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ChannelKey {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

/// Descriptor of one channel. Immutable after creation except for `name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    /// Globally unique key.
    pub key: ChannelKey,
    /// Mutable display name; not necessarily unique.
    #[serde(default)]
    pub name: String,
    /// Fixed-width sample type.
    pub data_type: DataType,
    /// True when the channel's values are monotonic timestamps indexing
    /// itself and sibling channels.
    #[serde(default)]
    pub is_index: bool,
    /// Key of the sibling index channel, or zero.
    #[serde(default)]
    pub index: ChannelKey,
    /// Fixed sample rate in Hz, or zero when indexed or virtual.
    #[serde(default)]
    pub rate: f64,
    /// True when the channel persists nothing and only participates in
    /// control and relay.
    #[serde(default)]
    pub is_virtual: bool,
    /// Concurrency policy for control regions over this channel.
    #[serde(default)]
    pub concurrency: Concurrency,
}

impl Default for Channel {
    fn default() -> Self {
        Self {
            key: ChannelKey::default(),
            name: String::new(),
            data_type: DataType::Unknown,
            is_index: false,
            index: ChannelKey::default(),
            rate: 0.0,
            is_virtual: false,
            concurrency: Concurrency::Exclusive,
        }
    }
}

impl Channel {
    /// Validates the descriptor in isolation. Cross-channel rules (index
    /// existence, key collisions) are enforced by the engine at creation.
    pub fn validate(&self) -> Result<()> {
        if self.data_type == DataType::Unknown {
            return Err(FennecError::validation("data type must be set"));
        }
        if self.is_virtual {
            if self.is_index {
                return Err(FennecError::validation(
                    "virtual channel cannot be an index",
                ));
            }
            if self.rate > 0.0 {
                return Err(FennecError::validation(
                    "virtual channel cannot have a rate",
                ));
            }
            if !self.index.is_zero() {
                return Err(FennecError::validation("virtual channel cannot be indexed"));
            }
            return Ok(());
        }
        if self.concurrency == Concurrency::Shared {
            return Err(FennecError::validation(
                "shared control concurrency is only allowed on virtual channels",
            ));
        }
        if self.is_index {
            if !self.data_type.is_timestamp() {
                return Err(FennecError::validation(
                    "index channel must be of type timestamp",
                ));
            }
            if !self.index.is_zero() && self.index != self.key {
                return Err(FennecError::validation(
                    "index channel cannot be indexed by another channel",
                ));
            }
            return Ok(());
        }
        if self.index.is_zero() && self.rate <= 0.0 {
            return Err(FennecError::validation("rate must be positive"));
        }
        Ok(())
    }

    /// Validates that `series` may be written to this channel.
    pub fn validate_series(&self, series: &crate::telem::Series) -> Result<()> {
        if series.data_type != self.data_type {
            return Err(FennecError::Validation(format!(
                "invalid data type {} for channel {} expecting {}",
                series.data_type, self.key, self.data_type
            )));
        }
        Ok(())
    }

    /// Bytes per sample for this channel's data type.
    pub fn density(&self) -> u32 {
        self.data_type.density()
    }
}
