//! Control primitives: authorities, subjects, and transfer events.
//!
//! Write access to a channel is arbitrated by numeric authority. Higher
//! authority outranks lower; ties are broken by arrival order. Changes in
//! control are reported as [`Transfer`] events.

use crate::channel::ChannelKey;
use serde::{Deserialize, Serialize};

/// Numeric control precedence. Higher outranks lower.
pub type Authority = u8;

/// The highest possible authority. Used by internal operations (deletes) to
/// fence out concurrent writers.
pub const ABSOLUTE_AUTHORITY: Authority = Authority::MAX;

/// Identity of a control-holding party.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Subject {
    /// Unique key of the subject within its region.
    pub key: String,
    /// Human-readable name, used in error messages.
    pub name: String,
}

impl Subject {
    /// Creates a subject keyed by `key` with an empty name.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            name: String::new(),
        }
    }

    /// The name when set, otherwise the key.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.key
        } else {
            &self.name
        }
    }
}

/// Concurrency policy of a control region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Concurrency {
    /// At most one gate is authorized at a time.
    #[default]
    Exclusive,
    /// All gates with authority at least the incumbent's are authorized.
    /// Permitted only on virtual channels.
    Shared,
}

/// A snapshot of one gate's control standing over a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct State {
    /// The controlling subject.
    pub subject: Subject,
    /// The controlled channel.
    pub resource: ChannelKey,
    /// Authority of the subject at snapshot time.
    pub authority: Authority,
}

/// A change in which gate controls a region.
///
/// `from == None` means the region was previously uncontrolled (an acquire);
/// `to == None` means the last gate released and the region dissolved.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Transfer {
    /// State of the outgoing controller, if any.
    pub from: Option<State>,
    /// State of the incoming controller, if any.
    pub to: Option<State>,
}

impl Transfer {
    /// Returns true when control changed hands in any way.
    pub fn occurred(&self) -> bool {
        self.from.is_some() || self.to.is_some()
    }

    /// Returns true when the last gate released the region.
    pub fn is_release(&self) -> bool {
        self.from.is_some() && self.to.is_none()
    }

    /// Returns true when a previously uncontrolled region was acquired.
    pub fn is_acquire(&self) -> bool {
        self.from.is_none() && self.to.is_some()
    }
}
