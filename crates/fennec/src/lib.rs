//! Fennec - Alopex telemetry channel storage engine
//!
//! This crate provides the storage core of a time-series database for
//! hardware telemetry: ordered sequences of fixed-width, timestamped
//! samples persisted per channel, with concurrent writers and readers
//! arbitrated by numeric control authority and tombstone-based deletion
//! with background space reclamation.
//!
//! # Components
//!
//! - [`domain`]: append-oriented segmented file store mapping half-open
//!   time intervals to byte extents.
//! - [`index`]: timestamp resolution via a fixed sample rate or a sibling
//!   channel of stored timestamps.
//! - [`controller`]: region-based arbitration of write access, with
//!   transfer events when control changes hands.
//! - [`unary`] / [`virtual_db`]: per-channel engines layered on the above.
//! - [`db`]: the engine root composing channels into frame reads/writes.
//!
//! # Example
//!
//! ```rust,ignore
//! use alopex_fennec::{db, Channel, ChannelKey, DataType, Series};
//! use alopex_fennec::telem::{TimeRange, SECOND};
//!
//! let engine = db::open(path)?;
//! engine.create_channel(Channel {
//!     key: ChannelKey(1),
//!     data_type: DataType::Int64,
//!     rate: 1.0,
//!     ..Default::default()
//! })?;
//! engine.write_series(ChannelKey(1), 10 * SECOND, Series::from_i64s(&[1, 2, 3]))?;
//! let frame = engine.read(TimeRange::MAX, &[ChannelKey(1)])?;
//! ```

#![deny(missing_docs)]

pub mod channel;
pub mod control;
pub mod controller;
pub mod db;
pub mod domain;
pub mod error;
pub mod frame;
pub mod index;
pub mod meta;
pub mod relay;
pub mod telem;
pub mod unary;
pub mod virtual_db;

mod gc;

pub use channel::{Channel, ChannelKey};
pub use control::{Authority, Concurrency, State, Subject, Transfer, ABSOLUTE_AUTHORITY};
pub use db::{Db, FrameIteratorConfig, FrameWriterConfig, Options};
pub use error::{FennecError, Result};
pub use frame::Frame;
pub use telem::{DataType, Series, TimeRange, TimeSpan, TimeStamp};
