//! Virtual channels: control and relay participation without persistence.

use crate::channel::{Channel, ChannelKey};
use crate::control::Transfer;
use crate::controller::{Controlled, Controller, Gate, GateConfig};
use crate::error::{FennecError, Result};
use crate::telem::{Series, TimeRange, TIME_STAMP_MAX};
use crate::unary::WriterConfig;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone)]
struct ControlEntity {
    channel_key: ChannelKey,
}

impl Controlled for ControlEntity {
    fn channel_key(&self) -> ChannelKey {
        self.channel_key
    }
}

/// A gateway-less channel whose data is never persisted. Virtual channels
/// exist to arbitrate control and to relay live frames; every write is
/// validated and authorized, then dropped.
#[derive(Debug)]
pub struct VirtualDb {
    /// Descriptor of the virtual channel.
    pub channel: Channel,
    controller: Controller<ControlEntity>,
    open_writers: AtomicI32,
    closed: AtomicBool,
}

/// A writer over a virtual channel. Participates in control arbitration
/// exactly like a unary writer, but persists nothing.
#[derive(Debug)]
pub struct VirtualWriter {
    db: Arc<VirtualDb>,
    gate: Option<Gate<ControlEntity>>,
    closed: bool,
}

impl VirtualDb {
    /// Opens the control-only database for a virtual channel.
    pub fn open(channel: Channel) -> Result<Arc<Self>> {
        if !channel.is_virtual {
            return Err(FennecError::validation("channel is not virtual"));
        }
        channel.validate()?;
        Ok(Arc::new(Self {
            controller: Controller::new(channel.concurrency),
            channel,
            open_writers: AtomicI32::new(0),
            closed: AtomicBool::new(false),
        }))
    }

    /// Opens a control gate for a writer on the channel.
    pub fn open_writer(self: &Arc<Self>, cfg: &WriterConfig) -> Result<(VirtualWriter, Transfer)> {
        if self.closed.load(Ordering::Acquire) {
            return Err(FennecError::EntityClosed("virtual.db"));
        }
        if cfg.subject.key.is_empty() {
            return Err(FennecError::validation("writer subject key must be set"));
        }
        let channel_key = self.channel.key;
        let (gate, transfer) = self.controller.open_gate_and_maybe_register(
            GateConfig {
                time_range: TimeRange::new(cfg.start, cfg.end.unwrap_or(TIME_STAMP_MAX)),
                authority: cfg.authority,
                subject: cfg.subject.clone(),
            },
            || Ok(ControlEntity { channel_key }),
        )?;
        self.open_writers.fetch_add(1, Ordering::AcqRel);
        Ok((
            VirtualWriter {
                db: Arc::clone(self),
                gate: Some(gate),
                closed: false,
            },
            transfer,
        ))
    }

    /// The leading control state across the channel's regions.
    pub fn leading_control_state(&self) -> Option<crate::control::State> {
        self.controller.leading_state()
    }

    /// Number of writers currently open.
    pub fn open_writer_count(&self) -> i32 {
        self.open_writers.load(Ordering::Acquire)
    }

    /// Closes the database, refusing while writers are open.
    pub fn try_close(&self) -> Result<()> {
        let open = self.open_writer_count();
        if open > 0 {
            return Err(FennecError::Validation(format!(
                "cannot close channel {} because there are currently {} unclosed writers accessing it",
                self.channel.key, open
            )));
        }
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

impl VirtualWriter {
    /// Validates and authorizes a write. The samples are relayed, never
    /// stored.
    pub fn write(&mut self, series: &Series) -> Result<()> {
        if self.closed {
            return Err(FennecError::EntityClosed("virtual.writer"));
        }
        self.db.channel.validate_series(series)?;
        self.gate
            .as_ref()
            .expect("open writer holds a gate")
            .authorize()?;
        Ok(())
    }

    /// Changes the writer's control authority.
    pub fn set_authority(&self, authority: crate::control::Authority) -> Transfer {
        self.gate
            .as_ref()
            .expect("open writer holds a gate")
            .set_authority(authority)
    }

    /// Releases the writer's gate.
    pub fn close(&mut self) -> Result<Transfer> {
        if self.closed {
            return Ok(Transfer::default());
        }
        self.closed = true;
        let gate = self.gate.take().expect("open writer holds a gate");
        let (_, transfer) = gate.release();
        self.db.open_writers.fetch_sub(1, Ordering::AcqRel);
        Ok(transfer)
    }
}

impl Drop for VirtualWriter {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
