//! Region-based control arbiter.
//!
//! A controller maps overlapping time ranges to *regions*. Each region holds
//! an entity (the controlled resource) and an ordered set of *gates*, one per
//! subject. At most one gate is *current*; the current gate is the one with
//! the highest authority, ties broken by earliest arrival (lowest position).
//! Every change of the current gate is reported as a [`Transfer`].
//!
//! Lock order is always controller region list before region state; gates
//! keep critical sections short and never perform I/O under a lock.

use crate::channel::ChannelKey;
use crate::control::{Authority, Concurrency, State, Subject, Transfer};
use crate::error::{FennecError, Result};
use crate::telem::TimeRange;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// A resource that can be placed under control. Entities are handed back on
/// successful authorization, so they are cheaply cloneable handles.
pub trait Controlled: Clone {
    /// Key of the channel the entity belongs to.
    fn channel_key(&self) -> ChannelKey;
}

/// Configuration for opening a gate on a controller.
#[derive(Debug, Clone, Default)]
pub struct GateConfig {
    /// Time range the gate claims. Subsequent opens with overlapping ranges
    /// bind to the same region.
    pub time_range: TimeRange,
    /// Authority of the gate over the entity.
    pub authority: Authority,
    /// Identity of the gate, unique per region.
    pub subject: Subject,
}

impl GateConfig {
    fn validate(&self) -> Result<()> {
        if self.subject.key.is_empty() {
            return Err(FennecError::validation("gate subject key must be set"));
        }
        if !self.time_range.valid() {
            return Err(FennecError::validation(
                "gate time range start must not exceed end",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct GateEntry {
    subject: Subject,
    authority: Authority,
    position: i64,
}

struct RegionState<E> {
    time_range: TimeRange,
    entity: E,
    counter: i64,
    curr: Option<i64>,
    gates: HashMap<i64, GateEntry>,
}

struct RegionCell<E> {
    state: Mutex<RegionState<E>>,
}

struct Inner<E> {
    concurrency: Concurrency,
    regions: Mutex<Vec<Arc<RegionCell<E>>>>,
}

/// Concurrency arbiter over one channel's time axis.
pub struct Controller<E: Controlled> {
    inner: Arc<Inner<E>>,
}

impl<E: Controlled> std::fmt::Debug for Controller<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("concurrency", &self.inner.concurrency)
            .finish_non_exhaustive()
    }
}

/// A subject's claim over a control region. Obtained from
/// [`Controller::open_gate`] and friends; must be released when done.
pub struct Gate<E: Controlled> {
    inner: Arc<Inner<E>>,
    region: Arc<RegionCell<E>>,
    position: i64,
    subject: Subject,
    concurrency: Concurrency,
}

impl<E: Controlled> std::fmt::Debug for Gate<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gate")
            .field("subject", &self.subject)
            .field("position", &self.position)
            .finish_non_exhaustive()
    }
}

impl<E: Controlled> RegionState<E> {
    fn state_of(&self, entry: &GateEntry) -> State {
        State {
            subject: entry.subject.clone(),
            resource: self.entity.channel_key(),
            authority: entry.authority,
        }
    }

    fn curr_entry(&self) -> Option<&GateEntry> {
        self.curr.and_then(|pos| self.gates.get(&pos))
    }

    /// Elects the gate with the highest authority, ties broken by lowest
    /// position. Only meaningful while at least one gate is present.
    fn elect(&self) -> Option<i64> {
        let mut best: Option<&GateEntry> = None;
        for entry in self.gates.values() {
            let better = match best {
                None => true,
                Some(b) => {
                    entry.authority > b.authority
                        || (entry.authority == b.authority && entry.position < b.position)
                }
            };
            if better {
                best = Some(entry);
            }
        }
        best.map(|e| e.position)
    }

    fn open(&mut self, cfg: &GateConfig) -> Result<(i64, Transfer)> {
        for entry in self.gates.values() {
            if entry.subject.key == cfg.subject.key {
                return Err(FennecError::Validation(format!(
                    "gate with subject key {} already exists in region {}",
                    cfg.subject.key, self.time_range
                )));
            }
        }
        let position = self.counter;
        self.counter += 1;
        let entry = GateEntry {
            subject: cfg.subject.clone(),
            authority: cfg.authority,
            position,
        };
        let mut transfer = Transfer::default();
        // A new gate takes control only from a strictly lower authority;
        // equal authority keeps the incumbent.
        let preempts = match self.curr_entry() {
            None => true,
            Some(curr) => cfg.authority > curr.authority,
        };
        if preempts {
            transfer.from = self.curr_entry().map(|c| self.state_of(c));
            transfer.to = Some(self.state_of(&entry));
            self.curr = Some(position);
        }
        self.gates.insert(position, entry);
        Ok((position, transfer))
    }

    fn update(&mut self, position: i64, authority: Authority) -> Transfer {
        let Some(entry) = self.gates.get_mut(&position) else {
            return Transfer::default();
        };
        entry.authority = authority;
        let mut transfer = Transfer::default();
        if self.curr == Some(position) {
            let me = self.gates.get(&position).expect("gate present");
            transfer.from = Some(self.state_of(me));
            // Still the best? Re-elect against the updated authority.
            let winner = self.elect().expect("non-empty region");
            self.curr = Some(winner);
            let winner_entry = self.gates.get(&winner).expect("gate present");
            transfer.to = Some(self.state_of(winner_entry));
            return transfer;
        }
        // Not in control: check whether the new authority outranks the
        // incumbent.
        let me = self.gates.get(&position).expect("gate present");
        let curr = self.curr_entry().expect("non-empty region has a current");
        if me.authority > curr.authority
            || (me.authority == curr.authority && me.position < curr.position)
        {
            transfer.from = Some(self.state_of(curr));
            transfer.to = Some(self.state_of(me));
            self.curr = Some(position);
        }
        transfer
    }

    /// Removes a gate; returns the transfer and whether the region emptied.
    fn release(&mut self, position: i64) -> (Transfer, bool) {
        let Some(removed) = self.gates.remove(&position) else {
            return (Transfer::default(), self.gates.is_empty());
        };
        let mut transfer = Transfer::default();
        if self.gates.is_empty() {
            transfer.from = Some(self.state_of(&removed));
            return (transfer, true);
        }
        if self.curr == Some(position) {
            transfer.from = Some(self.state_of(&removed));
            let winner = self.elect().expect("non-empty region");
            self.curr = Some(winner);
            let winner_entry = self.gates.get(&winner).expect("gate present");
            transfer.to = Some(self.state_of(winner_entry));
        }
        (transfer, false)
    }
}

impl<E: Controlled> Controller<E> {
    /// Creates a controller with the given concurrency policy.
    pub fn new(concurrency: Concurrency) -> Self {
        Self {
            inner: Arc::new(Inner {
                concurrency,
                regions: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Opens a gate on the region overlapping `cfg.time_range`. Returns
    /// `None` when no region overlaps, so the caller may register one and
    /// re-open atomically via [`Controller::open_gate_and_maybe_register`].
    pub fn open_gate(&self, cfg: GateConfig) -> Result<Option<(Gate<E>, Transfer)>> {
        cfg.validate()?;
        let regions = self.inner.regions.lock().expect("controller lock poisoned");
        self.open_on_overlap(&regions, &cfg)
    }

    fn open_on_overlap(
        &self,
        regions: &[Arc<RegionCell<E>>],
        cfg: &GateConfig,
    ) -> Result<Option<(Gate<E>, Transfer)>> {
        let mut matched: Option<&Arc<RegionCell<E>>> = None;
        for cell in regions.iter() {
            let state = cell.state.lock().expect("region lock poisoned");
            if state.time_range.overlaps_with(&cfg.time_range) {
                drop(state);
                if matched.is_some() {
                    return Err(FennecError::Validation(format!(
                        "encountered multiple control regions for time range {}",
                        cfg.time_range
                    )));
                }
                matched = Some(cell);
            }
        }
        let Some(cell) = matched else { return Ok(None) };
        let mut state = cell.state.lock().expect("region lock poisoned");
        let (position, transfer) = state.open(cfg)?;
        drop(state);
        Ok(Some((
            Gate {
                inner: Arc::clone(&self.inner),
                region: Arc::clone(cell),
                position,
                subject: cfg.subject.clone(),
                concurrency: self.inner.concurrency,
            },
            transfer,
        )))
    }

    /// Registers a region for `time_range` holding `entity`. Fails when the
    /// range overlaps an existing region.
    pub fn register(&self, time_range: TimeRange, entity: E) -> Result<()> {
        let mut regions = self.inner.regions.lock().expect("controller lock poisoned");
        self.insert_region(&mut regions, time_range, entity)?;
        Ok(())
    }

    fn insert_region(
        &self,
        regions: &mut Vec<Arc<RegionCell<E>>>,
        time_range: TimeRange,
        entity: E,
    ) -> Result<Arc<RegionCell<E>>> {
        let mut insert_at = regions.len();
        for (i, cell) in regions.iter().enumerate() {
            let state = cell.state.lock().expect("region lock poisoned");
            if state.time_range.overlaps_with(&time_range) {
                return Err(FennecError::Validation(format!(
                    "entity already registered for time range {time_range}"
                )));
            }
            if state.time_range.start > time_range.start && insert_at == regions.len() {
                insert_at = i;
            }
        }
        let cell = Arc::new(RegionCell {
            state: Mutex::new(RegionState {
                time_range,
                entity,
                counter: 0,
                curr: None,
                gates: HashMap::new(),
            }),
        });
        regions.insert(insert_at, Arc::clone(&cell));
        Ok(cell)
    }

    /// Opens a gate on the overlapping region, or registers a fresh region
    /// built from `make_entity` and opens on it, atomically.
    pub fn open_gate_and_maybe_register<F>(
        &self,
        cfg: GateConfig,
        make_entity: F,
    ) -> Result<(Gate<E>, Transfer)>
    where
        F: FnOnce() -> Result<E>,
    {
        cfg.validate()?;
        let mut regions = self.inner.regions.lock().expect("controller lock poisoned");
        if let Some(found) = self.open_on_overlap(&regions, &cfg)? {
            return Ok(found);
        }
        let entity = make_entity()?;
        let cell = self.insert_region(&mut regions, cfg.time_range, entity)?;
        let mut state = cell.state.lock().expect("region lock poisoned");
        let (position, transfer) = state.open(&cfg)?;
        drop(state);
        Ok((
            Gate {
                inner: Arc::clone(&self.inner),
                region: cell,
                position,
                subject: cfg.subject,
                concurrency: self.inner.concurrency,
            },
            transfer,
        ))
    }

    /// Control state of the earliest region, or `None` when nothing is under
    /// control.
    pub fn leading_state(&self) -> Option<State> {
        let regions = self.inner.regions.lock().expect("controller lock poisoned");
        let first = regions.first()?;
        let state = first.state.lock().expect("region lock poisoned");
        let curr = state.curr_entry()?;
        Some(state.state_of(curr))
    }
}

impl<E: Controlled> Gate<E> {
    /// Authorizes the gate's access to the entity.
    ///
    /// Exclusive regions authorize only the current gate. Shared regions
    /// authorize any gate whose authority is at least the current gate's.
    pub fn authorize(&self) -> Result<E> {
        let state = self.region.state.lock().expect("region lock poisoned");
        let ok = match self.concurrency {
            Concurrency::Exclusive => state.curr == Some(self.position),
            Concurrency::Shared => match state.curr_entry() {
                Some(curr) => {
                    let me = state.gates.get(&self.position);
                    me.map(|g| g.authority >= curr.authority).unwrap_or(false)
                }
                None => false,
            },
        };
        if !ok {
            return Err(FennecError::Unauthorized {
                subject: self.subject.display_name().to_string(),
                channel: state.entity.channel_key(),
            });
        }
        Ok(state.entity.clone())
    }

    /// Snapshot of the gate's current control standing.
    pub fn state(&self) -> State {
        let state = self.region.state.lock().expect("region lock poisoned");
        let entry = state.gates.get(&self.position).expect("gate present");
        state.state_of(entry)
    }

    /// Changes the gate's authority, returning any resulting transfer.
    pub fn set_authority(&self, authority: Authority) -> Transfer {
        let mut state = self.region.state.lock().expect("region lock poisoned");
        state.update(self.position, authority)
    }

    /// Releases the gate. When it was the last gate in its region, the
    /// region dissolves and the entity is handed back with a release
    /// transfer; otherwise control passes to the next best gate.
    pub fn release(self) -> (E, Transfer) {
        // Lock order: region list first, then region state, matching the
        // open paths.
        let mut regions = self.inner.regions.lock().expect("controller lock poisoned");
        let mut state = self.region.state.lock().expect("region lock poisoned");
        let (transfer, emptied) = state.release(self.position);
        let entity = state.entity.clone();
        if emptied {
            drop(state);
            regions.retain(|cell| !Arc::ptr_eq(cell, &self.region));
        }
        (entity, transfer)
    }
}
