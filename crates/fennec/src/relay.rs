//! In-process fan-out of control transfer events.
//!
//! Subscribers hold a last-value slot per channel: publishing replaces any
//! unconsumed transfer for the same channel, so a slow subscriber observes
//! only the newest state rather than an ever-growing backlog.

use crate::channel::ChannelKey;
use crate::control::Transfer;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// A control transfer on one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlUpdate {
    /// The channel whose control changed.
    pub channel: ChannelKey,
    /// The transfer that occurred.
    pub transfer: Transfer,
}

#[derive(Debug, Default)]
struct Slot {
    latest: Mutex<HashMap<ChannelKey, Transfer>>,
    signal: Condvar,
}

/// Publishes control transfers to any number of subscribers.
#[derive(Debug, Default)]
pub struct Relay {
    subscribers: Mutex<Vec<Arc<Slot>>>,
}

/// A subscription to control transfers. See [`Relay::subscribe`].
#[derive(Debug)]
pub struct ControlUpdates {
    slot: Arc<Slot>,
}

impl Relay {
    /// Creates a relay with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new subscriber.
    pub fn subscribe(&self) -> ControlUpdates {
        let slot = Arc::new(Slot::default());
        self.subscribers
            .lock()
            .expect("relay lock poisoned")
            .push(Arc::clone(&slot));
        ControlUpdates { slot }
    }

    /// Publishes `transfer` for `channel` to every subscriber, superseding
    /// any unconsumed transfer for the same channel. Transfers in which no
    /// control changed hands are dropped.
    pub fn publish(&self, channel: ChannelKey, transfer: &Transfer) {
        if !transfer.occurred() {
            return;
        }
        let subscribers = self.subscribers.lock().expect("relay lock poisoned");
        for slot in subscribers.iter() {
            let mut latest = slot.latest.lock().expect("relay slot poisoned");
            latest.insert(channel, transfer.clone());
            drop(latest);
            slot.signal.notify_all();
        }
    }
}

impl ControlUpdates {
    /// Drains every pending update without blocking.
    pub fn poll(&self) -> Vec<ControlUpdate> {
        let mut latest = self.slot.latest.lock().expect("relay slot poisoned");
        latest
            .drain()
            .map(|(channel, transfer)| ControlUpdate { channel, transfer })
            .collect()
    }

    /// Waits up to `timeout` for at least one update, then drains.
    pub fn wait(&self, timeout: Duration) -> Vec<ControlUpdate> {
        let mut latest = self.slot.latest.lock().expect("relay slot poisoned");
        if latest.is_empty() {
            let (guard, _) = self
                .slot
                .signal
                .wait_timeout(latest, timeout)
                .expect("relay slot poisoned");
            latest = guard;
        }
        latest
            .drain()
            .map(|(channel, transfer)| ControlUpdate { channel, transfer })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{State, Subject};

    fn transfer_to(key: &str) -> Transfer {
        Transfer {
            from: None,
            to: Some(State {
                subject: Subject::new(key),
                resource: ChannelKey(1),
                authority: 1,
            }),
        }
    }

    #[test]
    fn test_newer_transfer_supersedes_older() {
        let relay = Relay::new();
        let sub = relay.subscribe();
        relay.publish(ChannelKey(1), &transfer_to("a"));
        relay.publish(ChannelKey(1), &transfer_to("b"));
        let updates = sub.poll();
        assert_eq!(updates.len(), 1);
        assert_eq!(
            updates[0].transfer.to.as_ref().unwrap().subject.key,
            "b"
        );
    }

    #[test]
    fn test_distinct_channels_kept_separate() {
        let relay = Relay::new();
        let sub = relay.subscribe();
        relay.publish(ChannelKey(1), &transfer_to("a"));
        relay.publish(ChannelKey(2), &transfer_to("b"));
        assert_eq!(sub.poll().len(), 2);
        assert!(sub.poll().is_empty());
    }

    #[test]
    fn test_empty_transfer_not_published() {
        let relay = Relay::new();
        let sub = relay.subscribe();
        relay.publish(ChannelKey(1), &Transfer::default());
        assert!(sub.poll().is_empty());
    }
}
