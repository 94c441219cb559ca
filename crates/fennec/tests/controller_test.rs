//! Integration tests for the control arbiter's public surface.

use alopex_fennec::channel::ChannelKey;
use alopex_fennec::control::{Concurrency, Subject};
use alopex_fennec::controller::{Controlled, Controller, GateConfig};
use alopex_fennec::telem::TimeRange;
use alopex_fennec::FennecError;

#[derive(Clone)]
struct Resource(ChannelKey);

impl Controlled for Resource {
    fn channel_key(&self) -> ChannelKey {
        self.0
    }
}

fn cfg(key: &str, authority: u8, tr: TimeRange) -> GateConfig {
    GateConfig {
        time_range: tr,
        authority,
        subject: Subject::new(key),
    }
}

#[test]
fn test_open_without_region_reports_absence() {
    let c: Controller<Resource> = Controller::new(Concurrency::Exclusive);
    let opened = c.open_gate(cfg("a", 1, TimeRange::new(0, 10))).unwrap();
    assert!(opened.is_none());
}

#[test]
fn test_register_rejects_overlap() {
    let c: Controller<Resource> = Controller::new(Concurrency::Exclusive);
    c.register(TimeRange::new(0, 10), Resource(ChannelKey(1)))
        .unwrap();
    let err = c
        .register(TimeRange::new(5, 15), Resource(ChannelKey(1)))
        .unwrap_err();
    assert!(matches!(err, FennecError::Validation(_)));
    // Touching ranges are distinct regions.
    c.register(TimeRange::new(10, 20), Resource(ChannelKey(1)))
        .unwrap();
}

#[test]
fn test_gate_binds_to_overlapping_region() {
    let c: Controller<Resource> = Controller::new(Concurrency::Exclusive);
    let (g, t) = c
        .open_gate_and_maybe_register(cfg("a", 1, TimeRange::new(0, 100)), || {
            Ok(Resource(ChannelKey(7)))
        })
        .unwrap();
    assert!(t.is_acquire());
    assert_eq!(t.to.as_ref().unwrap().resource, ChannelKey(7));

    // A later gate over a sub-range binds to the same region.
    let opened = c.open_gate(cfg("b", 1, TimeRange::new(40, 60))).unwrap();
    let (g2, t2) = opened.expect("overlapping region exists");
    assert!(!t2.occurred());
    assert!(g.authorize().is_ok());
    assert!(g2.authorize().is_err());

    g2.release();
    g.release();
    assert!(c.leading_state().is_none());
}

#[test]
fn test_leading_state_tracks_current_gate() {
    let c: Controller<Resource> = Controller::new(Concurrency::Exclusive);
    let (a, _) = c
        .open_gate_and_maybe_register(cfg("a", 1, TimeRange::new(0, 100)), || {
            Ok(Resource(ChannelKey(7)))
        })
        .unwrap();
    assert_eq!(c.leading_state().unwrap().subject.key, "a");

    let (b, _) = c.open_gate(cfg("b", 5, TimeRange::new(0, 100))).unwrap().unwrap();
    assert_eq!(c.leading_state().unwrap().subject.key, "b");

    b.release();
    assert_eq!(c.leading_state().unwrap().subject.key, "a");
    a.release();
}

#[test]
fn test_gate_validation() {
    let c: Controller<Resource> = Controller::new(Concurrency::Exclusive);
    // Empty subject key.
    let err = c.open_gate(cfg("", 1, TimeRange::new(0, 10))).unwrap_err();
    assert!(matches!(err, FennecError::Validation(_)));
    // Inverted time range.
    let err = c.open_gate(cfg("a", 1, TimeRange::new(10, 0))).unwrap_err();
    assert!(matches!(err, FennecError::Validation(_)));
}
