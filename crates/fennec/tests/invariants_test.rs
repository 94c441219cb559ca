//! Property tests for pointer-index invariants under inserts and deletes.

use alopex_fennec::domain::{IndexState, Pointer, Tombstone};
use alopex_fennec::telem::TimeRange;
use proptest::prelude::*;

fn pointers_sorted_and_disjoint(state: &IndexState) -> bool {
    state.pointers.windows(2).all(|pair| {
        pair[0].time_range.start <= pair[1].time_range.start
            && !pair[0].time_range.overlaps_with(&pair[1].time_range)
    })
}

proptest! {
    /// Whatever order domains are inserted in, the accepted subset stays
    /// sorted and non-overlapping, and rejected inserts are exactly the
    /// overlapping ones.
    #[test]
    fn insert_preserves_order_and_disjointness(
        spans in prop::collection::vec((0i64..1000, 1i64..50), 0..64)
    ) {
        let mut state = IndexState::default();
        let mut offset = 0u32;
        for (start, len) in spans {
            let p = Pointer {
                time_range: TimeRange::new(start, start + len),
                file_key: 1,
                offset,
                length: len as u32,
            };
            let overlaps_existing = state
                .pointers
                .iter()
                .any(|q| q.time_range.overlaps_with(&p.time_range));
            match state.insert(p) {
                Ok(()) => {
                    prop_assert!(!overlaps_existing);
                    offset += len as u32;
                }
                Err(e) => {
                    prop_assert!(e.is_write_conflict());
                    prop_assert!(overlaps_existing);
                }
            }
            prop_assert!(pointers_sorted_and_disjoint(&state));
        }
    }

    /// Tombstones stay sorted by offset per file, and the tombstoned byte
    /// total matches what was inserted.
    #[test]
    fn tombstones_stay_sorted_per_file(
        entries in prop::collection::vec((1u16..4, 0u32..10_000, 1u32..100), 0..64)
    ) {
        let mut state = IndexState::default();
        let mut expected = std::collections::HashMap::new();
        for (file_key, offset, length) in entries {
            state.insert_tombstone(file_key, Tombstone { offset, length });
            *expected.entry(file_key).or_insert(0u64) += length as u64;
        }
        for (file_key, total) in expected {
            prop_assert_eq!(state.tombstone_bytes(file_key), total);
        }
        for (_, list) in state.tombstones.iter() {
            prop_assert!(list.windows(2).all(|p| p[0].offset <= p[1].offset));
        }
    }

    /// Binary search positions agree with a linear scan.
    #[test]
    fn search_matches_linear_scan(
        starts in prop::collection::vec(0i64..500, 1..32),
        probe in 0i64..600
    ) {
        let mut state = IndexState::default();
        let mut sorted = starts.clone();
        sorted.sort_unstable();
        sorted.dedup();
        for (i, start) in sorted.iter().enumerate() {
            // Unit-width domains cannot overlap after dedup.
            let _ = state.insert(Pointer {
                time_range: TimeRange::new(*start, start + 1),
                file_key: 1,
                offset: i as u32,
                length: 1,
            });
        }
        let le = state.search_le(probe);
        let expected_le = state
            .pointers
            .iter()
            .rposition(|p| p.time_range.start <= probe)
            .map(|i| i as i64)
            .unwrap_or(-1);
        prop_assert_eq!(le, expected_le);

        let ge = state.search_ge(probe);
        let expected_ge = state
            .pointers
            .iter()
            .position(|p| p.time_range.end > probe)
            .map(|i| i as i64)
            .unwrap_or(state.pointers.len() as i64);
        prop_assert_eq!(ge, expected_ge);
    }
}
