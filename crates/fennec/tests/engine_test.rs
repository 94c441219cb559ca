//! Integration tests for the engine root: channel lifecycle, validation,
//! frame reads/writes, virtual control, and reopen behavior.

use alopex_fennec::channel::{Channel, ChannelKey};
use alopex_fennec::control::{Concurrency, Subject};
use alopex_fennec::telem::{DataType, Series, TimeRange, SECOND};
use alopex_fennec::{db, FennecError, Frame, FrameWriterConfig};
use tempfile::TempDir;

fn secs(s: i64) -> i64 {
    s * SECOND
}

fn rate_channel(key: u32) -> Channel {
    Channel {
        key: ChannelKey(key),
        data_type: DataType::Int64,
        rate: 1.0,
        ..Default::default()
    }
}

fn index_channel(key: u32) -> Channel {
    Channel {
        key: ChannelKey(key),
        data_type: DataType::TimeStamp,
        is_index: true,
        ..Default::default()
    }
}

// ============================================================================
// Channel creation
// ============================================================================

#[test]
fn test_create_and_retrieve_channel() {
    let dir = TempDir::new().unwrap();
    let engine = db::open(dir.path()).unwrap();
    engine.create_channel(rate_channel(1)).unwrap();
    let ch = engine.retrieve_channel(ChannelKey(1)).unwrap();
    assert_eq!(ch.key, ChannelKey(1));
    assert_eq!(ch.rate, 1.0);
    engine.close().unwrap();
}

/// The channel validation table: each invalid descriptor is rejected with a
/// validation error and creates nothing.
#[test]
fn test_channel_validation_errors() {
    let dir = TempDir::new().unwrap();
    let engine = db::open(dir.path()).unwrap();
    engine.create_channel(index_channel(45)).unwrap();
    engine.create_channel(rate_channel(60)).unwrap();

    let cases: Vec<Channel> = vec![
        // Data type not set.
        Channel {
            key: ChannelKey(10),
            rate: 10.0,
            ..Default::default()
        },
        // Key collision.
        rate_channel(60),
        // Index channel with a non-timestamp type.
        Channel {
            key: ChannelKey(12),
            is_index: true,
            data_type: DataType::Float32,
            ..Default::default()
        },
        // Index channel indexed by another channel.
        Channel {
            key: ChannelKey(46),
            is_index: true,
            data_type: DataType::TimeStamp,
            index: ChannelKey(45),
            ..Default::default()
        },
        // Index reference to a channel that does not exist.
        Channel {
            key: ChannelKey(47),
            data_type: DataType::Float64,
            index: ChannelKey(40000),
            ..Default::default()
        },
        // Neither index nor rate.
        Channel {
            key: ChannelKey(48),
            data_type: DataType::Float32,
            ..Default::default()
        },
        // Index reference to a non-index channel.
        Channel {
            key: ChannelKey(61),
            data_type: DataType::Float32,
            index: ChannelKey(60),
            ..Default::default()
        },
        // Virtual channel with a rate.
        Channel {
            key: ChannelKey(62),
            data_type: DataType::Int64,
            is_virtual: true,
            rate: 1.0,
            ..Default::default()
        },
        // Virtual channel with an index.
        Channel {
            key: ChannelKey(63),
            data_type: DataType::Int64,
            is_virtual: true,
            index: ChannelKey(45),
            ..Default::default()
        },
        // Shared concurrency on a non-virtual channel.
        Channel {
            key: ChannelKey(64),
            data_type: DataType::Int64,
            rate: 1.0,
            concurrency: Concurrency::Shared,
            ..Default::default()
        },
    ];
    for ch in cases {
        let key = ch.key;
        let err = engine.create_channel(ch).unwrap_err();
        assert!(
            matches!(err, FennecError::Validation(_)),
            "channel {key} should fail validation"
        );
    }
    engine.close().unwrap();
}

// ============================================================================
// Frame writes and reads
// ============================================================================

#[test]
fn test_frame_write_and_read_indexed_pair() {
    let dir = TempDir::new().unwrap();
    let engine = db::open(dir.path()).unwrap();
    engine.create_channel(index_channel(1)).unwrap();
    engine
        .create_channel(Channel {
            key: ChannelKey(2),
            data_type: DataType::Int64,
            index: ChannelKey(1),
            ..Default::default()
        })
        .unwrap();

    engine
        .write(
            secs(2),
            Frame::new(
                vec![ChannelKey(1), ChannelKey(2)],
                vec![
                    Series::from_second_timestamps(&[2, 3, 5, 7, 11]),
                    Series::from_i64s(&[2, 3, 5, 7, 11]),
                ],
            ),
        )
        .unwrap();

    let frame = engine
        .read(TimeRange::MAX, &[ChannelKey(1), ChannelKey(2)])
        .unwrap();
    assert_eq!(frame.len(), 2);
    assert_eq!(frame.get(ChannelKey(2))[0].as_i64s(), vec![2, 3, 5, 7, 11]);
    assert_eq!(
        frame.get(ChannelKey(1))[0].as_i64s(),
        vec![secs(2), secs(3), secs(5), secs(7), secs(11)]
    );
    assert_eq!(
        frame.get(ChannelKey(2))[0].time_range,
        TimeRange::new(secs(2), secs(11) + 1)
    );
    engine.close().unwrap();
}

// ============================================================================
// Virtual channels and control transfer
// ============================================================================

/// Two writers contend over a virtual channel: the higher authority wins,
/// and releasing hands control back.
#[test]
fn test_virtual_control_transfer() {
    let dir = TempDir::new().unwrap();
    let engine = db::open(dir.path()).unwrap();
    engine
        .create_channel(Channel {
            key: ChannelKey(9),
            data_type: DataType::Int64,
            is_virtual: true,
            ..Default::default()
        })
        .unwrap();
    let updates = engine.control_updates();

    let mut a = engine
        .open_writer(FrameWriterConfig {
            channels: vec![ChannelKey(9)],
            start: 0,
            subject: Subject::new("a"),
            authority: 1,
            ..Default::default()
        })
        .unwrap();
    let mut b = engine
        .open_writer(FrameWriterConfig {
            channels: vec![ChannelKey(9)],
            start: 0,
            subject: Subject::new("b"),
            authority: 2,
            ..Default::default()
        })
        .unwrap();

    let frame = Frame::unary(ChannelKey(9), Series::from_i64s(&[1]));
    let err = a.write(&frame).unwrap_err();
    assert!(err.is_unauthorized());
    b.write(&frame).unwrap();

    b.close().unwrap();
    a.write(&frame).unwrap();
    a.close().unwrap();

    // The relay collapsed intermediate transfers; the newest state for the
    // channel is the final release.
    let pending = updates.poll();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].channel, ChannelKey(9));
    assert!(pending[0].transfer.is_release());
    engine.close().unwrap();
}

#[test]
fn test_shared_concurrency_on_virtual_channel() {
    let dir = TempDir::new().unwrap();
    let engine = db::open(dir.path()).unwrap();
    engine
        .create_channel(Channel {
            key: ChannelKey(9),
            data_type: DataType::Int64,
            is_virtual: true,
            concurrency: Concurrency::Shared,
            ..Default::default()
        })
        .unwrap();

    let mut a = engine
        .open_writer(FrameWriterConfig {
            channels: vec![ChannelKey(9)],
            subject: Subject::new("a"),
            authority: 3,
            ..Default::default()
        })
        .unwrap();
    let mut b = engine
        .open_writer(FrameWriterConfig {
            channels: vec![ChannelKey(9)],
            subject: Subject::new("b"),
            authority: 3,
            ..Default::default()
        })
        .unwrap();

    // Equal authority: both writers are authorized under shared control.
    let frame = Frame::unary(ChannelKey(9), Series::from_i64s(&[1]));
    a.write(&frame).unwrap();
    b.write(&frame).unwrap();
    a.close().unwrap();
    b.close().unwrap();
    engine.close().unwrap();
}

// ============================================================================
// Reopen behavior
// ============================================================================

/// Close then open preserves channels, pointers, and data.
#[test]
fn test_reopen_preserves_data() {
    let dir = TempDir::new().unwrap();
    {
        let engine = db::open(dir.path()).unwrap();
        engine.create_channel(rate_channel(1)).unwrap();
        engine
            .write_series(ChannelKey(1), secs(1), Series::from_i64s(&[1, 2, 3, 4, 5]))
            .unwrap();
        engine.close().unwrap();
    }
    {
        let engine = db::open(dir.path()).unwrap();
        let ch = engine.retrieve_channel(ChannelKey(1)).unwrap();
        assert_eq!(ch.rate, 1.0);
        assert_eq!(ch.data_type, DataType::Int64);

        let frame = engine.read(TimeRange::MAX, &[ChannelKey(1)]).unwrap();
        assert_eq!(frame.len(), 1);
        assert_eq!(frame.series[0].time_range, TimeRange::new(secs(1), secs(5) + 1));
        assert_eq!(frame.series[0].as_i64s(), vec![1, 2, 3, 4, 5]);

        // Writes keep working after the reopen.
        engine
            .write_series(ChannelKey(1), secs(11), Series::from_i64s(&[11, 12]))
            .unwrap();
        engine.close().unwrap();
    }
}

#[test]
fn test_reopen_rewires_index_dependencies() {
    let dir = TempDir::new().unwrap();
    {
        let engine = db::open(dir.path()).unwrap();
        engine.create_channel(index_channel(1)).unwrap();
        engine
            .create_channel(Channel {
                key: ChannelKey(2),
                data_type: DataType::Int64,
                index: ChannelKey(1),
                ..Default::default()
            })
            .unwrap();
        engine
            .write(
                secs(1),
                Frame::new(
                    vec![ChannelKey(1), ChannelKey(2)],
                    vec![
                        Series::from_second_timestamps(&[1, 2, 3, 4, 5]),
                        Series::from_i64s(&[1, 2, 3, 4, 5]),
                    ],
                ),
            )
            .unwrap();
        engine.close().unwrap();
    }
    {
        let engine = db::open(dir.path()).unwrap();
        // A write through the reopened pair resolves its end through the
        // rewired index.
        engine
            .write(
                secs(11),
                Frame::new(
                    vec![ChannelKey(1), ChannelKey(2)],
                    vec![
                        Series::from_second_timestamps(&[11, 12, 13]),
                        Series::from_i64s(&[11, 12, 13]),
                    ],
                ),
            )
            .unwrap();
        let frame = engine.read(TimeRange::MAX, &[ChannelKey(2)]).unwrap();
        assert_eq!(frame.len(), 2);
        assert_eq!(frame.series[1].time_range, TimeRange::new(secs(11), secs(13) + 1));
        engine.close().unwrap();
    }
}

// ============================================================================
// Root directory tolerance
// ============================================================================

/// The engine ignores stray files and non-numeric directories in its root.
#[test]
fn test_open_tolerates_noise_in_root() {
    let dir = TempDir::new().unwrap();
    {
        let engine = db::open(dir.path()).unwrap();
        engine.create_channel(rate_channel(1)).unwrap();
        engine
            .write_series(ChannelKey(1), secs(1), Series::from_i64s(&[7]))
            .unwrap();
        engine.close().unwrap();
    }
    std::fs::write(dir.path().join("123.txt"), b"not a channel").unwrap();
    std::fs::create_dir(dir.path().join("1234notnumeric")).unwrap();

    let engine = db::open(dir.path()).unwrap();
    let frame = engine.read(TimeRange::MAX, &[ChannelKey(1)]).unwrap();
    assert_eq!(frame.series[0].as_i64s(), vec![7]);
    engine.close().unwrap();
}

/// A numeric directory without a descriptor is a fatal inconsistency.
#[test]
fn test_open_fails_on_numeric_dir_without_meta() {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir(dir.path().join("7")).unwrap();
    let err = db::open(dir.path()).unwrap_err();
    assert!(matches!(err, FennecError::Validation(_)));
}

// ============================================================================
// Channel deletion and renaming
// ============================================================================

#[test]
fn test_delete_channel_guards() {
    let dir = TempDir::new().unwrap();
    let engine = db::open(dir.path()).unwrap();
    engine.create_channel(index_channel(1)).unwrap();
    engine
        .create_channel(Channel {
            key: ChannelKey(2),
            data_type: DataType::Int64,
            index: ChannelKey(1),
            ..Default::default()
        })
        .unwrap();

    // An index channel with dependents cannot be deleted.
    let err = engine.delete_channel(ChannelKey(1)).unwrap_err();
    assert!(matches!(err, FennecError::Validation(_)));

    // A channel with an open writer cannot be deleted.
    let w = engine
        .open_writer(FrameWriterConfig {
            channels: vec![ChannelKey(2)],
            start: secs(1),
            subject: Subject::new("holder"),
            ..Default::default()
        })
        .unwrap();
    let err = engine.delete_channel(ChannelKey(2)).unwrap_err();
    assert!(matches!(err, FennecError::Validation(_)));
    drop(w);

    // With the writer closed and the dependent gone, deletion proceeds and
    // removes the directories.
    engine.delete_channel(ChannelKey(2)).unwrap();
    engine.delete_channel(ChannelKey(1)).unwrap();
    assert!(!dir.path().join("2").exists());
    assert!(!dir.path().join("1").exists());
    assert!(matches!(
        engine.retrieve_channel(ChannelKey(1)),
        Err(FennecError::ChannelNotFound(_))
    ));
    engine.close().unwrap();
}

#[test]
fn test_delete_time_range_guards_index_dependents() {
    let dir = TempDir::new().unwrap();
    let engine = db::open(dir.path()).unwrap();
    engine.create_channel(index_channel(1)).unwrap();
    engine
        .create_channel(Channel {
            key: ChannelKey(2),
            data_type: DataType::Int64,
            index: ChannelKey(1),
            ..Default::default()
        })
        .unwrap();
    engine
        .write(
            secs(1),
            Frame::new(
                vec![ChannelKey(1), ChannelKey(2)],
                vec![
                    Series::from_second_timestamps(&[1, 2, 3]),
                    Series::from_i64s(&[1, 2, 3]),
                ],
            ),
        )
        .unwrap();

    // The index still has dependent data over the range.
    let tr = TimeRange::new(secs(1), secs(3));
    let err = engine.delete_time_range(ChannelKey(1), tr).unwrap_err();
    assert!(matches!(err, FennecError::Validation(_)));

    // Clearing the dependent first unblocks the index delete.
    engine.delete_time_range(ChannelKey(2), TimeRange::MAX).unwrap();
    engine.delete_time_range(ChannelKey(1), tr).unwrap();
    engine.close().unwrap();
}

#[test]
fn test_rename_channel_guards_open_writers() {
    let dir = TempDir::new().unwrap();
    {
        let engine = db::open(dir.path()).unwrap();
        engine.create_channel(rate_channel(1)).unwrap();

        let w = engine
            .open_writer(FrameWriterConfig {
                channels: vec![ChannelKey(1)],
                start: 0,
                subject: Subject::new("holder"),
                ..Default::default()
            })
            .unwrap();
        let err = engine.rename_channel(ChannelKey(1), "pressure").unwrap_err();
        assert!(matches!(err, FennecError::Validation(_)));
        drop(w);

        engine.rename_channel(ChannelKey(1), "pressure").unwrap();
        assert_eq!(engine.retrieve_channel(ChannelKey(1)).unwrap().name, "pressure");
        engine.close().unwrap();
    }
    // The new name survives a reopen.
    let engine = db::open(dir.path()).unwrap();
    assert_eq!(engine.retrieve_channel(ChannelKey(1)).unwrap().name, "pressure");
    engine.close().unwrap();
}

// ============================================================================
// Garbage collection through the engine
// ============================================================================

#[test]
fn test_engine_gc_reclaims_deleted_ranges() {
    let dir = TempDir::new().unwrap();
    let engine = db::open_with(
        dir.path(),
        db::Options {
            file_size: 1 << 20,
            gc_threshold: f32::MIN_POSITIVE,
            ..db::Options::default()
        },
    )
    .unwrap();
    engine.create_channel(rate_channel(1)).unwrap();
    engine
        .write_series(
            ChannelKey(1),
            secs(10),
            Series::from_i64s(&[10, 11, 12, 13, 14, 15, 16, 17, 18, 19]),
        )
        .unwrap();
    engine
        .delete_time_range(ChannelKey(1), TimeRange::new(secs(12) + 1, secs(16) + 1))
        .unwrap();

    let segment = dir.path().join("1").join("1.domain");
    assert_eq!(std::fs::metadata(&segment).unwrap().len(), 80);
    engine.garbage_collect().unwrap();
    assert_eq!(std::fs::metadata(&segment).unwrap().len(), 48);

    let frame = engine.read(TimeRange::MAX, &[ChannelKey(1)]).unwrap();
    assert_eq!(frame.series[0].as_i64s(), vec![10, 11, 12]);
    assert_eq!(frame.series[1].as_i64s(), vec![17, 18, 19]);
    engine.close().unwrap();
}

#[test]
fn test_close_refuses_with_open_writers() {
    let dir = TempDir::new().unwrap();
    let engine = db::open(dir.path()).unwrap();
    engine.create_channel(rate_channel(1)).unwrap();
    let w = engine
        .open_writer(FrameWriterConfig {
            channels: vec![ChannelKey(1)],
            subject: Subject::new("holder"),
            ..Default::default()
        })
        .unwrap();
    let err = engine.close().unwrap_err();
    assert!(matches!(err, FennecError::Validation(_)));
    drop(w);
    engine.close().unwrap();
}
