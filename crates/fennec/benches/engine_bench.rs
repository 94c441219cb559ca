//! Criterion benchmarks for the channel write and read paths.

use alopex_fennec::channel::{Channel, ChannelKey};
use alopex_fennec::telem::{DataType, Series, TimeRange, SECOND};
use alopex_fennec::{db, Frame};
use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use tempfile::TempDir;

const BATCH: usize = 1_000;

fn bench_rate_write(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let engine = db::open(dir.path()).unwrap();
    engine
        .create_channel(Channel {
            key: ChannelKey(1),
            data_type: DataType::Int64,
            rate: 1_000.0,
            ..Default::default()
        })
        .unwrap();

    let samples: Vec<i64> = (0..BATCH as i64).collect();
    let mut start: i64 = 0;
    let batch_span = SECOND; // 1000 samples at 1 kHz

    let mut group = c.benchmark_group("rate_write");
    group.throughput(Throughput::Elements(BATCH as u64));
    group.bench_function("write_1k_samples", |b| {
        b.iter(|| {
            engine
                .write_series(ChannelKey(1), start, Series::from_i64s(&samples))
                .unwrap();
            start += batch_span;
        })
    });
    group.finish();
    engine.close().unwrap();
}

fn bench_rate_read(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let engine = db::open(dir.path()).unwrap();
    engine
        .create_channel(Channel {
            key: ChannelKey(1),
            data_type: DataType::Int64,
            rate: 1_000.0,
            ..Default::default()
        })
        .unwrap();
    let samples: Vec<i64> = (0..BATCH as i64).collect();
    for i in 0..64 {
        engine
            .write_series(ChannelKey(1), i * SECOND, Series::from_i64s(&samples))
            .unwrap();
    }

    let mut group = c.benchmark_group("rate_read");
    group.throughput(Throughput::Elements(64 * BATCH as u64));
    group.bench_function("read_64k_samples", |b| {
        b.iter(|| {
            let frame: Frame = engine.read(TimeRange::MAX, &[ChannelKey(1)]).unwrap();
            assert_eq!(frame.len(), 64);
        })
    });
    group.finish();
    engine.close().unwrap();
}

criterion_group!(benches, bench_rate_write, bench_rate_read);
criterion_main!(benches);
