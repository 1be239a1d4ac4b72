//! Benchmarks for clock offset estimation

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use cuesync_core::{Epoch, LocalTime, NodeId, NodeTime};
use cuesync_time::{ClockSyncEngine, RoundTripSample, SyncConfig};

const OFFSET_US: i64 = 120_000;

/// Probe exchange started at `t1_us` with a 1 ms round trip and some spread
fn sample(i: u64, t1_us: i64) -> RoundTripSample {
    let jitter = (i % 7) as i64 * 50;
    let t1 = LocalTime::from_micros(t1_us);
    let t2 = NodeTime::from_micros(t1_us + 500 + jitter + OFFSET_US);
    let t3 = NodeTime::from_micros(t1_us + 520 + jitter + OFFSET_US);
    let t4 = LocalTime::from_micros(t1_us + 1_000 + jitter);
    RoundTripSample::new(t1, t2, t3, t4, Epoch::INITIAL)
}

fn bench_sample_update(c: &mut Criterion) {
    let engine = ClockSyncEngine::new(SyncConfig::default());
    let node = NodeId::new(1);

    c.bench_function("sample_update", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            let s = sample(i, i as i64 * 250_000);
            black_box(engine.update(black_box(node), s))
        })
    });
}

fn bench_estimate(c: &mut Criterion) {
    let mut group = c.benchmark_group("estimate");
    for nodes in [1u64, 16, 128] {
        let engine = ClockSyncEngine::new(SyncConfig::default());
        for n in 0..nodes {
            for i in 0..32 {
                let _ = engine.update(NodeId::new(n), sample(i, i as i64 * 250_000));
            }
        }
        let now = LocalTime::from_micros(32 * 250_000);

        group.bench_with_input(BenchmarkId::from_parameter(nodes), &nodes, |b, &nodes| {
            let mut n = 0u64;
            b.iter(|| {
                n = (n + 1) % nodes;
                black_box(engine.estimate(NodeId::new(n), now))
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_sample_update, bench_estimate);
criterion_main!(benches);
