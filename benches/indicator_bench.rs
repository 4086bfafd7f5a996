use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use perp_desk::strategy::indicators::{bollinger, ema, rsi, Rsi};
use perp_desk::strategy::SignalAggregator;
use perp_desk::{Side, Signal};
use std::time::SystemTime;

fn series(n: usize) -> Vec<f64> {
    (0..n)
        .map(|i| 100.0 + (i as f64 * 0.37).sin() * 2.0 + (i as f64 * 0.05))
        .collect()
}

fn bench_batch_indicators(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch");

    for n in [100usize, 500, 1500] {
        let closes = series(n);
        group.bench_with_input(BenchmarkId::new("rsi14", n), &closes, |b, closes| {
            b.iter(|| black_box(rsi(black_box(closes), 14)));
        });
        group.bench_with_input(BenchmarkId::new("ema20", n), &closes, |b, closes| {
            b.iter(|| black_box(ema(black_box(closes), 20)));
        });
        group.bench_with_input(BenchmarkId::new("bollinger20", n), &closes, |b, closes| {
            b.iter(|| black_box(bollinger(black_box(closes), 20, 2.0)));
        });
    }
    group.finish();
}

fn bench_streaming_rsi(c: &mut Criterion) {
    let closes = series(1000);
    let mut rsi = Rsi::new(14);
    let mut i = 0usize;

    c.bench_function("rsi_update", |b| {
        b.iter(|| {
            i = (i + 1) % closes.len();
            black_box(rsi.update(black_box(closes[i])))
        });
    });
}

fn bench_aggregate(c: &mut Criterion) {
    let aggregator = SignalAggregator::new(2.0, 1.0, 1);
    let signals: Vec<Signal> = [(3.1, 0.8), (1.4, 0.5), (2.2, 0.7)]
        .iter()
        .map(|&(strength, confidence)| Signal {
            source: "bench",
            strength,
            direction: Side::Buy,
            confidence,
            timestamp: SystemTime::now(),
            components: vec![],
        })
        .collect();

    c.bench_function("aggregate_3", |b| {
        b.iter(|| black_box(aggregator.aggregate(black_box(signals.clone()))));
    });
}

criterion_group!(benches, bench_batch_indicators, bench_streaming_rsi, bench_aggregate);
criterion_main!(benches);
