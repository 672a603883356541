//! Anomaly detection and trend analysis over a 1 000-point series.

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use pulse_engine::anomaly::{AnomalyEngine, DetectionContext};
use pulse_engine::config::{AnomalyConfig, TrendConfig};
use pulse_engine::stats::{detect_seasonality, Baseline};
use pulse_engine::trend::TrendAnalyzer;
use pulse_engine::{MetricSample, Timestamp};
use tokio_util::sync::CancellationToken;

/// Daily-shaped series with noise and a slow upward drift, one point a minute
fn series(len: usize) -> Vec<MetricSample> {
    let mut rng = fastrand::Rng::with_seed(7);
    (0..len)
        .map(|i| {
            let t = i as f64;
            let value = 50.0 + 10.0 * (2.0 * std::f64::consts::PI * t / 24.0).sin() + 0.01 * t + rng.f64() * 2.0;
            MetricSample::at("bench", value, Timestamp::from_secs(i as i64 * 60))
        })
        .collect()
}

fn bench_anomaly(c: &mut Criterion) {
    let config = AnomalyConfig {
        isolation_seed: Some(42),
        ..AnomalyConfig::default()
    };
    let engine = AnomalyEngine::from_config(&config);
    let cancel = CancellationToken::new();

    let mut group = c.benchmark_group("anomaly");
    for len in [100usize, 1_000] {
        let points = series(len);
        let (current, history) = points.split_last().expect("non-empty series");
        let baseline = Baseline::from_samples(history);
        group.bench_with_input(BenchmarkId::new("all_detectors", len), &len, |b, _| {
            b.iter(|| {
                let ctx = DetectionContext::new("bench", history, current, &baseline);
                black_box(engine.analyze(&ctx, &cancel))
            })
        });
    }
    group.finish();
}

fn bench_trend(c: &mut Criterion) {
    let analyzer = TrendAnalyzer::new(TrendConfig::default());
    let cancel = CancellationToken::new();
    let points = series(1_000);
    let values: Vec<f64> = points.iter().map(|p| p.value).collect();

    c.bench_function("trend/analyze_1000", |b| {
        b.iter(|| black_box(analyzer.analyze_points(black_box(&points), &cancel)))
    });
    c.bench_function("trend/seasonality_1000", |b| {
        b.iter(|| black_box(detect_seasonality(black_box(&values), 500, 0.3)))
    });
}

criterion_group!(benches, bench_anomaly, bench_trend);
criterion_main!(benches);
