//! Benchmarks for the per-frame scheduling path
//!
//! Measures:
//! - Relative and absolute pacing steps of the frame scheduler
//! - A bandwidth estimator window with controller correction
//!
//! Platform: Cross-platform, synthetic data

use criterion::{Criterion, criterion_group, criterion_main};
use jpipflow::bandwidth::{BandwidthEstimator, PlaybackFeedback};
use jpipflow::config::BandwidthConfig;
use jpipflow::scheduler::{FrameScheduler, FrameTimestamps};
use jpipflow::types::{AnimationMode, FrameRange, Pacing, PlayOrigin, PlaybackState};
use std::hint::black_box;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn playback(pacing: Pacing) -> PlaybackState {
    PlaybackState { movie: true, pacing, animation: AnimationMode::Swing, ..PlaybackState::default() }
}

fn bench_scheduler(c: &mut Criterion) {
    let range = FrameRange::new(0, 999);
    let mut group = c.benchmark_group("scheduler_advance");

    group.bench_function("relative", |b| {
        let mut scheduler = FrameScheduler::new(None);
        let pb = playback(Pacing::Relative { fps: 30 });
        let now = Instant::now();
        let mut frame = 0;
        b.iter(|| {
            let step = scheduler.advance(black_box(frame), range, &pb, now);
            frame = step.frame;
            black_box(step)
        })
    });

    group.bench_function("absolute", |b| {
        let timestamps: Arc<dyn FrameTimestamps> = Arc::new((0..1000).map(|i| i * 12_000).collect::<Vec<i64>>());
        let mut scheduler = FrameScheduler::new(Some(timestamps));
        let pb = playback(Pacing::Absolute { seconds_per_second: 3600 });
        let start = Instant::now();
        scheduler.reset_clock(0, start);
        let mut frame = 0;
        let mut tick = 0u64;
        b.iter(|| {
            tick += 1;
            let now = start + Duration::from_millis(tick % 10_000);
            let step = scheduler.advance(black_box(frame), range, &pb, now);
            frame = step.frame;
            black_box(step)
        })
    });

    group.finish();
}

fn bench_estimator(c: &mut Criterion) {
    c.bench_function("bandwidth_window", |b| {
        let mut estimator = BandwidthEstimator::new(BandwidthConfig::default());
        let feedback = PlaybackFeedback {
            playing: true,
            origin: PlayOrigin { frame: 0, accessible: 20 },
            current: 10,
            accessible: 18,
            max_frame: 100,
            speed: 20,
        };
        let mut now = Instant::now();
        estimator.begin_response(now);
        b.iter(|| {
            now += Duration::from_millis(120);
            black_box(estimator.observe(black_box(48_000), now, Some(&feedback)))
        })
    });
}

criterion_group!(benches, bench_scheduler, bench_estimator);
criterion_main!(benches);
