//! Next-frame selection and inter-frame delay

use std::sync::Arc;
use std::time::Instant;

use crate::types::{AnimationMode, Direction, FrameRange, Pacing, PlaybackState};

/// Source timestamps of frames, needed for absolute pacing.
pub trait FrameTimestamps: Send + Sync {
    /// Observation time of `frame` in milliseconds, `None` when unknown.
    fn timestamp_ms(&self, frame: u32) -> Option<i64>;
}

impl FrameTimestamps for Vec<i64> {
    fn timestamp_ms(&self, frame: u32) -> Option<i64> {
        self.get(frame as usize).copied()
    }
}

/// One step of the candidate chooser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub frame: u32,
    pub direction: Direction,
    /// The animation mode asks playback to end
    pub stop_movie: bool,
    /// Playback wrapped and restarts its clock at this frame
    pub wrapped_to: Option<u32>,
}

/// Frame following `last` within `range`.
pub fn next_candidate(last: u32, range: FrameRange, mode: AnimationMode, direction: Direction) -> Candidate {
    let step = |frame: u32, dir: Direction| i64::from(frame) + dir.step();
    let plain = |frame: i64| Candidate {
        frame: frame as u32,
        direction,
        stop_movie: false,
        wrapped_to: None,
    };
    let start = i64::from(range.start);
    let end = i64::from(range.end);
    let next = step(last, direction);

    match mode {
        AnimationMode::Loop | AnimationMode::Stop => {
            let wrapped = match direction {
                Direction::Forward if next > end => Some(range.start),
                Direction::Backward if next < start => Some(range.end),
                _ => None,
            };
            match wrapped {
                Some(frame) => Candidate {
                    frame,
                    direction,
                    stop_movie: mode == AnimationMode::Stop,
                    wrapped_to: Some(frame),
                },
                None => plain(next),
            }
        }
        AnimationMode::Swing => {
            if next < start && direction == Direction::Backward {
                let frame = (start + 1).min(end) as u32;
                Candidate { frame, direction: Direction::Forward, stop_movie: false, wrapped_to: Some(range.start) }
            } else if next > end && direction == Direction::Forward {
                let frame = (end - 1).max(start) as u32;
                Candidate { frame, direction: Direction::Backward, stop_movie: false, wrapped_to: Some(range.end) }
            } else {
                plain(next.clamp(start, end))
            }
        }
    }
}

/// Outcome of advancing playback by one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub frame: u32,
    /// Milliseconds to wait before showing `frame`; zero or negative means late
    pub delay_ms: i64,
    pub direction: Direction,
    pub stop_movie: bool,
}

#[derive(Debug, Clone, Copy)]
struct AbsoluteClock {
    source_start_ms: i64,
    wall_start: Instant,
}

/// Chooses the next frame and how long to wait for it.
pub struct FrameScheduler {
    timestamps: Option<Arc<dyn FrameTimestamps>>,
    clock: Option<AbsoluteClock>,
}

impl FrameScheduler {
    pub fn new(timestamps: Option<Arc<dyn FrameTimestamps>>) -> Self {
        Self { timestamps, clock: None }
    }

    /// Restart absolute pacing so that `frame` is shown at `now`.
    pub fn reset_clock(&mut self, frame: u32, now: Instant) {
        self.clock = self
            .timestamps
            .as_ref()
            .and_then(|ts| ts.timestamp_ms(frame))
            .map(|source_start_ms| AbsoluteClock { source_start_ms, wall_start: now });
    }

    pub fn advance(&mut self, current: u32, range: FrameRange, playback: &PlaybackState, now: Instant) -> Step {
        match playback.pacing {
            Pacing::Relative { .. } => self.advance_relative(current, range, playback),
            Pacing::Absolute { seconds_per_second } => {
                if self.timestamps.is_none() {
                    return self.advance_relative(current, range, playback);
                }
                if self.clock.is_none() {
                    self.reset_clock(current, now);
                }
                self.advance_absolute(current, range, playback, i64::from(seconds_per_second.max(1)), now)
            }
        }
    }

    fn advance_relative(&mut self, current: u32, range: FrameRange, playback: &PlaybackState) -> Step {
        let candidate = next_candidate(current, range, playback.animation, playback.direction);
        Step {
            frame: candidate.frame,
            delay_ms: 1000 / i64::from(playback.speed()),
            direction: candidate.direction,
            stop_movie: candidate.stop_movie,
        }
    }

    fn advance_absolute(
        &mut self,
        current: u32,
        range: FrameRange,
        playback: &PlaybackState,
        speed: i64,
        now: Instant,
    ) -> Step {
        let mut direction = playback.direction;
        let mut stop_movie = false;
        let mut next_frame = current;
        let mut next_diff = -i64::MAX;

        // Each pass moves one frame; a full range plus one always reaches a wrap.
        for _ in 0..=range.len() {
            let last_frame = next_frame;
            let candidate = next_candidate(next_frame, range, playback.animation, direction);
            direction = candidate.direction;
            stop_movie |= candidate.stop_movie;
            next_frame = candidate.frame;
            if let Some(frame) = candidate.wrapped_to {
                self.reset_clock(frame, now);
            }

            let last_diff = next_diff;
            next_diff = self.source_lag(next_frame, speed, now);
            if next_diff >= 0 {
                let (frame, diff) =
                    if -last_diff < next_diff { (last_frame, last_diff) } else { (next_frame, next_diff) };
                return Step { frame, delay_ms: diff / speed, direction, stop_movie };
            }
        }
        Step { frame: next_frame, delay_ms: 0, direction, stop_movie }
    }

    /// Source milliseconds between `frame` and the current playback position.
    fn source_lag(&self, frame: u32, speed: i64, now: Instant) -> i64 {
        let (Some(clock), Some(ts)) =
            (self.clock, self.timestamps.as_ref().and_then(|t| t.timestamp_ms(frame)))
        else {
            return 0;
        };
        let elapsed = now.saturating_duration_since(clock.wall_start).as_millis() as i64;
        (ts - clock.source_start_ms).abs() - elapsed * speed
    }
}

impl std::fmt::Debug for FrameScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameScheduler")
            .field("absolute", &self.timestamps.is_some())
            .field("clock", &self.clock)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn range() -> FrameRange {
        FrameRange::new(0, 9)
    }

    fn playback(animation: AnimationMode, pacing: Pacing) -> PlaybackState {
        PlaybackState { movie: true, animation, pacing, ..PlaybackState::default() }
    }

    #[test]
    fn loop_wraps_to_start() {
        let c = next_candidate(9, range(), AnimationMode::Loop, Direction::Forward);
        assert_eq!(c.frame, 0);
        assert!(!c.stop_movie);
        assert_eq!(c.wrapped_to, Some(0));
        assert_eq!(next_candidate(4, range(), AnimationMode::Loop, Direction::Forward).frame, 5);
        assert_eq!(next_candidate(0, range(), AnimationMode::Loop, Direction::Backward).frame, 9);
    }

    #[test]
    fn stop_wraps_and_ends_movie() {
        let c = next_candidate(9, range(), AnimationMode::Stop, Direction::Forward);
        assert_eq!(c.frame, 0);
        assert!(c.stop_movie);
        assert!(!next_candidate(3, range(), AnimationMode::Stop, Direction::Forward).stop_movie);
    }

    #[test]
    fn swing_bounces_at_both_ends() {
        let c = next_candidate(9, range(), AnimationMode::Swing, Direction::Forward);
        assert_eq!((c.frame, c.direction), (8, Direction::Backward));

        let c = next_candidate(0, range(), AnimationMode::Swing, Direction::Backward);
        assert_eq!((c.frame, c.direction), (1, Direction::Forward));

        let c = next_candidate(5, range(), AnimationMode::Swing, Direction::Backward);
        assert_eq!((c.frame, c.direction), (4, Direction::Backward));

        let single = FrameRange::single(3);
        assert_eq!(next_candidate(3, single, AnimationMode::Swing, Direction::Forward).frame, 3);
    }

    #[test]
    fn relative_pacing_is_constant() {
        let mut scheduler = FrameScheduler::new(None);
        let pb = playback(AnimationMode::Loop, Pacing::Relative { fps: 20 });
        let now = Instant::now();
        let mut frame = 0;
        for _ in 0..25 {
            let step = scheduler.advance(frame, range(), &pb, now);
            assert_eq!(step.delay_ms, 50);
            frame = step.frame;
        }
        assert_eq!(frame, 5);
    }

    #[test]
    fn absolute_pacing_without_timestamps_falls_back() {
        let mut scheduler = FrameScheduler::new(None);
        let pb = playback(AnimationMode::Loop, Pacing::Absolute { seconds_per_second: 4 });
        let step = scheduler.advance(2, range(), &pb, Instant::now());
        assert_eq!((step.frame, step.delay_ms), (3, 250));
    }

    fn seconds_apart() -> Arc<dyn FrameTimestamps> {
        Arc::new((0..10).map(|i| i * 1000).collect::<Vec<i64>>())
    }

    #[test]
    fn absolute_pacing_maps_source_time() {
        let mut scheduler = FrameScheduler::new(Some(seconds_apart()));
        let pb = playback(AnimationMode::Loop, Pacing::Absolute { seconds_per_second: 10 });
        let t0 = Instant::now();
        scheduler.reset_clock(0, t0);

        let step = scheduler.advance(0, range(), &pb, t0);
        assert_eq!((step.frame, step.delay_ms), (1, 100));

        // 470 ms in at 10x = 4.7 s of source time: frame 5 is 300 ms of source time ahead
        let step = scheduler.advance(1, range(), &pb, t0 + Duration::from_millis(470));
        assert_eq!((step.frame, step.delay_ms), (5, 30));

        // 430 ms in: frame 4 is only 300 ms late while frame 5 is 700 ms early
        let step = scheduler.advance(1, range(), &pb, t0 + Duration::from_millis(430));
        assert_eq!((step.frame, step.delay_ms), (4, -30));
    }

    #[test]
    fn absolute_wrap_restarts_clock() {
        let mut scheduler = FrameScheduler::new(Some(seconds_apart()));
        let pb = playback(AnimationMode::Stop, Pacing::Absolute { seconds_per_second: 1 });
        let t0 = Instant::now();
        scheduler.reset_clock(8, t0);

        let step = scheduler.advance(9, range(), &pb, t0 + Duration::from_secs(5));
        assert_eq!(step.frame, 0);
        assert!(step.stop_movie);
        assert_eq!(step.delay_ms, 0);
    }
}
