//! Bandwidth estimation and the buffering feedback controller
//!
//! The reader measures throughput over windows of at least
//! [`BandwidthConfig::window_ms`] and keeps an exponentially smoothed
//! estimate. While a movie plays, the estimate is nudged so that the number of
//! frames buffered ahead of the play position stays close to the lead that
//! existed when playback started: too little lead shrinks the advertised
//! bandwidth (the server then sends fewer quality layers per frame), a
//! comfortable lead grows it again. The result is only advisory; it travels to
//! the server as the `mbw` request field.

use std::time::Instant;
use tokio::sync::watch;
use tracing::debug;

use crate::config::{BandwidthConfig, GrowthSignal};
use crate::types::PlayOrigin;

/// Playback situation fed into the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackFeedback {
    pub playing: bool,
    pub origin: PlayOrigin,
    pub current: u32,
    pub accessible: u32,
    pub max_frame: u32,
    pub speed: u32,
}

impl PlaybackFeedback {
    fn setpoint(&self) -> f64 {
        self.origin.lead() as f64 / f64::from(self.speed.max(1))
    }

    fn measured(&self) -> f64 {
        (i64::from(self.accessible) + 1 - i64::from(self.current)) as f64
            / f64::from(self.speed.max(1))
    }
}

/// Estimator state, published after every completed window.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BandwidthState {
    /// Throughput of the last completed window
    pub last_measured_bps: f64,
    /// Estimate advertised to the server, after controller correction
    pub smoothed_bps: Option<f64>,
    /// Running mean of the smoothed estimates, the base of the next smoothing step
    pub history_bps: Option<f64>,
    pub relative_error: f64,
    pub over_estimate_error: f64,
    pub under_estimate_error: f64,
    pub accumulated_bits: u64,
    pub window_start: Option<Instant>,
    pub windows: u64,
}

/// Running average that starts at the first sample.
fn running(previous: f64, sample: f64) -> f64 {
    if previous != 0.0 { (previous + sample) / 2.0 } else { sample }
}

/// Per-session bandwidth estimator.
#[derive(Debug)]
pub struct BandwidthEstimator {
    config: BandwidthConfig,
    state: BandwidthState,
    published: watch::Sender<BandwidthState>,
}

impl BandwidthEstimator {
    pub fn new(config: BandwidthConfig) -> Self {
        let (published, _) = watch::channel(BandwidthState::default());
        Self { config, state: BandwidthState::default(), published }
    }

    pub fn subscribe(&self) -> watch::Receiver<BandwidthState> {
        self.published.subscribe()
    }

    pub fn state(&self) -> &BandwidthState {
        &self.state
    }

    /// Current advisory estimate in bits per second.
    pub fn estimate(&self) -> Option<f64> {
        self.state.smoothed_bps
    }

    /// A response starts; an idle estimator starts its window here.
    pub fn begin_response(&mut self, now: Instant) {
        if self.state.accumulated_bits == 0 {
            self.state.window_start = Some(now);
        }
    }

    /// Account for `bytes` received at `now`.
    ///
    /// Returns true when a window completed while a movie is playing, meaning
    /// the new estimate should be sent to the server.
    pub fn observe(&mut self, bytes: usize, now: Instant, feedback: Option<&PlaybackFeedback>) -> bool {
        if bytes == 0 {
            return false;
        }
        let start = *self.state.window_start.get_or_insert(now);
        self.state.accumulated_bits += bytes as u64 * 8;

        let elapsed = now.saturating_duration_since(start);
        if elapsed < self.config.window() {
            return false;
        }

        let measured = self.state.accumulated_bits as f64 / elapsed.as_secs_f64();
        let smoothing = self.config.smoothing;
        let mut smoothed = match self.state.history_bps {
            Some(history) => smoothing * measured + (1.0 - smoothing) * history,
            None => measured,
        };

        let largest = measured.max(smoothed);
        if largest > 0.0 {
            let s = &mut self.state;
            s.relative_error = running(s.relative_error, (measured - smoothed).abs() / largest);
            if measured > smoothed {
                s.over_estimate_error = running(s.over_estimate_error, (measured - smoothed) / measured);
            }
            if smoothed > measured {
                s.under_estimate_error = running(s.under_estimate_error, (smoothed - measured) / smoothed);
            }
        }

        self.state.history_bps = Some(match self.state.history_bps {
            Some(history) => (history + smoothed) / 2.0,
            None => smoothed,
        });

        let playing = feedback.is_some_and(|f| f.playing);
        if let Some(fb) = feedback.filter(|f| f.playing && f.accessible < f.max_frame) {
            smoothed = self.correct(smoothed, fb);
        }

        self.state.last_measured_bps = measured;
        self.state.smoothed_bps = Some(smoothed);
        self.state.accumulated_bits = 0;
        self.state.window_start = Some(now);
        self.state.windows += 1;
        self.published.send_replace(self.state);

        debug!(
            "Bandwidth window {}: measured {:.0} bps, estimate {:.0} bps, error {:.3}",
            self.state.windows, measured, smoothed, self.state.relative_error
        );
        playing
    }

    /// Steer the estimate toward keeping the initial buffer lead.
    fn correct(&self, smoothed: f64, feedback: &PlaybackFeedback) -> f64 {
        let setpoint = feedback.setpoint();
        let measured = feedback.measured();
        let cfg = &self.config;

        if measured < setpoint {
            // Linear from max_reduction with nothing buffered to min_reduction at the setpoint
            let t = if setpoint > 0.0 { (measured / setpoint).clamp(0.0, 1.0) } else { 0.0 };
            let factor = (cfg.max_reduction + (cfg.min_reduction - cfg.max_reduction) * t)
                .clamp(cfg.min_reduction, cfg.max_reduction);
            if self.state.relative_error > 0.0 {
                return smoothed - smoothed * factor;
            }
        } else if measured > setpoint {
            let error = match cfg.growth {
                GrowthSignal::Relative => self.state.relative_error,
                GrowthSignal::OverEstimated => self.state.over_estimate_error,
                GrowthSignal::UnderEstimated => self.state.under_estimate_error,
            };
            if error > 0.0 {
                return smoothed + smoothed * error;
            }
        }
        smoothed
    }
}
