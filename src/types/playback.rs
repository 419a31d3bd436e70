//! Playback state shared between the session API and the workers

use serde::{Deserialize, Serialize};

/// What happens when playback runs past the end of the frame range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnimationMode {
    /// Wrap around to the first frame
    #[default]
    Loop,
    /// Wrap around to the first frame and leave movie mode
    Stop,
    /// Reverse direction at either boundary (ping-pong)
    Swing,
}

/// Direction of frame advancement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Forward,
    Backward,
}

impl Direction {
    pub fn step(self) -> i64 {
        match self {
            Direction::Forward => 1,
            Direction::Backward => -1,
        }
    }

    pub fn reversed(self) -> Self {
        match self {
            Direction::Forward => Direction::Backward,
            Direction::Backward => Direction::Forward,
        }
    }
}

/// How the delay between two frames is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pacing {
    /// Constant frame rate
    Relative { fps: u32 },
    /// Real time mapped onto per-frame timestamps, scaled by this many
    /// seconds of source time per wall-clock second
    Absolute { seconds_per_second: u32 },
}

impl Pacing {
    /// Speed value sent to the server as `srate`.
    pub fn speed(&self) -> u32 {
        match *self {
            Pacing::Relative { fps } => fps.max(1),
            Pacing::Absolute { seconds_per_second } => seconds_per_second.max(1),
        }
    }
}

impl Default for Pacing {
    fn default() -> Self {
        Pacing::Relative { fps: 20 }
    }
}

/// Buffering situation captured when playback starts.
///
/// The distance between the accessible frame and the play position at this
/// moment is the lead the bandwidth controller tries to keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayOrigin {
    pub frame: u32,
    pub accessible: u32,
}

impl PlayOrigin {
    /// Frames that were available ahead of the play position; zero when
    /// playback started beyond the accessible frame.
    pub fn lead(&self) -> i64 {
        (i64::from(self.accessible) + 1 - i64::from(self.frame)).max(0)
    }
}

/// Playback controls mutated by the session API and read by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlaybackState {
    pub movie: bool,
    pub pacing: Pacing,
    pub direction: Direction,
    pub animation: AnimationMode,
    pub linked: bool,
    pub origin: Option<PlayOrigin>,
}

impl PlaybackState {
    pub fn with_pacing(pacing: Pacing) -> Self {
        Self { pacing, ..Self::default() }
    }

    pub fn speed(&self) -> u32 {
        self.pacing.speed()
    }

    /// Whether a change from `previous` has to interrupt an in-progress movie sleep.
    pub fn interrupts(&self, previous: &PlaybackState) -> bool {
        self.movie != previous.movie
            || self.pacing != previous.pacing
            || self.direction != previous.direction
            || self.animation != previous.animation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speed_never_reaches_zero() {
        assert_eq!(Pacing::Relative { fps: 0 }.speed(), 1);
        assert_eq!(Pacing::Absolute { seconds_per_second: 3600 }.speed(), 3600);
        assert_eq!(PlaybackState::default().speed(), 20);
    }

    #[test]
    fn origin_lead_counts_frames_ahead() {
        assert_eq!(PlayOrigin { frame: 2, accessible: 9 }.lead(), 8);
        assert_eq!(PlayOrigin { frame: 5, accessible: 4 }.lead(), 0);
        assert_eq!(PlayOrigin { frame: 9, accessible: 2 }.lead(), 0);
    }

    #[test]
    fn only_scheduling_changes_interrupt() {
        let base = PlaybackState { movie: true, ..PlaybackState::default() };
        assert!(!base.interrupts(&base));

        let linked = PlaybackState { linked: true, ..base };
        assert!(!linked.interrupts(&base));

        let swing = PlaybackState { animation: AnimationMode::Swing, ..base };
        assert!(swing.interrupts(&base));

        let faster = PlaybackState { pacing: Pacing::Relative { fps: 40 }, ..base };
        assert!(faster.interrupts(&base));
    }

    #[test]
    fn pacing_deserializes_from_yaml() {
        let pacing: Pacing = serde_yaml_ng::from_str("absolute:\n  seconds_per_second: 600\n").unwrap();
        assert_eq!(pacing, Pacing::Absolute { seconds_per_second: 600 });
    }
}
