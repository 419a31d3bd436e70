//! State shared between the session handle and its two workers

use tokio::sync::{broadcast, watch};

use crate::cache::CompletenessTracker;
use crate::config::StreamConfig;
use crate::reader::ReaderReason;
use crate::render::RenderReason;
use crate::signal::Signal;
use crate::types::{FrameRange, ImageParameter, PlaybackState};

/// Conditions reported to the embedding application.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A request was satisfied; more of the current view is cached
    DataChanged { frames: FrameRange },
    /// The connection failed and will be retried
    ConnectionLost { reason: String },
    /// The server dropped the connection mid-transfer; reported once per session
    ConnectionReset { message: String },
    /// A frame was decoded for parameters that no longer match and was dropped
    FrameSkipped { frame: u32 },
}

pub(crate) struct Shared {
    pub config: StreamConfig,
    pub tracker: CompletenessTracker,
    /// Frame range the resource offers
    pub extent: FrameRange,
    pub params: watch::Sender<Option<ImageParameter>>,
    pub range: watch::Sender<FrameRange>,
    pub playback: watch::Sender<PlaybackState>,
    pub actual_fps: watch::Sender<f32>,
    pub reader_signal: Signal<ReaderReason>,
    pub render_signal: Signal<RenderReason>,
    pub events: broadcast::Sender<StreamEvent>,
}

impl Shared {
    pub fn new(config: StreamConfig, tracker: CompletenessTracker) -> Self {
        let extent = tracker.range();
        let playback = PlaybackState::with_pacing(crate::types::Pacing::Relative {
            fps: config.render.initial_fps,
        });
        Self {
            config,
            tracker,
            extent,
            params: watch::channel(None).0,
            range: watch::channel(extent).0,
            playback: watch::channel(playback).0,
            actual_fps: watch::channel(0.0).0,
            reader_signal: Signal::new(),
            render_signal: Signal::new(),
            events: broadcast::channel(64).0,
        }
    }

    pub fn param(&self) -> Option<ImageParameter> {
        *self.params.borrow()
    }

    pub fn frame_range(&self) -> FrameRange {
        *self.range.borrow()
    }

    pub fn playback(&self) -> PlaybackState {
        *self.playback.borrow()
    }

    /// Move the current frame; followers of a non-primary view need a new request.
    pub fn set_frame(&self, frame: u32) {
        let moved = self.params.send_if_modified(|param| match param {
            Some(p) if p.frame != frame => {
                p.frame = frame;
                true
            }
            _ => false,
        });
        if moved && !self.config.session.primary {
            self.reader_signal.signal(ReaderReason::ParameterChanged);
        }
    }

    pub fn emit(&self, event: StreamEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }
}
