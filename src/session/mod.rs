//! Streaming session: the handle the embedding application holds
//!
//! A [`StreamSession`] owns two tokio tasks, the reader and the render worker,
//! and the state they share. The application publishes viewing parameters and
//! playback controls through the session; decoded frames arrive at the
//! [`FrameSink`] given at construction.
//!
//! ```rust,no_run
//! use jpipflow::config::{Endpoint, StreamConfig};
//! use jpipflow::session::{Capabilities, ResourceInfo, StreamSession};
//! use jpipflow::sink::WatchSink;
//! use jpipflow::types::{FrameRange, ImageParameter, ResolutionLevel, SubRegion};
//! use jpipflow::protocol::HttpConnector;
//! # use jpipflow::codec::{CodecEngine, DecodeSession};
//! # use jpipflow::cache::CompletenessTracker;
//! # struct Engine;
//! # impl CodecEngine for Engine {
//! #     fn channels(&self) -> u32 { 1 }
//! #     fn open<'a>(&'a mut self, _: &ImageParameter, _: &CompletenessTracker)
//! #         -> jpipflow::Result<Box<dyn DecodeSession + Send + 'a>> { unimplemented!() }
//! # }
//! use std::sync::Arc;
//!
//! # async fn demo() -> jpipflow::Result<()> {
//! let resource = ResourceInfo {
//!     endpoint: Some(Endpoint::parse("jpip://helio.example.org/jpip?aia_171.jpx")?),
//!     frames: FrameRange::new(0, 119),
//! };
//! let sink = Arc::new(WatchSink::new());
//! let mut session = StreamSession::open(
//!     StreamConfig::default(),
//!     resource,
//!     HttpConnector::default(),
//!     jpipflow::codec::shared(Engine),
//!     sink.clone(),
//!     Capabilities::default(),
//! )?;
//!
//! session.set_parameter(ImageParameter::new(
//!     SubRegion::new(0, 0, 1024, 1024),
//!     ResolutionLevel::new(2, 1024, 1024),
//!     8,
//!     0,
//! ));
//! session.play();
//! // ...
//! session.abolish().await;
//! # Ok(())
//! # }
//! ```

mod shared;
#[cfg(test)]
mod tests;

pub(crate) use shared::Shared;
pub use shared::StreamEvent;

use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Result;
use crate::bandwidth::{BandwidthEstimator, BandwidthState};
use crate::cache::{CacheStatus, CompletenessTracker};
use crate::codec::{CodecEngine, SharedCodec};
use crate::config::{Endpoint, StreamConfig, TeardownConfig};
use crate::link::LinkMembership;
use crate::protocol::{CloseHandle, Connector, ProtocolClient, Shutdown};
use crate::reader::{ReaderReason, ReaderWorker};
use crate::render::{RenderReason, RenderWorker};
use crate::scheduler::FrameTimestamps;
use crate::sink::FrameSink;
use crate::types::{
    AnimationMode, Direction, FrameRange, ImageParameter, Pacing, PlayOrigin, PlaybackState,
};

/// What is being streamed.
#[derive(Debug, Clone)]
pub struct ResourceInfo {
    /// Server location; `None` for a resource that is available locally
    pub endpoint: Option<Endpoint>,
    /// Composition layers the resource offers
    pub frames: FrameRange,
}

/// Optional features of a resource, fixed for the life of the session.
#[derive(Clone, Default)]
pub struct Capabilities {
    /// Per-frame timestamps, needed for absolute pacing and link matching
    pub timestamps: Option<Arc<dyn FrameTimestamps>>,
    pub link: Option<LinkMembership>,
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities")
            .field("timestamps", &self.timestamps.is_some())
            .field("link", &self.link.as_ref().map(|m| m.role))
            .finish()
    }
}

/// A spawned worker task and its cancellation.
struct Worker<T> {
    name: &'static str,
    cancel: CancellationToken,
    handle: Option<JoinHandle<T>>,
}

impl<T> Worker<T> {
    fn new(name: &'static str, cancel: CancellationToken, handle: JoinHandle<T>) -> Self {
        Self { name, cancel, handle: Some(handle) }
    }

    /// Cancel and wait for the task, aborting it when it does not stop in time.
    /// Later calls return `None` immediately.
    async fn join(&mut self, teardown: &TeardownConfig) -> Option<T> {
        let mut handle = self.handle.take()?;
        for attempt in 1..=teardown.join_attempts {
            self.cancel.cancel();
            match tokio::time::timeout(teardown.join_poll(), &mut handle).await {
                Ok(Ok(value)) => return Some(value),
                Ok(Err(e)) => {
                    warn!("{} task ended abnormally: {}", self.name, e);
                    return None;
                }
                Err(_) => debug!("{} still running after join attempt {}", self.name, attempt),
            }
        }
        warn!("{} did not stop, aborting", self.name);
        handle.abort();
        None
    }
}

/// Handle to one streaming session.
pub struct StreamSession {
    shared: Arc<Shared>,
    reader: Worker<Option<Box<dyn Shutdown>>>,
    render: Worker<()>,
    close: Option<CloseHandle>,
    bandwidth: watch::Receiver<BandwidthState>,
}

impl StreamSession {
    /// Spawn the workers of a new session. Must be called inside a tokio runtime.
    pub fn open<C, E>(
        config: StreamConfig,
        resource: ResourceInfo,
        connector: C,
        codec: SharedCodec<E>,
        sink: Arc<dyn FrameSink>,
        capabilities: Capabilities,
    ) -> Result<Self>
    where
        C: Connector,
        E: CodecEngine,
    {
        config.validate()?;

        let tracker = match resource.endpoint {
            Some(_) => CompletenessTracker::new(resource.frames),
            None => CompletenessTracker::local(resource.frames),
        };
        let client = resource
            .endpoint
            .filter(|_| !config.session.offline)
            .map(|endpoint| ProtocolClient::new(connector, endpoint));
        let close = client.as_ref().map(ProtocolClient::close_handle);

        let estimator = BandwidthEstimator::new(config.bandwidth.clone());
        let bandwidth = estimator.subscribe();
        let shared = Arc::new(Shared::new(config, tracker));

        info!(
            "Opening {} session over frames {}",
            if client.is_some() { "remote" } else { "local" },
            resource.frames
        );

        let reader_cancel = CancellationToken::new();
        let reader = ReaderWorker::new(shared.clone(), client, estimator, reader_cancel.clone());
        let reader = Worker::new("reader", reader_cancel, tokio::spawn(reader.run()));

        let render_cancel = CancellationToken::new();
        let render = RenderWorker::new(
            shared.clone(),
            codec,
            sink,
            capabilities.timestamps,
            capabilities.link,
            render_cancel.clone(),
        );
        let render = Worker::new("render", render_cancel, tokio::spawn(render.run()));

        Ok(Self { shared, reader, render, close, bandwidth })
    }

    /// Publish a new viewing parameter snapshot.
    pub fn set_parameter(&self, param: ImageParameter) {
        let range = self.shared.frame_range();
        self.shared.params.send_replace(Some(param.with_frame(range.clamp(param.frame))));
        self.shared.reader_signal.signal(ReaderReason::ParameterChanged);
        self.shared.render_signal.signal(RenderReason::NewData);
    }

    pub fn parameter(&self) -> Option<ImageParameter> {
        self.shared.param()
    }

    /// Restrict playback to `range`, clipped to the frames of the resource.
    pub fn set_frame_range(&self, range: FrameRange) {
        let extent = self.shared.extent;
        let range = FrameRange::new(extent.clamp(range.start), extent.clamp(range.end));
        self.shared.tracker.set_range(range);
        self.shared.range.send_replace(range);
        self.shared.params.send_if_modified(|param| match param {
            Some(p) if !range.contains(p.frame) => {
                p.frame = range.clamp(p.frame);
                true
            }
            _ => false,
        });
        self.shared.reader_signal.signal(ReaderReason::ParameterChanged);
        self.shared.render_signal.signal(RenderReason::NewData);
    }

    pub fn frame_range(&self) -> FrameRange {
        self.shared.frame_range()
    }

    /// Start movie playback from the current frame.
    pub fn play(&self) {
        let range = self.shared.frame_range();
        let frame = self.current_frame().unwrap_or(range.start);
        let accessible = self.shared.tracker.accessible_until().unwrap_or(frame);
        let started = self.shared.playback.send_if_modified(|pb| {
            if pb.movie {
                return false;
            }
            pb.movie = true;
            pb.origin = Some(PlayOrigin { frame, accessible });
            true
        });
        if started {
            debug!("Play from frame {} with frames up to {} buffered", frame, accessible);
            self.shared.reader_signal.signal(ReaderReason::Play);
            self.shared.render_signal.signal(RenderReason::MoviePlay);
        }
    }

    pub fn pause(&self) {
        let stopped = self.shared.playback.send_if_modified(|pb| {
            if !pb.movie {
                return false;
            }
            pb.movie = false;
            pb.origin = None;
            true
        });
        if stopped {
            self.shared.reader_signal.signal(ReaderReason::Pause);
            self.shared.render_signal.signal(RenderReason::Other);
        }
    }

    pub fn set_pacing(&self, pacing: Pacing) {
        self.update_playback(|pb| pb.pacing = pacing);
        self.shared.reader_signal.signal(ReaderReason::FrameRate);
    }

    pub fn set_animation_mode(&self, mode: AnimationMode) {
        self.update_playback(|pb| pb.animation = mode);
    }

    pub fn set_direction(&self, direction: Direction) {
        self.update_playback(|pb| pb.direction = direction);
    }

    pub fn set_linked(&self, linked: bool) {
        self.update_playback(|pb| pb.linked = linked);
    }

    fn update_playback(&self, f: impl FnOnce(&mut PlaybackState)) {
        self.shared.playback.send_modify(f);
        self.shared.render_signal.signal(RenderReason::Other);
    }

    pub fn playback(&self) -> PlaybackState {
        self.shared.playback()
    }

    pub fn current_frame(&self) -> Option<u32> {
        self.shared.param().map(|p| p.frame)
    }

    pub fn status(&self, frame: u32) -> CacheStatus {
        self.shared.tracker.status(frame)
    }

    pub fn accessible_until(&self) -> Option<u32> {
        self.shared.tracker.accessible_until()
    }

    pub fn events(&self) -> broadcast::Receiver<StreamEvent> {
        self.shared.events.subscribe()
    }

    /// Frame rate actually achieved during playback.
    pub fn actual_fps(&self) -> f32 {
        *self.shared.actual_fps.borrow()
    }

    pub fn subscribe_fps(&self) -> watch::Receiver<f32> {
        self.shared.actual_fps.subscribe()
    }

    pub fn bandwidth(&self) -> BandwidthState {
        *self.bandwidth.borrow()
    }

    /// Stop both workers and close the connection.
    ///
    /// The render worker stops first so no decode runs against a cache that is
    /// being torn down, then the reader, then the connection. Each join is
    /// bounded by the teardown configuration. Idempotent.
    pub async fn abolish(&mut self) {
        let teardown = self.shared.config.teardown.clone();
        self.render.join(&teardown).await;
        if let Some(Some(mut client)) = self.reader.join(&teardown).await {
            client.shutdown().await;
        }
        // Covers a reader that had to be aborted
        if let Some(close) = self.close.take() {
            close.close();
        }
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.render.cancel.cancel();
        self.reader.cancel.cancel();
        if let Some(close) = &self.close {
            close.close();
        }
    }
}

impl std::fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSession")
            .field("frames", &self.shared.frame_range())
            .field("parameter", &self.shared.param())
            .field("playback", &self.shared.playback())
            .finish()
    }
}
