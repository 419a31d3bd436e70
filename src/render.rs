//! Render worker: decodes the current frame and drives movie playback

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::codec::{CodecEngine, SharedCodec};
use crate::link::{LinkMembership, LinkPosition, follow};
use crate::scheduler::{FrameScheduler, FrameTimestamps};
use crate::session::{Shared, StreamEvent};
use crate::signal::{Reason, Reasons};
use crate::sink::FrameSink;
use crate::types::{DecodedFrame, ImageParameter, PixelBuffer, PlaybackState};
use crate::{Result, StreamError};

/// Why the render worker was woken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderReason {
    NewData,
    MoviePlay,
    Other,
}

impl Reason for RenderReason {
    const ALL: &'static [Self] = &[RenderReason::NewData, RenderReason::MoviePlay, RenderReason::Other];

    fn index(self) -> u8 {
        self as u8
    }
}

/// Frames shown per second of wall time, published about once a second.
struct FpsMeter {
    frames: u32,
    since: Instant,
    published: bool,
}

impl FpsMeter {
    fn new() -> Self {
        Self { frames: 0, since: Instant::now(), published: false }
    }

    fn restart(&mut self, now: Instant) {
        self.frames = 0;
        self.since = now;
    }

    fn tick(&mut self, now: Instant, out: &watch::Sender<f32>) {
        self.frames += 1;
        let elapsed = now.saturating_duration_since(self.since);
        if elapsed >= Duration::from_secs(1) {
            out.send_replace(self.frames as f32 / elapsed.as_secs_f32());
            self.published = true;
            self.restart(now);
        }
    }

    fn stop(&mut self, out: &watch::Sender<f32>) {
        if self.published {
            out.send_replace(0.0);
            self.published = false;
        }
        self.frames = 0;
    }
}

enum Wake {
    Signal(Reasons<RenderReason>),
    Link,
    Cancelled,
}

pub(crate) struct RenderWorker<E: CodecEngine> {
    shared: Arc<Shared>,
    codec: SharedCodec<E>,
    sink: Arc<dyn FrameSink>,
    scheduler: FrameScheduler,
    timestamps: Option<Arc<dyn FrameTimestamps>>,
    link: Option<LinkMembership>,
    cancel: CancellationToken,
    /// Last buffer handed out; reused when the consumer let go of it
    buffer: Option<Arc<PixelBuffer>>,
    fps: FpsMeter,
    last_playback: PlaybackState,
}

impl<E: CodecEngine> RenderWorker<E> {
    pub fn new(
        shared: Arc<Shared>,
        codec: SharedCodec<E>,
        sink: Arc<dyn FrameSink>,
        timestamps: Option<Arc<dyn FrameTimestamps>>,
        link: Option<LinkMembership>,
        cancel: CancellationToken,
    ) -> Self {
        let last_playback = shared.playback();
        Self {
            shared,
            codec,
            sink,
            scheduler: FrameScheduler::new(timestamps.clone()),
            timestamps,
            link,
            cancel,
            buffer: None,
            fps: FpsMeter::new(),
            last_playback,
        }
    }

    pub async fn run(mut self) {
        let channels = self.codec.lock().await.channels();
        info!("Render worker started ({} channels)", channels);
        let mut link_rx = self
            .link
            .as_ref()
            .filter(|m| !m.is_master())
            .map(|m| m.link.subscribe());

        loop {
            let following = self.shared.playback().linked && link_rx.is_some();
            let wake = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Wake::Cancelled,
                reasons = self.shared.render_signal.wait() => Wake::Signal(reasons),
                _ = link_moved(&mut link_rx), if following => Wake::Link,
            };
            match wake {
                Wake::Cancelled => break,
                Wake::Signal(reasons) => trace!("Render woke: {:?}", reasons),
                Wake::Link => self.follow_link(),
            }
            self.render(channels).await;
        }
        self.fps.stop(&self.shared.actual_fps);
        debug!("Render worker stopped");
    }

    /// Jump to the frame matching the master's position.
    fn follow_link(&self) {
        let Some(position) = self.link.as_ref().and_then(|m| m.link.position()) else {
            return;
        };
        let frame = follow(position, self.shared.frame_range(), self.timestamps.as_deref());
        trace!("Following master to frame {}", frame);
        self.shared.set_frame(frame);
    }

    /// Render the current frame, and keep rendering while a movie plays.
    async fn render(&mut self, channels: u32) {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            let frame_start = Instant::now();
            let Some(param) = self.shared.param() else {
                return;
            };
            let range = self.shared.frame_range();
            let playback = self.shared.playback();
            let param = param.with_frame(range.clamp(param.frame));
            let frame = param.frame;

            if playback.interrupts(&self.last_playback) {
                self.scheduler.reset_clock(frame, frame_start);
                self.fps.restart(frame_start);
            }
            self.last_playback = playback;
            if !playback.movie {
                self.fps.stop(&self.shared.actual_fps);
            }

            if playback.movie && !self.wait_accessible(frame).await {
                self.shared.render_signal.signal(RenderReason::NewData);
                return;
            }

            if playback.movie && playback.linked {
                if let Some(membership) = self.link.as_ref().filter(|m| m.is_master()) {
                    let timestamp_ms = self.timestamps.as_ref().and_then(|t| t.timestamp_ms(frame));
                    membership.link.publish(LinkPosition { frame, timestamp_ms });
                }
            }

            if self.shared.tracker.can_render(frame, &param) {
                let reuse = playback.movie || playback.linked;
                match self.decode(&param, channels, reuse).await {
                    Ok(decoded) => {
                        self.buffer = Some(decoded.buffer.clone());
                        self.sink.publish(decoded);
                        if playback.movie {
                            self.fps.tick(Instant::now(), &self.shared.actual_fps);
                        }
                    }
                    Err(StreamError::ParameterDesync { expected, actual }) => {
                        warn!("Params out of sync, skip frame {} ({} vs {} pixels)", frame, actual, expected);
                        self.shared.emit(StreamEvent::FrameSkipped { frame });
                    }
                    Err(StreamError::Closed) => return,
                    Err(e) => warn!("Decoding frame {} failed: {}", frame, e),
                }
            } else {
                trace!("Frame {} has no data for {}", frame, param);
            }

            if !playback.movie {
                return;
            }

            let step = self.scheduler.advance(frame, range, &playback, Instant::now());
            if step.stop_movie || step.direction != playback.direction {
                self.shared.playback.send_modify(|pb| {
                    pb.direction = step.direction;
                    if step.stop_movie {
                        pb.movie = false;
                        pb.origin = None;
                    }
                });
                self.last_playback = self.shared.playback();
            }
            self.shared.set_frame(step.frame);

            let elapsed = frame_start.elapsed().as_millis() as i64;
            let wait = step.delay_ms - elapsed;
            if wait > 0 {
                if !self.pause(Duration::from_millis(wait as u64)).await {
                    return;
                }
            } else {
                tokio::task::yield_now().await;
            }
        }
    }

    /// Wait for `frame` to become accessible, bounded by the configured fallback.
    async fn wait_accessible(&self, frame: u32) -> bool {
        let tracker = &self.shared.tracker;
        if tracker.accessible_until().is_some_and(|a| a >= frame) {
            return true;
        }
        let mut rx = tracker.subscribe_accessible();
        let reached = rx.wait_for(|a| a.is_some_and(|a| a >= frame));
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            result = tokio::time::timeout(self.shared.config.render.accessible_wait(), reached) => {
                matches!(result, Ok(Ok(_)))
            }
        }
    }

    /// Sleep between movie frames; false when interrupted by cancellation or a
    /// playback change that needs a fresh schedule.
    async fn pause(&self, duration: Duration) -> bool {
        let mut rx = self.shared.playback.subscribe();
        let before = *rx.borrow_and_update();
        let interrupted = rx.wait_for(|pb| pb.interrupts(&before));
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = interrupted => {
                self.shared.render_signal.signal(RenderReason::Other);
                false
            }
            _ = tokio::time::sleep(duration) => true,
        }
    }

    /// Decode `param` in bounded chunks into a pixel buffer.
    async fn decode(&mut self, param: &ImageParameter, channels: u32, reuse: bool) -> Result<DecodedFrame> {
        let region = param.region;
        let pixels = region.pixel_count();
        let mut buffer = self
            .buffer
            .take()
            .filter(|_| reuse)
            .and_then(|b| Arc::try_unwrap(b).ok())
            .filter(|b| b.fits(channels, pixels))
            .unwrap_or_else(|| PixelBuffer::for_channels(channels, pixels));

        let max_samples = self.shared.config.render.max_render_samples;
        let mut engine = self.codec.lock().await;
        let mut session = engine.open(param, &self.shared.tracker)?;
        while let Some(chunk) = session.process(max_samples)? {
            let area = chunk.region;
            if !region.contains(&area) || chunk.samples.len() != area.pixel_count() {
                return Err(StreamError::ParameterDesync { expected: pixels, actual: chunk.samples.len() });
            }
            if area.width > 0 {
                for (row, samples) in chunk.samples.chunks_exact(area.width as usize).enumerate() {
                    let dest = (area.y - region.y) as usize * region.width as usize
                        + row * region.width as usize
                        + (area.x - region.x) as usize;
                    if !buffer.write_row(dest, samples) {
                        return Err(StreamError::ParameterDesync { expected: pixels, actual: dest + samples.len() });
                    }
                }
            }
            if self.cancel.is_cancelled() {
                return Err(StreamError::Closed);
            }
            tokio::task::yield_now().await;
        }
        drop(session);
        drop(engine);

        Ok(DecodedFrame { buffer: Arc::new(buffer), region, frame: param.frame })
    }
}

/// Resolves when the link position changed; never for sessions outside a link.
async fn link_moved(rx: &mut Option<watch::Receiver<Option<LinkPosition>>>) {
    match rx {
        Some(rx) => {
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending().await,
    }
}
