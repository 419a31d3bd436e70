//! Reader worker: turns parameter changes into requests and responses into cache state
//!
//! The worker sleeps on its [`Signal`](crate::signal::Signal). On every wake-up
//! it compares the current [`ImageParameter`] snapshot with the one its last
//! request was built from, opens the connection if needed, sends a window
//! request when the view changed and then drains responses until nothing is
//! pending. While draining, the primary view keeps feeding the bandwidth
//! estimator and re-checks its signal between messages so that a zoom, a frame
//! rate change or play/pause is answered without waiting for the old response
//! to finish.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::bandwidth::{BandwidthEstimator, PlaybackFeedback};
use crate::config::NotifyPolicy;
use crate::protocol::{ClientState, Connector, DataSegment, JpipQuery, ProtocolClient, Shutdown};
use crate::render::RenderReason;
use crate::session::{Shared, StreamEvent};
use crate::signal::{Reason, Reasons};
use crate::types::{FrameRange, ImageParameter, PlayOrigin};
use crate::{Result, StreamError};

/// Why the reader was woken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderReason {
    ParameterChanged,
    FrameRate,
    Play,
    Pause,
    /// A previous attempt failed
    Retry,
}

impl Reason for ReaderReason {
    const ALL: &'static [Self] = &[
        ReaderReason::ParameterChanged,
        ReaderReason::FrameRate,
        ReaderReason::Play,
        ReaderReason::Pause,
        ReaderReason::Retry,
    ];

    fn index(self) -> u8 {
        self as u8
    }
}

/// The view a request was made for.
#[derive(Debug, Clone, Copy)]
struct Window {
    param: ImageParameter,
    /// Frame range of the session when the request was made
    range: FrameRange,
    /// Frames the response is expected to fill
    implicated: FrameRange,
}

pub(crate) struct ReaderWorker<C: Connector> {
    shared: Arc<Shared>,
    /// `None` for local resources and offline sessions
    client: Option<ProtocolClient<C>>,
    estimator: BandwidthEstimator,
    cancel: CancellationToken,
    /// Latest window requested
    window: Option<Window>,
    /// One entry per request sent and not yet answered to the end, oldest first
    requests: VecDeque<Window>,
    failures: u32,
    reset_reported: bool,
}

impl<C: Connector> ReaderWorker<C> {
    pub fn new(
        shared: Arc<Shared>,
        client: Option<ProtocolClient<C>>,
        estimator: BandwidthEstimator,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            shared,
            client,
            estimator,
            cancel,
            window: None,
            requests: VecDeque::new(),
            failures: 0,
            reset_reported: false,
        }
    }

    /// Run until cancelled; hands back the client for an orderly shutdown.
    pub async fn run(mut self) -> Option<Box<dyn Shutdown>> {
        info!("Reader started ({})", if self.client.is_some() { "remote" } else { "local" });

        if self.client.is_some() && self.shared.config.session.persistent {
            if let Err(e) = self.connect().await {
                self.connection_lost(e).await;
            }
        }

        let cancel = self.cancel.clone();
        loop {
            let reasons = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                reasons = self.shared.reader_signal.wait() => reasons,
            };
            trace!("Reader woke: {:?}", reasons);

            if self.client.is_none() {
                self.shared.render_signal.signal(RenderReason::NewData);
                continue;
            }
            if let Err(e) = self.serve(reasons).await {
                if cancel.is_cancelled() {
                    break;
                }
                self.connection_lost(e).await;
            }
        }

        debug!("Reader stopped with {} responses pending", self.requests.len());
        self.client.map(|client| Box::new(client) as Box<dyn Shutdown>)
    }

    fn client(&mut self) -> Result<&mut ProtocolClient<C>> {
        self.client.as_mut().ok_or(StreamError::Closed)
    }

    fn is_connected(&self) -> bool {
        self.client.as_ref().is_some_and(|c| c.is_connected())
    }

    async fn serve(&mut self, reasons: Reasons<ReaderReason>) -> Result<()> {
        let Some(param) = self.shared.param() else {
            return Ok(());
        };
        let range = self.shared.frame_range();

        let requery = self.needs_window(&param, range)
            || reasons.contains(ReaderReason::Play)
            || reasons.contains(ReaderReason::Pause)
            || reasons.contains(ReaderReason::Retry);

        let mut reconnected = false;
        if !self.is_connected() && (self.shared.config.session.persistent || requery) {
            self.connect().await?;
            reconnected = true;
        }
        if !self.is_connected() {
            return Ok(());
        }

        if requery || reconnected {
            self.request_window(param, range).await?;
        } else if reasons.contains(ReaderReason::FrameRate) {
            self.request_rate().await?;
        }

        self.drain().await
    }

    /// Whether the cached bytes may not satisfy `param` over `range`.
    fn needs_window(&self, param: &ImageParameter, range: FrameRange) -> bool {
        let Some(window) = &self.window else {
            return true;
        };
        let delta = param.delta(Some(&window.param));
        delta.view_changed()
            || window.range != range
            || (delta.frame && !self.shared.config.session.primary)
    }

    async fn connect(&mut self) -> Result<()> {
        let tracker = &self.shared.tracker;
        let model = (self.shared.extent.len() == 1 && tracker.bytes_held() > 0)
            .then(|| tracker.model_descriptor());

        let cancel = self.cancel.clone();
        let client = self.client()?;
        let segments = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StreamError::Closed),
            result = client.connect(model.as_deref()) => result?,
        };
        for segment in &segments {
            self.shared.tracker.record_segment(segment);
        }
        self.failures = 0;
        self.requests.clear();
        self.window = None;
        Ok(())
    }

    /// Send a window request for `param` and prepare the tracker for it.
    async fn request_window(&mut self, param: ImageParameter, range: FrameRange) -> Result<()> {
        let primary = self.shared.config.session.primary;
        let frame = range.clamp(param.frame);
        let (first, last, implicated) = if primary {
            let last = if frame == range.start { range.end } else { frame - 1 };
            (frame, last, range)
        } else {
            (frame, frame, FrameRange::single(frame))
        };

        self.shared.tracker.begin_request(implicated, param.request_key());

        let mut query = JpipQuery::window(&param, first, last);
        if primary {
            if let Some(bps) = self.estimator.estimate() {
                query = query.with_rate(bps, self.shared.playback().speed());
            }
        }
        debug!("Requesting {} over jpxl<{}-{}>", param, first, last);
        let window = Window { param, range, implicated };
        self.send(query, window).await?;
        self.window = Some(window);
        Ok(())
    }

    /// Tell the server about a new rate without changing the window.
    async fn request_rate(&mut self) -> Result<()> {
        if !self.shared.config.session.primary {
            return Ok(());
        }
        let (Some(bps), Some(window)) = (self.estimator.estimate(), self.window) else {
            return Ok(());
        };
        let speed = self.shared.playback().speed();
        debug!("Rate update: {:.0} bps at speed {}", bps, speed);
        self.send(JpipQuery::rate_update(bps, speed), window).await
    }

    /// Send `query`; its response will be attributed to `window`.
    async fn send(&mut self, query: JpipQuery, window: Window) -> Result<()> {
        let cancel = self.cancel.clone();
        let client = self.client()?;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StreamError::Closed),
            result = client.send_query(query) => result?,
        }
        self.requests.push_back(window);
        Ok(())
    }

    /// Read responses until none is pending.
    async fn drain(&mut self) -> Result<()> {
        let cancel = self.cancel.clone();
        while let Some(&answering) = self.requests.front() {
            let header = {
                let client = self.client()?;
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(StreamError::Closed),
                    header = client.read_header() => header?,
                }
            };
            if !header.is_success() {
                return Err(StreamError::protocol(
                    "response",
                    format!("server answered {} {}", header.status, header.reason),
                ));
            }
            self.estimator.begin_response(Instant::now());

            loop {
                let segment = {
                    let client = self.client()?;
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(StreamError::Closed),
                        segment = client.next_segment() => segment?,
                    }
                };
                let Some(segment) = segment else { break };
                self.absorb(&segment, &answering).await?;
                tokio::task::yield_now().await;
                if self.shared.config.session.primary {
                    self.recheck().await?;
                }
            }
            self.requests.pop_front();
            trace!("Response finished, {} pending", self.requests.len());
        }
        Ok(())
    }

    /// Store one message of the response answering `answering` and notify
    /// whoever needs to know.
    async fn absorb(&mut self, segment: &DataSegment, answering: &Window) -> Result<()> {
        let shared = self.shared.clone();
        let key = answering.param.request_key();
        let satisfied = shared.tracker.record_response_segment(segment, &key);

        if satisfied {
            shared.tracker.mark_complete_for(answering.implicated, &key);
            if self.window.is_some_and(|w| w.param.request_key() == key) {
                shared.emit(StreamEvent::DataChanged { frames: answering.implicated });
            }
        }
        let notify = match shared.config.session.notify {
            NotifyPolicy::OnNewData => satisfied || !segment.is_end(),
            NotifyPolicy::OnComplete => satisfied,
        };
        if notify {
            shared.render_signal.signal(RenderReason::NewData);
        }

        if shared.config.session.primary && !segment.payload.is_empty() {
            let feedback = self.feedback();
            let now = Instant::now();
            if self.estimator.observe(segment.payload.len(), now, Some(&feedback)) {
                self.request_rate().await?;
            }
        }
        Ok(())
    }

    fn feedback(&self) -> PlaybackFeedback {
        let playback = self.shared.playback();
        let range = self.shared.frame_range();
        let current = self.shared.param().map_or(range.start, |p| range.clamp(p.frame));
        let accessible = self.shared.tracker.accessible_until().unwrap_or(current.saturating_sub(1));
        PlaybackFeedback {
            playing: playback.movie,
            origin: playback.origin.unwrap_or(PlayOrigin { frame: current, accessible }),
            current,
            accessible,
            max_frame: range.end,
            speed: playback.speed(),
        }
    }

    /// React to signals raised while a response is being read.
    async fn recheck(&mut self) -> Result<()> {
        let Some(reasons) = self.shared.reader_signal.try_take() else {
            return Ok(());
        };
        let Some(param) = self.shared.param() else {
            return Ok(());
        };
        let range = self.shared.frame_range();

        if (reasons.contains(ReaderReason::ParameterChanged) && self.needs_window(&param, range))
            || reasons.contains(ReaderReason::Play)
            || reasons.contains(ReaderReason::Pause)
        {
            self.request_window(param, range).await
        } else if reasons.contains(ReaderReason::FrameRate) {
            self.request_rate().await
        } else {
            Ok(())
        }
    }

    /// Drop the connection, tell the application and schedule another attempt.
    async fn connection_lost(&mut self, error: StreamError) {
        let closed = self.cancel.is_cancelled()
            || self.client.as_ref().is_some_and(|c| c.state() == ClientState::Closed);
        if let Some(client) = self.client.as_mut() {
            client.disconnect();
        }
        self.requests.clear();
        if closed {
            debug!("Reader connection closed: {}", error);
            return;
        }
        warn!("Reader lost connection: {}", error);

        if error.is_connection_reset() {
            if !self.reset_reported {
                self.reset_reported = true;
                self.shared.emit(StreamEvent::ConnectionReset {
                    message: "The server reset the connection. Streaming many movies with many \
                              frames at once can exhaust it; consider fewer frames or movies."
                        .to_string(),
                });
            }
        } else {
            self.shared.emit(StreamEvent::ConnectionLost { reason: error.to_string() });
        }

        let delay = self.shared.config.retry.backoff(self.failures);
        self.failures = self.failures.saturating_add(1);
        debug!("Retrying in {:?} (attempt {})", delay, self.failures);
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(delay) => self.shared.reader_signal.signal(ReaderReason::Retry),
        }
    }
}
