//! Downstream delivery of decoded frames

use futures::Stream;
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, Sleep, sleep_until};
use tokio_stream::wrappers::WatchStream;

use crate::types::DecodedFrame;

/// Receives every frame the render worker produces.
pub trait FrameSink: Send + Sync + 'static {
    fn publish(&self, frame: DecodedFrame);
}

/// Sink that keeps only the latest frame and lets any number of consumers
/// observe it.
#[derive(Debug)]
pub struct WatchSink {
    tx: watch::Sender<Option<DecodedFrame>>,
}

impl WatchSink {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    pub fn latest(&self) -> Option<DecodedFrame> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<DecodedFrame>> {
        self.tx.subscribe()
    }

    /// Stream of frames delivered at most once per `min_interval`.
    pub fn frames(&self, min_interval: Option<Duration>) -> FrameSubscription {
        FrameSubscription::new(self.subscribe(), min_interval)
    }
}

impl Default for WatchSink {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSink for WatchSink {
    fn publish(&self, frame: DecodedFrame) {
        self.tx.send_replace(Some(frame));
    }
}

pin_project! {
    /// Frames from a [`WatchSink`], optionally rate limited.
    ///
    /// Frames arriving during the cool-down replace each other; only the
    /// newest is delivered when it ends.
    pub struct FrameSubscription {
        #[pin]
        frames: WatchStream<Option<DecodedFrame>>,
        cooldown: Pin<Box<Sleep>>,
        min_interval: Option<Duration>,
        cooling: bool,
        ended: bool,
        pending: Option<DecodedFrame>,
    }
}

impl FrameSubscription {
    pub fn new(rx: watch::Receiver<Option<DecodedFrame>>, min_interval: Option<Duration>) -> Self {
        Self {
            frames: WatchStream::new(rx),
            cooldown: Box::pin(sleep_until(Instant::now())),
            min_interval: min_interval.filter(|d| !d.is_zero()),
            cooling: false,
            ended: false,
            pending: None,
        }
    }
}

impl Stream for FrameSubscription {
    type Item = DecodedFrame;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<DecodedFrame>> {
        let mut this = self.project();

        while !*this.ended {
            match this.frames.as_mut().poll_next(cx) {
                Poll::Ready(Some(Some(frame))) => *this.pending = Some(frame),
                Poll::Ready(Some(None)) => {}
                Poll::Ready(None) => *this.ended = true,
                Poll::Pending => break,
            }
        }

        if this.pending.is_none() {
            return if *this.ended { Poll::Ready(None) } else { Poll::Pending };
        }

        if *this.cooling {
            if this.cooldown.as_mut().poll(cx).is_pending() {
                return Poll::Pending;
            }
            *this.cooling = false;
        }

        if let Some(interval) = *this.min_interval {
            this.cooldown.as_mut().reset(Instant::now() + interval);
            *this.cooling = true;
        }
        Poll::Ready(this.pending.take())
    }
}
