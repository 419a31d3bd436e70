//! Progressive JPIP streaming of large images and movies.
//!
//! jpipflow talks to a JPIP server over HTTP, keeps the received JPEG 2000
//! data-bins in a per-session cache, decodes the part of the image the
//! application currently looks at and paces movie playback so that it stays
//! smooth while the network delivers quality layers progressively.
//!
//! # Features
//!
//! - **Progressive streaming**: window requests over whole frame ranges,
//!   cache state tracked per frame and tied to region, resolution and quality
//! - **Adaptive bandwidth**: smoothed throughput estimate with a feedback
//!   controller that keeps a buffer lead during playback
//! - **Movie playback**: loop, stop and swing modes, constant frame rate or
//!   timestamp pacing, linked playback of several movies
//! - **Pluggable seams**: transport, JPEG 2000 engine and frame consumer are
//!   traits
//!
//! # Architecture
//!
//! Every [`StreamSession`] runs two tokio tasks. The reader turns parameter
//! changes into requests and responses into cache state; the render worker
//! decodes from the cache and publishes frames to a [`FrameSink`]. Both sleep
//! on coalescing wake-up signals and re-derive what changed from parameter
//! snapshots.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use jpipflow::{Jpip, WatchSink};
//! use jpipflow::types::{FrameRange, ImageParameter, ResolutionLevel, SubRegion};
//! # use jpipflow::codec::{CodecEngine, DecodeSession};
//! # use jpipflow::cache::CompletenessTracker;
//! # struct Kakadu;
//! # impl CodecEngine for Kakadu {
//! #     fn channels(&self) -> u32 { 1 }
//! #     fn open<'a>(&'a mut self, _: &ImageParameter, _: &CompletenessTracker)
//! #         -> jpipflow::Result<Box<dyn DecodeSession + Send + 'a>> { unimplemented!() }
//! # }
//! use futures::StreamExt;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> jpipflow::Result<()> {
//!     jpipflow::logging::init("info");
//!     let sink = Arc::new(WatchSink::new());
//!     let mut session = Jpip::connect(
//!         "jpip://helio.example.org/jpip?aia_171.jpx",
//!         FrameRange::new(0, 59),
//!         jpipflow::codec::shared(Kakadu),
//!         sink.clone(),
//!     )?;
//!     session.set_parameter(ImageParameter::new(
//!         SubRegion::new(0, 0, 1024, 1024),
//!         ResolutionLevel::new(2, 1024, 1024),
//!         8,
//!         0,
//!     ));
//!     session.play();
//!
//!     let mut frames = sink.frames(Some(Duration::from_millis(40)));
//!     while let Some(frame) = frames.next().await {
//!         println!("frame {} ({} pixels)", frame.frame, frame.buffer.len());
//!     }
//!     session.abolish().await;
//!     Ok(())
//! }
//! ```

pub mod bandwidth;
pub mod cache;
pub mod codec;
pub mod config;
mod error;
pub mod link;
pub mod logging;
pub mod protocol;
pub mod reader;
pub mod render;
pub mod scheduler;
pub mod session;
pub mod signal;
pub mod sink;
#[cfg_attr(any(test, feature = "benchmark"), path = "test_utils.rs")]
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;
pub mod types;

pub use error::*;

pub use codec::{CodecEngine, DecodeSession, DecodedChunk, SharedCodec};
pub use config::{Endpoint, StreamConfig};
pub use session::{Capabilities, ResourceInfo, StreamEvent, StreamSession};
pub use sink::{FrameSink, FrameSubscription, WatchSink};

use std::sync::Arc;

use protocol::HttpConnector;
use types::FrameRange;

/// Entry point for the common cases.
///
/// Both constructors use the default [`StreamConfig`]; use
/// [`StreamSession::open`] for anything else.
pub struct Jpip;

impl Jpip {
    /// Stream `frames` of the target named by `url` over HTTP.
    ///
    /// `url` is `jpip://host[:port]/path?target` or
    /// `http://host[:port]/path?target=name`.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Config`] when the URL cannot be parsed. Network
    /// failures surface later as [`StreamEvent`]s and are retried.
    pub fn connect<E: CodecEngine>(
        url: &str,
        frames: FrameRange,
        codec: SharedCodec<E>,
        sink: Arc<dyn FrameSink>,
    ) -> Result<StreamSession> {
        let resource = ResourceInfo { endpoint: Some(Endpoint::parse(url)?), frames };
        StreamSession::open(
            StreamConfig::default(),
            resource,
            HttpConnector::default(),
            codec,
            sink,
            Capabilities::default(),
        )
    }

    /// Play a resource whose data is already complete, e.g. a local file.
    pub fn open_local<E: CodecEngine>(
        frames: FrameRange,
        codec: SharedCodec<E>,
        sink: Arc<dyn FrameSink>,
    ) -> Result<StreamSession> {
        StreamSession::open(
            StreamConfig::default(),
            ResourceInfo { endpoint: None, frames },
            HttpConnector::default(),
            codec,
            sink,
            Capabilities::default(),
        )
    }
}
