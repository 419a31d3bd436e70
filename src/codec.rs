//! Seam to the JPEG 2000 decoding engine
//!
//! The engine itself is opaque. The render worker opens a decode session for
//! the current [`ImageParameter`] and pulls decoded rectangles out of it in
//! bounded chunks, so a large region never blocks the worker for long.

use std::sync::Arc;

use crate::Result;
use crate::cache::CompletenessTracker;
use crate::types::{ImageParameter, SubRegion};

/// A decoded rectangle inside the requested region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedChunk {
    /// Position in the same coordinates as [`ImageParameter::region`]
    pub region: SubRegion,
    /// Row-major compositor samples, `region.width * region.height` of them
    pub samples: Vec<u32>,
}

/// Progressive decode of one frame.
pub trait DecodeSession {
    /// Decode up to `max_samples` more samples; `None` once the frame is done.
    fn process(&mut self, max_samples: usize) -> Result<Option<DecodedChunk>>;
}

/// The decoding engine of one resource.
pub trait CodecEngine: Send + 'static {
    /// Number of image components.
    fn channels(&self) -> u32;

    /// Prepare decoding of `param.frame` from the bytes held by `cache`.
    fn open<'a>(
        &'a mut self,
        param: &ImageParameter,
        cache: &CompletenessTracker,
    ) -> Result<Box<dyn DecodeSession + Send + 'a>>;
}

/// Per-resource engine guarded for use across tasks.
pub type SharedCodec<E> = Arc<tokio::sync::Mutex<E>>;

/// Wrap an engine for sharing.
pub fn shared<E: CodecEngine>(engine: E) -> SharedCodec<E> {
    Arc::new(tokio::sync::Mutex::new(engine))
}
