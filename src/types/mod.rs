//! Core value types shared by the protocol client and the workers.
//!
//! - [`ImageParameter`] is the immutable snapshot of what the view wants: a
//!   [`SubRegion`] at a [`ResolutionLevel`] with a number of quality layers for
//!   one frame. Snapshots are compared axis by axis with [`ParameterDelta`].
//! - [`FrameRange`] is an inclusive interval of composition layers.
//! - [`PlaybackState`] carries the movie controls read by the scheduler.
//! - [`PixelBuffer`] and [`DecodedFrame`] are what the render worker publishes.
//!
//! ```rust
//! use jpipflow::types::{ImageParameter, ResolutionLevel, SubRegion};
//!
//! let before = ImageParameter::new(SubRegion::new(0, 0, 512, 512), ResolutionLevel::new(1, 2048, 2048), 3, 0);
//! let after = ImageParameter::new(SubRegion::new(0, 0, 512, 512), ResolutionLevel::new(2, 1024, 1024), 3, 0);
//! let delta = after.delta(Some(&before));
//! assert!(delta.resolution && !delta.region);
//! ```

mod frame_range;
mod parameter;
mod pixel;
mod playback;

pub use frame_range::FrameRange;
pub use parameter::{ImageParameter, ParameterDelta, RequestKey, ResolutionLevel, SubRegion};
pub use pixel::{DecodedFrame, PixelBuffer};
pub use playback::{AnimationMode, Direction, Pacing, PlayOrigin, PlaybackState};
