//! Received data-bins and per-frame completeness

mod databin;
mod tracker;

pub use databin::ByteCache;
pub use tracker::{CacheStatus, CompletenessTracker};
