//! Inclusive composition-layer intervals

use serde::{Deserialize, Serialize};
use std::fmt;

/// Inclusive interval of frame indices `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameRange {
    pub start: u32,
    pub end: u32,
}

impl FrameRange {
    /// Create a range, swapping the bounds if they are reversed.
    pub fn new(start: u32, end: u32) -> Self {
        if start <= end { Self { start, end } } else { Self { start: end, end: start } }
    }

    /// Range covering a single frame.
    pub fn single(frame: u32) -> Self {
        Self { start: frame, end: frame }
    }

    pub fn len(&self) -> u32 {
        self.end - self.start + 1
    }

    /// Ranges always hold at least one frame.
    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, frame: u32) -> bool {
        (self.start..=self.end).contains(&frame)
    }

    pub fn clamp(&self, frame: u32) -> u32 {
        frame.clamp(self.start, self.end)
    }

    pub fn iter(&self) -> std::ops::RangeInclusive<u32> {
        self.start..=self.end
    }
}

impl fmt::Display for FrameRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_are_normalised() {
        let range = FrameRange::new(9, 2);
        assert_eq!(range, FrameRange { start: 2, end: 9 });
        assert_eq!(range.len(), 8);
        assert!(range.contains(2) && range.contains(9) && !range.contains(10));
        assert_eq!(range.clamp(42), 9);
        assert_eq!(range.iter().rev().next(), Some(9));
        assert_eq!(FrameRange::single(4).len(), 1);
    }
}
