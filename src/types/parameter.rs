//! Viewing parameters requested by the view chain

use serde::{Deserialize, Serialize};
use std::fmt;

/// Rectangular portion of the image at the requested resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl SubRegion {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Number of pixels covered by the region.
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Whether `other` lies completely inside this region.
    pub fn contains(&self, other: &SubRegion) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.x as u64 + other.width as u64 <= self.x as u64 + self.width as u64
            && other.y as u64 + other.height as u64 <= self.y as u64 + self.height as u64
    }
}

impl fmt::Display for SubRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}+{}+{}", self.width, self.height, self.x, self.y)
    }
}

/// One of the discrete decimation levels of a JPEG 2000 codestream.
///
/// `width`/`height` are the full image dimensions at this level; they become the
/// `fsiz` request field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResolutionLevel {
    /// Number of discarded DWT levels (0 = full resolution)
    pub level: u8,
    pub width: u32,
    pub height: u32,
}

impl ResolutionLevel {
    pub fn new(level: u8, width: u32, height: u32) -> Self {
        Self { level, width, height }
    }

    /// Scale factor relative to full resolution.
    pub fn zoom(&self) -> f64 {
        1.0 / f64::from(1u32 << self.level.min(31))
    }
}

/// The part of a parameter that determines which bytes the server has to send.
///
/// Frames completed under one key are no longer complete for another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestKey {
    pub region: SubRegion,
    pub resolution: ResolutionLevel,
    pub quality_layers: u16,
}

/// Immutable snapshot of what the view chain currently wants to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageParameter {
    pub region: SubRegion,
    pub resolution: ResolutionLevel,
    pub quality_layers: u16,
    /// Zero based composition layer (frame number)
    pub frame: u32,
}

impl ImageParameter {
    pub fn new(
        region: SubRegion,
        resolution: ResolutionLevel,
        quality_layers: u16,
        frame: u32,
    ) -> Self {
        Self { region, resolution, quality_layers, frame }
    }

    /// Same parameter pointing at another frame.
    pub fn with_frame(self, frame: u32) -> Self {
        Self { frame, ..self }
    }

    pub fn request_key(&self) -> RequestKey {
        RequestKey {
            region: self.region,
            resolution: self.resolution,
            quality_layers: self.quality_layers,
        }
    }

    /// Compare against a previous snapshot axis by axis.
    ///
    /// A missing previous snapshot counts as a change on every axis.
    pub fn delta(&self, previous: Option<&ImageParameter>) -> ParameterDelta {
        match previous {
            None => ParameterDelta { region: true, resolution: true, quality: true, frame: true },
            Some(prev) => ParameterDelta {
                region: self.region != prev.region,
                resolution: self.resolution != prev.resolution,
                quality: self.quality_layers != prev.quality_layers,
                frame: self.frame != prev.frame,
            },
        }
    }
}

impl fmt::Display for ImageParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[region={} level={} layers={} frame={}]",
            self.region, self.resolution.level, self.quality_layers, self.frame
        )
    }
}

/// Which axes differ between two parameter snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ParameterDelta {
    pub region: bool,
    pub resolution: bool,
    pub quality: bool,
    pub frame: bool,
}

impl ParameterDelta {
    /// Whether the cached bytes may no longer satisfy the view.
    pub fn view_changed(&self) -> bool {
        self.region || self.resolution || self.quality
    }

    pub fn any(&self) -> bool {
        self.view_changed() || self.frame
    }
}
