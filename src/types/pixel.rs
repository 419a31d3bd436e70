//! Decoded pixel buffers handed to the downstream consumer

use std::sync::Arc;

use super::SubRegion;

/// Decoded samples of one sub-region.
///
/// The element width follows the channel count of the resource: single and
/// dual channel images decode to 8-bit indexed samples, colour images to packed
/// 32-bit ARGB.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PixelBuffer {
    Indexed8(Vec<u8>),
    Argb32(Vec<u32>),
}

impl PixelBuffer {
    /// Allocate a zeroed buffer for `pixels` samples of a resource with `channels` components.
    pub fn for_channels(channels: u32, pixels: usize) -> Self {
        if channels < 3 {
            PixelBuffer::Indexed8(vec![0; pixels])
        } else {
            PixelBuffer::Argb32(vec![0; pixels])
        }
    }

    pub fn len(&self) -> usize {
        match self {
            PixelBuffer::Indexed8(samples) => samples.len(),
            PixelBuffer::Argb32(samples) => samples.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether this buffer can hold `pixels` samples of a `channels` resource without reallocation.
    pub fn fits(&self, channels: u32, pixels: usize) -> bool {
        let kind_matches = matches!(
            (self, channels < 3),
            (PixelBuffer::Indexed8(_), true) | (PixelBuffer::Argb32(_), false)
        );
        kind_matches && self.len() == pixels
    }

    /// Copy one row of compositor samples into the buffer at `dest`.
    ///
    /// Indexed buffers keep bits 8..16 of each sample, which is where the
    /// compositor places the luminance of single channel images.
    pub fn write_row(&mut self, dest: usize, samples: &[u32]) -> bool {
        let end = dest + samples.len();
        match self {
            PixelBuffer::Indexed8(buf) => {
                let Some(target) = buf.get_mut(dest..end) else { return false };
                for (out, sample) in target.iter_mut().zip(samples) {
                    *out = ((sample >> 8) & 0xFF) as u8;
                }
            }
            PixelBuffer::Argb32(buf) => {
                let Some(target) = buf.get_mut(dest..end) else { return false };
                target.copy_from_slice(samples);
            }
        }
        true
    }
}

/// A decoded frame as published to the [`FrameSink`](crate::FrameSink).
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub buffer: Arc<PixelBuffer>,
    pub region: SubRegion,
    pub frame: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_count_selects_element_width() {
        assert!(matches!(PixelBuffer::for_channels(1, 4), PixelBuffer::Indexed8(_)));
        assert!(matches!(PixelBuffer::for_channels(3, 4), PixelBuffer::Argb32(_)));
        assert!(PixelBuffer::for_channels(4, 16).fits(3, 16));
        assert!(!PixelBuffer::for_channels(4, 16).fits(1, 16));
        assert!(!PixelBuffer::for_channels(1, 16).fits(1, 15));
    }

    #[test]
    fn indexed_rows_keep_second_byte() {
        let mut buffer = PixelBuffer::for_channels(1, 4);
        assert!(buffer.write_row(1, &[0x00AB_CD12, 0xFFFF_0100]));
        assert_eq!(buffer, PixelBuffer::Indexed8(vec![0, 0xCD, 0x01, 0]));
        assert!(!buffer.write_row(3, &[1, 2]));
    }

    #[test]
    fn argb_rows_copy_verbatim() {
        let mut buffer = PixelBuffer::for_channels(3, 3);
        assert!(buffer.write_row(0, &[7, 8, 9]));
        assert_eq!(buffer, PixelBuffer::Argb32(vec![7, 8, 9]));
    }
}
