//! Frame types passed between sources, the encoder and the cache.

use std::fmt;
use std::time::Instant;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::viewers::QualityTier;

/// Bytes per pixel of the interleaved RGB8 layout every source produces.
pub const RGB_CHANNELS: usize = 3;

/// Identifier of one configured camera source, as it appears in URLs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for SourceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// One uncompressed frame straight off a camera.
///
/// Pixels are interleaved RGB8, row-major, with no padding between rows.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
    pub captured_at: Instant,
}

impl RawFrame {
    /// Wrap a pixel buffer captured right now.
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Self {
        Self::captured_at(width, height, pixels, Instant::now())
    }

    pub fn captured_at(width: u32, height: u32, pixels: Vec<u8>, captured_at: Instant) -> Self {
        Self {
            width,
            height,
            pixels,
            captured_at,
        }
    }

    /// Build a frame from a decoded `image` buffer.
    pub fn from_rgb_image(image: image::RgbImage) -> Self {
        let (width, height) = image.dimensions();
        Self::new(width, height, image.into_raw())
    }

    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * RGB_CHANNELS
    }

    /// A frame is well formed when it has an area and its buffer matches it.
    pub fn is_well_formed(&self) -> bool {
        self.width > 0 && self.height > 0 && self.pixels.len() == self.expected_len()
    }
}

/// A JPEG-compressed frame, shared read-only by every attached viewer.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub data: Bytes,
    pub tier: QualityTier,
    pub jpeg_quality: u8,
    pub width: u32,
    pub height: u32,
    /// Capture time of the raw frame this was encoded from
    pub captured_at: Instant,
}

impl EncodedFrame {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_well_formed_frame() {
        let frame = RawFrame::new(4, 2, vec![0; 4 * 2 * 3]);
        assert!(frame.is_well_formed());
        assert_eq!(frame.expected_len(), 24);
    }

    #[test]
    fn test_truncated_frame_is_rejected() {
        let frame = RawFrame::new(4, 2, vec![0; 10]);
        assert!(!frame.is_well_formed());

        let empty = RawFrame::new(0, 0, Vec::new());
        assert!(!empty.is_well_formed());
    }

    #[test]
    fn test_source_id_serializes_as_plain_string() {
        let id = SourceId::from("robot");
        assert_eq!(serde_json::to_string(&id).expect("serialize"), "\"robot\"");
        assert_eq!(id.to_string(), "robot");
    }
}
