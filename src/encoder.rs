//! JPEG compression of raw frames.

use bytes::Bytes;
use image::ExtendedColorType;
use image::codecs::jpeg::JpegEncoder;

use crate::frame::{EncodedFrame, RawFrame};
use crate::viewers::{QualityPolicy, QualityTier};
use crate::{OurError, OurResult};

pub const CONTENT_TYPE: &str = "image/jpeg";

/// Encode `raw` at the JPEG quality the policy assigns to `tier`.
///
/// Deterministic in its inputs. A frame whose buffer does not match its
/// dimensions is rejected instead of being encoded as garbage.
pub fn encode(
    raw: &RawFrame,
    tier: QualityTier,
    policy: &QualityPolicy,
) -> OurResult<EncodedFrame> {
    if !raw.is_well_formed() {
        return Err(OurError::Encode(format!(
            "corrupt {}x{} frame: expected {} bytes, got {}",
            raw.width,
            raw.height,
            raw.expected_len(),
            raw.pixels.len()
        )));
    }

    let jpeg_quality = policy.jpeg_quality(tier);
    let mut jpeg_data = Vec::with_capacity(raw.pixels.len() / 8);
    JpegEncoder::new_with_quality(&mut jpeg_data, jpeg_quality)
        .encode(&raw.pixels, raw.width, raw.height, ExtendedColorType::Rgb8)
        .map_err(|e| OurError::Encode(format!("Failed to encode JPEG: {e}")))?;

    Ok(EncodedFrame {
        data: Bytes::from(jpeg_data),
        tier,
        jpeg_quality,
        width: raw.width,
        height: raw.height,
        captured_at: raw.captured_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> RawFrame {
        let pixels = (0..width * height)
            .flat_map(|i| {
                let v = (i * 255 / (width * height)) as u8;
                [v, 255 - v, v / 2]
            })
            .collect();
        RawFrame::new(width, height, pixels)
    }

    #[test]
    fn test_encode_produces_jpeg() {
        let raw = gradient(32, 24);
        let encoded = encode(&raw, QualityTier::High, &QualityPolicy::default()).expect("encode");
        assert_eq!(&encoded.data[0..2], &[0xFF, 0xD8]);
        assert_eq!(encoded.tier, QualityTier::High);
        assert_eq!(encoded.jpeg_quality, 85);
        assert_eq!((encoded.width, encoded.height), (32, 24));
        assert_eq!(encoded.captured_at, raw.captured_at);
    }

    #[test]
    fn test_encode_is_deterministic() {
        let raw = gradient(16, 16);
        let policy = QualityPolicy::default();
        let a = encode(&raw, QualityTier::Medium, &policy).expect("encode");
        let b = encode(&raw, QualityTier::Medium, &policy).expect("encode");
        assert_eq!(a.data, b.data);
    }

    #[test]
    fn test_lower_tier_is_smaller() {
        let raw = gradient(64, 64);
        let policy = QualityPolicy {
            low_quality: 10,
            ..Default::default()
        };
        let high = encode(&raw, QualityTier::High, &policy).expect("encode");
        let low = encode(&raw, QualityTier::Low, &policy).expect("encode");
        assert!(low.len() < high.len());
    }

    #[test]
    fn test_corrupt_frame_is_encode_error() {
        let raw = RawFrame::new(8, 8, vec![0; 17]);
        let result = encode(&raw, QualityTier::Low, &QualityPolicy::default());
        assert!(matches!(result, Err(OurError::Encode(_))));
    }
}
