use crate::core::image::canonicalize;
use image::DynamicImage;
use image_hasher::{HashAlg, Hasher, HasherConfig};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Default fingerprint width: an 8x8 gradient grid.
pub const DEFAULT_HASH_WIDTH: u32 = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FingerprintError {
    #[error("Fingerprint width mismatch: {left} bits vs {right} bits")]
    DimensionMismatch { left: u32, right: u32 },

    #[error("Unsupported fingerprint width {width}: must be side*side bits, side >= 2, byte aligned")]
    UnsupportedWidth { width: u32 },

    #[error("Invalid fingerprint encoding: {message}")]
    InvalidEncoding { message: String },
}

/// Fixed-width bit pattern derived from an image's coarse gradient structure.
///
/// Equality is bitwise. Similarity is [`Fingerprint::hamming`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    bytes: Box<[u8]>,
}

impl Fingerprint {
    pub fn from_bytes(bytes: impl Into<Box<[u8]>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    /// 64-bit fingerprint from an integer, most significant byte first.
    pub fn from_u64(bits: u64) -> Self {
        Self::from_bytes(bits.to_be_bytes().to_vec())
    }

    pub fn width(&self) -> u32 {
        (self.bytes.len() * 8) as u32
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Count of differing bits. Fails when the widths differ.
    pub fn hamming(&self, other: &Fingerprint) -> Result<u32, FingerprintError> {
        if self.bytes.len() != other.bytes.len() {
            return Err(FingerprintError::DimensionMismatch {
                left: self.width(),
                right: other.width(),
            });
        }

        Ok(self
            .bytes
            .iter()
            .zip(other.bytes.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.bytes)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for Fingerprint {
    type Err = FingerprintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(FingerprintError::InvalidEncoding {
                message: "empty fingerprint".to_string(),
            });
        }
        let bytes = hex::decode(s).map_err(|e| FingerprintError::InvalidEncoding {
            message: e.to_string(),
        })?;
        Ok(Self::from_bytes(bytes))
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        encoded.parse().map_err(serde::de::Error::custom)
    }
}

/// Free-function form of [`Fingerprint::hamming`].
pub fn hamming(a: &Fingerprint, b: &Fingerprint) -> Result<u32, FingerprintError> {
    a.hamming(b)
}

/// Derives difference-hash fingerprints.
///
/// The image is forced to RGB, reduced to luminance and resampled to a
/// (side+1) x side grid; each bit records whether a pixel is brighter than its
/// right-hand neighbour.
pub struct FingerprintCodec {
    width: u32,
    hasher: Hasher,
}

impl FingerprintCodec {
    pub fn new(width: u32) -> Result<Self, FingerprintError> {
        let side = grid_side(width).ok_or(FingerprintError::UnsupportedWidth { width })?;
        Ok(Self {
            width,
            hasher: gradient_hasher(side),
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn fingerprint(&self, image: &DynamicImage) -> Fingerprint {
        let hash = match image {
            DynamicImage::ImageRgb8(_) => self.hasher.hash_image(image),
            other => self.hasher.hash_image(&canonicalize(other.clone())),
        };
        Fingerprint::from_bytes(hash.as_bytes().to_vec())
    }
}

impl Default for FingerprintCodec {
    fn default() -> Self {
        Self {
            width: DEFAULT_HASH_WIDTH,
            hasher: gradient_hasher(8),
        }
    }
}

impl fmt::Debug for FingerprintCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FingerprintCodec")
            .field("width", &self.width)
            .finish_non_exhaustive()
    }
}

fn gradient_hasher(side: u32) -> Hasher {
    HasherConfig::new()
        .hash_alg(HashAlg::Gradient)
        .hash_size(side, side)
        .to_hasher()
}

/// Side of the square gradient grid for `width` bits, if `width` is usable.
pub(crate) fn grid_side(width: u32) -> Option<u32> {
    if width % 8 != 0 {
        return None;
    }
    let side = (width as f64).sqrt().round() as u32;
    (side >= 2 && side * side == width).then_some(side)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Luma, Rgb, Rgba};
    use proptest::prelude::*;

    fn horizontal_ramp(width: u32, height: u32, rising: bool) -> DynamicImage {
        let img = ImageBuffer::from_fn(width, height, |x, y| {
            let step = (x * 255 / (width - 1)) as u8;
            let v = if rising { step } else { 255 - step };
            Rgb([v, v.saturating_sub((y % 3) as u8), v])
        });
        DynamicImage::ImageRgb8(img)
    }

    #[test]
    fn test_self_distance_is_zero() {
        let codec = FingerprintCodec::default();
        let img = horizontal_ramp(90, 80, true);

        let a = codec.fingerprint(&img);
        let b = codec.fingerprint(&img);
        assert_eq!(a, b);
        assert_eq!(a.width(), 64);
        assert_eq!(a.hamming(&b).unwrap(), 0);
    }

    #[test]
    fn test_mirrored_gradient_is_far() {
        let codec = FingerprintCodec::default();
        let rising = codec.fingerprint(&horizontal_ramp(90, 80, true));
        let falling = codec.fingerprint(&horizontal_ramp(90, 80, false));

        assert!(rising.hamming(&falling).unwrap() > 32);
    }

    #[test]
    fn test_color_mode_is_canonicalized() {
        let codec = FingerprintCodec::default();
        let luma = ImageBuffer::from_fn(64, 48, |x, y| Luma([((x * 3 + y) % 256) as u8]));
        let rgba = ImageBuffer::from_fn(64, 48, |x, y| {
            let v = ((x * 3 + y) % 256) as u8;
            Rgba([v, v, v, 255])
        });

        let from_gray = codec.fingerprint(&DynamicImage::ImageLuma8(luma));
        let from_rgba = codec.fingerprint(&DynamicImage::ImageRgba8(rgba));
        assert_eq!(from_gray, from_rgba);
    }

    #[test]
    fn test_configured_width() {
        let codec = FingerprintCodec::new(256).unwrap();
        let fp = codec.fingerprint(&horizontal_ramp(90, 80, true));
        assert_eq!(fp.width(), 256);
    }

    #[test]
    fn test_unsupported_widths() {
        assert!(matches!(
            FingerprintCodec::new(60),
            Err(FingerprintError::UnsupportedWidth { width: 60 })
        ));
        assert!(FingerprintCodec::new(72).is_err());
        assert!(FingerprintCodec::new(0).is_err());
        assert_eq!(grid_side(144), Some(12));
    }

    #[test]
    fn test_width_mismatch() {
        let a = Fingerprint::from_u64(0);
        let b = Fingerprint::from_bytes(vec![0u8; 32]);
        assert_eq!(
            a.hamming(&b),
            Err(FingerprintError::DimensionMismatch {
                left: 64,
                right: 256
            })
        );
    }

    #[test]
    fn test_hex_round_trip_and_serde() {
        let fp = Fingerprint::from_u64(0x00ff_00ff_1234_abcd);
        assert_eq!(fp.to_hex(), "00ff00ff1234abcd");
        assert_eq!("00ff00ff1234abcd".parse::<Fingerprint>().unwrap(), fp);

        let json = serde_json::to_string(&fp).unwrap();
        assert_eq!(json, "\"00ff00ff1234abcd\"");
        assert!("zz".parse::<Fingerprint>().is_err());
        assert!("".parse::<Fingerprint>().is_err());
    }

    proptest! {
        #[test]
        fn prop_hamming_symmetric_and_bounded(a in any::<u64>(), b in any::<u64>()) {
            let fa = Fingerprint::from_u64(a);
            let fb = Fingerprint::from_u64(b);
            let ab = fa.hamming(&fb).unwrap();
            prop_assert_eq!(ab, fb.hamming(&fa).unwrap());
            prop_assert!(ab <= 64);
            prop_assert_eq!(ab, (a ^ b).count_ones());
        }

        #[test]
        fn prop_self_distance_zero(a in any::<u64>()) {
            let fa = Fingerprint::from_u64(a);
            prop_assert_eq!(fa.hamming(&fa).unwrap(), 0);
        }
    }
}
