use crate::error::{AgentError, AgentResult};
use image::{
    DynamicImage, GenericImageView, ImageFormat, RgbImage, codecs::jpeg::JpegEncoder,
    imageops::FilterType,
};
use serde::Serialize;
use std::io::Cursor;
use tracing::debug;

/// Size/dimension ceilings and the bounded search used to reach them.
#[derive(Debug, Clone)]
pub struct NormalizePolicy {
    pub max_bytes: usize,
    pub max_dimension: u32,
    /// Descending JPEG qualities tried at every scale tier.
    pub qualities: Vec<u8>,
    pub max_passes: u32,
    pub scale_factor: f32,
    pub min_scale: f32,
}

impl NormalizePolicy {
    /// 9.8 MB, decimal.
    pub const DEFAULT_MAX_BYTES: usize = 9_800_000;
    pub const DEFAULT_MAX_DIMENSION: u32 = 1600;

    /// Scale tiers the search will try for an image of `width` x `height`.
    ///
    /// The first tier is always the dimension-fitting scale; `min_scale`
    /// only bounds the reductions that follow it.
    pub fn scale_schedule(&self, width: u32, height: u32) -> Vec<f32> {
        let longest = width.max(height).max(1) as f32;
        let mut scale = (self.max_dimension as f32 / longest).min(1.0);
        let mut tiers = vec![scale];
        for _ in 1..self.max_passes.max(1) {
            scale *= self.scale_factor;
            if scale < self.min_scale {
                break;
            }
            tiers.push(scale);
        }
        tiers
    }
}

impl Default for NormalizePolicy {
    fn default() -> Self {
        Self {
            max_bytes: Self::DEFAULT_MAX_BYTES,
            max_dimension: Self::DEFAULT_MAX_DIMENSION,
            qualities: vec![92, 85, 75, 65, 55, 45],
            max_passes: 5,
            scale_factor: 0.85,
            min_scale: 0.15,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NormalizedImage {
    #[serde(skip)]
    pub bytes: Vec<u8>,
    pub name: String,
    pub note: String,
}

impl NormalizedImage {
    pub const CONTENT_TYPE: &'static str = "image/jpeg";
}

pub fn normalize(
    bytes: &[u8],
    target_name: &str,
    policy: &NormalizePolicy,
) -> AgentResult<NormalizedImage> {
    if bytes.is_empty() {
        return Err(AgentError::ImageConstraint {
            message: "empty image".into(),
            last_size: None,
        });
    }
    let name = canonical_name(target_name);

    if image::guess_format(bytes).ok() == Some(ImageFormat::Jpeg)
        && bytes.len() <= policy.max_bytes
        && dimensions(bytes).is_some_and(|(w, h)| w.max(h) <= policy.max_dimension)
    {
        return Ok(NormalizedImage {
            bytes: bytes.to_vec(),
            name,
            note: "unchanged".into(),
        });
    }

    let decoded = image::load_from_memory(bytes)?;
    let (width, height) = decoded.dimensions();
    let mut last_size = None;
    for scale in policy.scale_schedule(width, height) {
        let frame = render_frame(&decoded, scale);
        for &quality in &policy.qualities {
            let encoded = encode_jpeg(&frame, quality)?;
            debug!(
                target = "agent.media",
                scale,
                quality,
                size = encoded.len(),
                "reencode_attempt"
            );
            if encoded.len() <= policy.max_bytes {
                return Ok(NormalizedImage {
                    note: format!(
                        "re-encoded {}x{} at scale {:.2}, quality {} ({} -> {} bytes)",
                        frame.width(),
                        frame.height(),
                        scale,
                        quality,
                        bytes.len(),
                        encoded.len()
                    ),
                    bytes: encoded,
                    name,
                });
            }
            last_size = Some(encoded.len());
        }
    }

    Err(AgentError::ImageConstraint {
        message: format!(
            "could not fit under {} bytes; last attempt was {} bytes",
            policy.max_bytes,
            last_size.map_or_else(|| "n/a".to_string(), |s| s.to_string())
        ),
        last_size,
    })
}

fn render_frame(image: &DynamicImage, scale: f32) -> RgbImage {
    if scale < 1.0 {
        let (w, h) = image.dimensions();
        let target_w = ((w as f32 * scale).round() as u32).max(1);
        let target_h = ((h as f32 * scale).round() as u32).max(1);
        image
            .resize_exact(target_w, target_h, FilterType::Triangle)
            .to_rgb8()
    } else {
        image.to_rgb8()
    }
}

pub(crate) fn encode_jpeg(frame: &RgbImage, quality: u8) -> AgentResult<Vec<u8>> {
    let mut out = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut out, quality);
    encoder.encode_image(frame)?;
    Ok(out)
}

fn dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    image::io::Reader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}

fn canonical_name(target: &str) -> String {
    let base = target.rsplit(['/', '\\']).next().unwrap_or(target);
    let stem = match base.rfind('.') {
        Some(idx) if idx > 0 => &base[..idx],
        _ => base,
    };
    let stem = stem.trim();
    if stem.is_empty() {
        "photo.jpg".into()
    } else {
        format!("{stem}.jpg")
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use image::{ImageBuffer, Rgb};

    /// Deterministic high-entropy image; compresses poorly on purpose.
    pub fn noise(width: u32, height: u32) -> RgbImage {
        ImageBuffer::from_fn(width, height, |x, y| {
            let v = (x.wrapping_mul(2_654_435_761) ^ y.wrapping_mul(40_503))
                .wrapping_mul(2_246_822_519)
                .rotate_left(13);
            Rgb([v as u8, (v >> 8) as u8, (v >> 16) as u8])
        })
    }

    pub fn jpeg(width: u32, height: u32, quality: u8) -> Vec<u8> {
        encode_jpeg(&noise(width, height), quality).unwrap()
    }

    pub fn png(width: u32, height: u32) -> Vec<u8> {
        let mut out = Vec::new();
        DynamicImage::ImageRgb8(noise(width, height))
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .unwrap();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    fn longest_edge(bytes: &[u8]) -> u32 {
        let (w, h) = image::load_from_memory(bytes).unwrap().dimensions();
        w.max(h)
    }

    #[test]
    fn small_jpeg_is_returned_byte_identical() {
        let input = jpeg(64, 48, 90);
        let out = normalize(&input, "shots/front.jpeg", &NormalizePolicy::default()).unwrap();
        assert_eq!(out.bytes, input);
        assert_eq!(out.name, "front.jpg");
        assert_eq!(out.note, "unchanged");
    }

    #[test]
    fn png_is_transcoded_to_jpeg() {
        let input = png(80, 60);
        let out = normalize(&input, "scan.png", &NormalizePolicy::default()).unwrap();
        assert_eq!(image::guess_format(&out.bytes).unwrap(), ImageFormat::Jpeg);
        assert_eq!(out.name, "scan.jpg");
    }

    #[test]
    fn oversized_jpeg_meets_both_ceilings() {
        let input = jpeg(1200, 900, 100);
        let policy = NormalizePolicy {
            max_bytes: 250_000,
            max_dimension: 400,
            ..NormalizePolicy::default()
        };
        assert!(input.len() > policy.max_bytes);
        let out = normalize(&input, "big.jpg", &policy).unwrap();
        assert!(out.bytes.len() <= policy.max_bytes);
        assert!(longest_edge(&out.bytes) <= policy.max_dimension);
    }

    #[test]
    fn small_bytes_but_wide_jpeg_is_downscaled() {
        let input = jpeg(900, 300, 40);
        let policy = NormalizePolicy {
            max_dimension: 300,
            ..NormalizePolicy::default()
        };
        let out = normalize(&input, "wide.jpg", &policy).unwrap();
        assert_eq!(longest_edge(&out.bytes), 300);
    }

    #[test]
    fn impossible_ceiling_fails_with_last_size() {
        let input = png(64, 64);
        let policy = NormalizePolicy {
            max_bytes: 100,
            ..NormalizePolicy::default()
        };
        match normalize(&input, "x.png", &policy) {
            Err(AgentError::ImageConstraint { last_size, .. }) => {
                assert!(last_size.unwrap() > 100);
            }
            other => panic!("expected image constraint error, got {other:?}"),
        }
    }

    #[test]
    fn undecodable_bytes_fail() {
        let err = normalize(b"not an image", "x.jpg", &NormalizePolicy::default()).unwrap_err();
        assert_eq!(err.kind(), "image_constraint");
        let err = normalize(&[], "x.jpg", &NormalizePolicy::default()).unwrap_err();
        assert_eq!(err.kind(), "image_constraint");
    }

    #[test]
    fn schedule_starts_at_dimension_ratio_and_stops_at_floor() {
        let policy = NormalizePolicy::default();
        let tiers = policy.scale_schedule(4000, 3000);
        assert_eq!(tiers.len(), 5);
        assert!((tiers[0] - 0.4).abs() < 1e-6);
        assert!((tiers[1] - 0.34).abs() < 1e-6);

        let floor_bound = NormalizePolicy {
            min_scale: 0.3,
            ..NormalizePolicy::default()
        };
        let tiers = floor_bound.scale_schedule(4000, 3000);
        assert!(tiers.iter().all(|s| *s >= 0.3));
        assert_eq!(tiers.len(), 2);

        assert_eq!(policy.scale_schedule(800, 600)[0], 1.0);
    }

    #[test]
    fn first_tier_is_kept_even_below_the_floor() {
        let policy = NormalizePolicy::default();
        let tiers = policy.scale_schedule(11_000, 40);
        assert_eq!(tiers.len(), 1);
        assert!((tiers[0] - 1600.0 / 11_000.0).abs() < 1e-6);
    }

    #[test]
    fn panorama_wider_than_floor_allows_is_still_encoded() {
        let input = jpeg(11_000, 40, 60);
        let policy = NormalizePolicy::default();
        let out = normalize(&input, "pano.jpg", &policy).unwrap();
        assert!(out.bytes.len() <= policy.max_bytes);
        assert_eq!(longest_edge(&out.bytes), 1600);
    }

    #[test]
    fn canonical_names() {
        assert_eq!(canonical_name("IMG_001.HEIC"), "IMG_001.jpg");
        assert_eq!(canonical_name(""), "photo.jpg");
        assert_eq!(canonical_name(".hidden"), ".hidden.jpg");
        assert_eq!(canonical_name("a/b/c.png"), "c.jpg");
    }

    #[test]
    #[ignore = "full-size fixture; slow in debug builds"]
    fn camera_sized_jpeg_meets_default_ceilings() {
        let input = jpeg(4000, 3000, 100);
        let policy = NormalizePolicy::default();
        let out = normalize(&input, "camera.jpg", &policy).unwrap();
        assert!(out.bytes.len() <= policy.max_bytes);
        assert!(longest_edge(&out.bytes) <= 1600);
    }
}
