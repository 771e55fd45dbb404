use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, Rgba, RgbaImage};

const MIN_DOWNSCALE_DIM: u32 = 128;
const JPEG_QUALITY: u8 = 90;

/// Base64 image payload handed to a label client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
    pub base64: String,
    pub mime: &'static str,
    pub byte_len: usize,
}

impl EncodedImage {
    pub fn from_bytes(bytes: &[u8], mime: &'static str) -> Self {
        Self {
            base64: BASE64.encode(bytes),
            mime,
            byte_len: bytes.len(),
        }
    }

    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime, self.base64)
    }
}

/// Reads `path` and base64-encodes it. With `max_dim`, the image is
/// flattened onto white, fit inside `max_dim`×`max_dim` and re-encoded as
/// JPEG; undecodable files fall back to their raw bytes.
pub fn encode_image(path: &Path, max_dim: Option<u32>) -> Result<EncodedImage> {
    if let Some(max_dim) = max_dim {
        if let Some(bytes) = downscaled_jpeg(path, max_dim) {
            return Ok(EncodedImage::from_bytes(&bytes, "image/jpeg"));
        }
        tracing::debug!(path = %path.display(), "downscale skipped; sending original bytes");
    }
    let bytes = fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
    if bytes.is_empty() {
        anyhow::bail!("image file is empty: {}", path.display());
    }
    Ok(EncodedImage::from_bytes(&bytes, guess_image_mime(path)))
}

fn downscaled_jpeg(path: &Path, max_dim: u32) -> Option<Vec<u8>> {
    let dim = max_dim.max(MIN_DOWNSCALE_DIM);
    let image = image::open(path).ok()?;
    let rgba = image.to_rgba8();
    let mut flattened = RgbaImage::new(rgba.width(), rgba.height());
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let alpha = u16::from(pixel[3]);
        let blend = |channel: u8| -> u8 {
            (((u16::from(channel) * alpha) + (255 * (255 - alpha))) / 255) as u8
        };
        flattened.put_pixel(
            x,
            y,
            Rgba([blend(pixel[0]), blend(pixel[1]), blend(pixel[2]), 255]),
        );
    }
    let flattened = DynamicImage::ImageRgba8(flattened);
    let resized = if flattened.width() > dim || flattened.height() > dim {
        flattened.resize(dim, dim, FilterType::Triangle)
    } else {
        flattened
    };
    let mut bytes = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut bytes, JPEG_QUALITY);
    encoder.encode_image(&resized.to_rgb8()).ok()?;
    Some(bytes)
}

pub(crate) fn guess_image_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        _ => "image/png",
    }
}
