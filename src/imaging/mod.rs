//! Image preparation
//!
//! Every image that enters the system goes through [`prepare_image`]: decode,
//! flatten to 8-bit RGB, shrink so neither side exceeds the configured
//! maximum, and re-encode as PNG. The function is pure, so preparing an
//! already prepared image yields the same bytes.

use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, RgbImage};
use std::io::Cursor;
use thiserror::Error;

/// Default bounding dimension for prepared images.
pub const DEFAULT_MAX_DIM: u32 = 1024;

pub const PNG_MEDIA_TYPE: &str = "image/png";

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("Could not decode image: {0}")]
    Decode(#[source] image::ImageError),

    #[error("Could not encode image as PNG: {0}")]
    Encode(#[source] image::ImageError),

    #[error("Image has no pixels")]
    Empty,

    #[error("Image worker failed: {0}")]
    Worker(String),
}

/// Raw input bytes plus what we could learn about them without transforming.
#[derive(Debug, Clone)]
pub struct ImageAsset {
    pub bytes: Vec<u8>,
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
}

impl ImageAsset {
    pub fn media_type(&self) -> &'static str {
        self.format.to_mime_type()
    }
}

/// Output of [`prepare_image`]: RGB PNG bytes and final dimensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedImage {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl PreparedImage {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// One-line summary shown next to a preview.
    pub fn summary(&self) -> String {
        format!(
            "Image size: {}x{} px | File size: {} KB",
            self.width,
            self.height,
            footprint_kb(self.bytes.len())
        )
    }

    /// Inline `data:` URL for models that cannot reach a local path.
    pub fn data_url(&self) -> String {
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        format!("data:{};base64,{}", PNG_MEDIA_TYPE, STANDARD.encode(&self.bytes))
    }
}

/// Whole kilobytes, rounded down.
pub fn footprint_kb(len: usize) -> usize {
    len / 1024
}

/// Decode just enough to report format and dimensions.
pub fn inspect(bytes: &[u8]) -> Result<ImageAsset, ImageError> {
    let format = image::guess_format(bytes).map_err(ImageError::Decode)?;
    let img = image::load_from_memory_with_format(bytes, format).map_err(ImageError::Decode)?;
    Ok(ImageAsset {
        bytes: bytes.to_vec(),
        format,
        width: img.width(),
        height: img.height(),
    })
}

/// Target size for an image so that its longer side is at most `max_dim`.
///
/// Returns the input size untouched when it already fits. The shorter side is
/// rounded to the nearest pixel and never drops below 1.
pub fn fit_within(width: u32, height: u32, max_dim: u32) -> (u32, u32) {
    let longest = width.max(height);
    if max_dim == 0 || longest <= max_dim {
        return (width, height);
    }
    let ratio = max_dim as f64 / longest as f64;
    let scale = |side: u32| -> u32 {
        if side == longest {
            max_dim
        } else {
            ((side as f64 * ratio).round() as u32).max(1)
        }
    };
    (scale(width), scale(height))
}

/// Normalize arbitrary image bytes to a bounded RGB PNG.
pub fn prepare_image(bytes: &[u8], max_dim: u32) -> Result<PreparedImage, ImageError> {
    let decoded = image::load_from_memory(bytes).map_err(ImageError::Decode)?;
    prepare_decoded(decoded, max_dim)
}

/// [`prepare_image`] on the blocking pool, for use from request handlers.
pub async fn prepare_image_async(bytes: Vec<u8>, max_dim: u32) -> Result<PreparedImage, ImageError> {
    tokio::task::spawn_blocking(move || prepare_image(&bytes, max_dim))
        .await
        .map_err(|e| ImageError::Worker(e.to_string()))?
}

fn prepare_decoded(decoded: DynamicImage, max_dim: u32) -> Result<PreparedImage, ImageError> {
    let rgb: RgbImage = decoded.into_rgb8();
    let (width, height) = rgb.dimensions();
    if width == 0 || height == 0 {
        return Err(ImageError::Empty);
    }

    let (target_w, target_h) = fit_within(width, height, max_dim);
    let rgb = if (target_w, target_h) != (width, height) {
        image::imageops::resize(&rgb, target_w, target_h, FilterType::Lanczos3)
    } else {
        rgb
    };

    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(rgb)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .map_err(ImageError::Encode)?;

    Ok(PreparedImage {
        bytes,
        width: target_w,
        height: target_h,
    })
}
