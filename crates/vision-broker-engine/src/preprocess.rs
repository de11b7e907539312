//! Image normalization for the vision encoder.
//!
//! Any decodable image becomes a `target_size`×`target_size` RGB buffer:
//! 1. convert to RGB (grayscale, alpha and 16-bit sources included),
//! 2. letterbox to a square canvas of the longer side filled with neutral gray,
//!    with the source centered at `((size - w) / 2, (size - h) / 2)`,
//! 3. bilinear resize to the target resolution.
//!
//! The decoder is chosen from the file contents, not the extension.

use std::path::{Path, PathBuf};

use image::imageops;
use image::{DynamicImage, ImageError, ImageReader, Rgb, RgbImage};
use vision_broker_types::{EngineError, PixelTensor};

/// Neutral gray used for letterbox padding, per channel.
pub const PAD_GRAY: f32 = 127.5;

#[derive(Debug, thiserror::Error)]
pub enum PreprocessError {
    #[error("cannot read image {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("image {} has no pixels", .path.display())]
    Empty { path: PathBuf },
    #[error(transparent)]
    Tensor(#[from] EngineError),
}

#[derive(Debug, Clone)]
pub struct ImagePreprocessor {
    target_size: u32,
    pad: Rgb<u8>,
}

impl ImagePreprocessor {
    pub fn new(target_size: u32) -> Self {
        Self {
            target_size,
            pad: pad_pixel(),
        }
    }

    pub fn target_size(&self) -> u32 {
        self.target_size
    }

    /// Decode the file at `path` and normalize it.
    pub fn preprocess_path(&self, path: &Path) -> Result<PixelTensor, PreprocessError> {
        let image = decode(path).map_err(|source| PreprocessError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        if image.width() == 0 || image.height() == 0 {
            return Err(PreprocessError::Empty {
                path: path.to_path_buf(),
            });
        }
        self.preprocess(&image)
    }

    pub fn preprocess(&self, image: &DynamicImage) -> Result<PixelTensor, PreprocessError> {
        let rgb = image.to_rgb8();
        let square = letterbox(&rgb, self.pad);
        let size = self.target_size;
        let resized = if square.dimensions() == (size, size) {
            square
        } else {
            resize_bilinear(&square, size, size)
        };
        Ok(PixelTensor::new(size, size, resized.into_raw())?)
    }
}

fn decode(path: &Path) -> Result<DynamicImage, ImageError> {
    ImageReader::open(path)?.with_guessed_format()?.decode()
}

/// Bilinear resampling from the four nearest source pixels, with pixel centers
/// aligned (`src = (dst + 0.5) * scale - 0.5`, clamped at the edges). Shrinking
/// does not widen the kernel, so there is no anti-aliasing.
pub fn resize_bilinear(image: &RgbImage, width: u32, height: u32) -> RgbImage {
    let (src_width, src_height) = image.dimensions();
    if src_width == 0 || src_height == 0 {
        return RgbImage::new(width, height);
    }
    let columns = sample_axis(src_width, width);
    let rows = sample_axis(src_height, height);

    RgbImage::from_fn(width, height, |x, y| {
        let (x0, x1, fx) = columns[x as usize];
        let (y0, y1, fy) = rows[y as usize];
        let (p00, p10) = (image.get_pixel(x0, y0), image.get_pixel(x1, y0));
        let (p01, p11) = (image.get_pixel(x0, y1), image.get_pixel(x1, y1));
        let mut out = [0u8; 3];
        for (c, value) in out.iter_mut().enumerate() {
            let top = f32::from(p00[c]) * (1.0 - fx) + f32::from(p10[c]) * fx;
            let bottom = f32::from(p01[c]) * (1.0 - fx) + f32::from(p11[c]) * fx;
            // Always in 0..=255
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let v = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
            *value = v;
        }
        Rgb(out)
    })
}

/// For each destination index: the two source neighbours and the weight of the second.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn sample_axis(src: u32, dst: u32) -> Vec<(u32, u32, f32)> {
    let scale = src as f32 / dst as f32;
    (0..dst)
        .map(|d| {
            let pos = ((d as f32 + 0.5) * scale - 0.5).max(0.0);
            let i0 = (pos.floor() as u32).min(src - 1);
            let i1 = (i0 + 1).min(src - 1);
            let weight = if i0 == i1 { 0.0 } else { pos - i0 as f32 };
            (i0, i1, weight)
        })
        .collect()
}

/// 8-bit storage of `PAD_GRAY` (127.5 rounds to 128).
pub fn pad_pixel() -> Rgb<u8> {
    // Always in 0..=255
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let v = PAD_GRAY.round() as u8;
    Rgb([v, v, v])
}

/// Top-left placement of a `width`×`height` image on its square canvas.
pub fn letterbox_offsets(width: u32, height: u32) -> (u32, u32) {
    let size = width.max(height);
    ((size - width) / 2, (size - height) / 2)
}

/// Pad `image` to a square of its longer side, centered on `pad`.
/// Square inputs are returned unchanged.
pub fn letterbox(image: &RgbImage, pad: Rgb<u8>) -> RgbImage {
    let (width, height) = image.dimensions();
    if width == height {
        return image.clone();
    }
    let size = width.max(height);
    let mut canvas = RgbImage::from_pixel(size, size, pad);
    let (x, y) = letterbox_offsets(width, height);
    imageops::replace(&mut canvas, image, i64::from(x), i64::from(y));
    canvas
}
