use std::path::{Path, PathBuf};

use garde::Validate;
use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::services::imaging::{self, ImageProcessingError};

/// Preprocessing knobs applied before recognition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct EnhanceOptions {
    /// Upscale factor relative to the original width
    #[garde(range(min = 0.1, max = 8.0))]
    pub scale: f32,

    /// Contrast multiplier around mid-grey
    #[garde(range(min = 0.01, max = 10.0))]
    pub contrast: f32,

    /// Brightness multiplier
    #[garde(range(min = 0.01, max = 10.0))]
    pub brightness: f32,

    #[garde(skip)]
    pub sharpen: bool,

    /// 3x3 median filter
    #[garde(skip)]
    pub denoise: bool,
}

impl Default for EnhanceOptions {
    fn default() -> Self {
        Self {
            scale: 2.0,
            contrast: 1.2,
            brightness: 1.1,
            sharpen: true,
            denoise: true,
        }
    }
}

// Unsharp mask parameters.
const SHARPEN_SIGMA: f32 = 1.0;
const SHARPEN_THRESHOLD: i32 = 2;

// Fraction of pixels clipped at each end when stretching the range.
const NORMALIZE_CLIP: f64 = 0.01;

/// Run the preprocessing pipeline on `input` and write a lossless PNG to
/// `output`. Returns `output` on success; on failure no file is left there.
pub async fn enhance(
    input: &Path,
    output: &Path,
    options: &EnhanceOptions,
) -> Result<PathBuf, ImageProcessingError> {
    options
        .validate()
        .map_err(|report| ImageProcessingError::InvalidOptions(report.to_string()))?;

    let input = input.to_path_buf();
    let output = output.to_path_buf();
    let options = options.clone();

    imaging::run_blocking(move || {
        let img = imaging::open_image(&input)?;
        let enhanced = enhance_image(img, &options);
        imaging::write_png_atomic(&DynamicImage::ImageLuma8(enhanced), &output)?;
        debug!(
            input = %imaging::display_name(&input),
            output = %imaging::display_name(&output),
            "Enhanced image for OCR"
        );
        Ok(output)
    })
    .await
}

/// Pure pixel pipeline: grayscale, resize, modulate, sharpen, denoise,
/// normalize, in that order.
pub fn enhance_image(img: DynamicImage, options: &EnhanceOptions) -> GrayImage {
    let gray = img.to_luma8();

    let (w, h) = gray.dimensions();
    let new_w = ((w as f32 * options.scale).round() as u32).max(1);
    let new_h = ((h as f32 * new_w as f32 / w as f32).round() as u32).max(1);
    let mut out = if (new_w, new_h) == (w, h) {
        gray
    } else {
        imageops::resize(&gray, new_w, new_h, FilterType::CatmullRom)
    };

    modulate(&mut out, options.brightness, options.contrast);

    if options.sharpen {
        out = imageops::unsharpen(&out, SHARPEN_SIGMA, SHARPEN_THRESHOLD);
    }

    if options.denoise {
        out = imageproc::filter::median_filter(&out, 1, 1);
    }

    normalize(&mut out);
    out
}

fn modulate(img: &mut GrayImage, brightness: f32, contrast: f32) {
    let mut lut = [0u8; 256];
    for (v, slot) in lut.iter_mut().enumerate() {
        let bright = v as f32 * brightness;
        let contrasted = (bright - 128.0) * contrast + 128.0;
        *slot = contrasted.round().clamp(0.0, 255.0) as u8;
    }
    for p in img.pixels_mut() {
        p.0[0] = lut[p.0[0] as usize];
    }
}

/// Stretch the occupied intensity range to 0..=255, ignoring the darkest and
/// brightest `NORMALIZE_CLIP` of pixels.
fn normalize(img: &mut GrayImage) {
    let mut histogram = [0u64; 256];
    for p in img.pixels() {
        histogram[p.0[0] as usize] += 1;
    }
    let total: u64 = histogram.iter().sum();
    if total == 0 {
        return;
    }

    let clip = (total as f64 * NORMALIZE_CLIP) as u64;
    let low = percentile_index(histogram.iter().enumerate(), clip);
    let high = percentile_index(histogram.iter().enumerate().rev(), clip);
    if high <= low {
        return;
    }

    let range = f32::from(high - low);
    for p in img.pixels_mut() {
        let v = p.0[0].clamp(low, high);
        p.0[0] = (f32::from(v - low) * 255.0 / range).round() as u8;
    }
}

fn percentile_index<'a>(bins: impl Iterator<Item = (usize, &'a u64)>, clip: u64) -> u8 {
    let mut seen = 0u64;
    let mut last = 0usize;
    for (i, count) in bins {
        last = i;
        seen += count;
        if seen > clip {
            break;
        }
    }
    last as u8
}
