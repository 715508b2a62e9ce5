use std::path::{Path, PathBuf};

use strum::IntoEnumIterator;
use tracing::debug;

use crate::models::image::{ImageVariant, VariantName};
use crate::services::imaging::{self, ImageProcessingError};

/// Crop `source` into the five fixed variants and write each as PNG into
/// `output_dir` (created if absent), named `<stem>_<variant>.png`.
///
/// All-or-nothing: if any crop fails, files already written by this call are
/// removed and the error is returned.
pub async fn generate_variants(
    source: &Path,
    output_dir: &Path,
) -> Result<Vec<ImageVariant>, ImageProcessingError> {
    let source = source.to_path_buf();
    let output_dir = output_dir.to_path_buf();
    imaging::run_blocking(move || generate_variants_blocking(&source, &output_dir)).await
}

fn generate_variants_blocking(
    source: &Path,
    output_dir: &Path,
) -> Result<Vec<ImageVariant>, ImageProcessingError> {
    let img = imaging::open_image(source)?;
    let (width, height) = (img.width(), img.height());

    std::fs::create_dir_all(output_dir).map_err(|e| ImageProcessingError::Write {
        path: imaging::display_name(output_dir),
        source: e,
    })?;

    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());

    // A 1px-wide or 1px-tall source has an empty half; refuse before writing.
    if width < 2 || height < 2 {
        return Err(ImageProcessingError::Empty {
            path: format!("{}_{}", stem, if width < 2 { VariantName::LeftHalf } else { VariantName::TopHalf }),
        });
    }

    let mut variants: Vec<ImageVariant> = Vec::with_capacity(5);
    for name in VariantName::iter() {
        let region = name.region(width, height);
        let output_path = variant_path(output_dir, &stem, name);

        let crop = img.crop_imm(region.left, region.top, region.width, region.height);
        if let Err(e) = imaging::write_png_atomic(&crop, &output_path) {
            for written in &variants {
                imaging::discard_file(&written.output_path);
            }
            return Err(e);
        }

        variants.push(ImageVariant {
            name,
            region,
            output_path,
        });
    }

    debug!(
        source = %imaging::display_name(source),
        width,
        height,
        count = variants.len(),
        "Generated image variants"
    );
    Ok(variants)
}

fn variant_path(output_dir: &Path, stem: &str, name: VariantName) -> PathBuf {
    output_dir.join(format!("{stem}_{name}.png"))
}
