//! Shared plumbing for the image services: decoding, atomic PNG encoding and
//! moving CPU-bound work off the async runtime.

use std::path::{Path, PathBuf};

use image::{DynamicImage, ImageFormat, ImageReader};
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ImageProcessingError {
    #[error("cannot read image {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot decode image {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: image::ImageError,
    },

    #[error("cannot encode image {path}: {source}")]
    Encode {
        path: String,
        #[source]
        source: image::ImageError,
    },

    #[error("cannot write image {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("image {path} has no pixels")]
    Empty { path: String },

    #[error("invalid enhancement options: {0}")]
    InvalidOptions(String),

    #[error("image task aborted: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Base name of `path` for use in error messages. Full scratch paths are not
/// reported to job callers.
pub(crate) fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

/// Decode an image, sniffing the format from content rather than extension.
pub(crate) fn open_image(path: &Path) -> Result<DynamicImage, ImageProcessingError> {
    let reader = ImageReader::open(path)
        .map_err(|source| ImageProcessingError::Read {
            path: display_name(path),
            source,
        })?
        .with_guessed_format()
        .map_err(|source| ImageProcessingError::Read {
            path: display_name(path),
            source,
        })?;

    let img = reader.decode().map_err(|source| ImageProcessingError::Decode {
        path: display_name(path),
        source,
    })?;

    if img.width() == 0 || img.height() == 0 {
        return Err(ImageProcessingError::Empty {
            path: display_name(path),
        });
    }
    Ok(img)
}

/// Unique sibling temp path used while writing `path`. Concurrent writers
/// of the same target each get their own temp file.
pub(crate) fn partial_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{}.part", Uuid::new_v4().simple()));
    path.with_file_name(name)
}

/// True for temp files produced by [`partial_path`].
#[cfg(test)]
pub(crate) fn is_partial(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "part")
}

/// Best-effort removal of a temp or half-written file. Failures are logged,
/// never returned.
pub(crate) fn discard_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(file = %display_name(path), error = %e, "Failed to remove file");
        }
    }
}

pub(crate) async fn discard_file_async(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(file = %display_name(path), error = %e, "Failed to remove file");
        }
    }
}

/// Encode `img` as PNG into a temp file next to `path`, then rename it into
/// place. On failure nothing is left at either location.
pub(crate) fn write_png_atomic(img: &DynamicImage, path: &Path) -> Result<(), ImageProcessingError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| ImageProcessingError::Write {
            path: display_name(path),
            source,
        })?;
    }

    let tmp = partial_path(path);
    if let Err(source) = img.save_with_format(&tmp, ImageFormat::Png) {
        discard_file(&tmp);
        return Err(ImageProcessingError::Encode {
            path: display_name(path),
            source,
        });
    }

    std::fs::rename(&tmp, path).map_err(|source| {
        discard_file(&tmp);
        ImageProcessingError::Write {
            path: display_name(path),
            source,
        }
    })
}

/// Run a blocking image operation on the blocking thread pool.
pub(crate) async fn run_blocking<T, F>(f: F) -> Result<T, ImageProcessingError>
where
    F: FnOnce() -> Result<T, ImageProcessingError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}
