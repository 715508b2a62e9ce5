//! Recognition engine backed by the `tesseract` command line tool.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::services::engine::{
    EngineError, EngineFactory, EngineSettings, Recognition, RecognitionEngine, RecognizeOptions,
};
use crate::services::imaging::display_name;

/// Builds [`TesseractCli`] engines after checking the installation.
pub struct TesseractFactory {
    binary: String,
}

impl TesseractFactory {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl EngineFactory for TesseractFactory {
    async fn create(
        &self,
        settings: &EngineSettings,
    ) -> Result<Arc<dyn RecognitionEngine>, EngineError> {
        let version = run_capture(&self.binary, &["--version"]).await?;
        let version = version.lines().next().unwrap_or_default().trim().to_string();

        tokio::fs::create_dir_all(&settings.cache_dir).await?;
        let tessdata_dir = has_traineddata(&settings.cache_dir, &settings.languages)
            .await
            .then(|| settings.cache_dir.clone());

        let mut list_args = vec!["--list-langs".to_string()];
        if let Some(dir) = &tessdata_dir {
            list_args.push("--tessdata-dir".to_string());
            list_args.push(dir.display().to_string());
        }
        let list_args: Vec<&str> = list_args.iter().map(String::as_str).collect();
        let listing = run_capture(&self.binary, &list_args).await?;
        let installed = installed_languages(&listing);
        let missing: Vec<&str> = settings
            .languages
            .iter()
            .map(String::as_str)
            .filter(|lang| !installed.iter().any(|i| i == lang))
            .collect();
        if !missing.is_empty() {
            return Err(EngineError::Unavailable(format!(
                "tesseract languages not installed: {}",
                missing.join(", ")
            )));
        }

        info!(
            version = %version,
            tessdata = tessdata_dir.is_some(),
            "Tesseract engine constructed"
        );

        Ok(Arc::new(TesseractCli {
            binary: self.binary.clone(),
            languages: settings.languages.join("+"),
            oem: settings.oem,
            psm: settings.psm,
            tessdata_dir,
        }))
    }
}

pub struct TesseractCli {
    binary: String,
    languages: String,
    oem: u8,
    psm: u8,
    tessdata_dir: Option<PathBuf>,
}

impl TesseractCli {
    fn command(&self, image: &Path, options: &RecognizeOptions) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg(image)
            .arg("stdout")
            .arg("-l")
            .arg(&self.languages)
            .arg("--oem")
            .arg(self.oem.to_string())
            .arg("--psm")
            .arg(options.psm.unwrap_or(self.psm).to_string());
        if let Some(dir) = &self.tessdata_dir {
            cmd.arg("--tessdata-dir").arg(dir);
        }
        if let Some(dir) = &options.debug_images_dir {
            // Tesseract writes its debug images into the working directory.
            cmd.arg("-c").arg("tessedit_write_images=true").current_dir(dir);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl RecognitionEngine for TesseractCli {
    fn name(&self) -> &'static str {
        "tesseract"
    }

    async fn recognize(
        &self,
        image: &Path,
        options: &RecognizeOptions,
    ) -> Result<Recognition, EngineError> {
        let image = if options.debug_images_dir.is_some() {
            std::path::absolute(image)?
        } else {
            image.to_path_buf()
        };
        if let Some(dir) = &options.debug_images_dir {
            tokio::fs::create_dir_all(dir).await?;
        }

        let output = self.command(&image, options).output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::Recognition {
                image: display_name(&image),
                message: stderr.lines().last().unwrap_or("tesseract failed").trim().to_string(),
            });
        }

        let text = String::from_utf8_lossy(&output.stdout).into_owned();
        let auxiliary_images = match &options.debug_images_dir {
            Some(dir) => list_images(dir).await?,
            None => Vec::new(),
        };

        debug!(
            image = %display_name(&image),
            chars = text.len(),
            "Tesseract recognition finished"
        );
        Ok(Recognition {
            text,
            auxiliary_images,
        })
    }

    async fn terminate(&self) -> Result<(), EngineError> {
        // Each recognition is its own process; nothing stays resident.
        Ok(())
    }
}

async fn run_capture(binary: &str, args: &[&str]) -> Result<String, EngineError> {
    let output = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| EngineError::Unavailable(format!("cannot run {binary}: {e}")))?;
    if !output.status.success() {
        return Err(EngineError::Unavailable(format!(
            "{binary} {} exited with {}",
            args.join(" "),
            output.status
        )));
    }
    // Older releases print the version and language list on stderr.
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok(text)
}

/// Language codes from `tesseract --list-langs` output.
fn installed_languages(listing: &str) -> Vec<String> {
    listing
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.contains(' ') && !line.ends_with(':'))
        .map(str::to_string)
        .collect()
}

async fn has_traineddata(dir: &Path, languages: &[String]) -> bool {
    for lang in languages {
        match tokio::fs::metadata(dir.join(format!("{lang}.traineddata"))).await {
            Ok(meta) if meta.is_file() => {}
            _ => return false,
        }
    }
    !languages.is_empty()
}

async fn list_images(dir: &Path) -> Result<Vec<PathBuf>, EngineError> {
    let mut found = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_image = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| matches!(e.to_ascii_lowercase().as_str(), "tif" | "tiff" | "png"));
        if is_image {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}
