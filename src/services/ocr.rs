//! Multi-pass recognition of one input: the unsplit image plus, optionally,
//! its five geometric variants, all funnelled through the shared engine.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, warn};

use crate::models::image::ImageVariant;
use crate::services::acquisition::ImageFetcher;
use crate::services::engine::{EngineError, EngineManager, Recognition, RecognizeOptions};
use crate::services::pipeline::PipelineError;
use crate::services::variants::generate_variants;

#[derive(Debug, Clone)]
pub struct RecognizeAllOptions {
    /// Where variant crops (and debug images) are written
    pub output_dir: PathBuf,
    /// Also recognize the five geometric variants
    pub split: bool,
    /// Keep the engine's intermediate images
    pub debug_images: bool,
}

impl Default for RecognizeAllOptions {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("tmp/split"),
            split: false,
            debug_images: false,
        }
    }
}

/// Text recognized for one label (variant name, or the image path for the
/// unsplit pass).
#[derive(Debug, Clone, PartialEq)]
pub struct RecognizedText {
    pub label: String,
    pub text: String,
}

/// A pass that failed and was left out of the result.
#[derive(Debug, Clone, PartialEq)]
pub struct VariantFailure {
    pub label: String,
    pub reason: String,
}

/// Insertion-ordered label -> text map plus the passes that failed.
#[derive(Debug, Clone, Default)]
pub struct RecognitionResult {
    pub entries: Vec<RecognizedText>,
    pub failures: Vec<VariantFailure>,
    pub auxiliary_images: Vec<PathBuf>,
}

impl RecognitionResult {
    pub fn get(&self, label: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.label == label)
            .map(|e| e.text.as_str())
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.label.as_str())
    }

    pub fn texts(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.text.as_str())
    }

    fn push(&mut self, label: String, outcome: Recognition) {
        self.auxiliary_images.extend(outcome.auxiliary_images);
        self.entries.push(RecognizedText {
            label,
            text: outcome.text,
        });
    }
}

pub struct RecognitionOrchestrator {
    fetcher: Arc<ImageFetcher>,
    engine: Arc<EngineManager>,
}

impl RecognitionOrchestrator {
    pub fn new(fetcher: Arc<ImageFetcher>, engine: Arc<EngineManager>) -> Self {
        Self { fetcher, engine }
    }

    pub fn engine(&self) -> &Arc<EngineManager> {
        &self.engine
    }

    /// Recognize `input` (path or URL).
    ///
    /// Variant entries come first in fixed order, then the unsplit entry keyed
    /// by the resolved path. Variant passes are best-effort; the unsplit pass
    /// must succeed.
    pub async fn recognize_all(
        &self,
        input: &str,
        options: &RecognizeAllOptions,
    ) -> Result<RecognitionResult, PipelineError> {
        let source = self.fetcher.resolve(input).await?;
        let primary_label = source.to_string_lossy().into_owned();

        let mut result = RecognitionResult::default();

        let variants = if options.split {
            match generate_variants(&source, &options.output_dir.join("variants")).await {
                Ok(variants) => variants,
                Err(e) => {
                    warn!(error = %e, "Variant generation failed, recognizing unsplit image only");
                    result.failures.push(VariantFailure {
                        label: "variants".to_string(),
                        reason: e.to_string(),
                    });
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let variant_passes = variants
            .iter()
            .map(|variant| self.recognize_variant(variant, options));
        let primary_options = self.pass_options(options, "unsplit");
        let primary_pass = self.engine.recognize(&source, &primary_options);
        let (variant_outcomes, primary) =
            tokio::join!(join_all(variant_passes), primary_pass);

        for (variant, outcome) in variants.iter().zip(variant_outcomes) {
            let label = variant.name.to_string();
            match outcome {
                Ok(recognition) => result.push(label, recognition),
                Err(e) => {
                    warn!(variant = %label, error = %e, "Variant recognition failed, omitting it");
                    result.failures.push(VariantFailure {
                        label,
                        reason: e.to_string(),
                    });
                }
            }
        }

        result.push(primary_label, primary?);

        debug!(
            entries = result.entries.len(),
            failures = result.failures.len(),
            "Recognition passes finished"
        );
        Ok(result)
    }

    async fn recognize_variant(
        &self,
        variant: &ImageVariant,
        options: &RecognizeAllOptions,
    ) -> Result<Recognition, EngineError> {
        let label: &'static str = variant.name.into();
        let pass_options = self.pass_options(options, label);
        self.engine.recognize(&variant.output_path, &pass_options).await
    }

    fn pass_options(&self, options: &RecognizeAllOptions, label: &str) -> RecognizeOptions {
        RecognizeOptions {
            psm: None,
            debug_images_dir: options
                .debug_images
                .then(|| debug_dir(&options.output_dir, label)),
        }
    }
}

fn debug_dir(output_dir: &Path, label: &str) -> PathBuf {
    output_dir.join("debug").join(label)
}
