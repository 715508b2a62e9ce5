use std::path::PathBuf;
use std::time::Duration;

use garde::Validate;
use serde::Deserialize;

use crate::services::enhance::EnhanceOptions;
use crate::services::engine::EngineSettings;

/// Which result store backend to use.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Json,
    Postgres,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct AppConfig {
    /// Root for downloads, uploads, variants and enhanced images. May be
    /// wiped between runs.
    #[serde(default = "default_scratch_dir")]
    #[garde(skip)]
    pub scratch_dir: PathBuf,

    /// Persistent engine data directory (language files, engine scratch).
    #[serde(default = "default_engine_cache_dir")]
    #[garde(skip)]
    pub engine_cache_dir: PathBuf,

    /// Tesseract executable name or path
    #[serde(default = "default_tesseract_bin")]
    #[garde(length(min = 1))]
    pub tesseract_bin: String,

    /// Tesseract language set, `+`-separated (e.g. "eng+ind")
    #[serde(default = "default_ocr_languages")]
    #[garde(length(min = 1))]
    pub ocr_languages: String,

    /// Tesseract OCR engine mode (0-3)
    #[serde(default = "default_ocr_oem")]
    #[garde(range(max = 3))]
    pub ocr_oem: u8,

    /// Tesseract page segmentation mode (0-13)
    #[serde(default = "default_ocr_psm")]
    #[garde(range(max = 13))]
    pub ocr_psm: u8,

    /// Maximum recognitions running on the engine at once
    #[serde(default = "default_engine_concurrency")]
    #[garde(range(min = 1, max = 64))]
    pub engine_concurrency: usize,

    /// Number of pool workers pulling jobs
    #[serde(default = "default_worker_concurrency")]
    #[garde(range(min = 1, max = 64))]
    pub worker_concurrency: usize,

    /// Also recognize the five geometric variants of each image
    #[serde(default = "default_true")]
    #[garde(skip)]
    pub split_variants: bool,

    /// A job running longer than this is considered stalled
    #[serde(default = "default_job_timeout_secs")]
    #[garde(range(min = 1))]
    pub job_timeout_secs: u64,

    /// How many times a stalled job is requeued before it fails
    #[serde(default = "default_max_stalled_count")]
    #[garde(range(max = 10))]
    pub max_stalled_count: u32,

    /// Keep the engine's intermediate images under `<scratch>/debug/<job_id>/`
    #[serde(default)]
    #[garde(skip)]
    pub ocr_debug_images: bool,

    /// Complete jobs for already-recorded images from the store, without OCR
    #[serde(default)]
    #[garde(skip)]
    pub skip_known_images: bool,

    /// Ban-list file (text, one code per line, or a JSON array)
    #[serde(default)]
    #[garde(skip)]
    pub ban_list_path: Option<PathBuf>,

    #[serde(default = "default_store_backend")]
    #[garde(skip)]
    pub store_backend: StoreBackend,

    /// Directory of the JSON result store
    #[serde(default = "default_json_store_dir")]
    #[garde(skip)]
    pub json_store_dir: PathBuf,

    /// PostgreSQL connection string (postgres backend only)
    #[serde(default)]
    #[garde(skip)]
    pub database_url: Option<String>,

    /// Redis connection string for the job intake bridge (worker only)
    #[serde(default)]
    #[garde(skip)]
    pub redis_url: Option<String>,

    /// Prometheus scrape listener address (e.g. "0.0.0.0:9100")
    #[serde(default)]
    #[garde(skip)]
    pub metrics_addr: Option<String>,

    #[serde(default = "default_enhance_scale")]
    #[garde(range(min = 0.1, max = 8.0))]
    pub enhance_scale: f32,

    #[serde(default = "default_enhance_contrast")]
    #[garde(range(min = 0.01, max = 10.0))]
    pub enhance_contrast: f32,

    #[serde(default = "default_enhance_brightness")]
    #[garde(range(min = 0.01, max = 10.0))]
    pub enhance_brightness: f32,

    #[serde(default = "default_true")]
    #[garde(skip)]
    pub enhance_sharpen: bool,

    #[serde(default = "default_true")]
    #[garde(skip)]
    pub enhance_denoise: bool,
}

fn default_scratch_dir() -> PathBuf {
    PathBuf::from("tmp")
}

fn default_engine_cache_dir() -> PathBuf {
    PathBuf::from(".cache/tesseract")
}

fn default_tesseract_bin() -> String {
    "tesseract".to_string()
}

fn default_ocr_languages() -> String {
    "eng+ind".to_string()
}

fn default_ocr_oem() -> u8 {
    1
}

fn default_ocr_psm() -> u8 {
    3
}

fn default_engine_concurrency() -> usize {
    1
}

fn default_worker_concurrency() -> usize {
    2
}

fn default_true() -> bool {
    true
}

fn default_job_timeout_secs() -> u64 {
    600
}

fn default_max_stalled_count() -> u32 {
    2
}

fn default_store_backend() -> StoreBackend {
    StoreBackend::Json
}

fn default_json_store_dir() -> PathBuf {
    PathBuf::from("data/vouchers")
}

fn default_enhance_scale() -> f32 {
    2.0
}

fn default_enhance_contrast() -> f32 {
    1.2
}

fn default_enhance_brightness() -> f32 {
    1.1
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: Self = envy::from_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn enhance_options(&self) -> EnhanceOptions {
        EnhanceOptions {
            scale: self.enhance_scale,
            contrast: self.enhance_contrast,
            brightness: self.enhance_brightness,
            sharpen: self.enhance_sharpen,
            denoise: self.enhance_denoise,
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            languages: self
                .ocr_languages
                .split('+')
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect(),
            oem: self.ocr_oem,
            psm: self.ocr_psm,
            cache_dir: self.engine_cache_dir.clone(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            scratch_dir: default_scratch_dir(),
            engine_cache_dir: default_engine_cache_dir(),
            tesseract_bin: default_tesseract_bin(),
            ocr_languages: default_ocr_languages(),
            ocr_oem: default_ocr_oem(),
            ocr_psm: default_ocr_psm(),
            engine_concurrency: default_engine_concurrency(),
            worker_concurrency: default_worker_concurrency(),
            split_variants: true,
            job_timeout_secs: default_job_timeout_secs(),
            max_stalled_count: default_max_stalled_count(),
            ocr_debug_images: false,
            skip_known_images: false,
            ban_list_path: None,
            store_backend: default_store_backend(),
            json_store_dir: default_json_store_dir(),
            database_url: None,
            redis_url: None,
            metrics_addr: None,
            enhance_scale: default_enhance_scale(),
            enhance_contrast: default_enhance_contrast(),
            enhance_brightness: default_enhance_brightness(),
            enhance_sharpen: true,
            enhance_denoise: true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration from environment: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(#[from] garde::Report),

    #[error("Missing configuration: {0}")]
    Missing(&'static str),
}
