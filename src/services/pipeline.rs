//! One job, end to end: acquire, enhance, recognize, extract, store.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::{normalize_key, StoreError, VoucherStore};
use crate::models::job::{JobInput, JobOutcome, ValidationError};
use crate::services::acquisition::{FetchError, ImageFetcher};
use crate::services::ban_list::BanList;
use crate::services::engine::{EngineError, EngineManager};
use crate::services::enhance::{enhance, EnhanceOptions};
use crate::services::imaging::ImageProcessingError;
use crate::services::ocr::{RecognitionOrchestrator, RecognizeAllOptions};
use crate::services::vouchers::{extract_from_lines, unique_lines};

/// Progress checkpoints reported while a job runs.
pub mod progress {
    pub const QUEUED: u8 = 0;
    pub const ACQUIRED: u8 = 10;
    pub const ENHANCED: u8 = 30;
    pub const RECOGNIZED: u8 = 80;
    pub const DONE: u8 = 100;
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub scratch_dir: PathBuf,
    pub enhance: EnhanceOptions,
    pub split: bool,
    pub skip_known_images: bool,
    pub debug_images: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            scratch_dir: PathBuf::from("tmp"),
            enhance: EnhanceOptions::default(),
            split: true,
            skip_known_images: false,
            debug_images: false,
        }
    }
}

impl PipelineSettings {
    /// Where the acquisition cache keeps downloads.
    pub fn downloads_dir(&self) -> PathBuf {
        self.scratch_dir.join("downloads")
    }

    /// Where kept debug output (engine images, CLI logs) goes.
    pub fn debug_dir(&self) -> PathBuf {
        self.scratch_dir.join("debug")
    }

    /// Where the HTTP layer stages uploaded files.
    pub fn uploads_dir(&self) -> PathBuf {
        self.scratch_dir.join("uploads")
    }

    fn job_dir(&self, job_id: Uuid) -> PathBuf {
        self.scratch_dir.join("jobs").join(job_id.to_string())
    }
}

pub struct VoucherPipeline {
    orchestrator: RecognitionOrchestrator,
    fetcher: Arc<ImageFetcher>,
    ban_list: Arc<BanList>,
    store: Arc<dyn VoucherStore>,
    settings: PipelineSettings,
}

impl VoucherPipeline {
    pub fn new(
        fetcher: Arc<ImageFetcher>,
        engine: Arc<EngineManager>,
        ban_list: Arc<BanList>,
        store: Arc<dyn VoucherStore>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            orchestrator: RecognitionOrchestrator::new(fetcher.clone(), engine),
            fetcher,
            ban_list,
            store,
            settings,
        }
    }

    pub fn engine(&self) -> &Arc<EngineManager> {
        self.orchestrator.engine()
    }

    pub fn store(&self) -> &Arc<dyn VoucherStore> {
        &self.store
    }

    pub fn ban_list(&self) -> &Arc<BanList> {
        &self.ban_list
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Run one job attempt. Intermediate files live in a per-job scratch
    /// directory that is removed before this returns, or when the future is
    /// dropped.
    pub async fn run(
        &self,
        job_id: Uuid,
        input: &JobInput,
        on_progress: &(dyn Fn(u8) + Send + Sync),
    ) -> Result<JobOutcome, PipelineError> {
        let scratch = JobScratch::new(job_id, self.settings.job_dir(job_id));
        let result = self.process(input, &scratch, on_progress).await;
        scratch.release().await;
        result
    }

    async fn process(
        &self,
        input: &JobInput,
        scratch: &JobScratch,
        on_progress: &(dyn Fn(u8) + Send + Sync),
    ) -> Result<JobOutcome, PipelineError> {
        let key = normalize_key(input.as_ref_str());
        let banned = self.ban_list.snapshot();

        if self.settings.skip_known_images {
            if let Some(record) = self.store.read_by_key(&key).await? {
                let vouchers: Vec<_> = record
                    .codes
                    .into_iter()
                    .filter(|code| !banned.contains(code.as_str()))
                    .collect();
                info!(key = %key, codes = vouchers.len(), "Image already recorded, skipping OCR");
                on_progress(progress::DONE);
                return Ok(JobOutcome {
                    text: String::new(),
                    vouchers,
                    debug_images: Vec::new(),
                });
            }
        }

        let source = self.fetcher.resolve(input.as_ref_str()).await?;
        on_progress(progress::ACQUIRED);

        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image".to_string());
        let enhanced = scratch.path().join("optimized").join(format!("{stem}.png"));
        enhance(&source, &enhanced, &self.settings.enhance).await?;
        on_progress(progress::ENHANCED);

        let options = RecognizeAllOptions {
            output_dir: scratch.path().to_path_buf(),
            split: self.settings.split,
            debug_images: self.settings.debug_images,
        };
        let recognition = self
            .orchestrator
            .recognize_all(&enhanced.to_string_lossy(), &options)
            .await?;
        on_progress(progress::RECOGNIZED);

        let lines = unique_lines(recognition.texts());
        let vouchers = extract_from_lines(&lines, Some(&banned));

        let debug_images = self
            .keep_debug_images(scratch, &recognition.auxiliary_images)
            .await;

        self.store.upsert(&key, &vouchers).await?;
        metrics::counter!("voucher_codes_found_total").increment(vouchers.len() as u64);
        on_progress(progress::DONE);

        debug!(
            key = %key,
            lines = lines.len(),
            vouchers = vouchers.len(),
            failed_passes = recognition.failures.len(),
            "Extraction finished"
        );
        Ok(JobOutcome {
            text: lines.join("\n"),
            vouchers,
            debug_images,
        })
    }

    /// Copy engine debug images out of the job scratch directory into
    /// `<scratch>/debug/<job_id>/`, keeping their layout. Copy failures are
    /// logged and the image is left out.
    async fn keep_debug_images(&self, scratch: &JobScratch, images: &[PathBuf]) -> Vec<PathBuf> {
        let target_root = self.settings.debug_dir().join(scratch.job_id().to_string());
        let mut kept = Vec::with_capacity(images.len());
        for image in images {
            let relative = match image.strip_prefix(scratch.path()) {
                Ok(relative) => relative.to_path_buf(),
                Err(_) => match image.file_name() {
                    Some(name) => PathBuf::from(name),
                    None => continue,
                },
            };
            let target = target_root.join(relative);
            let copy = async {
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::copy(image, &target).await
            };
            match copy.await {
                Ok(_) => kept.push(target),
                Err(e) => warn!(file = ?image.file_name(), error = %e, "Failed to keep debug image"),
            }
        }
        if !kept.is_empty() {
            debug!(count = kept.len(), dir = %target_root.display(), "Kept engine debug images");
        }
        kept
    }

    /// Delete `input` if it is an upload staged under the scratch root. Other
    /// inputs (caller files, cached downloads) are left alone. Failures are
    /// logged and swallowed.
    pub async fn discard_staged_input(&self, input: &JobInput) {
        let JobInput::Path(path) = input else {
            return;
        };
        let path = Path::new(path);
        if !path.starts_with(self.settings.uploads_dir()) {
            return;
        }
        match tokio::fs::remove_file(path).await {
            Ok(()) => debug!(file = ?path.file_name(), "Removed staged upload"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(file = ?path.file_name(), error = %e, "Failed to remove staged upload"),
        }
    }
}

/// Per-job scratch directory. `release` removes it; dropping an unreleased
/// guard removes it synchronously.
struct JobScratch {
    job_id: Uuid,
    dir: PathBuf,
    released: bool,
}

impl JobScratch {
    fn new(job_id: Uuid, dir: PathBuf) -> Self {
        Self {
            job_id,
            dir,
            released: false,
        }
    }

    fn job_id(&self) -> Uuid {
        self.job_id
    }

    fn path(&self) -> &Path {
        &self.dir
    }

    async fn release(mut self) {
        self.released = true;
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(error = %e, "Failed to remove job scratch directory"),
        }
    }
}

impl Drop for JobScratch {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(error = %e, "Failed to remove abandoned job scratch directory");
            }
        }
    }
}

/// Job-fatal failures. The `Display` text becomes the job's failure reason.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("could not fetch image: {0}")]
    Fetch(#[from] FetchError),

    #[error("could not process image: {0}")]
    Image(#[from] ImageProcessingError),

    #[error("recognition failed: {0}")]
    Engine(#[from] EngineError),

    #[error("invalid job: {0}")]
    Validation(#[from] ValidationError),

    #[error("could not store results: {0}")]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::JsonVoucherStore;
    use crate::models::voucher::VoucherCode;
    use crate::services::engine::testing::{FakeEngine, FakeFactory};
    use crate::services::engine::EngineSettings;
    use image::{GrayImage, Luma};
    use std::sync::Mutex;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        pipeline: VoucherPipeline,
    }

    fn fixture(engine: FakeEngine, skip_known: bool) -> Fixture {
        fixture_with(engine, |settings| settings.skip_known_images = skip_known)
    }

    fn fixture_with(engine: FakeEngine, configure: impl FnOnce(&mut PipelineSettings)) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let ban_list = Arc::new(BanList::from_codes(["1234123412341234"]));
        let store = Arc::new(JsonVoucherStore::new(root.join("store"), ban_list.clone()));
        let mut settings = PipelineSettings {
            scratch_dir: root.join("tmp"),
            ..PipelineSettings::default()
        };
        configure(&mut settings);
        let fetcher = Arc::new(ImageFetcher::new(settings.downloads_dir()).unwrap());
        let engine = Arc::new(EngineManager::new(
            Arc::new(FakeFactory::new(engine)),
            EngineSettings::default(),
            1,
        ));
        let pipeline = VoucherPipeline::new(fetcher, engine, ban_list, store, settings);
        Fixture {
            _dir: dir,
            root,
            pipeline,
        }
    }

    fn write_image(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        GrayImage::from_pixel(24, 16, Luma([180])).save(path).unwrap();
    }

    fn code(s: &str) -> VoucherCode {
        VoucherCode::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_run_extracts_and_stores() {
        let fx = fixture(
            FakeEngine {
                responses: vec![
                    ("top_half".to_string(), "PIN\n1111 2222 3333 4444\n".to_string()),
                    ("card.png".to_string(), "PIN\n1234 1234 1234 1234\n5555 6666 7777 8888".to_string()),
                ],
                ..FakeEngine::default()
            },
            false,
        );
        let image = fx.root.join("input/card.png");
        write_image(&image);
        let input = JobInput::Path(image.to_string_lossy().into_owned());

        let seen = Mutex::new(Vec::new());
        let outcome = fx
            .pipeline
            .run(Uuid::new_v4(), &input, &|p| seen.lock().unwrap().push(p))
            .await
            .unwrap();

        assert_eq!(outcome.vouchers, [code("1111222233334444"), code("5555666677778888")]);
        assert_eq!(
            outcome.text,
            "PIN\n1111 2222 3333 4444\n1234 1234 1234 1234\n5555 6666 7777 8888"
        );
        assert_eq!(*seen.lock().unwrap(), [10, 30, 80, 100]);

        let key = normalize_key(input.as_ref_str());
        let record = fx.pipeline.store().read_by_key(&key).await.unwrap().unwrap();
        assert_eq!(record.codes, outcome.vouchers);
        assert!(!fx.root.join("tmp/jobs").exists() || std::fs::read_dir(fx.root.join("tmp/jobs")).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn test_missing_file_fails_without_store_entry() {
        let fx = fixture(FakeEngine::default(), false);
        let input = JobInput::Path(fx.root.join("nope/missing.png").to_string_lossy().into_owned());

        let err = fx.pipeline.run(Uuid::new_v4(), &input, &|_| {}).await.unwrap_err();
        assert!(matches!(err, PipelineError::Image(_)));
        let reason = err.to_string();
        assert!(reason.contains("missing.png"));
        assert!(!reason.contains("nope/"));
        assert!(fx.pipeline.store().list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_skip_known_images_uses_store() {
        let fx = fixture(FakeEngine::default(), true);
        let image = fx.root.join("input/seen.png");
        let input = JobInput::Path(image.to_string_lossy().into_owned());
        fx.pipeline
            .store()
            .upsert(&normalize_key(input.as_ref_str()), &[code("9999888877776666")])
            .await
            .unwrap();

        // The file does not exist: only the store is consulted.
        let outcome = fx.pipeline.run(Uuid::new_v4(), &input, &|_| {}).await.unwrap();
        assert_eq!(outcome.vouchers, [code("9999888877776666")]);
    }

    #[tokio::test]
    async fn test_skip_known_images_hides_codes_banned_since() {
        let fx = fixture(FakeEngine::default(), true);
        let input = JobInput::Path(fx.root.join("input/seen.png").to_string_lossy().into_owned());
        let key = normalize_key(input.as_ref_str());
        fx.pipeline
            .store()
            .upsert(&key, &[code("9999000011112222"), code("4444333322221111")])
            .await
            .unwrap();

        fx.pipeline
            .ban_list()
            .replace(["1234123412341234", "9999000011112222"]);

        let outcome = fx.pipeline.run(Uuid::new_v4(), &input, &|_| {}).await.unwrap();
        assert_eq!(outcome.vouchers, [code("4444333322221111")]);
    }

    #[tokio::test]
    async fn test_debug_images_outlive_job_scratch() {
        let fx = fixture_with(FakeEngine::default(), |settings| {
            settings.split = false;
            settings.debug_images = true;
        });
        let image = fx.root.join("input/card.png");
        write_image(&image);
        let input = JobInput::Path(image.to_string_lossy().into_owned());
        let job_id = Uuid::new_v4();

        let outcome = fx.pipeline.run(job_id, &input, &|_| {}).await.unwrap();

        assert_eq!(outcome.debug_images.len(), 1);
        let kept = &outcome.debug_images[0];
        assert!(kept.exists());
        assert!(kept.starts_with(fx.root.join("tmp/debug").join(job_id.to_string())));
        assert!(!fx.root.join("tmp/jobs").join(job_id.to_string()).exists());
    }

    #[tokio::test]
    async fn test_debug_images_off_by_default() {
        let fx = fixture(FakeEngine::default(), false);
        let image = fx.root.join("input/card.png");
        write_image(&image);
        let input = JobInput::Path(image.to_string_lossy().into_owned());

        let outcome = fx.pipeline.run(Uuid::new_v4(), &input, &|_| {}).await.unwrap();
        assert!(outcome.debug_images.is_empty());
        assert!(!fx.root.join("tmp/debug").exists());
    }

    #[tokio::test]
    async fn test_discard_staged_input_only_touches_uploads() {
        let fx = fixture(FakeEngine::default(), false);
        let staged = fx.pipeline.settings().uploads_dir().join("u.png");
        let outside = fx.root.join("input/keep.png");
        write_image(&staged);
        write_image(&outside);

        fx.pipeline
            .discard_staged_input(&JobInput::Path(staged.to_string_lossy().into_owned()))
            .await;
        fx.pipeline
            .discard_staged_input(&JobInput::Path(outside.to_string_lossy().into_owned()))
            .await;

        assert!(!staged.exists());
        assert!(outside.exists());
    }

    #[test]
    fn test_dropped_scratch_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let job_dir = dir.path().join("jobs/1");
        std::fs::create_dir_all(job_dir.join("variants")).unwrap();
        drop(JobScratch::new(Uuid::new_v4(), job_dir.clone()));
        assert!(!job_dir.exists());
    }
}
