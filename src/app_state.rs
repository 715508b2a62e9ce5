use std::sync::Arc;

use tracing::info;

use crate::config::{AppConfig, ConfigError, StoreBackend};
use crate::db::{self, JsonVoucherStore, PgVoucherStore, StoreError, VoucherStore};
use crate::services::{
    acquisition::{FetchError, ImageFetcher},
    ban_list::{BanList, BanListError},
    engine::{EngineFactory, EngineManager},
    pipeline::{PipelineSettings, VoucherPipeline},
    queue::{JobQueue, QueueSettings},
    tesseract::TesseractFactory,
};

/// Everything a binary needs to run jobs, wired from one configuration.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub ban_list: Arc<BanList>,
    pub store: Arc<dyn VoucherStore>,
    pub engine: Arc<EngineManager>,
    pub pipeline: Arc<VoucherPipeline>,
    pub queue: Arc<JobQueue>,
}

impl AppState {
    /// Wire the services with the Tesseract engine.
    pub async fn build(config: AppConfig) -> Result<Self, StartupError> {
        let factory = Arc::new(TesseractFactory::new(config.tesseract_bin.clone()));
        Self::build_with_factory(config, factory).await
    }

    /// Wire the services around a caller-supplied engine factory. The engine
    /// itself is constructed lazily by the first job.
    pub async fn build_with_factory(
        config: AppConfig,
        factory: Arc<dyn EngineFactory>,
    ) -> Result<Self, StartupError> {
        let ban_list = Arc::new(match &config.ban_list_path {
            Some(path) => BanList::load(path)?,
            None => BanList::empty(),
        });

        let store = open_store(&config, ban_list.clone()).await?;
        store.create_if_absent().await?;

        let settings = PipelineSettings {
            scratch_dir: config.scratch_dir.clone(),
            enhance: config.enhance_options(),
            split: config.split_variants,
            skip_known_images: config.skip_known_images,
            debug_images: config.ocr_debug_images,
        };
        let fetcher = Arc::new(ImageFetcher::new(settings.downloads_dir())?);
        let engine = Arc::new(EngineManager::new(
            factory,
            config.engine_settings(),
            config.engine_concurrency,
        ));
        let pipeline = Arc::new(VoucherPipeline::new(
            fetcher,
            engine.clone(),
            ban_list.clone(),
            store.clone(),
            settings,
        ));
        let queue = Arc::new(JobQueue::start(
            pipeline.clone(),
            QueueSettings {
                concurrency: config.worker_concurrency,
                job_timeout: config.job_timeout(),
                max_stalled_count: config.max_stalled_count,
            },
        ));

        Ok(Self {
            config: Arc::new(config),
            ban_list,
            store,
            engine,
            pipeline,
            queue,
        })
    }
}

async fn open_store(
    config: &AppConfig,
    ban_list: Arc<BanList>,
) -> Result<Arc<dyn VoucherStore>, StartupError> {
    match config.store_backend {
        StoreBackend::Json => {
            info!(dir = %config.json_store_dir.display(), "Using JSON result store");
            Ok(Arc::new(JsonVoucherStore::new(
                config.json_store_dir.clone(),
                ban_list,
            )))
        }
        StoreBackend::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .ok_or(ConfigError::Missing("DATABASE_URL"))?;
            info!("Connecting to PostgreSQL result store");
            let pool = db::init_pool(url).await.map_err(StoreError::Database)?;
            Ok(Arc::new(PgVoucherStore::new(pool, ban_list)))
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to load ban-list: {0}")]
    BanList(#[from] BanListError),

    #[error("Failed to open result store: {0}")]
    Store(#[from] StoreError),

    #[error("Failed to initialize image fetcher: {0}")]
    Fetch(#[from] FetchError),
}
