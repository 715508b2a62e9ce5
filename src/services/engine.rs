//! Ownership of the single recognition engine.
//!
//! The manager holds the engine handle through `Uninitialized -> Ready ->
//! Terminated`. Construction happens at most once no matter how many callers
//! race on `ensure_ready`, and a semaphore bounds how many recognitions run
//! on the engine at the same time, independent of the job pool size.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore};
use tracing::{info, warn};

/// Fixed engine construction parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    pub languages: Vec<String>,
    /// Engine (accuracy) mode
    pub oem: u8,
    /// Default page segmentation mode
    pub psm: u8,
    /// Persistent engine data directory
    pub cache_dir: PathBuf,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            languages: vec!["eng".to_string(), "ind".to_string()],
            oem: 1,
            psm: 3,
            cache_dir: PathBuf::from(".cache/tesseract"),
        }
    }
}

/// Per-call recognition options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecognizeOptions {
    /// Override the engine's page segmentation mode for this call
    pub psm: Option<u8>,
    /// Ask the engine to keep its intermediate images in this directory
    pub debug_images_dir: Option<PathBuf>,
}

/// Output of one recognition call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Recognition {
    pub text: String,
    pub auxiliary_images: Vec<PathBuf>,
}

/// A constructed, ready-to-use recognition engine.
#[async_trait]
pub trait RecognitionEngine: Send + Sync {
    fn name(&self) -> &'static str;

    async fn recognize(
        &self,
        image: &Path,
        options: &RecognizeOptions,
    ) -> Result<Recognition, EngineError>;

    /// Release engine resources. Called exactly once, by the manager.
    async fn terminate(&self) -> Result<(), EngineError>;
}

/// Builds the engine. Construction is expensive and happens once per manager.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn create(
        &self,
        settings: &EngineSettings,
    ) -> Result<Arc<dyn RecognitionEngine>, EngineError>;
}

enum EngineState {
    Uninitialized,
    Ready(Arc<dyn RecognitionEngine>),
    Terminated,
}

/// Lifecycle phase, for health reporting and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePhase {
    Uninitialized,
    Ready,
    Terminated,
}

pub struct EngineManager {
    factory: Arc<dyn EngineFactory>,
    settings: EngineSettings,
    state: Mutex<EngineState>,
    permits: Arc<Semaphore>,
    max_concurrent: u32,
}

impl EngineManager {
    pub fn new(
        factory: Arc<dyn EngineFactory>,
        settings: EngineSettings,
        max_concurrent: usize,
    ) -> Self {
        let max_concurrent =
            u32::try_from(max_concurrent.clamp(1, Semaphore::MAX_PERMITS)).unwrap_or(u32::MAX);
        Self {
            factory,
            settings,
            state: Mutex::new(EngineState::Uninitialized),
            permits: Arc::new(Semaphore::new(max_concurrent as usize)),
            max_concurrent,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub async fn phase(&self) -> EnginePhase {
        match *self.state.lock().await {
            EngineState::Uninitialized => EnginePhase::Uninitialized,
            EngineState::Ready(_) => EnginePhase::Ready,
            EngineState::Terminated => EnginePhase::Terminated,
        }
    }

    /// Construct the engine if it does not exist yet. Concurrent callers wait
    /// on the state lock, so only the first one constructs.
    pub async fn ensure_ready(&self) -> Result<Arc<dyn RecognitionEngine>, EngineError> {
        let mut state = self.state.lock().await;
        match &*state {
            EngineState::Ready(engine) => Ok(engine.clone()),
            EngineState::Terminated => Err(EngineError::Terminated),
            EngineState::Uninitialized => {
                let started = Instant::now();
                let engine = self.factory.create(&self.settings).await?;
                info!(
                    engine = engine.name(),
                    languages = %self.settings.languages.join("+"),
                    oem = self.settings.oem,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Recognition engine ready"
                );
                *state = EngineState::Ready(engine.clone());
                Ok(engine)
            }
        }
    }

    /// Recognize `image`, initializing the engine on first use. At most
    /// `max_concurrent` calls run on the engine at once.
    pub async fn recognize(
        &self,
        image: &Path,
        options: &RecognizeOptions,
    ) -> Result<Recognition, EngineError> {
        let engine = self.ensure_ready().await?;
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| EngineError::Terminated)?;

        let started = Instant::now();
        let result = engine.recognize(image, options).await;
        metrics::histogram!("voucher_recognition_seconds").record(started.elapsed().as_secs_f64());
        metrics::counter!("voucher_recognitions_total").increment(1);
        if result.is_err() {
            metrics::counter!("voucher_recognition_failures_total").increment(1);
        }
        result
    }

    /// Terminate the engine. Waits for in-flight recognitions to finish,
    /// then releases the engine. Later calls are no-ops.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        let previous = std::mem::replace(&mut *state, EngineState::Terminated);

        // Drain: once every permit is held no recognition is running.
        match self.permits.acquire_many(self.max_concurrent).await {
            Ok(permits) => permits.forget(),
            Err(_) => return Ok(()),
        }
        self.permits.close();

        match previous {
            EngineState::Ready(engine) => {
                info!(engine = engine.name(), "Shutting down recognition engine");
                if let Err(e) = engine.terminate().await {
                    warn!(error = %e, "Recognition engine did not terminate cleanly");
                    return Err(e);
                }
                Ok(())
            }
            EngineState::Uninitialized => {
                info!("Recognition engine never started, nothing to shut down");
                Ok(())
            }
            EngineState::Terminated => Ok(()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("recognition engine is not available: {0}")]
    Unavailable(String),

    #[error("recognition engine has been shut down")]
    Terminated,

    #[error("recognition failed for {image}: {message}")]
    Recognition { image: String, message: String },

    #[error("recognition engine I/O error: {0}")]
    Io(#[from] std::io::Error),
}
