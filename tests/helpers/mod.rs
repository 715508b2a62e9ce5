//! Test helper utilities shared by the integration tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use image::{GrayImage, Luma};
use parking_lot::{Mutex, RwLock};

use voucher_ocr::app_state::AppState;
use voucher_ocr::config::AppConfig;
use voucher_ocr::services::engine::{
    EngineError, EngineFactory, EngineSettings, Recognition, RecognitionEngine, RecognizeOptions,
};

/// Engine that answers from a script: each call pops the next text, and
/// returns an empty string once the script is exhausted.
#[derive(Default)]
pub struct ScriptedEngine {
    script: Mutex<VecDeque<String>>,
    pub calls: AtomicUsize,
    pub terminated: AtomicUsize,
}

impl ScriptedEngine {
    pub fn new<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            script: Mutex::new(texts.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    pub fn push(&self, text: impl Into<String>) {
        self.script.lock().push_back(text.into());
    }
}

#[async_trait]
impl RecognitionEngine for ScriptedEngine {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn recognize(
        &self,
        _image: &Path,
        options: &RecognizeOptions,
    ) -> Result<Recognition, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let text = self.script.lock().pop_front().unwrap_or_default();
        // Stand-in for the thresholded image Tesseract writes in debug mode.
        let mut auxiliary_images = Vec::new();
        if let Some(dir) = &options.debug_images_dir {
            std::fs::create_dir_all(dir)?;
            let image = dir.join("tessinput.tif");
            std::fs::write(&image, b"debug")?;
            auxiliary_images.push(image);
        }
        Ok(Recognition {
            text,
            auxiliary_images,
        })
    }

    async fn terminate(&self) -> Result<(), EngineError> {
        self.terminated.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct ScriptedFactory {
    pub engine: Arc<ScriptedEngine>,
    pub constructions: AtomicUsize,
}

impl ScriptedFactory {
    pub fn new(engine: ScriptedEngine) -> Arc<Self> {
        Arc::new(Self {
            engine: Arc::new(engine),
            constructions: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl EngineFactory for ScriptedFactory {
    async fn create(
        &self,
        _settings: &EngineSettings,
    ) -> Result<Arc<dyn RecognitionEngine>, EngineError> {
        self.constructions.fetch_add(1, Ordering::SeqCst);
        Ok(self.engine.clone())
    }
}

/// Configuration rooted in a temp directory, JSON store, one banned code.
pub fn test_config(root: &Path) -> AppConfig {
    let ban_list = root.join("banned.txt");
    std::fs::write(&ban_list, "# demo card code\n1234123412341234\n").unwrap();
    AppConfig {
        scratch_dir: root.join("tmp"),
        engine_cache_dir: root.join("cache"),
        json_store_dir: root.join("store"),
        ban_list_path: Some(ban_list),
        split_variants: false,
        worker_concurrency: 2,
        ..AppConfig::default()
    }
}

pub async fn build_state(config: AppConfig, factory: Arc<ScriptedFactory>) -> AppState {
    AppState::build_with_factory(config, factory)
        .await
        .expect("Failed to build app state")
}

/// Write a small synthetic voucher photo.
pub fn write_voucher_image(path: &Path) -> PathBuf {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    let img = GrayImage::from_fn(64, 32, |x, y| Luma([if (x / 8 + y / 8) % 2 == 0 { 40 } else { 220 }]));
    img.save(path).unwrap();
    path.to_path_buf()
}

pub fn png_bytes() -> Vec<u8> {
    let dir = tempfile::tempdir().unwrap();
    let path = write_voucher_image(&dir.path().join("v.png"));
    std::fs::read(path).unwrap()
}

#[derive(Clone)]
struct ImageServerState {
    body: Arc<RwLock<Vec<u8>>>,
    downloads: Arc<AtomicUsize>,
    heads: Arc<AtomicUsize>,
    fail_head: bool,
}

/// In-process HTTP server serving one image at `/images/{name}`.
pub struct ImageServer {
    pub addr: SocketAddr,
    body: Arc<RwLock<Vec<u8>>>,
    downloads: Arc<AtomicUsize>,
    heads: Arc<AtomicUsize>,
}

impl ImageServer {
    pub async fn start(body: Vec<u8>) -> Self {
        Self::start_with(body, false).await
    }

    /// Server whose HEAD requests fail with 500.
    pub async fn start_without_head(body: Vec<u8>) -> Self {
        Self::start_with(body, true).await
    }

    async fn start_with(body: Vec<u8>, fail_head: bool) -> Self {
        let state = ImageServerState {
            body: Arc::new(RwLock::new(body)),
            downloads: Arc::new(AtomicUsize::new(0)),
            heads: Arc::new(AtomicUsize::new(0)),
            fail_head,
        };
        let app = Router::new()
            .route("/images/{name}", get(serve_image))
            .route("/missing/{name}", get(|| async { StatusCode::NOT_FOUND }))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            body: state.body,
            downloads: state.downloads,
            heads: state.heads,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn set_body(&self, body: Vec<u8>) {
        *self.body.write() = body;
    }

    /// Number of GET requests served (full downloads).
    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    pub fn heads(&self) -> usize {
        self.heads.load(Ordering::SeqCst)
    }
}

async fn serve_image(State(state): State<ImageServerState>, method: Method) -> Response {
    if method == Method::HEAD {
        state.heads.fetch_add(1, Ordering::SeqCst);
        if state.fail_head {
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    } else {
        state.downloads.fetch_add(1, Ordering::SeqCst);
    }

    let body = state.body.read().clone();
    (
        [
            (CONTENT_TYPE, "image/png".to_string()),
            (CONTENT_LENGTH, body.len().to_string()),
        ],
        body,
    )
        .into_response()
}
