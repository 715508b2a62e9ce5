use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use reqwest::header::CONTENT_LENGTH;
use reqwest::Client;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::services::imaging::{discard_file_async, partial_path};

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolves job inputs to local files, downloading remote images into a
/// size-checked cache under `cache_dir`.
pub struct ImageFetcher {
    http: Client,
    cache_dir: PathBuf,
    downloads: AtomicU64,
}

impl ImageFetcher {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Result<Self, FetchError> {
        let http = Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .build()
            .map_err(FetchError::Client)?;
        Ok(Self::with_client(http, cache_dir))
    }

    pub fn with_client(http: Client, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            http,
            cache_dir: cache_dir.into(),
            downloads: AtomicU64::new(0),
        }
    }

    /// Number of full downloads performed by this fetcher.
    pub fn download_count(&self) -> u64 {
        self.downloads.load(Ordering::Relaxed)
    }

    /// Local path for `input`. Non-URL inputs are returned unchanged.
    pub async fn resolve(&self, input: &str) -> Result<PathBuf, FetchError> {
        if !is_remote(input) {
            return Ok(PathBuf::from(input));
        }

        tokio::fs::create_dir_all(&self.cache_dir)
            .await
            .map_err(|e| FetchError::Io {
                url: input.to_string(),
                source: e,
            })?;
        let target = self.cache_dir.join(cache_file_name(input));

        let remote_size = self.remote_size_of(input).await;
        if let Some(remote_size) = remote_size {
            if let Ok(meta) = tokio::fs::metadata(&target).await {
                if meta.is_file() && meta.len() == remote_size {
                    debug!(url = %input, size = remote_size, "Image cache hit");
                    return Ok(target);
                }
            }
        }

        self.download(input, &target).await?;
        Ok(target)
    }

    /// Remote size from a HEAD request. Any failure means "unknown".
    async fn remote_size_of(&self, url: &str) -> Option<u64> {
        let response = match self.http.head(url).timeout(PROBE_TIMEOUT).send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                debug!(url = %url, status = %r.status(), "HEAD request rejected, downloading");
                return None;
            }
            Err(e) => {
                debug!(url = %url, error = %e, "HEAD request failed, downloading");
                return None;
            }
        };

        // `Response::content_length` reports the (empty) HEAD body, so read
        // the header itself.
        response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
    }

    async fn download(&self, url: &str, target: &Path) -> Result<(), FetchError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Request {
                url: url.to_string(),
                source: e,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await.map_err(|e| FetchError::Request {
            url: url.to_string(),
            source: e,
        })?;
        self.downloads.fetch_add(1, Ordering::Relaxed);

        let tmp = partial_path(target);
        let write = async {
            tokio::fs::write(&tmp, &body).await?;
            tokio::fs::rename(&tmp, target).await
        };
        if let Err(e) = write.await {
            discard_file_async(&tmp).await;
            return Err(FetchError::Io {
                url: url.to_string(),
                source: e,
            });
        }

        info!(url = %url, bytes = body.len(), "Downloaded image");
        Ok(())
    }
}

/// True for `http://` and `https://` references (case-insensitive).
pub fn is_remote(input: &str) -> bool {
    let lower = input.trim_start().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Deterministic cache name: SHA-256 of the URL plus the URL path's extension
/// (query and fragment ignored), or `.img` when it has none.
pub fn cache_file_name(url: &str) -> String {
    let digest = hex::encode(Sha256::digest(url.as_bytes()));
    format!("{}{}", digest, url_extension(url))
}

fn url_extension(url: &str) -> String {
    let without_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let path = without_scheme
        .split(['?', '#'])
        .next()
        .unwrap_or_default();
    let last_segment = match path.split_once('/') {
        Some((_, p)) => p.rsplit('/').next().unwrap_or_default(),
        None => "",
    };

    match last_segment.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty()
                && !ext.is_empty()
                && ext.len() <= 5
                && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            format!(".{}", ext.to_ascii_lowercase())
        }
        _ => ".img".to_string(),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("HTTP client setup failed: {0}")]
    Client(#[source] reqwest::Error),

    #[error("download of {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("download of {url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("cannot store download of {url}: {source}")]
    Io {
        url: String,
        #[source]
        source: std::io::Error,
    },
}
