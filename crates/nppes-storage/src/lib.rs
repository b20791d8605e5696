//! Archive download utilities and the persistent provider store.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use futures_util::StreamExt;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

mod store;

pub use store::{MemoryProviderStore, PgProviderStore, ProviderStore, StoreError};

pub const CRATE_NAME: &str = "nppes-storage";

const PROGRESS_EVERY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// HTTP settings. Only connecting is bounded in time; archive bodies can take
/// arbitrarily long to stream.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub connect_timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl FetchError {
    /// True when no response arrived at all: the host could not be reached or
    /// the request could not be sent.
    pub fn is_unreachable(&self) -> bool {
        match self {
            Self::Request(err) => !err.is_body() && !err.is_decode() && !err.is_status(),
            Self::HttpStatus { .. } | Self::Io { .. } => false,
        }
    }

    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A freshly downloaded archive committed at its final path.
#[derive(Debug, Clone)]
pub struct DownloadedArchive {
    pub path: PathBuf,
    pub byte_size: u64,
    pub content_hash: String,
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    /// Archive bodies are hashed and stored exactly as sent, so this client
    /// never decodes a `Content-Encoding`.
    raw_client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let base = || {
            let builder = reqwest::Client::builder().connect_timeout(config.connect_timeout);
            match &config.user_agent {
                Some(user_agent) => builder.user_agent(user_agent.clone()),
                None => builder,
            }
        };

        let client = base()
            .gzip(true)
            .brotli(true)
            .build()
            .context("building reqwest client")?;
        let raw_client = base()
            .no_gzip()
            .no_brotli()
            .build()
            .context("building archive download client")?;
        Ok(Self {
            client,
            raw_client,
            backoff: config.backoff,
        })
    }

    /// Send a GET, retrying transient failures, and return the successful response
    /// with its body still unread.
    async fn get_with_retries(
        &self,
        client: &reqwest::Client,
        url: &str,
    ) -> Result<reqwest::Response, FetchError> {
        let mut attempt = 0;
        loop {
            match client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp);
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: resp.url().to_string(),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }

    pub async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        let span = info_span!("http_fetch", url);
        async {
            let resp = self.get_with_retries(&self.client, url).await?;
            Ok::<_, FetchError>(resp.text().await?)
        }
        .instrument(span)
        .await
    }

    /// Stream `url` into a temp file beside `dest`, then rename it into place.
    /// On any failure the temp file is removed and `dest` is left untouched.
    pub async fn download_archive(
        &self,
        url: &str,
        dest: &Path,
    ) -> Result<DownloadedArchive, FetchError> {
        let span = info_span!("archive_download", url, dest = %dest.display());
        async {
            let parent = dest
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            fs::create_dir_all(parent)
                .await
                .map_err(|e| FetchError::io(parent, e))?;

            let resp = self.get_with_retries(&self.raw_client, url).await?;
            let temp_path = temp_path_for(dest);
            match stream_to_file(resp, &temp_path).await {
                Ok((byte_size, content_hash)) => {
                    if let Err(err) = fs::rename(&temp_path, dest).await {
                        let _ = fs::remove_file(&temp_path).await;
                        return Err(FetchError::io(dest, err));
                    }
                    info!(byte_size, %content_hash, "archive downloaded");
                    Ok(DownloadedArchive {
                        path: dest.to_path_buf(),
                        byte_size,
                        content_hash,
                    })
                }
                Err(err) => {
                    let _ = fs::remove_file(&temp_path).await;
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }
}

async fn stream_to_file(
    resp: reqwest::Response,
    temp_path: &Path,
) -> Result<(u64, String), FetchError> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(temp_path)
        .await
        .map_err(|e| FetchError::io(temp_path, e))?;

    let mut hasher = Sha256::new();
    let mut downloaded: u64 = 0;
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        hasher.update(&chunk);
        downloaded += chunk.len() as u64;
        file.write_all(&chunk)
            .await
            .map_err(|e| FetchError::io(temp_path, e))?;

        if downloaded % PROGRESS_EVERY_BYTES < chunk.len() as u64 {
            info!("downloaded {} MB", downloaded / (1024 * 1024));
        }
    }

    file.flush()
        .await
        .map_err(|e| FetchError::io(temp_path, e))?;
    file.sync_all()
        .await
        .map_err(|e| FetchError::io(temp_path, e))?;
    drop(file);

    Ok((downloaded, hex::encode(hasher.finalize())))
}

fn temp_path_for(dest: &Path) -> PathBuf {
    let file_name = dest
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("archive");
    dest.with_file_name(format!(".{file_name}.{}.part", Uuid::new_v4()))
}

/// Whether a previously committed archive already sits at `path`.
pub async fn archive_present(path: &Path) -> anyhow::Result<bool> {
    fs::try_exists(path)
        .await
        .with_context(|| format!("checking archive path {}", path.display()))
}
