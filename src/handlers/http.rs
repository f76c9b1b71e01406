//! Direct media links streamed over HTTP

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::traits::{HandlerError, SourceHandler};
use super::types::{Artifact, FetchRequest, remove_quietly};
use crate::config::SourceConfig;
use crate::humanize::ByteSize;
use crate::progress::Stage;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Connection timeout")]
    Timeout,

    #[error("HTTP {status}")]
    Status { status: StatusCode },

    #[error("Response exceeds size limit of {limit}")]
    TooLarge { limit: ByteSize },

    #[error("Failed to write file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cancelled")]
    Cancelled,
}

impl From<DownloadError> for HandlerError {
    fn from(e: DownloadError) -> Self {
        match e {
            DownloadError::Cancelled => HandlerError::Cancelled,
            DownloadError::TooLarge { .. } => HandlerError::Fatal(e.to_string()),
            DownloadError::Status { status } if is_retryable_status(status) => {
                HandlerError::Retryable(e.to_string())
            }
            DownloadError::Status { .. } => HandlerError::Fatal(e.to_string()),
            DownloadError::RequestFailed(_) | DownloadError::Timeout | DownloadError::Io(_) => {
                HandlerError::Retryable(e.to_string())
            }
        }
    }
}

/// 5xx, 408 and 429 are worth another attempt; other 4xx are not
fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub connect_timeout: Duration,
    /// Maximum time between two received chunks
    pub read_timeout: Duration,
    pub user_agent: String,
    pub max_size: Option<ByteSize>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(60),
            user_agent: concat!("mediafix/", env!("CARGO_PKG_VERSION")).to_string(),
            max_size: Some(ByteSize::mib(2048)),
        }
    }
}

/// Streams a direct media URL to disk in chunks
pub struct DirectHttpHandler {
    name: String,
    client: Client,
    config: HttpConfig,
}

impl DirectHttpHandler {
    pub fn new(name: impl Into<String>, config: HttpConfig) -> Result<Self, DownloadError> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|e| DownloadError::RequestFailed(e.to_string()))?;

        Ok(Self {
            name: name.into(),
            client,
            config,
        })
    }

    pub fn from_config(source: &SourceConfig) -> Result<Self, DownloadError> {
        let mut config = HttpConfig::default();
        if let Some(timeout) = source.connect_timeout {
            config.connect_timeout = timeout.as_duration();
        }
        if let Some(user_agent) = &source.user_agent {
            config.user_agent = user_agent.clone();
        }
        if source.max_size.is_some() {
            config.max_size = source.max_size;
        }
        Self::new(source.name.clone(), config)
    }

    async fn download_to(
        &self,
        request: &FetchRequest,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<ByteSize, DownloadError> {
        debug!(url = %request.source_url, dest = %dest.display(), "Starting download");

        let mut response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            sent = self.client.get(&request.source_url).send() => sent.map_err(map_request_error)?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Status { status });
        }

        let total = response.content_length();
        if let (Some(total), Some(limit)) = (total, self.config.max_size) {
            if total > limit.as_u64() {
                return Err(DownloadError::TooLarge { limit });
            }
        }

        let mut file = File::create(dest).await?;
        let mut written: u64 = 0;

        loop {
            // Cancellation checkpoint between chunks
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                chunk = response.chunk() => chunk.map_err(map_request_error)?,
            };
            let Some(chunk) = chunk else {
                break;
            };

            written += chunk.len() as u64;
            if let Some(limit) = self.config.max_size {
                if written > limit.as_u64() {
                    return Err(DownloadError::TooLarge { limit });
                }
            }
            file.write_all(&chunk).await?;

            let percent = total
                .filter(|t| *t > 0)
                .map(|t| (written as f64 / t as f64 * 100.0) as f32)
                .unwrap_or(0.0);
            request.progress.report(
                Stage::Downloading,
                percent,
                Some(ByteSize(written).to_human_readable()),
            );
        }

        file.flush().await?;
        Ok(ByteSize(written))
    }
}

fn map_request_error(e: reqwest::Error) -> DownloadError {
    if e.is_timeout() {
        DownloadError::Timeout
    } else {
        DownloadError::RequestFailed(e.to_string())
    }
}

/// File extension of the URL path, if it looks like one
fn url_extension(source_url: &str) -> Option<String> {
    let url = reqwest::Url::parse(source_url).ok()?;
    let last = url.path_segments()?.next_back()?;
    let (_, ext) = last.rsplit_once('.')?;
    let valid = !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric());
    valid.then(|| ext.to_ascii_lowercase())
}

#[async_trait]
impl SourceHandler for DirectHttpHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(
        &self,
        request: FetchRequest,
        cancel: CancellationToken,
    ) -> Result<Artifact, HandlerError> {
        tokio::fs::create_dir_all(&request.work_dir)
            .await
            .map_err(|e| HandlerError::fatal(format!("work dir unavailable: {e}")))?;

        let ext = url_extension(&request.source_url).unwrap_or_else(|| "bin".to_string());
        let dest = request
            .work_dir
            .join(format!("{}.{}", request.output_stem(), ext));

        match self.download_to(&request, &dest, &cancel).await {
            Ok(size) => {
                info!(
                    job_id = %request.job_id,
                    url = %request.source_url,
                    size = %size,
                    "Download completed"
                );
                Ok(Artifact::new(dest, size).with_metadata("source", self.name.clone()))
            }
            Err(e) => {
                remove_quietly(&dest).await;
                Err(e.into())
            }
        }
    }
}
