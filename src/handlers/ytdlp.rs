//! Sites handled through the `yt-dlp` binary

use async_trait::async_trait;
use regex::Regex;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::traits::{HandlerError, SourceHandler};
use super::types::{Artifact, FetchRequest, remove_quietly};
use crate::config::SourceConfig;
use crate::progress::Stage;

/// Prefer an mp4 under 50MB, fall back to the best mp4 (compressed later)
pub const DEFAULT_FORMAT: &str = "bestvideo[ext=mp4][filesize<50M]+bestaudio[ext=m4a]/\
                                  best[ext=mp4][filesize<50M]/\
                                  bestvideo[ext=mp4]+bestaudio[ext=m4a]/\
                                  best[ext=mp4]/best";

const TITLE_MARKER: &str = "mediafix-title:";
const FILE_MARKER: &str = "mediafix-file:";

static PERCENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[download\]\s+(\d+(?:\.\d+)?)%").unwrap());

/// Error text that will not improve with another attempt
const FATAL_KEYWORDS: &[&str] = &[
    "private",
    "not found",
    "unsupported url",
    "404",
    "403",
    "has been removed",
    "not available",
];

pub fn classify_failure(stderr: &str) -> HandlerError {
    let message = stderr
        .lines()
        .rev()
        .find(|line| line.contains("ERROR"))
        .or_else(|| stderr.lines().rev().find(|line| !line.trim().is_empty()))
        .unwrap_or("yt-dlp failed")
        .trim()
        .to_string();

    let lower = stderr.to_lowercase();
    if FATAL_KEYWORDS.iter().any(|keyword| lower.contains(keyword)) {
        HandlerError::Fatal(message)
    } else {
        HandlerError::Retryable(message)
    }
}

pub struct YtDlpHandler {
    name: String,
    binary: String,
    format: String,
    cookies_file: Option<PathBuf>,
    user_agent: Option<String>,
}

impl YtDlpHandler {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            binary: "yt-dlp".to_string(),
            format: DEFAULT_FORMAT.to_string(),
            cookies_file: None,
            user_agent: None,
        }
    }

    pub fn from_config(source: &SourceConfig) -> Self {
        let mut handler = Self::new(source.name.clone());
        if let Some(binary) = &source.binary {
            handler.binary = binary.clone();
        }
        if let Some(format) = &source.format {
            handler.format = format.clone();
        }
        handler.cookies_file = source.cookies_file.clone();
        handler.user_agent = source.user_agent.clone();
        handler
    }

    fn build_args(&self, request: &FetchRequest) -> Vec<String> {
        let template = request
            .work_dir
            .join(format!("{}.%(ext)s", request.output_stem()));

        let mut args: Vec<String> = vec![
            "--newline".into(),
            "--no-playlist".into(),
            "--no-simulate".into(),
            "--progress".into(),
            "-f".into(),
            self.format.clone(),
            "--merge-output-format".into(),
            "mp4".into(),
            "-o".into(),
            template.to_string_lossy().into_owned(),
            "--print".into(),
            format!("before_dl:{TITLE_MARKER}%(title)s"),
            "--print".into(),
            format!("after_move:{FILE_MARKER}%(filepath)s"),
        ];
        // A missing cookies file is skipped rather than passed to yt-dlp
        if let Some(cookies) = self.cookies_file.as_ref().filter(|p| p.exists()) {
            args.push("--cookies".into());
            args.push(cookies.to_string_lossy().into_owned());
        }
        if let Some(user_agent) = &self.user_agent {
            args.push("--user-agent".into());
            args.push(user_agent.clone());
        }
        args.push(request.source_url.clone());
        args
    }
}

/// Remove every file this attempt may have left behind
async fn remove_partials(work_dir: &Path, stem: &str) {
    let Ok(mut dir) = tokio::fs::read_dir(work_dir).await else {
        return;
    };
    while let Ok(Some(entry)) = dir.next_entry().await {
        if entry.file_name().to_string_lossy().starts_with(stem) {
            remove_quietly(&entry.path()).await;
        }
    }
}

#[async_trait]
impl SourceHandler for YtDlpHandler {
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

        let args = self.build_args(&request);
        debug!(job_id = %request.job_id, binary = %self.binary, ?args, "Spawning yt-dlp");

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => {
                    HandlerError::fatal(format!("{} is not installed", self.binary))
                }
                _ => HandlerError::retryable(format!("failed to start {}: {e}", self.binary)),
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HandlerError::fatal("yt-dlp stdout unavailable"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| HandlerError::fatal("yt-dlp stderr unavailable"))?;

        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut collected = String::new();
            while let Ok(Some(line)) = lines.next_line().await {
                collected.push_str(&line);
                collected.push('\n');
            }
            collected
        });

        let stem = request.output_stem();
        let mut title = None;
        let mut output_path = None;
        let mut lines = BufReader::new(stdout).lines();

        loop {
            let line = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    remove_partials(&request.work_dir, &stem).await;
                    return Err(HandlerError::Cancelled);
                }
                line = lines.next_line() => line,
            };
            let Ok(Some(line)) = line else {
                break;
            };

            if let Some(value) = line.strip_prefix(TITLE_MARKER) {
                title = Some(value.trim().to_string());
            } else if let Some(value) = line.strip_prefix(FILE_MARKER) {
                output_path = Some(PathBuf::from(value.trim()));
            } else if let Some(caps) = PERCENT.captures(&line) {
                let percent: f32 = caps[1].parse().unwrap_or(0.0);
                request
                    .progress
                    .report(Stage::Downloading, percent, None);
            }
        }

        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                remove_partials(&request.work_dir, &stem).await;
                return Err(HandlerError::Cancelled);
            }
            status = child.wait() => status
                .map_err(|e| HandlerError::retryable(format!("yt-dlp wait failed: {e}")))?,
        };
        let stderr = stderr_task.await.unwrap_or_default();

        if !status.success() {
            remove_partials(&request.work_dir, &stem).await;
            let error = classify_failure(&stderr);
            warn!(job_id = %request.job_id, %status, error = %error, "yt-dlp failed");
            return Err(error);
        }

        let path = output_path.ok_or_else(|| {
            HandlerError::retryable("yt-dlp finished without reporting an output file")
        })?;
        let mut artifact = Artifact::from_path(&path)
            .await
            .map_err(|e| HandlerError::retryable(format!("downloaded file missing: {e}")))?
            .with_metadata("source", self.name.clone());
        artifact.title = title.filter(|t| !t.is_empty() && t != "NA");

        info!(
            job_id = %request.job_id,
            url = %request.source_url,
            size = %artifact.size,
            "yt-dlp download completed"
        );
        Ok(artifact)
    }
}
