use async_trait::async_trait;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::PostProcessor;
use crate::config::CompressionConfig;
use crate::handlers::{Artifact, HandlerError};
use crate::handlers::types::remove_quietly;
use crate::progress::{ProgressReporter, Stage};

static OUT_TIME: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^out_time_us=(\d+)").unwrap());

/// Inputs of one two-pass encode
struct EncodePlan<'a> {
    input: &'a Path,
    output: &'a Path,
    passlog: &'a Path,
    duration_secs: f64,
    video_kbps: f64,
}

/// Video bitrate (kbps) that keeps `duration_secs` of media under
/// `target_bytes`, after reserving `audio_kbps` for the audio track
pub fn target_video_bitrate_kbps(target_bytes: u64, duration_secs: f64, audio_kbps: u32) -> f64 {
    if duration_secs <= 0.0 {
        return 0.0;
    }
    let total_kbps = (target_bytes as f64 * 8.0 / 1000.0) / duration_secs;
    total_kbps - f64::from(audio_kbps)
}

/// Two-pass libx264/AAC re-encode of artifacts above `max_size`
#[derive(Debug, Clone)]
pub struct FfmpegCompressor {
    config: CompressionConfig,
}

impl FfmpegCompressor {
    pub fn new(config: CompressionConfig) -> Self {
        Self { config }
    }

    fn output_path(input: &Path) -> PathBuf {
        let stem = input
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("output");
        input.with_file_name(format!("{stem}_compressed.mp4"))
    }

    async fn probe_duration(&self, input: &Path) -> Result<f64, HandlerError> {
        let output = Command::new(&self.config.ffprobe)
            .args(["-v", "error", "-show_entries", "format=duration"])
            .args(["-of", "default=noprint_wrappers=1:nokey=1"])
            .arg(input)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| HandlerError::fatal(format!("failed to run ffprobe: {e}")))?;

        if !output.status.success() {
            return Err(HandlerError::fatal(format!(
                "ffprobe failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse::<f64>()
            .map_err(|_| HandlerError::fatal("could not determine media duration"))
    }

    async fn run_pass(
        &self,
        args: Vec<String>,
        duration_secs: f64,
        pass_range: (f32, f32),
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<(), HandlerError> {
        debug!(ffmpeg = %self.config.ffmpeg, ?args, "Running ffmpeg pass");

        let mut child = Command::new(&self.config.ffmpeg)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| HandlerError::fatal(format!("failed to run ffmpeg: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HandlerError::fatal("ffmpeg stdout unavailable"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| HandlerError::fatal("ffmpeg stderr unavailable"))?;
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        let mut lines = BufReader::new(stdout).lines();
        let (start, end) = pass_range;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    return Err(HandlerError::Cancelled);
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if let Some(caps) = OUT_TIME.captures(&line) {
                            let done_us: f64 = caps[1].parse().unwrap_or(0.0);
                            let fraction = (done_us / 1_000_000.0 / duration_secs).clamp(0.0, 1.0) as f32;
                            progress.report(Stage::Compressing, start + (end - start) * fraction, None);
                        }
                    }
                    Ok(None) | Err(_) => break,
                }
            }
        }

        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return Err(HandlerError::Cancelled);
            }
            status = child.wait() => status
                .map_err(|e| HandlerError::fatal(format!("ffmpeg wait failed: {e}")))?,
        };

        if !status.success() {
            let stderr = stderr_task.await.unwrap_or_default();
            let tail: String = stderr.lines().rev().take(5).collect::<Vec<_>>().join(" | ");
            return Err(HandlerError::fatal(format!("ffmpeg exited with {status}: {tail}")));
        }
        Ok(())
    }

    async fn encode(
        &self,
        plan: EncodePlan<'_>,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<(), HandlerError> {
        let input = plan.input.to_string_lossy().into_owned();
        let passlog = plan.passlog.to_string_lossy().into_owned();
        let video_bitrate = format!("{}k", plan.video_kbps as u64);
        let audio_bitrate = format!("{}k", self.config.audio_bitrate_kbps);
        let null_device = if cfg!(windows) { "NUL" } else { "/dev/null" };

        let common = |pass: &str| -> Vec<String> {
            [
                "-y", "-hide_banner", "-nostats", "-progress", "pipe:1",
                "-i", input.as_str(),
                "-c:v", "libx264",
                "-b:v", video_bitrate.as_str(),
                "-pass", pass,
                "-passlogfile", passlog.as_str(),
            ]
            .iter()
            .map(|s| s.to_string())
            .collect()
        };

        let mut pass1 = common("1");
        pass1.extend(["-an", "-f", "null", null_device].map(String::from));
        self.run_pass(pass1, plan.duration_secs, (0.0, 50.0), progress, cancel)
            .await?;

        let mut pass2 = common("2");
        pass2.extend(["-c:a".to_string(), "aac".to_string(), "-b:a".to_string(), audio_bitrate]);
        pass2.push(plan.output.to_string_lossy().into_owned());
        self.run_pass(pass2, plan.duration_secs, (50.0, 100.0), progress, cancel)
            .await
    }
}

#[async_trait]
impl PostProcessor for FfmpegCompressor {
    fn name(&self) -> &str {
        "ffmpeg-compress"
    }

    async fn process(
        &self,
        artifact: &Artifact,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> Result<Artifact, HandlerError> {
        let max_size = self.config.max_size;
        if artifact.size <= max_size {
            debug!(path = %artifact.path.display(), size = %artifact.size, "No compression needed");
            return Ok(artifact.clone());
        }

        let duration = self.probe_duration(&artifact.path).await?;
        if duration <= 0.0 {
            return Err(HandlerError::fatal("invalid media duration"));
        }

        let target_bytes = (max_size.as_u64() as f64 * self.config.target_ratio) as u64;
        let video_kbps =
            target_video_bitrate_kbps(target_bytes, duration, self.config.audio_bitrate_kbps);
        if video_kbps <= 0.0 {
            return Err(HandlerError::fatal(format!(
                "media too long to fit {max_size}: required video bitrate {video_kbps:.0}kbps"
            )));
        }

        info!(
            path = %artifact.path.display(),
            size = %artifact.size,
            duration,
            video_kbps = video_kbps as u64,
            "Compressing artifact"
        );
        progress.report(Stage::Compressing, 0.0, Some(format!("{} → {}", artifact.size, max_size)));

        let output = Self::output_path(&artifact.path);
        let passlog = artifact.path.with_extension("ffmpeg2pass");
        let plan = EncodePlan {
            input: &artifact.path,
            output: &output,
            passlog: &passlog,
            duration_secs: duration,
            video_kbps,
        };
        let result = self.encode(plan, &progress, &cancel).await;

        for suffix in ["-0.log", "-0.log.mbtree"] {
            let mut log = passlog.clone().into_os_string();
            log.push(suffix);
            remove_quietly(Path::new(&log)).await;
        }

        if let Err(e) = result {
            remove_quietly(&output).await;
            return Err(e);
        }

        let compressed = match Artifact::from_path(&output).await {
            Ok(compressed) => compressed,
            Err(e) => {
                return Err(HandlerError::fatal(format!(
                    "compressed output missing: {e}"
                )));
            }
        };
        if compressed.size > max_size {
            warn!(
                size = %compressed.size,
                max = %max_size,
                "Compressed artifact still above target"
            );
        }

        let mut result = compressed.with_metadata("original_size", artifact.size.to_string());
        result.title = artifact.title.clone();
        for (key, value) in &artifact.metadata {
            result.metadata.entry(key.clone()).or_insert_with(|| value.clone());
        }
        Ok(result)
    }
}
