use crate::humanize::{ByteSize, HumanDuration};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

/// Top-level configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Directory handlers write artifacts into
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    /// Ordered source handlers; array order is match precedence
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub compression: CompressionConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            server: ServerConfig::default(),
            queue: QueueConfig::default(),
            sources: Vec::new(),
            compression: CompressionConfig::default(),
            cache: CacheConfig::default(),
            notify: NotifyConfig::default(),
        }
    }
}

impl Config {
    /// Configured sources, or the built-in set when none are configured
    pub fn effective_sources(&self) -> Vec<SourceConfig> {
        if self.sources.is_empty() {
            SourceConfig::builtin()
        } else {
            self.sources.clone()
        }
    }
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("data/work")
}

/// HTTP transport configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: ByteSize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            max_payload_bytes: default_max_payload_bytes(),
        }
    }
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8080)
}

fn default_max_payload_bytes() -> ByteSize {
    ByteSize::kib(64)
}

/// Queue capacity: a fixed bound or unbounded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueCapacity {
    Bounded(usize),
    Unbounded,
}

impl QueueCapacity {
    pub fn limit(self) -> Option<usize> {
        match self {
            QueueCapacity::Bounded(n) => Some(n),
            QueueCapacity::Unbounded => None,
        }
    }
}

impl Default for QueueCapacity {
    fn default() -> Self {
        QueueCapacity::Bounded(100)
    }
}

impl fmt::Display for QueueCapacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueCapacity::Bounded(n) => write!(f, "{n}"),
            QueueCapacity::Unbounded => f.write_str("unbounded"),
        }
    }
}

impl Serialize for QueueCapacity {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            QueueCapacity::Bounded(n) => serializer.serialize_u64(*n as u64),
            QueueCapacity::Unbounded => serializer.serialize_str("unbounded"),
        }
    }
}

impl<'de> Deserialize<'de> for QueueCapacity {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct CapacityVisitor;

        impl serde::de::Visitor<'_> for CapacityVisitor {
            type Value = QueueCapacity;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a queue capacity as integer or \"unbounded\"")
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                usize::try_from(v)
                    .map(QueueCapacity::Bounded)
                    .map_err(|_| E::custom(format!("queue capacity too large: {v}")))
            }

            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                usize::try_from(v)
                    .map(QueueCapacity::Bounded)
                    .map_err(|_| E::custom(format!("queue capacity must not be negative: {v}")))
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                let v = v.trim();
                if v.eq_ignore_ascii_case("unbounded") {
                    return Ok(QueueCapacity::Unbounded);
                }
                v.parse::<usize>()
                    .map(QueueCapacity::Bounded)
                    .map_err(|_| E::custom(format!("invalid queue capacity: {v}")))
            }
        }

        deserializer.deserialize_any(CapacityVisitor)
    }
}

/// Queue and worker pool settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default)]
    pub queue_capacity: QueueCapacity,
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout: HumanDuration,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Wait for space instead of failing with QueueFull
    #[serde(default)]
    pub submit_blocks_on_full: bool,
    #[serde(default = "default_postprocess_timeout")]
    pub postprocess_timeout: HumanDuration,
    /// Minimum interval between progress events of one job
    #[serde(default = "default_progress_interval")]
    pub progress_interval: HumanDuration,
    /// How long terminal jobs stay queryable
    #[serde(default = "default_finished_job_ttl")]
    pub finished_job_ttl: HumanDuration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            queue_capacity: QueueCapacity::default(),
            attempt_timeout: default_attempt_timeout(),
            max_attempts: default_max_attempts(),
            submit_blocks_on_full: false,
            postprocess_timeout: default_postprocess_timeout(),
            progress_interval: default_progress_interval(),
            finished_job_ttl: default_finished_job_ttl(),
        }
    }
}

fn default_max_concurrency() -> usize {
    2
}

fn default_attempt_timeout() -> HumanDuration {
    HumanDuration::secs(600)
}

fn default_max_attempts() -> u32 {
    3
}

fn default_postprocess_timeout() -> HumanDuration {
    HumanDuration::secs(600)
}

fn default_progress_interval() -> HumanDuration {
    HumanDuration::millis(2500)
}

fn default_finished_job_ttl() -> HumanDuration {
    HumanDuration::secs(3600)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Direct media links streamed over HTTP
    Http,
    /// Sites handled by the yt-dlp binary
    Ytdlp,
}

/// One entry of the source handler registry
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    pub name: String,
    pub kind: SourceKind,
    /// Regexes matched against the full URL
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patterns: Vec<String>,
    /// Host names, subdomains included
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<String>,
    /// File extensions of the URL path, without the dot
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extensions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookies_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_size: Option<ByteSize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout: Option<HumanDuration>,
}

impl SourceConfig {
    pub fn new(name: impl Into<String>, kind: SourceKind) -> Self {
        Self {
            name: name.into(),
            kind,
            patterns: Vec::new(),
            hosts: Vec::new(),
            extensions: Vec::new(),
            binary: None,
            format: None,
            cookies_file: None,
            user_agent: None,
            max_size: None,
            connect_timeout: None,
        }
    }

    pub fn has_matcher(&self) -> bool {
        !(self.patterns.is_empty() && self.hosts.is_empty() && self.extensions.is_empty())
    }

    /// YouTube and Twitter/X through yt-dlp, then direct media links
    pub fn builtin() -> Vec<SourceConfig> {
        let mut youtube = SourceConfig::new("youtube", SourceKind::Ytdlp);
        youtube.patterns = vec![
            r"^https?://(www\.|m\.)?youtube\.com/(watch\?v=|shorts/)[\w-]+".to_string(),
            r"^https?://youtu\.be/[\w-]+".to_string(),
        ];
        youtube.cookies_file = Some(PathBuf::from("cookies.txt"));

        let mut twitter = SourceConfig::new("twitter", SourceKind::Ytdlp);
        twitter.patterns = vec![
            r"^https?://(www\.|mobile\.)?(twitter|x)\.com/\w+/status/\d+".to_string(),
            r"^https?://(www\.)?(twitter|x)\.com/i/videos/\d+".to_string(),
            r"^https?://t\.co/\w+".to_string(),
        ];
        twitter.user_agent = Some("TwitterBot/1.0".to_string());

        let mut direct = SourceConfig::new("direct", SourceKind::Http);
        direct.extensions = ["mp4", "webm", "mkv", "mov", "m4a", "mp3", "gif", "jpg", "jpeg", "png"]
            .into_iter()
            .map(String::from)
            .collect();

        vec![youtube, twitter, direct]
    }
}

/// Compression post-processing stage
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CompressionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Artifacts above this size are re-encoded
    #[serde(default = "default_compression_max_size")]
    pub max_size: ByteSize,
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: String,
    #[serde(default = "default_ffprobe")]
    pub ffprobe: String,
    #[serde(default = "default_audio_bitrate_kbps")]
    pub audio_bitrate_kbps: u32,
    /// Fraction of `max_size` targeted by the encoder
    #[serde(default = "default_target_ratio")]
    pub target_ratio: f64,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: default_compression_max_size(),
            ffmpeg: default_ffmpeg(),
            ffprobe: default_ffprobe(),
            audio_bitrate_kbps: default_audio_bitrate_kbps(),
            target_ratio: default_target_ratio(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_compression_max_size() -> ByteSize {
    ByteSize(49 * 1024 * 1024 + 512 * 1024)
}

fn default_ffmpeg() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe() -> String {
    "ffprobe".to_string()
}

fn default_audio_bitrate_kbps() -> u32 {
    128
}

fn default_target_ratio() -> f64 {
    0.95
}

/// Artifact cache keyed by source URL
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_cache_path")]
    pub path: PathBuf,
    #[serde(default = "default_cache_ttl_days")]
    pub ttl_days: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_cache_path(),
            ttl_days: default_cache_ttl_days(),
        }
    }
}

fn default_cache_path() -> PathBuf {
    PathBuf::from("data/cache")
}

fn default_cache_ttl_days() -> u32 {
    30
}

/// Outbound lifecycle notifications
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NotifyConfig {
    /// Chat-transport bridge receiving every event as JSON
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    #[serde(default = "default_webhook_timeout")]
    pub webhook_timeout: HumanDuration,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            webhook_timeout: default_webhook_timeout(),
        }
    }
}

fn default_webhook_timeout() -> HumanDuration {
    HumanDuration::secs(10)
}
