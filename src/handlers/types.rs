use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::humanize::ByteSize;
use crate::job::JobId;
use crate::progress::ProgressReporter;

/// Input of a single fetch attempt
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub job_id: JobId,
    pub source_url: String,
    pub attempt: u32,
    /// Directory the handler writes its output into
    pub work_dir: PathBuf,
    pub progress: ProgressReporter,
}

impl FetchRequest {
    /// File stem unique to this job attempt
    pub fn output_stem(&self) -> String {
        format!("{}-{}", self.job_id, self.attempt)
    }
}

/// File produced by a handler or post-processor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub path: PathBuf,
    pub size: ByteSize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl Artifact {
    pub fn new(path: impl Into<PathBuf>, size: ByteSize) -> Self {
        Self {
            path: path.into(),
            size,
            title: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Build an artifact from a file on disk, reading its size
    pub async fn from_path(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let meta = tokio::fs::metadata(&path).await?;
        Ok(Self::new(path, ByteSize(meta.len())))
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|name| name.to_str())
    }

    /// Remove the artifact file. A missing file is not an error.
    pub async fn discard(&self) {
        remove_quietly(&self.path).await;
    }
}

pub(crate) async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove file"),
    }
}
