//! Optional stage run on a downloaded artifact before the job succeeds

mod compress;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::handlers::{Artifact, HandlerError};
use crate::progress::ProgressReporter;

pub use compress::{FfmpegCompressor, target_video_bitrate_kbps};

/// Same contract shape as a source handler: artifact in, artifact out
///
/// Returning the input artifact unchanged is allowed. When a new file is
/// produced the caller removes the input.
#[async_trait]
pub trait PostProcessor: Send + Sync {
    fn name(&self) -> &str;

    async fn process(
        &self,
        artifact: &Artifact,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> Result<Artifact, HandlerError>;
}
