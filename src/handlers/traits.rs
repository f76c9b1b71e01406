use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::types::{Artifact, FetchRequest};

/// Failure classification at the handler boundary
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// Transient failure; the job may be retried
    #[error("retryable: {0}")]
    Retryable(String),
    /// Non-recoverable failure; the job fails immediately
    #[error("fatal: {0}")]
    Fatal(String),
    /// The cancellation token was observed
    #[error("cancelled")]
    Cancelled,
}

impl HandlerError {
    pub fn retryable(message: impl Into<String>) -> Self {
        HandlerError::Retryable(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        HandlerError::Fatal(message.into())
    }
}

/// Source handler capability: fetch one URL into an artifact
///
/// Implementations must check `cancel` at safe checkpoints (between chunks,
/// while waiting on a subprocess) and return [`HandlerError::Cancelled`]
/// once it fires.
#[async_trait]
pub trait SourceHandler: Send + Sync {
    /// Stable name used in logs and job snapshots
    fn name(&self) -> &str;

    async fn fetch(
        &self,
        request: FetchRequest,
        cancel: CancellationToken,
    ) -> Result<Artifact, HandlerError>;
}
