//! Worker pool
//!
//! `max_concurrency` executors share the queue of one [`QueueManager`]. Each
//! executor pops a job id, claims the job under its lock, runs one attempt
//! (fetch, optional post-processing) without holding any lock, then commits
//! the outcome under the lock again. The executor count is the only bound on
//! running jobs.

mod runner;

use bon::Builder;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cache::{ArtifactCache, CacheError};
use crate::config::Config;
use crate::handlers::{HandlerRegistry, RegistryError};
use crate::postprocess::{FfmpegCompressor, PostProcessor};
use crate::queue::QueueManager;

use runner::Worker;

/// What happens to outstanding work on shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Finish every queued and running job
    Drain,
    /// Cancel queued jobs and request cancellation of running ones
    Abort,
}

/// Collaborators shared by every executor
#[derive(Builder)]
pub struct WorkerContext {
    registry: Arc<HandlerRegistry>,
    postprocessor: Option<Arc<dyn PostProcessor>>,
    cache: Option<ArtifactCache>,
    /// Directory handlers write into
    #[builder(into)]
    work_dir: PathBuf,
}

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("handler registry: {0}")]
    Registry(#[from] RegistryError),

    #[error("artifact cache: {0}")]
    Cache(#[from] CacheError),
}

impl WorkerContext {
    /// Handlers from `sources` (builtin set when empty), the ffmpeg stage when
    /// compression is enabled and the fjall cache when caching is enabled
    pub fn from_config(config: &Config) -> Result<Self, SetupError> {
        let registry = HandlerRegistry::from_sources(&config.effective_sources())?;

        let postprocessor: Option<Arc<dyn PostProcessor>> = config
            .compression
            .enabled
            .then(|| Arc::new(FfmpegCompressor::new(config.compression.clone())) as _);

        let cache = if config.cache.enabled {
            let ttl = Duration::from_secs(u64::from(config.cache.ttl_days) * 86_400);
            Some(ArtifactCache::open(&config.cache.path, ttl)?)
        } else {
            None
        };

        Ok(Self::builder()
            .registry(Arc::new(registry))
            .maybe_postprocessor(postprocessor)
            .maybe_cache(cache)
            .work_dir(config.work_dir.clone())
            .build())
    }

    pub fn cache(&self) -> Option<&ArtifactCache> {
        self.cache.as_ref()
    }
}

pub struct WorkerPool {
    manager: QueueManager,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `max_concurrency` executors on the current runtime
    pub fn spawn(manager: &QueueManager, context: WorkerContext) -> Self {
        let context = Arc::new(context);
        let size = manager.settings().max_concurrency;

        let workers = (0..size)
            .map(|id| {
                let worker = Worker::new(id, manager.shared().clone(), context.clone());
                tokio::spawn(worker.run())
            })
            .collect();

        info!(
            workers = size,
            handlers = ?context.registry.handler_names(),
            postprocessor = ?context.postprocessor.as_ref().map(|p| p.name()),
            cache = context.cache.is_some(),
            "Worker pool started"
        );

        Self {
            manager: manager.clone(),
            workers,
        }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Close the queue, wait for every executor to exit and flush notifications
    pub async fn shutdown(self, mode: ShutdownMode) {
        info!(?mode, "Shutting down worker pool");
        self.manager.close();
        if mode == ShutdownMode::Abort {
            let cancelled = self.manager.cancel_all();
            info!(cancelled, "Cancelled outstanding jobs");
        }

        for (id, handle) in self.workers.into_iter().enumerate() {
            if let Err(e) = handle.await {
                warn!(worker_id = id, error = %e, "Worker task ended abnormally");
            }
        }

        self.manager.flush_notifications().await;
        info!("Worker pool stopped");
    }
}
