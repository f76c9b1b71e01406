//! One executor of the pool and the attempt lifecycle

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::WorkerContext;
use crate::handlers::{Artifact, FetchRequest, HandlerError};
use crate::job::{ErrorKind, JobError, JobId, JobState, TransitionError};
use crate::notify::{EventKind, JobEvent};
use crate::progress::ProgressReporter;
use crate::queue::{JobEntry, Shared};

/// Time a stage gets to clean up after its deadline fired
const CLEANUP_GRACE: Duration = Duration::from_secs(5);

/// Result of one attempt, before it is committed to the job
#[derive(Debug)]
enum Outcome {
    Success { artifact: Artifact, cached: bool },
    Failure(JobError),
    Cancelled,
}

/// What the commit decided
enum Committed {
    Terminal(EventKind),
    Requeued,
}

#[derive(Clone)]
pub(super) struct Worker {
    id: usize,
    shared: Arc<Shared>,
    context: Arc<WorkerContext>,
}

impl Worker {
    pub(super) fn new(id: usize, shared: Arc<Shared>, context: Arc<WorkerContext>) -> Self {
        Self {
            id,
            shared,
            context,
        }
    }

    /// Process jobs until the queue is closed and empty
    pub(super) async fn run(self) {
        debug!(worker_id = self.id, "Worker started");

        while let Some(job_id) = self.shared.queue.pop().await {
            let Some(entry) = self.shared.store.get(&job_id) else {
                debug!(worker_id = self.id, job_id = %job_id, "Dequeued job is no longer tracked");
                continue;
            };
            let Some(attempt) = self.claim(&entry) else {
                continue;
            };

            let running = self.shared.metrics.attempt_started();
            debug!(worker_id = self.id, job_id = %job_id, attempt, running, "Attempt started");

            let outcome = self.contain_attempt(&entry, attempt).await;
            self.commit(&entry, outcome).await;

            self.shared.metrics.attempt_finished();
        }

        debug!(worker_id = self.id, "Worker stopped");
    }

    /// Queued -> Running under the job lock; `None` if the job was cancelled
    /// between dequeue and claim
    fn claim(&self, entry: &JobEntry) -> Option<u32> {
        let mut job = entry.lock();
        if job.state != JobState::Queued {
            debug!(worker_id = self.id, job_id = %job.id, state = %job.state, "Skipping job");
            return None;
        }

        let first = match job.start() {
            Ok(first) => first,
            Err(e) => {
                error!(worker_id = self.id, job_id = %job.id, error = %e, "Failed to start job");
                return None;
            }
        };
        entry.publish(job.state);

        if first {
            self.shared
                .events
                .emit(JobEvent::from_job(&job, EventKind::Started));
            info!(worker_id = self.id, job_id = %job.id, source_url = %job.source_url, "Job started");
        } else {
            info!(worker_id = self.id, job_id = %job.id, attempt = job.attempt_count, "Retrying job");
        }
        Some(job.attempt_count)
    }

    /// Run the attempt on its own task so a panicking handler or
    /// post-processor fails the job instead of killing this executor
    async fn contain_attempt(&self, entry: &Arc<JobEntry>, attempt: u32) -> Outcome {
        let worker = self.clone();
        let task_entry = Arc::clone(entry);
        let attempt_task =
            tokio::spawn(async move { worker.run_attempt(&task_entry, attempt).await });

        match attempt_task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                let job_id = entry.lock().id;
                let message = if e.is_panic() {
                    "handler panicked"
                } else {
                    "attempt aborted"
                };
                error!(worker_id = self.id, job_id = %job_id, attempt, error = %e, "{message}");
                Outcome::Failure(JobError::new(ErrorKind::Fatal, message))
            }
        }
    }

    async fn run_attempt(&self, entry: &Arc<JobEntry>, attempt: u32) -> Outcome {
        let (job_id, source_url) = {
            let job = entry.lock();
            (job.id, job.source_url.clone())
        };
        let job_cancel = entry.cancel_token();
        let settings = &self.shared.settings;

        let handler = match self.context.registry.resolve(&source_url) {
            Ok(handler) => handler,
            Err(e) => return Outcome::Failure(JobError::new(ErrorKind::NotFound, e.to_string())),
        };
        entry.lock().handler = Some(handler.name().to_string());

        if job_cancel.is_cancelled() {
            return Outcome::Cancelled;
        }

        if let Some(cache) = &self.context.cache {
            match cache.get(&source_url) {
                Ok(Some(artifact)) => {
                    info!(job_id = %job_id, path = %artifact.path.display(), "Serving cached artifact");
                    self.shared.metrics.cache_hit();
                    return Outcome::Success {
                        artifact,
                        cached: true,
                    };
                }
                Ok(None) => {}
                Err(e) => warn!(job_id = %job_id, error = %e, "Cache lookup failed"),
            }
        }

        if let Err(e) = tokio::fs::create_dir_all(&self.context.work_dir).await {
            return Outcome::Failure(JobError::new(
                ErrorKind::Retryable,
                format!("cannot create work dir: {e}"),
            ));
        }

        let attempt_cancel = job_cancel.child_token();
        let progress = ProgressReporter::new(
            entry.clone(),
            self.shared.events.clone(),
            settings.progress_interval.as_duration(),
            attempt,
        );
        let request = FetchRequest {
            job_id,
            source_url,
            attempt,
            work_dir: self.context.work_dir.clone(),
            progress: progress.clone(),
        };

        debug!(job_id = %job_id, handler = handler.name(), attempt, "Fetching");
        let fetched = with_deadline(
            handler.fetch(request, attempt_cancel.clone()),
            settings.attempt_timeout.as_duration(),
            &attempt_cancel,
        )
        .await;

        let raw = match fetched {
            None => {
                warn!(job_id = %job_id, attempt, timeout = %settings.attempt_timeout, "Attempt timed out");
                return Outcome::Failure(JobError::new(
                    ErrorKind::Timeout,
                    format!("attempt exceeded {}", settings.attempt_timeout),
                ));
            }
            Some(Ok(artifact)) => artifact,
            Some(Err(e)) => return classify(e, job_cancel, None),
        };

        if job_cancel.is_cancelled() {
            raw.discard().await;
            return Outcome::Cancelled;
        }

        let Some(postprocessor) = &self.context.postprocessor else {
            return Outcome::Success {
                artifact: raw,
                cached: false,
            };
        };

        debug!(job_id = %job_id, stage = postprocessor.name(), "Post-processing");
        let processed = with_deadline(
            postprocessor.process(&raw, progress, attempt_cancel.clone()),
            settings.postprocess_timeout.as_duration(),
            &attempt_cancel,
        )
        .await;

        let artifact = match processed {
            Some(Ok(artifact)) => artifact,
            Some(Err(e)) => {
                raw.discard().await;
                return classify(e, job_cancel, Some(ErrorKind::PostProcessFailed));
            }
            None => {
                raw.discard().await;
                return Outcome::Failure(JobError::new(
                    ErrorKind::PostProcessFailed,
                    format!(
                        "{} exceeded {}",
                        postprocessor.name(),
                        settings.postprocess_timeout
                    ),
                ));
            }
        };

        if artifact.path != raw.path {
            raw.discard().await;
            self.shared.metrics.artifact_postprocessed();
        }

        if job_cancel.is_cancelled() {
            artifact.discard().await;
            return Outcome::Cancelled;
        }

        Outcome::Success {
            artifact,
            cached: false,
        }
    }

    /// Apply the outcome under the job lock. Exactly one terminal event is
    /// emitted per job: a racing `cancel` either got the lock first (and the
    /// job is `Cancelled`) or only set `cancel_requested`, which is honoured here.
    async fn commit(&self, entry: &JobEntry, outcome: Outcome) {
        let mut leftover = None;
        let mut to_cache = None;

        let committed = {
            let mut job = entry.lock();
            let job_id = job.id;

            let committed = match outcome {
                Outcome::Success { artifact, cached } if !job.cancel_requested => {
                    if !cached {
                        to_cache = Some((job.source_url.clone(), artifact.clone()));
                    }
                    job.succeed(artifact)
                        .map(|_| Committed::Terminal(EventKind::Succeeded))
                }
                Outcome::Success { artifact, cached } => {
                    if !cached {
                        leftover = Some(artifact);
                    }
                    job.cancel().map(|_| Committed::Terminal(EventKind::Cancelled))
                }
                Outcome::Cancelled => {
                    job.cancel().map(|_| Committed::Terminal(EventKind::Cancelled))
                }
                Outcome::Failure(_) if job.cancel_requested => {
                    job.cancel().map(|_| Committed::Terminal(EventKind::Cancelled))
                }
                Outcome::Failure(error)
                    if error.kind.is_retryable()
                        && job.attempt_count < self.shared.settings.max_attempts =>
                {
                    warn!(
                        worker_id = self.id,
                        job_id = %job_id,
                        attempt = job.attempt_count,
                        max_attempts = self.shared.settings.max_attempts,
                        kind = %error.kind,
                        error = %error.message,
                        "Attempt failed, requeueing"
                    );
                    job.requeue().map(|_| Committed::Requeued)
                }
                Outcome::Failure(error) => {
                    job.fail(error).map(|_| Committed::Terminal(EventKind::Failed))
                }
            };

            match committed {
                Ok(committed) => {
                    entry.publish(job.state);
                    match committed {
                        Committed::Requeued => {
                            self.shared.queue.push_retry(job_id);
                            self.shared.metrics.job_retried();
                        }
                        Committed::Terminal(kind) => {
                            self.record_terminal(kind);
                            self.shared.events.emit(JobEvent::from_job(&job, kind));
                            info!(
                                worker_id = self.id,
                                job_id = %job_id,
                                state = %job.state,
                                attempts = job.attempt_count,
                                "Job finished"
                            );
                        }
                    }
                    Some(committed)
                }
                Err(e) => {
                    log_transition_error(self.id, job_id, &e);
                    None
                }
            }
        };

        if let Some(artifact) = leftover {
            artifact.discard().await;
        }

        let succeeded = matches!(committed, Some(Committed::Terminal(EventKind::Succeeded)));
        if let (true, Some((url, artifact)), Some(cache)) =
            (succeeded, to_cache, &self.context.cache)
        {
            if let Err(e) = cache.put(&url, &artifact) {
                warn!(source_url = %url, error = %e, "Failed to cache artifact");
            }
        }
    }

    fn record_terminal(&self, kind: EventKind) {
        let metrics = &self.shared.metrics;
        match kind {
            EventKind::Succeeded => metrics.job_succeeded(),
            EventKind::Failed => metrics.job_failed(),
            EventKind::Cancelled => metrics.job_cancelled(),
            EventKind::Started | EventKind::Progress => {}
        }
    }
}

fn log_transition_error(worker_id: usize, job_id: JobId, e: &TransitionError) {
    error!(worker_id, job_id = %job_id, error = %e, "Rejected job transition");
}

/// Map a handler or post-processor error onto the job error kinds
///
/// `Cancelled` only counts as a cancellation when the job itself was
/// cancelled; otherwise the attempt was interrupted and may be retried.
fn classify(
    error: HandlerError,
    job_cancel: &CancellationToken,
    stage_kind: Option<ErrorKind>,
) -> Outcome {
    let (kind, message) = match error {
        HandlerError::Cancelled if job_cancel.is_cancelled() => return Outcome::Cancelled,
        HandlerError::Cancelled => (ErrorKind::Retryable, "attempt interrupted".to_string()),
        HandlerError::Retryable(message) => (ErrorKind::Retryable, message),
        HandlerError::Fatal(message) => (ErrorKind::Fatal, message),
    };
    Outcome::Failure(JobError::new(stage_kind.unwrap_or(kind), message))
}

/// Run a stage with a deadline. On expiry the stage is cancelled and gets
/// [`CLEANUP_GRACE`] to remove its partial output; `None` means it timed out.
async fn with_deadline<F>(
    stage: F,
    limit: Duration,
    cancel: &CancellationToken,
) -> Option<Result<Artifact, HandlerError>>
where
    F: Future<Output = Result<Artifact, HandlerError>>,
{
    tokio::pin!(stage);
    tokio::select! {
        result = &mut stage => Some(result),
        _ = tokio::time::sleep(limit) => {
            cancel.cancel();
            if let Ok(Ok(artifact)) = tokio::time::timeout(CLEANUP_GRACE, stage).await {
                artifact.discard().await;
            }
            None
        }
    }
}
