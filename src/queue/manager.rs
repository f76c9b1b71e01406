use reqwest::Url;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::fifo::{JobQueue, PushError};
use super::store::{JobEntry, JobStore};
use crate::config::QueueConfig;
use crate::job::{ErrorKind, Job, JobId, JobState, Requester, TransitionError};
use crate::notify::{EventKind, EventRouter, JobEvent, NotificationSink};
use crate::observability::{Metrics, MetricsSnapshot};

const MAX_URL_BYTES: usize = 2048;
const MAX_REQUESTER_BYTES: usize = 256;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is full ({capacity} jobs waiting)")]
    QueueFull { capacity: usize },

    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job {job_id} is already {state}")]
    AlreadyTerminal { job_id: JobId, state: JobState },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("queue is closed")]
    Closed,

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

impl QueueError {
    /// Classification shared with job failures, where one applies
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            QueueError::QueueFull { .. } => Some(ErrorKind::QueueFull),
            QueueError::NotFound(_) => Some(ErrorKind::NotFound),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The job was queued and is now `Cancelled`
    Cancelled,
    /// The job is running; the worker stops at its next checkpoint
    CancelRequested,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub running: u64,
    pub tracked: usize,
    pub max_concurrency: usize,
    pub capacity: Option<usize>,
    pub closed: bool,
    pub counters: MetricsSnapshot,
}

pub(crate) struct Shared {
    pub(crate) store: JobStore,
    pub(crate) queue: JobQueue,
    pub(crate) events: EventRouter,
    pub(crate) settings: QueueConfig,
    pub(crate) metrics: Arc<Metrics>,
}

/// Public face of the job queue: submission, status, cancellation
#[derive(Clone)]
pub struct QueueManager {
    shared: Arc<Shared>,
}

impl QueueManager {
    /// Create the manager and spawn its notification dispatcher
    pub fn new(
        settings: QueueConfig,
        sink: Arc<dyn NotificationSink>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (events, _dispatcher) = EventRouter::spawn(sink);
        let queue = JobQueue::new(settings.queue_capacity.limit());

        info!(
            max_concurrency = settings.max_concurrency,
            capacity = %settings.queue_capacity,
            max_attempts = settings.max_attempts,
            attempt_timeout = %settings.attempt_timeout,
            "Queue manager created"
        );

        Self {
            shared: Arc::new(Shared {
                store: JobStore::new(),
                queue,
                events,
                settings,
                metrics,
            }),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub fn settings(&self) -> &QueueConfig {
        &self.shared.settings
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.shared.metrics
    }

    /// Accept a job, or reject it with `QueueFull` when the queue is at capacity
    ///
    /// With `submit_blocks_on_full` the call waits for space instead.
    pub async fn submit(
        &self,
        source_url: impl Into<String>,
        requester: impl Into<Requester>,
    ) -> Result<JobId> {
        let source_url = source_url.into();
        let requester = requester.into();
        validate_submission(&source_url, &requester)?;

        let shared = &self.shared;
        if shared.queue.is_closed() {
            return Err(QueueError::Closed);
        }

        let job = Job::new(source_url, requester);
        let job_id = job.id;
        let entry = shared.store.insert(job);
        let mut admission = Admission::new(&shared.store, job_id);

        let pushed = if shared.settings.submit_blocks_on_full {
            tokio::select! {
                biased;
                _ = entry.cancel_token().cancelled() => {
                    // Cancelled while waiting for space; the cancel already
                    // made the job terminal and notified
                    admission.complete();
                    info!(job_id = %job_id, "Job cancelled before admission");
                    return Ok(job_id);
                }
                pushed = shared.queue.push(job_id) => pushed,
            }
        } else {
            shared.queue.try_push(job_id)
        };

        match pushed {
            Ok(()) => {
                admission.complete();
                shared.metrics.job_submitted();
                let job = entry.lock();
                if job.state.is_terminal() {
                    // Cancelled between insert and push
                    shared.queue.remove(&job_id);
                    return Ok(job_id);
                }
                info!(
                    job_id = %job_id,
                    requester = %job.requester,
                    source_url = %job.source_url,
                    queued = shared.queue.len(),
                    "Job submitted"
                );
                Ok(job_id)
            }
            Err(PushError::Full) => {
                shared.metrics.job_rejected();
                let capacity = shared.queue.capacity().unwrap_or_default();
                warn!(job_id = %job_id, capacity, "Queue full, submission rejected");
                Err(QueueError::QueueFull { capacity })
            }
            Err(PushError::Closed) => Err(QueueError::Closed),
        }
    }

    /// Consistent snapshot of a tracked job
    pub fn status(&self, job_id: &JobId) -> Result<Job> {
        self.entry(job_id).map(|entry| entry.snapshot())
    }

    /// Cancel a queued job immediately, or request cooperative
    /// cancellation of a running one
    pub fn cancel(&self, job_id: &JobId) -> Result<CancelOutcome> {
        let entry = self.entry(job_id)?;
        let shared = &self.shared;

        let mut job = entry.lock();
        match job.state {
            JobState::Queued => {
                job.cancel()?;
                shared.queue.remove(job_id);
                entry.cancel_token().cancel();
                entry.publish(job.state);
                shared.metrics.job_cancelled();
                shared
                    .events
                    .emit(JobEvent::from_job(&job, EventKind::Cancelled));
                info!(job_id = %job_id, "Queued job cancelled");
                Ok(CancelOutcome::Cancelled)
            }
            JobState::Running => {
                if !job.cancel_requested {
                    job.cancel_requested = true;
                    entry.cancel_token().cancel();
                    info!(job_id = %job_id, attempt = job.attempt_count, "Cancellation requested");
                }
                Ok(CancelOutcome::CancelRequested)
            }
            state => Err(QueueError::AlreadyTerminal {
                job_id: *job_id,
                state,
            }),
        }
    }

    /// Resolve with the final snapshot once the job is terminal
    pub async fn wait(&self, job_id: &JobId) -> Result<Job> {
        let entry = self.entry(job_id)?;
        let mut rx = entry.subscribe();
        rx.wait_for(|state| state.is_terminal())
            .await
            .map_err(|_| QueueError::Closed)?;
        Ok(entry.snapshot())
    }

    /// 1-based position of a queued job; `None` when not waiting in the queue
    pub fn queue_position(&self, job_id: &JobId) -> Option<usize> {
        self.shared.queue.position(job_id)
    }

    pub fn stats(&self) -> QueueStats {
        let shared = &self.shared;
        QueueStats {
            queued: shared.queue.len(),
            running: shared.metrics.running(),
            tracked: shared.store.len(),
            max_concurrency: shared.settings.max_concurrency,
            capacity: shared.queue.capacity(),
            closed: shared.queue.is_closed(),
            counters: shared.metrics.snapshot(),
        }
    }

    /// Wait until every event emitted so far reached the sink
    pub async fn flush_notifications(&self) {
        self.shared.events.flush().await;
    }

    /// Evict terminal jobs older than `ttl`
    pub fn prune_finished(&self, ttl: Duration) -> usize {
        let pruned = self.shared.store.prune_finished(ttl);
        if pruned > 0 {
            debug!(pruned, "Evicted finished jobs");
        }
        pruned
    }

    /// Periodically evict terminal jobs older than `finished_job_ttl`
    pub fn spawn_janitor(&self, every: Duration) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let ttl = manager.settings().finished_job_ttl.as_duration();
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                manager.prune_finished(ttl);
            }
        })
    }

    /// Stop accepting submissions; queued work stays for the workers
    pub fn close(&self) {
        if !self.shared.queue.is_closed() {
            info!(queued = self.shared.queue.len(), "Closing job queue");
        }
        self.shared.queue.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.queue.is_closed()
    }

    /// Cancel every non-terminal job; returns how many were affected
    pub fn cancel_all(&self) -> usize {
        self.shared
            .store
            .entries()
            .iter()
            .filter_map(|entry| {
                let job_id = entry.lock().id;
                self.cancel(&job_id).ok()
            })
            .count()
    }

    fn entry(&self, job_id: &JobId) -> Result<Arc<JobEntry>> {
        self.shared
            .store
            .get(job_id)
            .ok_or(QueueError::NotFound(*job_id))
    }
}

/// Untracks a submitted job unless it made it into the queue
///
/// `submit` can be dropped while waiting for space; the guard keeps the
/// store from holding a `Queued` job that no worker will ever see.
struct Admission<'a> {
    store: &'a JobStore,
    job_id: JobId,
    done: bool,
}

impl<'a> Admission<'a> {
    fn new(store: &'a JobStore, job_id: JobId) -> Self {
        Self {
            store,
            job_id,
            done: false,
        }
    }

    fn complete(&mut self) {
        self.done = true;
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.store.remove(&self.job_id);
            debug!(job_id = %self.job_id, "Job untracked, never admitted to the queue");
        }
    }
}

fn validate_submission(source_url: &str, requester: &Requester) -> Result<()> {
    if source_url.len() > MAX_URL_BYTES {
        return Err(QueueError::InvalidRequest(format!(
            "source_url exceeds {MAX_URL_BYTES} bytes"
        )));
    }
    let url = Url::parse(source_url)
        .map_err(|e| QueueError::InvalidRequest(format!("invalid source_url: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(QueueError::InvalidRequest(format!(
            "unsupported scheme '{}'",
            url.scheme()
        )));
    }

    let requester = requester.as_str();
    if requester.trim().is_empty() {
        return Err(QueueError::InvalidRequest("requester is empty".into()));
    }
    if requester.len() > MAX_REQUESTER_BYTES {
        return Err(QueueError::InvalidRequest(format!(
            "requester exceeds {MAX_REQUESTER_BYTES} bytes"
        )));
    }
    Ok(())
}
