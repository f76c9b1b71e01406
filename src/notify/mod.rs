//! Lifecycle notifications
//!
//! Transitions are emitted into an [`EventRouter`] while the job lock is
//! held, so each transition produces exactly one event and events of one job
//! reach the sink in transition order. A single dispatcher task drains the
//! router and awaits the [`NotificationSink`]; slow sinks never block workers.

mod format;
mod sinks;

use async_trait::async_trait;
use bon::Builder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::config::NotifyConfig;
use crate::handlers::Artifact;
use crate::job::{Job, JobError, JobId, JobState, Requester};
use crate::progress::Progress;

pub use format::{queued_message, summary};
pub use sinks::{ChannelSink, FanoutSink, LogSink, WebhookSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Started,
    /// Throttled progress update; not a state transition
    Progress,
    Succeeded,
    Failed,
    Cancelled,
}

impl EventKind {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EventKind::Succeeded | EventKind::Failed | EventKind::Cancelled
        )
    }
}

/// Event delivered to the chat transport
#[derive(Debug, Clone, Serialize, Builder)]
pub struct JobEvent {
    pub job_id: JobId,
    pub requester: Requester,
    pub kind: EventKind,
    pub state: JobState,
    pub attempt: u32,
    /// Human-readable summary for the requester
    #[builder(into)]
    pub detail: String,
    #[builder(default = Utc::now())]
    pub at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Artifact>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
}

impl JobEvent {
    /// Event describing the current snapshot of `job`
    pub fn from_job(job: &Job, kind: EventKind) -> Self {
        JobEvent::builder()
            .job_id(job.id)
            .requester(job.requester.clone())
            .kind(kind)
            .state(job.state)
            .attempt(job.attempt_count)
            .detail(summary(job, kind))
            .maybe_progress(job.progress.clone())
            .maybe_result(job.result.clone())
            .maybe_error(job.error.clone())
            .build()
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("sink closed")]
    Closed,
}

/// Destination for lifecycle events
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, event: &JobEvent) -> Result<(), SinkError>;
}

/// Log every event, and forward it to the webhook when one is configured
pub fn sink_from_config(config: &NotifyConfig) -> Result<Arc<dyn NotificationSink>, SinkError> {
    let Some(url) = &config.webhook_url else {
        return Ok(Arc::new(LogSink));
    };

    let webhook = WebhookSink::new(url.clone(), config.webhook_timeout.as_duration())?;
    Ok(Arc::new(FanoutSink::new(vec![
        Arc::new(LogSink),
        Arc::new(webhook),
    ])))
}

enum Dispatch {
    Event(JobEvent),
    Flush(oneshot::Sender<()>),
}

/// Ordered, non-blocking hand-off from job transitions to a sink
#[derive(Clone)]
pub struct EventRouter {
    tx: mpsc::UnboundedSender<Dispatch>,
}

impl EventRouter {
    /// Spawn the dispatcher task. It exits once every router clone is dropped.
    pub fn spawn(sink: Arc<dyn NotificationSink>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Dispatch>();

        let handle = tokio::spawn(async move {
            while let Some(dispatch) = rx.recv().await {
                match dispatch {
                    Dispatch::Event(event) => {
                        if let Err(e) = sink.notify(&event).await {
                            warn!(
                                job_id = %event.job_id,
                                kind = ?event.kind,
                                error = %e,
                                "Notification delivery failed"
                            );
                        }
                    }
                    Dispatch::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });

        (Self { tx }, handle)
    }

    /// Queue an event for delivery; never blocks
    pub fn emit(&self, event: JobEvent) {
        if self.tx.send(Dispatch::Event(event)).is_err() {
            warn!("Notification dispatcher stopped, event dropped");
        }
    }

    /// Resolve once every event emitted before this call was handed to the sink
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Dispatch::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}
