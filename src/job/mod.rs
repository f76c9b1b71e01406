//! The unit of work: immutable request data plus mutable lifecycle state
//!
//! ```text
//! Queued --dequeue--> Running --ok--> Succeeded
//!   |                   |  \--fail--> Failed
//!   |                   |  \--retry-> Queued
//!   \--cancel----> Cancelled <--cooperative cancel--/
//! ```

mod error;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

use crate::handlers::Artifact;
use crate::progress::Progress;

pub use error::{ErrorKind, JobError};

/// Job identifier, generated at submission time (UUID v7, time ordered)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Opaque identifier of the submitting chat or user
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Requester(String);

impl Requester {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Requester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Requester {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Requester {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }

    /// Edges of the lifecycle graph; terminal states have none
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Queued)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid job transition {from} -> {to}")]
pub struct TransitionError {
    pub from: JobState,
    pub to: JobState,
}

/// Job record; clones of it are the snapshots handed out by `status`
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: JobId,
    pub source_url: String,
    pub requester: Requester,
    pub state: JobState,
    /// Attempt in progress (or last made), starting at 1
    pub attempt_count: u32,
    pub result: Option<Artifact>,
    pub error: Option<JobError>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
    pub progress: Option<Progress>,
    /// Name of the handler that served the latest attempt
    pub handler: Option<String>,
}

impl Job {
    pub fn new(source_url: impl Into<String>, requester: Requester) -> Self {
        Self {
            id: JobId::new(),
            source_url: source_url.into(),
            requester,
            state: JobState::Queued,
            attempt_count: 1,
            result: None,
            error: None,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            cancel_requested: false,
            progress: None,
            handler: None,
        }
    }

    fn transition(&mut self, next: JobState) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(TransitionError {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Queued -> Running. Returns true on the first dispatch of the job.
    pub fn start(&mut self) -> Result<bool, TransitionError> {
        self.transition(JobState::Running)?;
        self.progress = None;
        let first = self.started_at.is_none();
        if first {
            self.started_at = Some(Utc::now());
        }
        Ok(first)
    }

    /// Running -> Queued for another attempt
    pub fn requeue(&mut self) -> Result<(), TransitionError> {
        self.transition(JobState::Queued)?;
        self.attempt_count += 1;
        self.progress = None;
        Ok(())
    }

    pub fn succeed(&mut self, artifact: Artifact) -> Result<(), TransitionError> {
        self.transition(JobState::Succeeded)?;
        self.result = Some(artifact);
        self.finish();
        Ok(())
    }

    pub fn fail(&mut self, error: JobError) -> Result<(), TransitionError> {
        self.transition(JobState::Failed)?;
        self.error = Some(error);
        self.finish();
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<(), TransitionError> {
        self.transition(JobState::Cancelled)?;
        self.cancel_requested = true;
        self.finish();
        Ok(())
    }

    fn finish(&mut self) {
        self.progress = None;
        if self.finished_at.is_none() {
            self.finished_at = Some(Utc::now());
        }
    }
}
