//! Request and response bodies of the HTTP transport
//!
//! `POST /jobs` accepts a [`SubmitRequest`]:
//!
//! ```json
//! {
//!   "source_url": "https://youtu.be/dQw4w9WgXcQ",
//!   "requester": "chat:4242"
//! }
//! ```
//!
//! and answers `202 Accepted` with a [`JobAcceptedResponse`] carrying the
//! queue position the chat bot relays to the user. Job snapshots are the
//! serialized [`Job`](crate::job::Job) itself.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::job::JobId;
use crate::queue::CancelOutcome;

#[derive(Debug, Deserialize, Clone)]
pub struct SubmitRequest {
    pub source_url: String,
    pub requester: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct JobAcceptedResponse {
    pub job_id: JobId,
    /// 1-based; absent when a worker already picked the job up
    pub queue_position: Option<usize>,
    pub active: u64,
    pub max_concurrency: usize,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub job_id: JobId,
    pub outcome: CancelOutcome,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub components: BTreeMap<String, String>,
    pub version: String,
}
