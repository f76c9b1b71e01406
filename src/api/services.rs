use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use http_body_util::BodyExt;
use std::collections::BTreeMap;

use super::{
    models::{CancelResponse, HealthResponse, JobAcceptedResponse, SubmitRequest},
    state::AppState,
    validation::SubmitValidationError,
};
use crate::api::error::ApiError;
use crate::job::JobId;
use crate::notify::queued_message;

/// Job submission endpoint (POST /jobs)
///
/// ## Flow:
/// 1. Validate Content-Type (gzip bodies are decompressed by middleware)
/// 2. Read the body, enforcing `server.max_payload_bytes`
/// 3. Deserialize and validate the [`SubmitRequest`]
/// 4. Submit to the queue manager; a full queue answers 429 `QUEUE_FULL`
/// 5. Return 202 Accepted with the queue position for the chat reply
pub async fn submit_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Body,
) -> Result<impl IntoResponse, ApiError> {
    let content_type = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::InvalidPayload("missing Content-Type header".into()))?;
    super::utils::parse_content_type(content_type)?;

    let max_size = state.config.server.max_payload_bytes.as_u64() as usize;
    let body_bytes = read_body(body, max_size).await?;

    let request: SubmitRequest = serde_json::from_slice(&body_bytes)?;
    super::validation::validate_submission(&request).map_err(map_validation_error)?;

    let job_id = state
        .manager
        .submit(request.source_url.trim(), request.requester)
        .await?;

    let queue_position = state.manager.queue_position(&job_id);
    let active = state.metrics.running();
    let max_concurrency = state.manager.settings().max_concurrency;

    let response = JobAcceptedResponse {
        job_id,
        queue_position,
        active,
        max_concurrency,
        message: queued_message(queue_position, active, max_concurrency),
    };

    Ok((StatusCode::ACCEPTED, Json(response)))
}

fn map_validation_error(err: SubmitValidationError) -> ApiError {
    ApiError::InvalidPayload(err.to_string())
}

/// Reads the request body and validates its size
///
/// Decompression already happened in `RequestDecompressionLayer`.
async fn read_body(body: axum::body::Body, max_size: usize) -> Result<Vec<u8>, ApiError> {
    let data = body
        .collect()
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?
        .to_bytes()
        .to_vec();

    super::utils::validate_body_size(&data, max_size)?;

    Ok(data)
}

/// Job status endpoint (GET /jobs/{job_id})
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job_id = super::utils::parse_job_id(&job_id)?;
    let job = state.manager.status(&job_id)?;

    Ok((StatusCode::OK, Json(job)))
}

/// Job cancellation endpoint (DELETE /jobs/{job_id})
///
/// Queued jobs are cancelled immediately; running jobs stop at their next
/// checkpoint (`cancel_requested`). Terminal jobs answer 409.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job_id: JobId = super::utils::parse_job_id(&job_id)?;
    let outcome = state.manager.cancel(&job_id)?;

    Ok((StatusCode::OK, Json(CancelResponse { job_id, outcome })))
}

/// Queue statistics endpoint (GET /stats)
pub async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.manager.stats())
}

/// Health check endpoint (GET /health)
///
/// Returns 503 once the queue stopped accepting jobs.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let mut components = BTreeMap::new();
    components.insert("api".to_string(), "healthy".to_string());

    let queue = if state.manager.is_closed() {
        "closed"
    } else {
        "healthy"
    };
    components.insert("queue".to_string(), queue.to_string());

    let all_healthy = components.values().all(|status| status == "healthy");
    let (overall_status, status_code) = if all_healthy {
        ("healthy", StatusCode::OK)
    } else {
        ("unhealthy", StatusCode::SERVICE_UNAVAILABLE)
    };

    let response = HealthResponse {
        status: overall_status.to_string(),
        components,
        version: env!("CARGO_PKG_VERSION").to_string(),
    };

    (status_code, Json(response))
}
