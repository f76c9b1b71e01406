use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use serde_json::json;
use std::sync::Arc;
use tower::ServiceExt; // for `oneshot`

use mediafix::api::models::JobAcceptedResponse;
use mediafix::api::state::AppState;
use mediafix::config::{Config, QueueCapacity};
use mediafix::notify::LogSink;
use mediafix::observability::Metrics;
use mediafix::queue::QueueManager;

/// Builds a test app whose queue has no workers, so jobs stay queued
fn build_test_app(config: Config) -> (Router, QueueManager) {
    let manager = QueueManager::new(
        config.queue.clone(),
        Arc::new(LogSink),
        Arc::new(Metrics::new()),
    );
    let state = AppState::new(config, manager.clone());
    (mediafix::api::router(state), manager)
}

fn default_app() -> Router {
    build_test_app(Config::default()).0
}

/// Helper to build a POST /jobs request
fn post_job_request(payload: serde_json::Value) -> Request<Body> {
    Request::builder()
        .uri("/jobs")
        .method("POST")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_string(&payload).unwrap()))
        .unwrap()
}

fn valid_payload(url: &str) -> serde_json::Value {
    json!({
        "source_url": url,
        "requester": "chat:4242"
    })
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

async fn submit(app: &Router, url: &str) -> JobAcceptedResponse {
    let response = ServiceExt::<Request<Body>>::oneshot(app.clone(), post_job_request(valid_payload(url)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_submit_job_success() {
    let app = default_app();

    let first = submit(&app, "https://youtu.be/dQw4w9WgXcQ").await;
    let second = submit(&app, "https://x.com/user/status/1").await;

    assert_ne!(first.job_id, second.job_id);
    assert_eq!(first.queue_position, Some(1));
    assert_eq!(second.queue_position, Some(2));
    assert_eq!(second.active, 0);
    assert_eq!(second.max_concurrency, 2);
    assert!(second.message.contains("Position: 2"));
}

#[tokio::test]
async fn test_submit_job_invalid_content_type() {
    let request = Request::builder()
        .uri("/jobs")
        .method("POST")
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Body::from(
            serde_json::to_string(&valid_payload("https://youtu.be/abc")).unwrap(),
        ))
        .unwrap();

    let response = default_app().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let error = body_json(response).await;
    assert_eq!(error["code"], "INVALID_PAYLOAD");
}

#[tokio::test]
async fn test_submit_job_missing_content_type() {
    let request = Request::builder()
        .uri("/jobs")
        .method("POST")
        .body(Body::from(
            serde_json::to_string(&valid_payload("https://youtu.be/abc")).unwrap(),
        ))
        .unwrap();

    let response = default_app().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_submit_job_invalid_payload() {
    for payload in [
        json!({ "source_url": "ftp://example.com/a.mp4", "requester": "chat:1" }),
        json!({ "source_url": "https://youtu.be/abc", "requester": "" }),
        json!({ "source_url": "https://youtu.be/abc" }),
    ] {
        let response = default_app().oneshot(post_job_request(payload)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}

#[tokio::test]
async fn test_submit_job_payload_too_large() {
    let mut config = Config::default();
    config.server.max_payload_bytes = mediafix::config::ByteSize(64);
    let (app, _manager) = build_test_app(config);

    let url = format!("https://example.com/{}.mp4", "a".repeat(100));
    let response = app.oneshot(post_job_request(valid_payload(&url))).await.unwrap();

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn test_submit_job_queue_full() {
    let mut config = Config::default();
    config.queue.queue_capacity = QueueCapacity::Bounded(1);
    let (app, _manager) = build_test_app(config);

    submit(&app, "https://youtu.be/one").await;
    let response = app
        .oneshot(post_job_request(valid_payload("https://youtu.be/two")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let error = body_json(response).await;
    assert_eq!(error["code"], "QUEUE_FULL");
}

#[tokio::test]
async fn test_get_job_success() {
    let app = default_app();
    let job = submit(&app, "https://youtu.be/abc").await;

    let get_request = Request::builder()
        .uri(format!("/jobs/{}", job.job_id))
        .method("GET")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(get_request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let snapshot = body_json(response).await;
    assert_eq!(snapshot["id"], job.job_id.to_string());
    assert_eq!(snapshot["state"], "queued");
    assert_eq!(snapshot["attempt_count"], 1);
    assert_eq!(snapshot["requester"], "chat:4242");
    assert_eq!(snapshot["source_url"], "https://youtu.be/abc");
}

#[tokio::test]
async fn test_get_job_not_found() {
    for uri in [
        "/jobs/nonexistent-job-id".to_string(),
        format!("/jobs/{}", mediafix::job::JobId::new()),
    ] {
        let request = Request::builder()
            .uri(uri)
            .method("GET")
            .body(Body::empty())
            .unwrap();
        let response = default_app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}

#[tokio::test]
async fn test_cancel_job() {
    let (app, manager) = build_test_app(Config::default());
    let job = submit(&app, "https://youtu.be/abc").await;

    let cancel = || {
        Request::builder()
            .uri(format!("/jobs/{}", job.job_id))
            .method("DELETE")
            .body(Body::empty())
            .unwrap()
    };

    let response = app.clone().oneshot(cancel()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["outcome"], "cancelled");
    assert_eq!(manager.stats().queued, 0);

    let response = app.oneshot(cancel()).await.unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let error = body_json(response).await;
    assert_eq!(error["code"], "ALREADY_TERMINAL");
}

#[tokio::test]
async fn test_submit_after_close_is_unavailable() {
    let (app, manager) = build_test_app(Config::default());
    manager.close();

    let response = app
        .clone()
        .oneshot(post_job_request(valid_payload("https://youtu.be/abc")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let health = Request::builder()
        .uri("/health")
        .method("GET")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(health).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_stats_endpoint() {
    let app = default_app();
    submit(&app, "https://youtu.be/abc").await;

    let request = Request::builder()
        .uri("/stats")
        .method("GET")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let stats = body_json(response).await;
    assert_eq!(stats["queued"], 1);
    assert_eq!(stats["max_concurrency"], 2);
    assert_eq!(stats["capacity"], 100);
    assert_eq!(stats["counters"]["jobs_submitted"], 1);
}

#[tokio::test]
async fn test_health_endpoint() {
    let request = Request::builder()
        .uri("/health")
        .method("GET")
        .body(Body::empty())
        .unwrap();

    let response = default_app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let health = body_json(response).await;
    assert_eq!(health.get("status").and_then(|v| v.as_str()), Some("healthy"));
    assert!(health.get("version").is_some());

    let components = health.get("components").unwrap().as_object().unwrap();
    assert!(components.contains_key("api"));
    assert!(components.contains_key("queue"));
}
