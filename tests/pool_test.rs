use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{Notify, mpsc::UnboundedReceiver};
use tokio_util::sync::CancellationToken;

use mediafix::cache::ArtifactCache;
use mediafix::config::{QueueCapacity, QueueConfig};
use mediafix::handlers::{
    Artifact, FetchRequest, HandlerError, HandlerRegistry, SourceHandler, SourceMatcher,
};
use mediafix::humanize::HumanDuration;
use mediafix::job::{ErrorKind, JobId, JobState};
use mediafix::notify::{ChannelSink, EventKind, JobEvent};
use mediafix::observability::Metrics;
use mediafix::postprocess::PostProcessor;
use mediafix::progress::{ProgressReporter, Stage};
use mediafix::queue::{CancelOutcome, QueueError, QueueManager};
use mediafix::worker::{ShutdownMode, WorkerContext, WorkerPool};

const WAIT_LIMIT: Duration = Duration::from_secs(10);

/// Writes a small file after an optional delay, tracking concurrency
#[derive(Default)]
struct WritingHandler {
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    order: Mutex<Vec<String>>,
}

impl WritingHandler {
    fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }
}

async fn write_output(request: &FetchRequest) -> Result<Artifact, HandlerError> {
    let path = request
        .work_dir
        .join(format!("{}.bin", request.output_stem()));
    tokio::fs::write(&path, b"media bytes")
        .await
        .map_err(|e| HandlerError::retryable(e.to_string()))?;
    Artifact::from_path(path)
        .await
        .map_err(|e| HandlerError::retryable(e.to_string()))
}

#[async_trait]
impl SourceHandler for WritingHandler {
    fn name(&self) -> &str {
        "writing"
    }

    async fn fetch(
        &self,
        request: FetchRequest,
        _cancel: CancellationToken,
    ) -> Result<Artifact, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.order.lock().unwrap().push(request.source_url.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        request.progress.report(Stage::Downloading, 50.0, None);
        tokio::time::sleep(self.delay).await;
        let result = write_output(&request).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Fails every attempt with the given error
struct FailingHandler {
    error: HandlerError,
    calls: AtomicUsize,
}

impl FailingHandler {
    fn new(error: HandlerError) -> Self {
        Self {
            error,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SourceHandler for FailingHandler {
    fn name(&self) -> &str {
        "failing"
    }

    async fn fetch(
        &self,
        _request: FetchRequest,
        _cancel: CancellationToken,
    ) -> Result<Artifact, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(self.error.clone())
    }
}

/// Blocks until cancelled, or until the gate opens and then succeeds
/// without looking at the token again
#[derive(Default)]
struct GatedHandler {
    gate: Notify,
    honour_cancel: bool,
}

#[async_trait]
impl SourceHandler for GatedHandler {
    fn name(&self) -> &str {
        "gated"
    }

    async fn fetch(
        &self,
        request: FetchRequest,
        cancel: CancellationToken,
    ) -> Result<Artifact, HandlerError> {
        if self.honour_cancel {
            tokio::select! {
                _ = cancel.cancelled() => return Err(HandlerError::Cancelled),
                _ = self.gate.notified() => {}
            }
        } else {
            self.gate.notified().await;
        }
        write_output(&request).await
    }
}

/// Never finishes on its own; only the attempt deadline stops it
struct StallingHandler;

#[async_trait]
impl SourceHandler for StallingHandler {
    fn name(&self) -> &str {
        "stalling"
    }

    async fn fetch(
        &self,
        _request: FetchRequest,
        cancel: CancellationToken,
    ) -> Result<Artifact, HandlerError> {
        cancel.cancelled().await;
        Err(HandlerError::Cancelled)
    }
}

/// Panics on URLs containing "boom", otherwise writes a file
struct PanickingHandler;

#[async_trait]
impl SourceHandler for PanickingHandler {
    fn name(&self) -> &str {
        "panicking"
    }

    async fn fetch(
        &self,
        request: FetchRequest,
        _cancel: CancellationToken,
    ) -> Result<Artifact, HandlerError> {
        if request.source_url.contains("boom") {
            panic!("handler bug on {}", request.source_url);
        }
        write_output(&request).await
    }
}

enum StageBehaviour {
    Fail,
    Replace,
    Panic,
}

struct TestStage(StageBehaviour);

#[async_trait]
impl PostProcessor for TestStage {
    fn name(&self) -> &str {
        "test-stage"
    }

    async fn process(
        &self,
        artifact: &Artifact,
        _progress: ProgressReporter,
        _cancel: CancellationToken,
    ) -> Result<Artifact, HandlerError> {
        match self.0 {
            StageBehaviour::Fail => Err(HandlerError::fatal("encoder exploded")),
            StageBehaviour::Panic => panic!("encoder bug"),
            StageBehaviour::Replace => {
                let output = artifact.path.with_extension("small.mp4");
                tokio::fs::write(&output, b"small")
                    .await
                    .map_err(|e| HandlerError::fatal(e.to_string()))?;
                Artifact::from_path(output)
                    .await
                    .map_err(|e| HandlerError::fatal(e.to_string()))
            }
        }
    }
}

struct Harness {
    manager: QueueManager,
    events: UnboundedReceiver<JobEvent>,
    metrics: Arc<Metrics>,
    work_dir: TempDir,
}

impl Harness {
    fn new(settings: QueueConfig) -> Self {
        let (sink, events) = ChannelSink::new();
        let metrics = Arc::new(Metrics::new());
        let manager = QueueManager::new(settings, Arc::new(sink), metrics.clone());
        Self {
            manager,
            events,
            metrics,
            work_dir: TempDir::new().unwrap(),
        }
    }

    fn context(
        &self,
        handler: Arc<dyn SourceHandler>,
        postprocessor: Option<Arc<dyn PostProcessor>>,
        cache: Option<ArtifactCache>,
    ) -> WorkerContext {
        let mut registry = HandlerRegistry::new();
        registry.register(SourceMatcher::any(), handler);
        WorkerContext::builder()
            .registry(Arc::new(registry))
            .maybe_postprocessor(postprocessor)
            .maybe_cache(cache)
            .work_dir(self.work_dir.path().join("work"))
            .build()
    }

    fn spawn(&self, handler: Arc<dyn SourceHandler>) -> WorkerPool {
        WorkerPool::spawn(&self.manager, self.context(handler, None, None))
    }

    async fn submit(&self, url: &str) -> JobId {
        self.manager.submit(url, "chat:1").await.unwrap()
    }

    async fn wait(&self, job_id: &JobId) -> mediafix::job::Job {
        tokio::time::timeout(WAIT_LIMIT, self.manager.wait(job_id))
            .await
            .expect("job did not finish in time")
            .unwrap()
    }

    async fn wait_running(&self, job_id: &JobId) {
        tokio::time::timeout(WAIT_LIMIT, async {
            while self.manager.status(job_id).unwrap().state != JobState::Running {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("job never started");
    }

    /// Every event delivered so far
    async fn drain_events(&mut self) -> Vec<JobEvent> {
        self.manager.flush_notifications().await;
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

fn settings(max_concurrency: usize) -> QueueConfig {
    QueueConfig {
        max_concurrency,
        queue_capacity: QueueCapacity::Unbounded,
        progress_interval: HumanDuration::millis(0),
        ..QueueConfig::default()
    }
}

fn kinds_for(events: &[JobEvent], job_id: JobId) -> Vec<EventKind> {
    events
        .iter()
        .filter(|e| e.job_id == job_id && e.kind != EventKind::Progress)
        .map(|e| e.kind)
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pool_never_runs_more_than_max_concurrency() {
    let mut harness = Harness::new(settings(2));
    let handler = Arc::new(WritingHandler::with_delay(Duration::from_millis(100)));
    let pool = harness.spawn(handler.clone());

    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(harness.submit(&format!("https://example.com/{i}.mp4")).await);
    }
    for id in &ids {
        let job = harness.wait(id).await;
        assert_eq!(job.state, JobState::Succeeded);
        assert_eq!(job.attempt_count, 1);
        assert!(job.result.unwrap().path.exists());
    }

    assert_eq!(handler.max_in_flight.load(Ordering::SeqCst), 2);
    assert_eq!(harness.metrics.peak_running(), 2);
    assert_eq!(harness.manager.stats().queued, 0);

    let events = harness.drain_events().await;
    for id in &ids {
        assert_eq!(
            kinds_for(&events, *id),
            vec![EventKind::Started, EventKind::Succeeded]
        );
    }
    pool.shutdown(ShutdownMode::Drain).await;
}

#[tokio::test]
async fn single_worker_dequeues_in_fifo_order() {
    let harness = Harness::new(settings(1));
    let handler = Arc::new(WritingHandler::with_delay(Duration::from_millis(5)));

    // Queue everything before the worker exists
    let mut ids = Vec::new();
    let urls: Vec<String> = (0..4).map(|i| format!("https://example.com/{i}.mp4")).collect();
    for url in &urls {
        ids.push(harness.submit(url).await);
    }
    let pool = harness.spawn(handler.clone());
    for id in &ids {
        harness.wait(id).await;
    }

    assert_eq!(*handler.order.lock().unwrap(), urls);
    pool.shutdown(ShutdownMode::Drain).await;
}

#[tokio::test]
async fn retryable_failures_exhaust_attempts() {
    let mut harness = Harness::new(QueueConfig {
        max_attempts: 3,
        ..settings(1)
    });
    let handler = Arc::new(FailingHandler::new(HandlerError::retryable("HTTP 503")));
    let pool = harness.spawn(handler.clone());

    let id = harness.submit("https://example.com/a.mp4").await;
    let job = harness.wait(&id).await;

    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempt_count, 3);
    assert_eq!(job.error.as_ref().unwrap().kind, ErrorKind::Retryable);
    assert!(job.finished_at.is_some());
    assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    assert_eq!(harness.metrics.snapshot().retries, 2);

    let events = harness.drain_events().await;
    assert_eq!(
        kinds_for(&events, id),
        vec![EventKind::Started, EventKind::Failed]
    );
    pool.shutdown(ShutdownMode::Drain).await;
}

#[tokio::test]
async fn fatal_failure_is_not_retried() {
    let harness = Harness::new(settings(1));
    let handler = Arc::new(FailingHandler::new(HandlerError::fatal("video is private")));
    let pool = harness.spawn(handler.clone());

    let id = harness.submit("https://example.com/a.mp4").await;
    let job = harness.wait(&id).await;

    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempt_count, 1);
    assert_eq!(job.error.unwrap().kind, ErrorKind::Fatal);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    pool.shutdown(ShutdownMode::Drain).await;
}

#[tokio::test]
async fn unmatched_url_fails_with_not_found() {
    let harness = Harness::new(settings(1));
    let context = WorkerContext::builder()
        .registry(Arc::new(HandlerRegistry::new()))
        .work_dir(harness.work_dir.path())
        .build();
    let pool = WorkerPool::spawn(&harness.manager, context);

    let id = harness.submit("https://example.com/page.html").await;
    let job = harness.wait(&id).await;

    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.error.unwrap().kind, ErrorKind::NotFound);
    pool.shutdown(ShutdownMode::Drain).await;
}

#[tokio::test]
async fn full_queue_rejects_submission_immediately() {
    let harness = Harness::new(QueueConfig {
        queue_capacity: QueueCapacity::Bounded(1),
        submit_blocks_on_full: false,
        ..settings(1)
    });

    harness.submit("https://example.com/a.mp4").await;
    let err = harness
        .manager
        .submit("https://example.com/b.mp4", "chat:1")
        .await
        .unwrap_err();

    assert!(matches!(err, QueueError::QueueFull { capacity: 1 }));
    assert_eq!(harness.metrics.snapshot().jobs_rejected, 1);
}

#[tokio::test]
async fn panicking_handler_fails_job_and_worker_keeps_going() {
    let mut harness = Harness::new(settings(1));
    let pool = harness.spawn(Arc::new(PanickingHandler));

    let bad = harness.submit("https://example.com/boom.mp4").await;
    let good = harness.submit("https://example.com/ok.mp4").await;

    let job = harness.wait(&bad).await;
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempt_count, 1);
    let error = job.error.unwrap();
    assert_eq!(error.kind, ErrorKind::Fatal);
    assert!(error.message.contains("panicked"));

    let job = harness.wait(&good).await;
    assert_eq!(job.state, JobState::Succeeded);
    assert_eq!(pool.size(), 1);

    pool.shutdown(ShutdownMode::Drain).await;
    assert_eq!(harness.metrics.running(), 0);
    let events = harness.drain_events().await;
    assert_eq!(kinds_for(&events, bad), vec![EventKind::Started, EventKind::Failed]);
    assert_eq!(kinds_for(&events, good), vec![EventKind::Started, EventKind::Succeeded]);
}

#[tokio::test]
async fn panicking_postprocessor_fails_job() {
    let harness = Harness::new(settings(1));
    let context = harness.context(
        Arc::new(WritingHandler::default()),
        Some(Arc::new(TestStage(StageBehaviour::Panic))),
        None,
    );
    let pool = WorkerPool::spawn(&harness.manager, context);

    let first = harness.submit("https://example.com/a.mp4").await;
    let second = harness.submit("https://example.com/b.mp4").await;

    for id in [first, second] {
        let job = harness.wait(&id).await;
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.error.unwrap().kind, ErrorKind::Fatal);
    }
    pool.shutdown(ShutdownMode::Drain).await;
    assert_eq!(harness.metrics.running(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blocked_submit_is_admitted_when_worker_frees_space() {
    let harness = Harness::new(QueueConfig {
        queue_capacity: QueueCapacity::Bounded(1),
        submit_blocks_on_full: true,
        ..settings(1)
    });
    let handler = Arc::new(GatedHandler {
        honour_cancel: true,
        ..GatedHandler::default()
    });
    let pool = harness.spawn(handler.clone());

    let running = harness.submit("https://example.com/a.mp4").await;
    harness.wait_running(&running).await;
    let queued = harness.submit("https://example.com/b.mp4").await;

    let submitter = harness.manager.clone();
    let blocked = tokio::spawn(async move {
        submitter.submit("https://example.com/c.mp4", "chat:1").await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!blocked.is_finished());
    assert_eq!(harness.manager.stats().queued, 1);

    handler.gate.notify_one();
    let admitted = tokio::time::timeout(WAIT_LIMIT, blocked)
        .await
        .expect("submit stayed blocked")
        .unwrap()
        .unwrap();

    assert_eq!(harness.wait(&running).await.state, JobState::Succeeded);
    harness.wait_running(&queued).await;
    assert_eq!(harness.manager.queue_position(&admitted), Some(1));

    pool.shutdown(ShutdownMode::Abort).await;
    assert_eq!(harness.wait(&queued).await.state, JobState::Cancelled);
    assert_eq!(harness.wait(&admitted).await.state, JobState::Cancelled);
}

#[tokio::test]
async fn timeouts_count_as_attempts() {
    let mut harness = Harness::new(QueueConfig {
        attempt_timeout: HumanDuration::millis(50),
        max_attempts: 2,
        ..settings(1)
    });
    let pool = harness.spawn(Arc::new(StallingHandler));

    let id = harness.submit("https://example.com/a.mp4").await;
    let job = harness.wait(&id).await;

    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempt_count, 2);
    assert_eq!(job.error.unwrap().kind, ErrorKind::Timeout);

    let events = harness.drain_events().await;
    assert_eq!(
        kinds_for(&events, id),
        vec![EventKind::Started, EventKind::Failed]
    );
    pool.shutdown(ShutdownMode::Drain).await;
}

#[tokio::test]
async fn cancelling_queued_and_running_jobs() {
    let mut harness = Harness::new(settings(1));
    let handler = Arc::new(GatedHandler {
        honour_cancel: true,
        ..GatedHandler::default()
    });
    let pool = harness.spawn(handler.clone());

    let running = harness.submit("https://example.com/a.mp4").await;
    harness.wait_running(&running).await;
    let queued = harness.submit("https://example.com/b.mp4").await;

    assert_eq!(
        harness.manager.cancel(&queued).unwrap(),
        CancelOutcome::Cancelled
    );
    assert_eq!(
        harness.manager.status(&queued).unwrap().state,
        JobState::Cancelled
    );
    assert_eq!(
        harness.manager.cancel(&running).unwrap(),
        CancelOutcome::CancelRequested
    );

    let job = harness.wait(&running).await;
    assert_eq!(job.state, JobState::Cancelled);
    assert!(job.cancel_requested);
    assert!(matches!(
        harness.manager.cancel(&running),
        Err(QueueError::AlreadyTerminal { .. })
    ));

    let events = harness.drain_events().await;
    assert_eq!(kinds_for(&events, queued), vec![EventKind::Cancelled]);
    assert_eq!(
        kinds_for(&events, running),
        vec![EventKind::Started, EventKind::Cancelled]
    );
    assert!(harness.manager.status(&queued).unwrap().started_at.is_none());
    pool.shutdown(ShutdownMode::Drain).await;
}

#[tokio::test]
async fn cancel_racing_success_resolves_to_one_outcome() {
    let mut harness = Harness::new(settings(1));
    let handler = Arc::new(GatedHandler::default());
    let pool = harness.spawn(handler.clone());

    let id = harness.submit("https://example.com/a.mp4").await;
    harness.wait_running(&id).await;
    assert_eq!(
        harness.manager.cancel(&id).unwrap(),
        CancelOutcome::CancelRequested
    );
    handler.gate.notify_one();

    let job = harness.wait(&id).await;
    assert_eq!(job.state, JobState::Cancelled);
    assert!(job.result.is_none());

    let events = harness.drain_events().await;
    let terminal: Vec<_> = events
        .iter()
        .filter(|e| e.job_id == id && e.kind.is_terminal())
        .collect();
    assert_eq!(terminal.len(), 1);

    // The artifact produced after the cancel request is cleaned up
    let mut entries = tokio::fs::read_dir(harness.work_dir.path().join("work"))
        .await
        .unwrap();
    assert!(entries.next_entry().await.unwrap().is_none());
    pool.shutdown(ShutdownMode::Drain).await;
}

#[tokio::test]
async fn postprocess_failure_cleans_up_raw_artifact() {
    let harness = Harness::new(settings(1));
    let context = harness.context(
        Arc::new(WritingHandler::default()),
        Some(Arc::new(TestStage(StageBehaviour::Fail))),
        None,
    );
    let pool = WorkerPool::spawn(&harness.manager, context);

    let id = harness.submit("https://example.com/a.mp4").await;
    let job = harness.wait(&id).await;

    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempt_count, 1);
    assert_eq!(job.error.unwrap().kind, ErrorKind::PostProcessFailed);

    let raw = harness.work_dir.path().join("work").join(format!("{id}-1.bin"));
    assert!(!raw.exists());
    pool.shutdown(ShutdownMode::Drain).await;
}

#[tokio::test]
async fn postprocess_replacement_becomes_result() {
    let harness = Harness::new(settings(1));
    let context = harness.context(
        Arc::new(WritingHandler::default()),
        Some(Arc::new(TestStage(StageBehaviour::Replace))),
        None,
    );
    let pool = WorkerPool::spawn(&harness.manager, context);

    let id = harness.submit("https://example.com/a.mp4").await;
    let job = harness.wait(&id).await;

    assert_eq!(job.state, JobState::Succeeded);
    let artifact = job.result.unwrap();
    assert!(artifact.path.to_string_lossy().ends_with(".small.mp4"));
    assert!(artifact.path.exists());

    let raw = harness.work_dir.path().join("work").join(format!("{id}-1.bin"));
    assert!(!raw.exists());
    assert_eq!(harness.metrics.snapshot().postprocessed, 1);
    pool.shutdown(ShutdownMode::Drain).await;
}

#[tokio::test]
async fn progress_is_reported_while_running() {
    let mut harness = Harness::new(settings(1));
    let pool = harness.spawn(Arc::new(WritingHandler::default()));

    let id = harness.submit("https://example.com/a.mp4").await;
    let job = harness.wait(&id).await;
    assert!(job.progress.is_none());

    let events = harness.drain_events().await;
    let progress: Vec<_> = events
        .iter()
        .filter(|e| e.job_id == id && e.kind == EventKind::Progress)
        .collect();
    assert_eq!(progress.len(), 1);
    assert_eq!(progress[0].state, JobState::Running);
    assert_eq!(progress[0].progress.as_ref().unwrap().percent, 50.0);
    pool.shutdown(ShutdownMode::Drain).await;
}

#[tokio::test]
async fn cached_artifact_skips_the_handler() {
    let harness = Harness::new(settings(1));
    let cache = ArtifactCache::open(
        harness.work_dir.path().join("cache"),
        Duration::from_secs(3600),
    )
    .unwrap();
    let handler = Arc::new(WritingHandler::default());
    let context = harness.context(handler.clone(), None, Some(cache));
    let pool = WorkerPool::spawn(&harness.manager, context);

    let first = harness.submit("https://youtu.be/abc").await;
    let first = harness.wait(&first).await;
    let second = harness.submit("https://youtu.be/abc").await;
    let second = harness.wait(&second).await;

    assert_eq!(second.state, JobState::Succeeded);
    assert_eq!(second.result, first.result);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    assert_eq!(harness.metrics.snapshot().cache_hits, 1);
    pool.shutdown(ShutdownMode::Drain).await;
}

#[tokio::test]
async fn drain_finishes_queued_work_and_closes_queue() {
    let harness = Harness::new(settings(1));
    let mut ids = Vec::new();
    for i in 0..3 {
        ids.push(harness.submit(&format!("https://example.com/{i}.mp4")).await);
    }
    let pool = harness.spawn(Arc::new(WritingHandler::default()));
    pool.shutdown(ShutdownMode::Drain).await;

    for id in &ids {
        assert_eq!(
            harness.manager.status(id).unwrap().state,
            JobState::Succeeded
        );
    }
    assert!(matches!(
        harness
            .manager
            .submit("https://example.com/late.mp4", "chat:1")
            .await,
        Err(QueueError::Closed)
    ));
}

#[tokio::test]
async fn abort_cancels_outstanding_jobs() {
    let harness = Harness::new(settings(1));
    let pool = harness.spawn(Arc::new(GatedHandler {
        honour_cancel: true,
        ..GatedHandler::default()
    }));

    let running = harness.submit("https://example.com/a.mp4").await;
    harness.wait_running(&running).await;
    let queued = harness.submit("https://example.com/b.mp4").await;

    pool.shutdown(ShutdownMode::Abort).await;

    for id in [running, queued] {
        assert_eq!(
            harness.manager.status(&id).unwrap().state,
            JobState::Cancelled
        );
    }
}
