//! Process-wide counters and gauges for the queue and worker pool

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Metrics handle for recording counters/gauges
#[derive(Debug, Default)]
pub struct Metrics {
    jobs_submitted: AtomicU64,
    jobs_rejected: AtomicU64,
    jobs_succeeded: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_cancelled: AtomicU64,
    retries: AtomicU64,
    postprocessed: AtomicU64,
    cache_hits: AtomicU64,
    running: AtomicU64,
    peak_running: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_submitted(&self) {
        self.jobs_submitted.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "jobs_submitted", "Metric incremented");
    }

    pub fn job_rejected(&self) {
        self.jobs_rejected.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "jobs_rejected", "Metric incremented");
    }

    pub fn job_succeeded(&self) {
        self.jobs_succeeded.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "jobs_succeeded", "Metric incremented");
    }

    pub fn job_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "jobs_failed", "Metric incremented");
    }

    pub fn job_cancelled(&self) {
        self.jobs_cancelled.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "jobs_cancelled", "Metric incremented");
    }

    pub fn job_retried(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "retries", "Metric incremented");
    }

    pub fn artifact_postprocessed(&self) {
        self.postprocessed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "postprocessed", "Metric incremented");
    }

    pub fn cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "cache_hits", "Metric incremented");
    }

    /// A worker picked up a job; returns the new running count
    pub fn attempt_started(&self) -> u64 {
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_running.fetch_max(running, Ordering::SeqCst);
        running
    }

    pub fn attempt_finished(&self) {
        // Saturates at zero
        let _ = self
            .running
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub fn running(&self) -> u64 {
        self.running.load(Ordering::SeqCst)
    }

    pub fn peak_running(&self) -> u64 {
        self.peak_running.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_submitted: self.jobs_submitted.load(Ordering::Relaxed),
            jobs_rejected: self.jobs_rejected.load(Ordering::Relaxed),
            jobs_succeeded: self.jobs_succeeded.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_cancelled: self.jobs_cancelled.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            postprocessed: self.postprocessed.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            running: self.running(),
            peak_running: self.peak_running(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub jobs_submitted: u64,
    pub jobs_rejected: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_cancelled: u64,
    pub retries: u64,
    pub postprocessed: u64,
    pub cache_hits: u64,
    pub running: u64,
    pub peak_running: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_gauge_tracks_peak() {
        let metrics = Metrics::new();
        assert_eq!(metrics.attempt_started(), 1);
        assert_eq!(metrics.attempt_started(), 2);
        metrics.attempt_finished();
        assert_eq!(metrics.attempt_started(), 2);
        metrics.attempt_finished();
        metrics.attempt_finished();
        metrics.attempt_finished();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.running, 0);
        assert_eq!(snapshot.peak_running, 2);
    }

    #[test]
    fn counters_are_independent() {
        let metrics = Metrics::new();
        metrics.job_submitted();
        metrics.job_submitted();
        metrics.job_rejected();
        metrics.job_retried();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.jobs_submitted, 2);
        assert_eq!(snapshot.jobs_rejected, 1);
        assert_eq!(snapshot.retries, 1);
        assert_eq!(snapshot.jobs_failed, 0);
    }
}
