//! Progress reporting from handlers and post-processors

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::job::JobState;
use crate::notify::{EventKind, EventRouter, JobEvent};
use crate::queue::JobEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Downloading,
    Compressing,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Downloading => f.write_str("📥 Downloading"),
            Stage::Compressing => f.write_str("🗜️ Compressing"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub stage: Stage,
    /// 0.0 to 100.0
    pub percent: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Progress {
    pub fn new(stage: Stage, percent: f32, detail: Option<String>) -> Self {
        let percent = if percent.is_finite() {
            percent.clamp(0.0, 100.0)
        } else {
            0.0
        };
        Self {
            stage,
            percent,
            detail,
        }
    }
}

/// `[████░░░░░░] 40.0%`
pub fn render_bar(percent: f32) -> String {
    const WIDTH: usize = 10;
    let percent = if percent.is_finite() {
        percent.clamp(0.0, 100.0)
    } else {
        0.0
    };
    let filled = ((percent / 100.0) * WIDTH as f32).round() as usize;
    format!(
        "[{}{}] {:.1}%",
        "█".repeat(filled),
        "░".repeat(WIDTH - filled),
        percent
    )
}

struct ReporterInner {
    entry: Arc<JobEntry>,
    events: EventRouter,
    interval: Duration,
    attempt: u32,
    last_emit: Mutex<Option<Instant>>,
}

/// Handle passed to handlers for reporting progress of one attempt
///
/// Reports update the job snapshot immediately; `Progress` events are
/// throttled to one per interval. Reports arriving after the job left
/// `Running`, or from an earlier attempt, are ignored.
#[derive(Clone, Default)]
pub struct ProgressReporter {
    inner: Option<Arc<ReporterInner>>,
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            Some(inner) => f
                .debug_struct("ProgressReporter")
                .field("attempt", &inner.attempt)
                .field("interval", &inner.interval)
                .finish(),
            None => f.write_str("ProgressReporter(disabled)"),
        }
    }
}

impl ProgressReporter {
    pub(crate) fn new(
        entry: Arc<JobEntry>,
        events: EventRouter,
        interval: Duration,
        attempt: u32,
    ) -> Self {
        Self {
            inner: Some(Arc::new(ReporterInner {
                entry,
                events,
                interval,
                attempt,
                last_emit: Mutex::new(None),
            })),
        }
    }

    /// Reporter that drops every report
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn report(&self, stage: Stage, percent: f32, detail: Option<String>) {
        let Some(inner) = &self.inner else {
            return;
        };

        let mut job = inner.entry.lock();
        if job.state != JobState::Running || job.attempt_count != inner.attempt {
            return;
        }
        job.progress = Some(Progress::new(stage, percent, detail));

        let now = Instant::now();
        let mut last_emit = inner
            .last_emit
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if last_emit.is_some_and(|at| now.duration_since(at) < inner.interval) {
            return;
        }
        *last_emit = Some(now);
        inner
            .events
            .emit(JobEvent::from_job(&job, EventKind::Progress));
    }
}
