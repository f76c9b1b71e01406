use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::job::{Job, JobId, JobState};

/// One tracked job with its exclusive mutation lock
///
/// Every mutation of the job happens under `lock()`; readers take a clone
/// under the same lock, so snapshots never observe a half-applied transition.
#[derive(Debug)]
pub struct JobEntry {
    job: Mutex<Job>,
    cancel: CancellationToken,
    state_tx: watch::Sender<JobState>,
}

impl JobEntry {
    pub fn new(job: Job) -> Self {
        let (state_tx, _) = watch::channel(job.state);
        Self {
            job: Mutex::new(job),
            cancel: CancellationToken::new(),
            state_tx,
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, Job> {
        self.job.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> Job {
        self.lock().clone()
    }

    /// Fired when cancellation of the job is requested
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Announce the state written under the job lock
    pub fn publish(&self, state: JobState) {
        self.state_tx.send_replace(state);
    }

    pub fn subscribe(&self) -> watch::Receiver<JobState> {
        self.state_tx.subscribe()
    }
}

/// In-flight job tracking keyed by id
///
/// Lock order: the map lock is taken before any entry lock, never after.
#[derive(Debug, Default)]
pub struct JobStore {
    jobs: RwLock<HashMap<JobId, Arc<JobEntry>>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, job: Job) -> Arc<JobEntry> {
        let id = job.id;
        let entry = Arc::new(JobEntry::new(job));
        self.jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, entry.clone());
        entry
    }

    pub fn get(&self, id: &JobId) -> Option<Arc<JobEntry>> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn remove(&self, id: &JobId) -> Option<Arc<JobEntry>> {
        self.jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    pub fn entries(&self) -> Vec<Arc<JobEntry>> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn count_in_state(&self, state: JobState) -> usize {
        self.entries()
            .iter()
            .filter(|entry| entry.lock().state == state)
            .count()
    }

    /// Evict terminal jobs that finished more than `ttl` ago
    pub fn prune_finished(&self, ttl: Duration) -> usize {
        let ttl = ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::MAX);
        let cutoff = Utc::now().checked_sub_signed(ttl);

        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        let before = jobs.len();
        jobs.retain(|_, entry| {
            let job = entry.lock();
            match (job.state.is_terminal(), job.finished_at, cutoff) {
                (true, Some(finished), Some(cutoff)) => finished > cutoff,
                _ => true,
            }
        });
        before - jobs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{ErrorKind, JobError};

    fn queued() -> Job {
        Job::new("https://example.com/a.mp4", "chat".into())
    }

    #[test]
    fn snapshot_is_detached_from_entry() {
        let store = JobStore::new();
        let entry = store.insert(queued());
        let snapshot = entry.snapshot();

        entry.lock().start().unwrap();
        assert_eq!(snapshot.state, JobState::Queued);
        assert_eq!(store.get(&snapshot.id).unwrap().snapshot().state, JobState::Running);
    }

    #[test]
    fn prune_only_evicts_old_terminal_jobs() {
        let store = JobStore::new();
        let running = store.insert(queued());
        running.lock().start().unwrap();

        let failed = store.insert(queued());
        {
            let mut job = failed.lock();
            job.start().unwrap();
            job.fail(JobError::new(ErrorKind::Fatal, "x")).unwrap();
        }
        store.insert(queued());

        assert_eq!(store.prune_finished(Duration::from_secs(3600)), 0);
        assert_eq!(store.prune_finished(Duration::ZERO), 1);
        assert_eq!(store.len(), 2);
        assert_eq!(store.count_in_state(JobState::Running), 1);
        assert_eq!(store.count_in_state(JobState::Queued), 1);
    }

    #[tokio::test]
    async fn subscribers_see_published_state() {
        let entry = JobEntry::new(queued());
        let mut rx = entry.subscribe();
        entry.publish(JobState::Running);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), JobState::Running);
    }
}
