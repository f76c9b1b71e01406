use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::Notify;

use crate::job::JobId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PushError {
    #[error("queue is full")]
    Full,
    #[error("queue is closed")]
    Closed,
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<JobId>,
    closed: bool,
}

/// Bounded FIFO of queued job ids shared by submitters and workers
///
/// The mutex is only held for O(n) bookkeeping, never across an await.
#[derive(Debug)]
pub struct JobQueue {
    state: Mutex<QueueState>,
    capacity: Option<usize>,
    items_available: Notify,
    space_available: Notify,
}

impl JobQueue {
    /// `None` means unbounded
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            capacity,
            items_available: Notify::new(),
            space_available: Notify::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Admit a new job or fail immediately
    pub fn try_push(&self, id: JobId) -> Result<(), PushError> {
        let mut state = self.state();
        if state.closed {
            return Err(PushError::Closed);
        }
        if self.capacity.is_some_and(|cap| state.items.len() >= cap) {
            return Err(PushError::Full);
        }
        state.items.push_back(id);
        drop(state);
        self.items_available.notify_one();
        Ok(())
    }

    /// Admit a new job, waiting for space while the queue is full
    pub async fn push(&self, id: JobId) -> Result<(), PushError> {
        loop {
            let notified = self.space_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_push(id) {
                Err(PushError::Full) => notified.await,
                other => return other,
            }
        }
    }

    /// Re-enter a job at the back for another attempt
    ///
    /// Retries were admitted already, so capacity and closing do not apply.
    pub fn push_retry(&self, id: JobId) {
        self.state().items.push_back(id);
        self.items_available.notify_one();
    }

    /// Next job in FIFO order; `None` once the queue is closed and drained
    pub async fn pop(&self) -> Option<JobId> {
        loop {
            let notified = self.items_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state();
                if let Some(id) = state.items.pop_front() {
                    drop(state);
                    self.space_available.notify_one();
                    return Some(id);
                }
                if state.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Drop a queued job; returns whether it was present
    pub fn remove(&self, id: &JobId) -> bool {
        let mut state = self.state();
        let before = state.items.len();
        state.items.retain(|queued| queued != id);
        let removed = state.items.len() != before;
        drop(state);
        if removed {
            self.space_available.notify_one();
        }
        removed
    }

    /// 1-based position of a queued job
    pub fn position(&self, id: &JobId) -> Option<usize> {
        self.state()
            .items
            .iter()
            .position(|queued| queued == id)
            .map(|idx| idx + 1)
    }

    pub fn len(&self) -> usize {
        self.state().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().items.is_empty()
    }

    /// Reject further submissions and wake every waiter
    pub fn close(&self) {
        self.state().closed = true;
        self.items_available.notify_waiters();
        self.space_available.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }
}
