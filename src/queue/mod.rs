//! Job queue: bounded FIFO, in-flight job store and the queue manager

mod fifo;
mod manager;
mod store;

pub use fifo::{JobQueue, PushError};
pub use manager::{CancelOutcome, QueueError, QueueManager, QueueStats};
pub(crate) use manager::Shared;
pub use store::{JobEntry, JobStore};
