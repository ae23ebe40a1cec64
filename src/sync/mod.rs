//! Durable replay of mutations made while offline.
//!
//! - `SyncQueue` keeps an ordered, SQLite-backed log of pending mutations
//! - `RetryPolicy` and `Sleeper` decide how long to wait between attempts
//! - `SyncCoordinator` drains the queue one item at a time whenever a trigger fires

mod coordinator;
mod queue;
mod retry;

pub use coordinator::{DrainReport, SyncCoordinator};
pub use queue::{Mutation, QueueCounts, SyncAction, SyncQueue, SyncQueueItem, SyncStatus};
pub use retry::{classify, Failure, RetryPolicy, Sleeper, TokioSleeper};
