//! The task store abstraction (spec §4.1).
//!
//! Rather than a `dyn Transaction` trait object (which async methods that
//! consume `self` don't support without extra boxing gymnastics), stores are
//! generic over an associated `Txn` type, the way the teacher crate avoids
//! object safety problems by wrapping concrete backends in an enum instead of
//! a trait object.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::error::SchedulerResult;
use crate::task::{NewTask, Task, TaskId};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Durable persistence of tasks and processed-dedup keys (spec §4.1).
#[async_trait]
pub trait TaskStore: Send + Sync + 'static {
    type Txn: Transaction;

    /// Tasks with `at < before` and `completed != true`. Ordering is not
    /// contractually required.
    async fn find_due(&self, before: DateTime<Utc>) -> SchedulerResult<Vec<Task>>;

    /// Start a write transaction. `deadline` bounds how long the caller is
    /// willing to wait to acquire it (spec §5: ingress uses 50ms).
    async fn begin(&self, deadline: Duration) -> SchedulerResult<Self::Txn>;

    /// Record a dedup key outside of any user transaction. Returns the
    /// assigned row id.
    async fn insert_processed(&self, key: &[u8]) -> SchedulerResult<i64>;

    /// All dedup keys, for cache warm-up.
    async fn get_processed(&self) -> SchedulerResult<Vec<Vec<u8>>>;
}

/// A single write transaction. All mutation is atomic at `commit`.
#[async_trait]
pub trait Transaction: Send {
    async fn insert_task(&mut self, task: NewTask) -> SchedulerResult<TaskId>;
    async fn complete_task(&mut self, id: TaskId) -> SchedulerResult<()>;
    async fn increment_retries(&mut self, id: TaskId) -> SchedulerResult<()>;
    async fn commit(self) -> SchedulerResult<()>;
    async fn rollback(self) -> SchedulerResult<()>;
}
