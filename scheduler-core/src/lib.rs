//! Durable, deferred task scheduling: persistence, dedup/grouping, batched
//! dispatch with bounded concurrency, and a pluggable dispatch handler.
//!
//! Module layout mirrors the teacher's `taskdb`/`tasks`/`task_manager`
//! split: a store abstraction with swappable backends, a thin task type,
//! and a driving loop built on `tokio`.

pub mod batch;
pub mod dedup;
pub mod error;
pub mod grouping;
pub mod handler;
pub mod metrics;
pub mod store;
pub mod task;
pub mod worker;

pub use batch::Batch;
pub use dedup::DedupCache;
pub use error::{SchedulerError, SchedulerResult};
pub use grouping::{GroupingStrategy, GroupingTable};
pub use handler::{DispatchHandler, HttpDispatchHandler};
pub use store::{MemoryStore, SqliteStore, TaskStore, Transaction};
pub use task::{NewTask, Params, Task, TaskId};
pub use worker::{WorkerConfig, WorkerLoop};
