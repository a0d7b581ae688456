//! An in-memory `TaskStore`, for tests and for operators that don't need
//! durability. Mirrors the teacher's `InMemoryTaskManager`: a single shared
//! map behind a lock, reached via `Arc<Mutex<_>>`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::{SchedulerError, SchedulerResult};
use crate::task::{NewTask, Task, TaskId};

use super::Transaction as TransactionTrait;

#[derive(Default)]
struct MemoryDb {
    tasks: HashMap<TaskId, Task>,
    next_id: TaskId,
    processed: Vec<Vec<u8>>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    db: Arc<Mutex<MemoryDb>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl super::TaskStore for MemoryStore {
    type Txn = MemoryTransaction;

    async fn find_due(&self, before: DateTime<Utc>) -> SchedulerResult<Vec<Task>> {
        let db = self.db.lock().await;
        Ok(db
            .tasks
            .values()
            .filter(|t| t.is_due(before))
            .cloned()
            .collect())
    }

    async fn begin(&self, deadline: Duration) -> SchedulerResult<Self::Txn> {
        let guard = tokio::time::timeout(deadline, self.db.clone().lock_owned())
            .await
            .map_err(|_| SchedulerError::Other("timed out acquiring store lock".into()))?;
        Ok(MemoryTransaction {
            db: Some(guard),
            undo: Vec::new(),
        })
    }

    async fn insert_processed(&self, key: &[u8]) -> SchedulerResult<i64> {
        let mut db = self.db.lock().await;
        db.processed.push(key.to_vec());
        Ok(db.processed.len() as i64)
    }

    async fn get_processed(&self) -> SchedulerResult<Vec<Vec<u8>>> {
        let db = self.db.lock().await;
        Ok(db.processed.clone())
    }
}

enum UndoOp {
    RemoveTask(TaskId),
    Uncomplete(TaskId),
    DecrementRetries(TaskId),
}

/// This store has no real transaction log: every call mutates the shared map
/// immediately, the way spec §4.1's "single-transaction" variant allows.
/// `commit` is therefore a no-op and `rollback` replays a small undo list
/// recorded as calls happen, which is enough for the scenarios this store is
/// used for (tests, non-durable deployments) without needing a write-ahead
/// log.
pub struct MemoryTransaction {
    db: Option<OwnedMutexGuard<MemoryDb>>,
    undo: Vec<UndoOp>,
}

impl MemoryTransaction {
    fn db_mut(&mut self) -> &mut MemoryDb {
        self.db.as_mut().expect("transaction already finished")
    }
}

#[async_trait]
impl TransactionTrait for MemoryTransaction {
    async fn insert_task(&mut self, task: NewTask) -> SchedulerResult<TaskId> {
        let db = self.db_mut();
        db.next_id += 1;
        let id = db.next_id;
        db.tasks.insert(
            id,
            Task {
                id,
                method: task.method,
                params: task.params,
                at: task.at,
                completed: false,
                retries: 0,
            },
        );
        self.undo.push(UndoOp::RemoveTask(id));
        Ok(id)
    }

    async fn complete_task(&mut self, id: TaskId) -> SchedulerResult<()> {
        let db = self.db_mut();
        if let Some(task) = db.tasks.get_mut(&id) {
            if !task.completed {
                task.completed = true;
                self.undo.push(UndoOp::Uncomplete(id));
            }
        }
        Ok(())
    }

    async fn increment_retries(&mut self, id: TaskId) -> SchedulerResult<()> {
        let db = self.db_mut();
        if let Some(task) = db.tasks.get_mut(&id) {
            task.retries += 1;
            self.undo.push(UndoOp::DecrementRetries(id));
        }
        Ok(())
    }

    async fn commit(mut self) -> SchedulerResult<()> {
        self.db.take();
        Ok(())
    }

    async fn rollback(mut self) -> SchedulerResult<()> {
        if let Some(mut db) = self.db.take() {
            for op in self.undo.drain(..).rev() {
                match op {
                    UndoOp::RemoveTask(id) => {
                        db.tasks.remove(&id);
                    }
                    UndoOp::Uncomplete(id) => {
                        if let Some(task) = db.tasks.get_mut(&id) {
                            task.completed = false;
                        }
                    }
                    UndoOp::DecrementRetries(id) => {
                        if let Some(task) = db.tasks.get_mut(&id) {
                            task.retries = task.retries.saturating_sub(1);
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
