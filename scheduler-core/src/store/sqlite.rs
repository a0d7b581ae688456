use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{named_params, Connection};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::{SchedulerError, SchedulerResult};
use crate::task::{NewTask, Params, Task, TaskId};

use super::Transaction as TransactionTrait;

/// Sqlite-backed `TaskStore` (spec §6 "Store schema").
///
/// A single shared connection behind a `tokio::sync::Mutex` — the same
/// shape the teacher's `SqliteTaskManager` uses (`Arc<Mutex<TaskDb>>`).
/// Sqlite itself only allows one writer at a time, so a single connection
/// plus `EXCLUSIVE` locking mode gives us real transactional isolation
/// without a connection pool.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open an existing database at `path`, creating it (and its schema) if
    /// it doesn't exist yet.
    pub fn open_or_create(path: &Path) -> SchedulerResult<Self> {
        let fresh = !path.exists();
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;
        if fresh {
            create_schema(&conn)?;
        }
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// An in-process, file-backed database with no persistence guarantees
    /// beyond the process lifetime. Handy for tests that want real SQL
    /// semantics without a temp file.
    pub fn open_in_memory() -> SchedulerResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", true)?;
        create_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

fn create_schema(conn: &Connection) -> SchedulerResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE tasks(
          id INTEGER PRIMARY KEY,
          method TEXT NOT NULL,
          parameters TEXT NOT NULL,
          at DATETIME NOT NULL,
          completed INTEGER NOT NULL DEFAULT 0,
          retries INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE processed(
          id INTEGER PRIMARY KEY,
          key TEXT NOT NULL,
          at DATETIME NOT NULL DEFAULT (STRFTIME('%Y-%m-%d %H:%M:%f', 'NOW'))
        );

        CREATE INDEX idx_tasks_due ON tasks(at, completed);
        "#,
    )?;
    Ok(())
}

#[async_trait]
impl super::TaskStore for SqliteStore {
    type Txn = SqliteTransaction;

    async fn find_due(&self, before: DateTime<Utc>) -> SchedulerResult<Vec<Task>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, method, parameters, at, completed, retries FROM tasks \
             WHERE at < :before AND (completed = 0 OR completed IS NULL)",
        )?;
        let rows = stmt.query_map(named_params! {":before": before}, row_to_task)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    async fn begin(&self, deadline: Duration) -> SchedulerResult<Self::Txn> {
        let guard = tokio::time::timeout(deadline, self.conn.clone().lock_owned())
            .await
            .map_err(|_| SchedulerError::Other("timed out acquiring store lock".into()))?;
        guard.execute_batch("BEGIN IMMEDIATE")?;
        Ok(SqliteTransaction {
            conn: Some(guard),
            done: false,
        })
    }

    async fn insert_processed(&self, key: &[u8]) -> SchedulerResult<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO processed(key) VALUES (?1)",
            [hex::encode(key)],
        )?;
        Ok(conn.last_insert_rowid())
    }

    async fn get_processed(&self) -> SchedulerResult<Vec<Vec<u8>>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached("SELECT key FROM processed")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let keys = rows.collect::<Result<Vec<_>, _>>()?;
        keys.into_iter()
            .map(|hexed| hex::decode(hexed).map_err(|e| SchedulerError::Other(e.to_string())))
            .collect()
    }
}

fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<Task> {
    let raw_params: String = row.get(2)?;
    let params: Params = serde_json::from_str(&raw_params)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e)))?;
    Ok(Task {
        id: row.get(0)?,
        method: row.get(1)?,
        params,
        at: row.get(3)?,
        completed: row.get::<_, i64>(4)? != 0,
        retries: row.get::<_, i64>(5)? as u32,
    })
}

/// A real sqlite transaction (`BEGIN IMMEDIATE` / `COMMIT` / `ROLLBACK`),
/// holding the store's only connection for its whole lifetime. This is what
/// gives the `EXCLUSIVE` locking mode its serialization guarantee across
/// concurrent `begin()` callers (ingress vs. the worker loop).
pub struct SqliteTransaction {
    conn: Option<OwnedMutexGuard<Connection>>,
    done: bool,
}

impl SqliteTransaction {
    fn conn(&self) -> &Connection {
        self.conn.as_ref().expect("transaction already finished")
    }
}

#[async_trait]
impl TransactionTrait for SqliteTransaction {
    async fn insert_task(&mut self, task: NewTask) -> SchedulerResult<TaskId> {
        let params = serde_json::to_string(&task.params)?;
        self.conn().execute(
            "INSERT INTO tasks(method, parameters, at) VALUES (?1, ?2, ?3)",
            rusqlite::params![task.method, params, task.at],
        )?;
        Ok(self.conn().last_insert_rowid())
    }

    async fn complete_task(&mut self, id: TaskId) -> SchedulerResult<()> {
        self.conn()
            .execute("UPDATE tasks SET completed = 1 WHERE id = ?1", [id])?;
        Ok(())
    }

    async fn increment_retries(&mut self, id: TaskId) -> SchedulerResult<()> {
        self.conn()
            .execute("UPDATE tasks SET retries = retries + 1 WHERE id = ?1", [id])?;
        Ok(())
    }

    async fn commit(mut self) -> SchedulerResult<()> {
        self.conn().execute_batch("COMMIT")?;
        self.done = true;
        self.conn.take();
        Ok(())
    }

    async fn rollback(mut self) -> SchedulerResult<()> {
        self.conn().execute_batch("ROLLBACK")?;
        self.done = true;
        self.conn.take();
        Ok(())
    }
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        if !self.done {
            if let Some(conn) = self.conn.take() {
                let _ = conn.execute_batch("ROLLBACK");
            }
        }
    }
}
