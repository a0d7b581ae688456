use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Store-assigned identity of a task. Immutable once assigned (invariant 1).
pub type TaskId = i64;

/// Name -> value parameters carried by a task. Ordered so that grouping-key
/// construction and the HTTP dispatch query string are deterministic.
pub type Params = BTreeMap<String, String>;

/// A unit of deferred work: a method to invoke, its parameters, and the
/// earliest wall-clock time it becomes due.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub method: String,
    pub params: Params,
    pub at: DateTime<Utc>,
    pub completed: bool,
    pub retries: u32,
}

/// The fields a producer supplies; the store assigns `id`, `completed`
/// defaults to false and `retries` defaults to 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub method: String,
    pub params: Params,
    pub at: DateTime<Utc>,
}

impl Task {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.completed && self.at < now
    }
}
