//! Small prometheus counter set, grounded on the teacher's `raiko-metrics`
//! crate. Carried regardless of spec.md's Non-goals (§SPEC_FULL.md "Ambient
//! stack") — it's the teacher's baseline level of operability, not a
//! scheduling feature.

use lazy_static::lazy_static;
use prometheus::{register_counter, Counter};

lazy_static! {
    pub static ref TASKS_DISPATCHED: Counter = register_counter!(
        "scheduler_tasks_dispatched_total",
        "tasks successfully handled"
    )
    .unwrap();
    pub static ref TASKS_RETRIED: Counter = register_counter!(
        "scheduler_tasks_retried_total",
        "handler failures that incremented a task's retry counter"
    )
    .unwrap();
    pub static ref TASKS_SUPPRESSED: Counter = register_counter!(
        "scheduler_tasks_suppressed_total",
        "tasks suppressed as duplicates by a grouping strategy"
    )
    .unwrap();
    pub static ref BATCH_COMMITS_FAILED: Counter = register_counter!(
        "scheduler_batch_commits_failed_total",
        "batch commits that failed and reverted"
    )
    .unwrap();
}

pub fn inc_dispatched() {
    TASKS_DISPATCHED.inc();
}

pub fn inc_retried() {
    TASKS_RETRIED.inc();
}

pub fn inc_suppressed_by(n: usize) {
    TASKS_SUPPRESSED.inc_by(n as f64);
}

pub fn inc_commit_failed() {
    BATCH_COMMITS_FAILED.inc();
}
