use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;

use crate::dedup::DedupCache;
use crate::grouping::{build_key, GroupingTable};
use crate::task::Task;

/// Accumulates due tasks, applying grouping/dedup rules as they're added
/// (spec §4.4).
pub struct Batch {
    tasks: Vec<Task>,
    excluded: Vec<Task>,
    max_size: usize,
    grouping: Arc<GroupingTable>,
    cache: Arc<DedupCache>,
    grouped_tx: UnboundedSender<Vec<u8>>,
}

impl Batch {
    pub fn new(
        max_size: usize,
        grouping: Arc<GroupingTable>,
        cache: Arc<DedupCache>,
        grouped_tx: UnboundedSender<Vec<u8>>,
    ) -> Self {
        Self {
            tasks: Vec::with_capacity(max_size),
            excluded: Vec::new(),
            max_size,
            grouping,
            cache,
            grouped_tx,
        }
    }

    /// Spec §4.4 `Add(task)`.
    pub fn add(&mut self, task: Task) {
        let Some(strategy) = self.grouping.get(&task.method) else {
            self.tasks.push(task);
            return;
        };

        let key = build_key(&task, strategy);
        if self.cache.has(&key) {
            self.excluded.push(task);
            return;
        }

        self.cache.set(key.clone());
        // Non-blocking from the batch builder's perspective (spec §4.4 step
        // 4): the grouped-key writer coroutine is the sole consumer.
        let _ = self.grouped_tx.send(key);
        self.tasks.push(task);
    }

    /// True once the size trigger has been hit. `excluded` does not count.
    pub fn ready(&self) -> bool {
        self.tasks.len() == self.max_size
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty() && self.excluded.is_empty()
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn excluded(&self) -> &[Task] {
        &self.excluded
    }

    pub fn reset(&mut self) {
        self.tasks.clear();
        self.excluded.clear();
    }
}
