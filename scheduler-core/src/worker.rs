//! The worker loop (spec §4.5, §5): periodic scans, the batch state
//! machine, bounded-concurrency dispatch, and transactional commits.
//!
//! Grounded on the teacher's `reqactor::Actor::serve_in_background` for the
//! concurrency shape (`tokio::select!`, `Arc<Mutex<_>>`, a `Semaphore` for
//! the bounded executor, `tokio::spawn` per unit of work) and on spec §9's
//! own note that a `CancellationToken` is the idiomatic replacement for the
//! source's raw exit channel.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::batch::Batch;
use crate::dedup::DedupCache;
use crate::error::SchedulerResult;
use crate::grouping::GroupingTable;
use crate::handler::DispatchHandler;
use crate::metrics;
use crate::store::{TaskStore, Transaction};
use crate::task::Task;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub scan_interval: Duration,
    pub batch_age: Duration,
    pub batch_size: usize,
    /// Bounded executor parallelism `P` (spec recommends 10-20).
    pub parallelism: usize,
    /// Deadline for `TaskStore::begin` (spec §5: 50ms for ingress; reused
    /// here for the worker's own batch-commit transactions).
    pub begin_deadline: Duration,
    /// Not enforced as a cap (spec §9 open question 5: the core has no
    /// retry ceiling). When set, a task crossing this many retries gets a
    /// `warn` log line so operators can act out-of-band.
    pub max_retries: Option<u32>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(10),
            batch_age: Duration::from_secs(5),
            batch_size: 1000,
            parallelism: 16,
            begin_deadline: Duration::from_millis(50),
            max_retries: None,
        }
    }
}

/// Drives periodic scans, enforces the batch's size/age triggers, executes
/// handlers with bounded concurrency, and commits outcomes transactionally.
pub struct WorkerLoop<S: TaskStore + Clone, H: DispatchHandler> {
    store: S,
    handler: Arc<H>,
    grouping: Arc<GroupingTable>,
    cache: Arc<DedupCache>,
    config: WorkerConfig,
    /// Doubles as the "per-worker batch mutex" spec §4.5 calls for: holding
    /// this guard across a commit serializes the size-trigger path (inside
    /// `finish`) against the age-trigger path (`force_commit_age`).
    batch_slot: Mutex<Option<Batch>>,
    grouped_tx: UnboundedSender<Vec<u8>>,
}

impl<S, H> WorkerLoop<S, H>
where
    S: TaskStore + Clone,
    H: DispatchHandler,
{
    pub fn new(
        store: S,
        handler: H,
        grouping: GroupingTable,
        config: WorkerConfig,
    ) -> (Self, UnboundedReceiver<Vec<u8>>) {
        let (grouped_tx, grouped_rx) = unbounded_channel();
        let worker = Self {
            store,
            handler: Arc::new(handler),
            grouping: Arc::new(grouping),
            cache: Arc::new(DedupCache::new()),
            config,
            batch_slot: Mutex::new(None),
            grouped_tx,
        };
        (worker, grouped_rx)
    }

    /// Populate the dedup cache from the store. Call before `run`; a
    /// failure here should abort startup (spec §4.3).
    pub async fn warm_up(&self) -> SchedulerResult<usize> {
        self.cache.warm_up(&self.store).await
    }

    fn new_batch(&self) -> Batch {
        Batch::new(
            self.config.batch_size,
            self.grouping.clone(),
            self.cache.clone(),
            self.grouped_tx.clone(),
        )
    }

    /// Runs the main loop and the grouped-key writer coroutine together
    /// until `shutdown` is triggered. In-flight commits are allowed to
    /// finish (spec §5 "Shutdown is cooperative").
    pub async fn run(&self, grouped_rx: UnboundedReceiver<Vec<u8>>, shutdown: CancellationToken) {
        let writer = run_grouped_key_writer(self.store.clone(), grouped_rx, shutdown.clone());
        let main_loop = self.run_main_loop(shutdown);
        tokio::join!(writer, main_loop);
    }

    async fn run_main_loop(&self, shutdown: CancellationToken) {
        let mut scan_ticker = tokio::time::interval(self.config.scan_interval);
        let mut age_ticker = tokio::time::interval(self.config.batch_age);

        loop {
            tokio::select! {
                _ = scan_ticker.tick() => {
                    self.on_scan_tick(&mut scan_ticker).await;
                }
                _ = age_ticker.tick() => {
                    if let Err(e) = self.force_commit_age().await {
                        tracing::error!(error = %e, "age-triggered commit failed");
                    }
                }
                _ = shutdown.cancelled() => {
                    tracing::info!("worker loop received shutdown signal");
                    return;
                }
            }
        }
    }

    async fn on_scan_tick(&self, scan_ticker: &mut tokio::time::Interval) {
        let now = Utc::now();
        match self.store.find_due(now).await {
            Ok(tasks) => {
                tracing::debug!(count = tasks.len(), "found due tasks");
                for task in tasks {
                    if let Err(e) = self.finish(task).await {
                        tracing::error!(error = %e, "failed to add task to batch");
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "scan failed, will retry next tick");
                scan_ticker.reset();
            }
        }
    }

    /// spec §4.5 `finish(task)`: the size trigger fires *before* the task
    /// that would overflow the batch is added, so that task becomes the
    /// first element of the next batch.
    async fn finish(&self, task: Task) -> SchedulerResult<()> {
        let mut slot = self.batch_slot.lock().await;
        if slot.is_none() {
            *slot = Some(self.new_batch());
        }
        if slot.as_ref().expect("just inserted").ready() {
            let full = slot.take().expect("just checked");
            self.commit(full).await?;
            *slot = Some(self.new_batch());
        }
        slot.as_mut().expect("just inserted").add(task);
        Ok(())
    }

    async fn force_commit_age(&self) -> SchedulerResult<()> {
        let mut slot = self.batch_slot.lock().await;
        if let Some(batch) = slot.take() {
            self.commit(batch).await?;
        }
        Ok(())
    }

    /// spec §4.5 `commit(batch)` protocol, steps 2-8 (step 1, acquiring the
    /// batch mutex, already holds by the time this is called).
    async fn commit(&self, mut batch: Batch) -> SchedulerResult<()> {
        if batch.is_empty() {
            batch.reset();
            return Ok(());
        }

        let txn = self.store.begin(self.config.begin_deadline).await?;
        let txn = Arc::new(Mutex::new(txn));
        let semaphore = Arc::new(Semaphore::new(self.config.parallelism.max(1)));
        let mut jobs = Vec::new();

        for task in batch.tasks().to_vec() {
            let handler = self.handler.clone();
            let txn = txn.clone();
            let semaphore = semaphore.clone();
            let max_retries = self.config.max_retries;
            jobs.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
                let outcome = handler.handle(&task).await;
                let mut txn = txn.lock().await;
                match outcome {
                    Ok(()) => {
                        metrics::inc_dispatched();
                        if let Err(e) = txn.complete_task(task.id).await {
                            tracing::error!(task_id = task.id, error = %e, "failed to mark task complete");
                        }
                    }
                    Err(reason) => {
                        tracing::warn!(task_id = task.id, method = %task.method, error = %reason, "handler failed");
                        metrics::inc_retried();
                        if let Err(e) = txn.increment_retries(task.id).await {
                            tracing::error!(task_id = task.id, error = %e, "failed to increment retries");
                        }
                        let next_retries = task.retries + 1;
                        if let Some(limit) = max_retries {
                            if next_retries >= limit {
                                tracing::warn!(
                                    task_id = task.id,
                                    method = %task.method,
                                    retries = next_retries,
                                    limit,
                                    "task has crossed the operator-configured retry threshold; the core does not cap retries"
                                );
                            }
                        }
                    }
                }
            }));
        }

        let excluded = batch.excluded().to_vec();
        if !excluded.is_empty() {
            let txn = txn.clone();
            let semaphore = semaphore.clone();
            jobs.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
                let mut txn = txn.lock().await;
                for task in &excluded {
                    if let Err(e) = txn.complete_task(task.id).await {
                        tracing::error!(task_id = task.id, error = %e, "failed to mark suppressed duplicate complete");
                    }
                }
                metrics::inc_suppressed_by(excluded.len());
            }));
        }

        for job in jobs {
            if let Err(e) = job.await {
                tracing::error!(error = %e, "batch job panicked");
            }
        }

        let txn = Arc::try_unwrap(txn)
            .unwrap_or_else(|_| panic!("batch jobs still hold a reference to the transaction"))
            .into_inner();

        if let Err(e) = txn.commit().await {
            tracing::error!(error = %e, "batch commit failed; tasks remain due for the next scan");
            metrics::inc_commit_failed();
            return Err(e);
        }

        batch.reset();
        Ok(())
    }
}

/// Consumes the `grouped` channel and persists each key outside the batch
/// transaction (spec §4.5 "Grouped-key writer"). This is ordered FIFO
/// within the channel but not relative to batch commits — a crash between
/// a key's cache admission and its persistence here loses that dedup
/// record, which spec §9 open question 2 accepts as a known tradeoff.
async fn run_grouped_key_writer<S: TaskStore>(
    store: S,
    mut rx: UnboundedReceiver<Vec<u8>>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            maybe_key = rx.recv() => {
                match maybe_key {
                    Some(key) => {
                        if let Err(e) = store.insert_processed(&key).await {
                            tracing::error!(error = %e, "failed to persist processed key");
                        }
                    }
                    None => return,
                }
            }
            _ = shutdown.cancelled() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::grouping::GroupingStrategy;
    use crate::store::MemoryStore;
    use crate::task::{NewTask, Params};

    /// A handler that fails for a configurable set of task ids and counts
    /// every call it receives, so the spec §8 scenarios can assert on
    /// invocation counts without a real HTTP sink.
    #[derive(Default)]
    struct StubHandler {
        calls: AtomicUsize,
        fail_ids: StdMutex<HashSet<i64>>,
    }

    impl StubHandler {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn always_fail(id: i64) -> Self {
            let mut fail_ids = HashSet::new();
            fail_ids.insert(id);
            Self {
                calls: AtomicUsize::new(0),
                fail_ids: StdMutex::new(fail_ids),
            }
        }
    }

    #[async_trait]
    impl DispatchHandler for StubHandler {
        async fn handle(&self, task: &Task) -> Result<(), String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_ids.lock().unwrap().contains(&task.id) {
                Err("stubbed failure".to_string())
            } else {
                Ok(())
            }
        }
    }

    /// `WorkerLoop::new` takes ownership of the handler, so tests that need
    /// to inspect call counts afterwards hand it an `Arc` wrapper instead of
    /// the bare `StubHandler`.
    #[derive(Clone)]
    struct SharedHandler(Arc<StubHandler>);

    #[async_trait]
    impl DispatchHandler for SharedHandler {
        async fn handle(&self, task: &Task) -> Result<(), String> {
            self.0.handle(task).await
        }
    }

    async fn insert_due(store: &MemoryStore, method: &str, params: &[(&str, &str)], at: chrono::DateTime<Utc>) -> i64 {
        let mut p = Params::new();
        for (k, v) in params {
            p.insert(k.to_string(), v.to_string());
        }
        let mut txn = store.begin(Duration::from_millis(50)).await.unwrap();
        let id = txn
            .insert_task(NewTask {
                method: method.to_string(),
                params: p,
                at,
            })
            .await
            .unwrap();
        txn.commit().await.unwrap();
        id
    }

    /// The real grouped-key writer coroutine isn't spawned in these tests;
    /// drain whatever it would have persisted so processed-key assertions
    /// see what a running worker would produce.
    async fn drain_grouped_keys(store: &MemoryStore, rx: &mut UnboundedReceiver<Vec<u8>>) {
        while let Ok(key) = rx.try_recv() {
            store.insert_processed(&key).await.unwrap();
        }
    }

    fn test_config(batch_size: usize) -> WorkerConfig {
        WorkerConfig {
            batch_size,
            ..WorkerConfig::default()
        }
    }

    /// Fetches a task through the same path the real scan tick uses:
    /// `find_due` with a far-future cutoff so "due" is never in question.
    async fn fetch(store: &MemoryStore, id: i64) -> Task {
        let far_future = Utc::now() + chrono::Duration::days(3650);
        store
            .find_due(far_future)
            .await
            .unwrap()
            .into_iter()
            .find(|t| t.id == id)
            .expect("task present")
    }

    /// Spec §8 scenario 1: a single due task is dispatched once and marked
    /// complete.
    #[tokio::test]
    async fn basic_dispatch() {
        let store = MemoryStore::new();
        let id = insert_due(&store, "notify", &[("name", "a")], Utc::now() - chrono::Duration::seconds(1)).await;
        let task = fetch(&store, id).await;

        let handler = Arc::new(StubHandler::default());
        let (worker, _rx) = WorkerLoop::new(
            store.clone(),
            SharedHandler(handler.clone()),
            GroupingTable::new(vec![]),
            test_config(10),
        );

        worker.finish(task).await.unwrap();
        worker.force_commit_age().await.unwrap();

        assert_eq!(handler.calls(), 1);
        let after = fetch(&store, id).await;
        assert!(after.completed);
        assert_eq!(after.retries, 0);
    }

    /// Spec §8 scenario 2: handler failure increments retries and leaves
    /// the task incomplete across two scans.
    #[tokio::test]
    async fn retry_on_handler_failure() {
        let store = MemoryStore::new();
        let id = insert_due(&store, "notify", &[("name", "b")], Utc::now() - chrono::Duration::seconds(1)).await;

        let handler = Arc::new(StubHandler::always_fail(id));
        let (worker, _rx) = WorkerLoop::new(
            store.clone(),
            SharedHandler(handler.clone()),
            GroupingTable::new(vec![]),
            test_config(10),
        );

        let task = fetch(&store, id).await;
        worker.finish(task).await.unwrap();
        worker.force_commit_age().await.unwrap();
        let after_first = fetch(&store, id).await;
        assert_eq!(after_first.retries, 1);
        assert!(!after_first.completed);

        worker.finish(after_first).await.unwrap();
        worker.force_commit_age().await.unwrap();
        let after_second = fetch(&store, id).await;
        assert_eq!(after_second.retries, 2);
        assert!(!after_second.completed);
    }

    /// Spec §8 scenario 3: two tasks in the same grouping bucket dispatch
    /// exactly once and leave a processed-key record behind.
    #[tokio::test]
    async fn grouping_dedups_within_a_batch() {
        let store = MemoryStore::new();
        let at1 = Utc.with_ymd_and_hms(2024, 1, 1, 10, 15, 0).unwrap();
        let at2 = Utc.with_ymd_and_hms(2024, 1, 1, 10, 45, 0).unwrap();
        let id1 = insert_due(&store, "notify", &[("name", "c")], at1).await;
        let id2 = insert_due(&store, "notify", &[("name", "c")], at2).await;

        let strategy = GroupingStrategy {
            method: "notify".to_string(),
            time_format: "%Y-%m-%d %H".to_string(),
            params: vec!["name".to_string()],
        };
        let handler = Arc::new(StubHandler::default());
        let (worker, mut rx) = WorkerLoop::new(
            store.clone(),
            SharedHandler(handler.clone()),
            GroupingTable::new(vec![strategy]),
            test_config(10),
        );

        worker.finish(fetch(&store, id1).await).await.unwrap();
        worker.finish(fetch(&store, id2).await).await.unwrap();
        worker.force_commit_age().await.unwrap();
        drain_grouped_keys(&store, &mut rx).await;

        assert_eq!(handler.calls(), 1);
        assert!(fetch(&store, id1).await.completed);
        assert!(fetch(&store, id2).await.completed);
        let processed = store.get_processed().await.unwrap();
        assert_eq!(processed, vec![b"notify_c_2024-01-01 10".to_vec()]);
    }

    /// Spec §8 scenario 4: with `batch_size = 3`, seven due tasks flush as
    /// three commits (3, 3, 1) and all end completed.
    #[tokio::test]
    async fn size_triggered_flush() {
        let store = MemoryStore::new();
        let mut ids = Vec::new();
        for i in 0..7 {
            let id = insert_due(
                &store,
                "notify",
                &[("i", &i.to_string())],
                Utc::now() - chrono::Duration::seconds(1),
            )
            .await;
            ids.push(id);
        }

        let handler = Arc::new(StubHandler::default());
        let (worker, _rx) = WorkerLoop::new(
            store.clone(),
            SharedHandler(handler.clone()),
            GroupingTable::new(vec![]),
            test_config(3),
        );

        for id in &ids {
            worker.finish(fetch(&store, *id).await).await.unwrap();
        }
        // The 7th task only filled the 3rd batch to size 1; flush it as the
        // age trigger would.
        worker.force_commit_age().await.unwrap();

        assert_eq!(handler.calls(), 7);
        for id in &ids {
            assert!(fetch(&store, *id).await.completed);
        }
    }

    /// Spec §8 scenario 5: an age-triggered flush completes tasks that
    /// never filled the batch.
    #[tokio::test]
    async fn age_triggered_flush_completes_partial_batch() {
        let store = MemoryStore::new();
        let id1 = insert_due(&store, "notify", &[("name", "x")], Utc::now() - chrono::Duration::seconds(1)).await;
        let id2 = insert_due(&store, "notify", &[("name", "y")], Utc::now() - chrono::Duration::seconds(1)).await;

        let handler = Arc::new(StubHandler::default());
        let (worker, _rx) = WorkerLoop::new(
            store.clone(),
            SharedHandler(handler.clone()),
            GroupingTable::new(vec![]),
            test_config(100),
        );

        worker.finish(fetch(&store, id1).await).await.unwrap();
        worker.finish(fetch(&store, id2).await).await.unwrap();
        assert_eq!(handler.calls(), 0, "size trigger must not have fired yet");

        worker.force_commit_age().await.unwrap();

        assert_eq!(handler.calls(), 2);
        assert!(fetch(&store, id1).await.completed);
        assert!(fetch(&store, id2).await.completed);
    }

    /// Spec §8 scenario 6: a dedup key persisted before restart suppresses
    /// the handler on warm-up, and the suppressed task is still marked
    /// complete.
    #[tokio::test]
    async fn cache_warm_up_suppresses_across_restart() {
        let store = MemoryStore::new();
        store
            .insert_processed(b"notify_c_2024-01-01 10")
            .await
            .unwrap();

        let at = Utc.with_ymd_and_hms(2024, 1, 1, 10, 30, 0).unwrap();
        let id = insert_due(&store, "notify", &[("name", "c")], at).await;

        let strategy = GroupingStrategy {
            method: "notify".to_string(),
            time_format: "%Y-%m-%d %H".to_string(),
            params: vec!["name".to_string()],
        };
        let handler = Arc::new(StubHandler::default());
        let (worker, _rx) = WorkerLoop::new(
            store.clone(),
            SharedHandler(handler.clone()),
            GroupingTable::new(vec![strategy]),
            test_config(10),
        );

        worker.warm_up().await.unwrap();
        worker.finish(fetch(&store, id).await).await.unwrap();
        worker.force_commit_age().await.unwrap();

        assert_eq!(handler.calls(), 0);
        assert!(fetch(&store, id).await.completed);
    }
}
