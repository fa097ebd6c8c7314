/// Job Manager - Cached, Cancellable Parallel Jobs
///
/// **Core Responsibility:**
/// Turn a list of work items into results through a bounded parallel pool,
/// skipping items whose results are already stored.
///
/// **Lifecycle of a run:**
/// 1. Remove stored records (overwrite mode) or retrieve cached ones
/// 2. Take the job's lock key; if we had to wait, retrieve again
/// 3. Per item: take the item key, re-check the cache, work, store
/// 4. Fold outcomes into a `JobOutput` and fire `on_success` on a clean run
///
/// **Error Classes:**
/// - Work errors are per item and land in `work_errors` (the pool keeps going)
/// - Retrieve/store/remove errors are system errors: they set `error`
///   and stop further dispatch
/// - Cancellation is not an error; it sets `canceled` and nothing more is stored
///
/// **Completion Modes:**
/// - `wait_for_completion`: `run` returns when everything is done
/// - `return_incomplete_results`: the caller gets the cached subset now, and a
///   detached task works the rest into a private output that is logged and dropped
/// - otherwise: a background task finishes the job and `JobHandle::wait` yields it

use crate::lockmanager::{KeyGuard, LockManager};
use crate::pool::run_parallel_pool;
use anyhow::{anyhow, bail, Result};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub type RetrieveFn<I, O> = Arc<dyn Fn(Vec<I>) -> BoxFuture<'static, Result<(Vec<O>, Vec<I>)>> + Send + Sync>;
pub type StoreFn<O> = Arc<dyn Fn(Vec<O>) -> BoxFuture<'static, Result<()>> + Send + Sync>;
pub type RemoveFn<I> = Arc<dyn Fn(Vec<I>) -> BoxFuture<'static, Result<()>> + Send + Sync>;
pub type WorkFn<I, O> = Arc<dyn Fn(I) -> BoxFuture<'static, Result<O>> + Send + Sync>;
pub type WorkItemKeyFn<I> = Arc<dyn Fn(&I) -> String + Send + Sync>;
pub type OnSuccessFn<I, O> = Arc<dyn Fn(&JobOutput<I, O>) + Send + Sync>;

/// User-level options for a job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct JobOptions {
    /// Don't store anything.
    pub dry_run: bool,

    /// Remove existing records before running.
    pub overwrite_records: bool,

    pub wait_for_completion: bool,

    #[serde(skip)]
    pub cancel: CancellationToken,
}

impl JobOptions {
    pub fn waiting() -> Self {
        Self {
            wait_for_completion: true,
            ..Default::default()
        }
    }
}

pub struct JobOutput<I, O> {
    pub canceled: bool,
    pub error: Option<anyhow::Error>,

    /// Keyed by the index of the failed item in `remaining_items`.
    pub work_errors: BTreeMap<usize, anyhow::Error>,

    pub result_items: Vec<O>,
    pub remaining_items: Vec<I>,

    /// Sum of successful work time in ms. Cache hits and lock waits are not charged.
    pub run_time: i64,
}

impl<I, O> Default for JobOutput<I, O> {
    fn default() -> Self {
        Self {
            canceled: false,
            error: None,
            work_errors: BTreeMap::new(),
            result_items: Vec::new(),
            remaining_items: Vec::new(),
            run_time: 0,
        }
    }
}

impl<I: Clone, O: Clone> JobOutput<I, O> {
    fn snapshot(&self) -> Self {
        Self {
            canceled: self.canceled,
            error: None,
            work_errors: BTreeMap::new(),
            result_items: self.result_items.clone(),
            remaining_items: self.remaining_items.clone(),
            run_time: self.run_time,
        }
    }
}

impl<I, O> JobOutput<I, O> {
    pub fn is_success(&self) -> bool {
        !self.canceled && self.error.is_none() && self.work_errors.is_empty()
    }
}

enum Completion<I, O> {
    Finished,
    Pending(oneshot::Receiver<JobOutput<I, O>>),
    Detached(JoinHandle<()>),
}

/// Returned by `Job::run`. The snapshot is stable; call `wait` for the final output.
pub struct JobHandle<I, O> {
    output: JobOutput<I, O>,
    completion: Completion<I, O>,
}

impl<I, O> JobHandle<I, O> {
    fn finished(output: JobOutput<I, O>) -> Self {
        Self {
            output,
            completion: Completion::Finished,
        }
    }

    /// The output as of `run` returning.
    pub fn output(&self) -> &JobOutput<I, O> {
        &self.output
    }

    pub fn is_done(&self) -> bool {
        match &self.completion {
            Completion::Finished => true,
            Completion::Pending(_) => false,
            Completion::Detached(handle) => handle.is_finished(),
        }
    }

    /// Wait for the job. A detached job yields the snapshot once its task ends.
    pub async fn wait(self) -> JobOutput<I, O> {
        match self.completion {
            Completion::Finished => self.output,
            Completion::Pending(receiver) => match receiver.await {
                Ok(output) => output,
                Err(_) => {
                    let mut output = self.output;
                    output.error = Some(anyhow!("Job task ended without reporting output"));
                    output
                }
            },
            Completion::Detached(handle) => {
                if let Err(err) = handle.await {
                    warn!(error = %err, "Detached job task failed");
                }
                self.output
            }
        }
    }
}

enum ItemOutcome<O> {
    Cached(O),
    Worked { result: O, run_time: i64 },
    WorkFailed(anyhow::Error),
    SystemFailed(anyhow::Error),
    Abandoned,
}

pub struct Job<I, O> {
    locks: Arc<LockManager>,
    options: JobOptions,
    pool_size: usize,
    lock_key: String,
    return_incomplete_results: bool,
    work_items: Vec<I>,

    work: WorkFn<I, O>,
    retrieve: Option<RetrieveFn<I, O>>,
    store: Option<StoreFn<O>>,
    remove: Option<RemoveFn<I>>,
    work_item_key: Option<WorkItemKeyFn<I>>,
    on_success: Option<OnSuccessFn<I, O>>,
}

impl<I, O> Job<I, O>
where
    I: Clone + Debug + Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
{
    pub fn new<F, Fut>(locks: Arc<LockManager>, options: JobOptions, pool_size: usize, work_items: Vec<I>, work: F) -> Self
    where
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
    {
        Self {
            locks,
            options,
            pool_size,
            lock_key: String::new(),
            return_incomplete_results: false,
            work_items,
            work: Arc::new(move |item| -> BoxFuture<'static, Result<O>> { Box::pin(work(item)) }),
            retrieve: None,
            store: None,
            remove: None,
            work_item_key: None,
            on_success: None,
        }
    }

    pub fn with_lock_key(mut self, lock_key: impl Into<String>) -> Self {
        self.lock_key = lock_key.into();
        self
    }

    pub fn with_return_incomplete_results(mut self, value: bool) -> Self {
        self.return_incomplete_results = value;
        self
    }

    /// Returns the stored results found and the items still needing work.
    pub fn with_retrieve<F, Fut>(mut self, retrieve: F) -> Self
    where
        F: Fn(Vec<I>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(Vec<O>, Vec<I>)>> + Send + 'static,
    {
        self.retrieve = Some(Arc::new(move |items| -> BoxFuture<'static, Result<(Vec<O>, Vec<I>)>> {
            Box::pin(retrieve(items))
        }));
        self
    }

    pub fn with_store<F, Fut>(mut self, store: F) -> Self
    where
        F: Fn(Vec<O>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.store = Some(Arc::new(move |results| -> BoxFuture<'static, Result<()>> { Box::pin(store(results)) }));
        self
    }

    pub fn with_remove<F, Fut>(mut self, remove: F) -> Self
    where
        F: Fn(Vec<I>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.remove = Some(Arc::new(move |items| -> BoxFuture<'static, Result<()>> { Box::pin(remove(items)) }));
        self
    }

    /// Items are locked individually under the returned key (empty means no lock).
    pub fn with_work_item_key(mut self, key: impl Fn(&I) -> String + Send + Sync + 'static) -> Self {
        self.work_item_key = Some(Arc::new(key));
        self
    }

    pub fn with_on_success(mut self, on_success: impl Fn(&JobOutput<I, O>) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(on_success));
        self
    }

    fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            bail!("Pool size must be positive, got {}", self.pool_size);
        }

        Ok(())
    }

    #[tracing::instrument(skip_all, fields(lock_key = %self.lock_key, items = self.work_items.len()))]
    pub async fn run(self) -> JobHandle<I, O> {
        let mut output = JobOutput {
            result_items: Vec::with_capacity(self.work_items.len()),
            remaining_items: self.work_items.clone(),
            ..Default::default()
        };

        if let Err(err) = self.validate() {
            output.error = Some(err.context("Failed to validate job"));
            return JobHandle::finished(output);
        }

        if self.options.overwrite_records && !self.options.dry_run {
            if let Some(remove) = &self.remove {
                if let Err(err) = remove(self.work_items.clone()).await {
                    output.error = Some(err.context("Failed to remove existing records"));
                    return JobHandle::finished(output);
                }
            }
        }

        if !self.options.overwrite_records {
            if let Some(retrieve) = &self.retrieve {
                match retrieve(self.work_items.clone()).await {
                    Ok((results, remaining)) => {
                        output.result_items = results;
                        output.remaining_items = remaining;
                    }
                    Err(err) => {
                        output.error = Some(err.context("Failed to retrieve stored records"));
                        return JobHandle::finished(output);
                    }
                }
            }
        }

        debug!(
            cached = output.result_items.len(),
            remaining = output.remaining_items.len(),
            "Job prepared"
        );

        let job = Arc::new(self);

        if job.options.wait_for_completion {
            let output = job.clone().process(output).await;
            job.finish(&output);
            return JobHandle::finished(output);
        }

        if job.return_incomplete_results {
            let snapshot = output.snapshot();
            let handle = tokio::spawn(async move {
                let output = job.clone().process(output).await;
                job.finish(&output);
            });

            return JobHandle {
                output: snapshot,
                completion: Completion::Detached(handle),
            };
        }

        let snapshot = output.snapshot();
        let (sender, receiver) = oneshot::channel();
        tokio::spawn(async move {
            let output = job.clone().process(output).await;
            job.finish(&output);
            // The receiver may have been dropped by a caller that does not care.
            let _ = sender.send(output);
        });

        JobHandle {
            output: snapshot,
            completion: Completion::Pending(receiver),
        }
    }

    fn finish(&self, output: &JobOutput<I, O>) {
        if let Some(err) = &output.error {
            error!(lock_key = %self.lock_key, error = %err, "Job finished with errors");
        }

        if output.canceled {
            info!(lock_key = %self.lock_key, "Job was cancelled");
        }

        if output.is_success() {
            if let Some(on_success) = &self.on_success {
                on_success(output);
            }
        }
    }

    async fn process(self: Arc<Self>, mut output: JobOutput<I, O>) -> JobOutput<I, O> {
        if output.remaining_items.is_empty() {
            return output;
        }

        let cancel = self.options.cancel.clone();

        let mut _job_guard: Option<KeyGuard> = None;
        let mut immediate = true;
        if !self.lock_key.is_empty() {
            tokio::select! {
                _ = cancel.cancelled() => {
                    output.canceled = true;
                    return output;
                }
                (guard, no_wait) = self.locks.lock_scoped(&self.lock_key) => {
                    _job_guard = Some(guard);
                    immediate = no_wait;
                }
            }
        }

        if cancel.is_cancelled() {
            output.canceled = true;
            return output;
        }

        // Another job may have produced results while we waited.
        if !immediate && !self.options.overwrite_records {
            if let Some(retrieve) = &self.retrieve {
                match retrieve(output.remaining_items.clone()).await {
                    Ok((results, remaining)) => {
                        output.result_items.extend(results);
                        output.remaining_items = remaining;
                    }
                    Err(err) => {
                        output.error = Some(err.context("Failed to re-check record storage before run"));
                        return output;
                    }
                }
            }
        }

        if output.remaining_items.is_empty() {
            return output;
        }

        let items = std::mem::take(&mut output.remaining_items);
        let pool_cancel = cancel.child_token();

        let worker = self.clone();
        let worker_cancel = pool_cancel.clone();
        let pool_output = run_parallel_pool(self.pool_size, items.clone(), pool_cancel, move |item| {
            let worker = worker.clone();
            let cancel = worker_cancel.clone();
            async move { worker.process_item(item, cancel).await }
        })
        .await;

        let pool_output = match pool_output {
            Ok(pool_output) => pool_output,
            Err(err) => {
                output.error = Some(err.context("Failed to run job in a parallel pool"));
                output.remaining_items = items;
                return output;
            }
        };

        let mut system_errors = Vec::new();
        for (item, outcome) in items.into_iter().zip(pool_output.results) {
            match outcome {
                Some(ItemOutcome::Cached(result)) => output.result_items.push(result),
                Some(ItemOutcome::Worked { result, run_time }) => {
                    output.result_items.push(result);
                    output.run_time += run_time;
                }
                Some(ItemOutcome::WorkFailed(err)) => {
                    output.work_errors.insert(output.remaining_items.len(), err);
                    output.remaining_items.push(item);
                }
                Some(ItemOutcome::SystemFailed(err)) => {
                    system_errors.push(format!("{:#}", err));
                    output.work_errors.insert(output.remaining_items.len(), err);
                    output.remaining_items.push(item);
                }
                Some(ItemOutcome::Abandoned) | None => output.remaining_items.push(item),
            }
        }

        if !system_errors.is_empty() {
            output.error = Some(anyhow!("System error while running job: {}", system_errors.join("; ")));
        } else if !output.work_errors.is_empty() {
            output.error = Some(anyhow!("{} work item(s) failed", output.work_errors.len()));
        }

        if cancel.is_cancelled() {
            output.canceled = true;
        }

        output
    }

    async fn process_item(&self, item: I, cancel: CancellationToken) -> ItemOutcome<O> {
        let key = self.work_item_key.as_ref().map(|key| key(&item)).unwrap_or_default();

        let mut _item_guard: Option<KeyGuard> = None;
        if !key.is_empty() {
            tokio::select! {
                _ = cancel.cancelled() => return ItemOutcome::Abandoned,
                (guard, _) = self.locks.lock_scoped(&key) => _item_guard = Some(guard),
            }
        }

        if cancel.is_cancelled() {
            return ItemOutcome::Abandoned;
        }

        if !self.options.overwrite_records {
            if let Some(retrieve) = &self.retrieve {
                match retrieve(vec![item.clone()]).await {
                    Ok((mut results, _)) if !results.is_empty() => return ItemOutcome::Cached(results.swap_remove(0)),
                    Ok(_) => {}
                    Err(err) => {
                        cancel.cancel();
                        return ItemOutcome::SystemFailed(err.context(format!("Failed to re-check storage for item {:?}", item)));
                    }
                }
            }
        }

        let start = Instant::now();
        let result = match (self.work)(item.clone()).await {
            Ok(result) => result,
            Err(_) if cancel.is_cancelled() => return ItemOutcome::Abandoned,
            Err(err) => {
                warn!(item = ?item, error = %err, "Work item failed");
                return ItemOutcome::WorkFailed(err.context(format!("Failed to perform individual work on item {:?}", item)));
            }
        };
        let run_time = (start.elapsed().as_millis() as i64).max(1);

        if cancel.is_cancelled() {
            return ItemOutcome::Abandoned;
        }

        if !self.options.dry_run {
            if let Some(store) = &self.store {
                if let Err(err) = store(vec![result.clone()]).await {
                    cancel.cancel();
                    return ItemOutcome::SystemFailed(err.context(format!("Failed to store result for item {:?}", item)));
                }
            }
        }

        ItemOutcome::Worked { result, run_time }
    }
}
