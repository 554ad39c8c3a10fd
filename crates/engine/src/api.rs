//! Public API for the worker pool.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, Notify};

use crate::chunker::{self, Chunks};
use crate::engine::{self, JobContext, JobEnd, JobRuntime, WorkerSet};
use crate::error::PoolError;
use crate::insights::{Insights, InsightsStore};
use crate::progress::{ProgressEnd, ProgressTracker};
use crate::state::WorkerState;
use crate::worker;

/// Capacity of the event stream returned by [`WorkerPool::subscribe`].
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Capacity of a job's result stream. A stalled consumer fills it, which
/// stalls the controller's in-order flush, which stops dispatch.
const OUTPUT_CHANNEL_CAPACITY: usize = 1024;

/// Pool-level configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of workers. Defaults to the number of available CPUs.
    pub n_jobs: usize,

    /// When `true` (the default), workers may not construct nested pools;
    /// the nested construction fails fast with an invalid-argument error.
    pub daemon: bool,

    /// CPU sets to pin workers to. Either one set applied to every worker,
    /// or exactly one set per worker. Pinning is Linux best-effort; a
    /// failed pin is reported as a warning event, not an error.
    pub cpu_ids: Option<Vec<Vec<usize>>>,

    /// Expose the worker index through [`TaskContext::worker_id`].
    pub pass_worker_id: bool,

    /// Give every worker life a private [`WorkerState`] bag, exposed
    /// through [`TaskContext::state`].
    pub use_worker_state: bool,

    /// Keep workers alive between map calls. Reuse only happens when the
    /// next call carries the same task (by identity), the same hooks and
    /// the same `worker_lifespan`; anything else tears the fleet down and
    /// starts fresh.
    pub keep_alive: bool,

    /// How long shutdown waits for workers to run their exit hooks and
    /// finish. Threads cannot be killed; a worker still running past the
    /// deadline is detached and reported.
    pub graceful_join_timeout: Duration,
}

impl PoolConfig {
    /// Default graceful join deadline.
    pub const DEFAULT_GRACEFUL_JOIN_TIMEOUT: Duration = Duration::from_secs(3);
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            n_jobs: mapforge_affinity::available_cpus(),
            daemon: true,
            cpu_ids: None,
            pass_worker_id: false,
            use_worker_state: false,
            keep_alive: false,
            graceful_join_timeout: Self::DEFAULT_GRACEFUL_JOIN_TIMEOUT,
        }
    }
}

/// Per-call options for the map variants.
#[derive(Debug, Clone, Default)]
pub struct MapOptions {
    /// Length hint for inputs that do not know their own size (generators).
    /// Lets the chunker divide evenly instead of falling back to
    /// single-element chunks.
    pub iterable_len: Option<usize>,

    /// Fixed chunk size; the last chunk may be shorter. Overrides
    /// `n_splits`.
    pub chunk_size: Option<usize>,

    /// Number of chunks to divide a sized input into. Defaults to
    /// `4 * n_jobs`.
    pub n_splits: Option<usize>,

    /// Cap on dispatched-but-uncollected chunks. Defaults to `2 * n_jobs`.
    pub max_tasks_active: Option<usize>,

    /// Tasks a worker may complete before it exits and is replaced by a
    /// fresh worker on the same index. Unlimited by default.
    pub worker_lifespan: Option<usize>,

    /// Render a progress bar while the job runs.
    pub progress_bar: bool,

    /// Line position of the progress bar, for stacking bars from
    /// concurrent pools.
    pub progress_bar_position: usize,

    /// Record per-worker timing insights for this job; see
    /// [`WorkerPool::insights`].
    pub enable_insights: bool,
}

impl MapOptions {
    fn validate(&self) -> Result<(), PoolError> {
        for (name, value) in [
            ("chunk_size", self.chunk_size),
            ("n_splits", self.n_splits),
            ("max_tasks_active", self.max_tasks_active),
            ("worker_lifespan", self.worker_lifespan),
        ] {
            if value == Some(0) {
                return Err(PoolError::InvalidArgument(format!(
                    "{name} must be a positive integer"
                )));
            }
        }
        Ok(())
    }

    fn resolved_max_active(&self, n_jobs: usize) -> usize {
        self.max_tasks_active.unwrap_or(2 * n_jobs).max(1)
    }
}

/// Worker lifecycle stage, as tracked by the controller and published on the
/// event stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WorkerStage {
    /// Thread spawned, not yet pinned.
    Starting,
    /// Running the init hook.
    Initializing,
    /// Blocked on the task channel.
    Idle,
    /// Executing a chunk.
    Running,
    /// Running the exit hook.
    Exiting,
    /// Life ended.
    Dead,
}

/// Pool event stream payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum PoolEvent {
    /// A map call started dispatching.
    JobStarted {
        /// Job counter, unique within the pool.
        job_id: u64,
    },
    /// A worker changed lifecycle stage.
    WorkerStage {
        /// Worker index (0-based).
        worker_id: usize,
        /// New stage.
        stage: WorkerStage,
    },
    /// A worker completed a chunk.
    ChunkCompleted {
        /// Worker index (0-based).
        worker_id: usize,
        /// Chunk id within the job.
        chunk_id: u64,
        /// Number of tasks in the chunk.
        n_tasks: u64,
    },
    /// A lifespan-exhausted worker was replaced on its index.
    WorkerRecycled {
        /// Worker index (0-based).
        worker_id: usize,
        /// Lives spent on this index so far, the fresh one included.
        lives: u32,
    },
    /// A non-fatal problem (for example a failed CPU pin).
    Warning {
        /// Warning message.
        message: String,
    },
    /// The job latched its first error and is shutting down.
    JobAborting {
        /// The latched error, rendered.
        message: String,
    },
    /// The job finished; the error (if any) is delivered on the result
    /// stream, not here.
    JobFinished {
        /// Job counter, unique within the pool.
        job_id: u64,
        /// Total tasks completed.
        n_tasks: u64,
    },
}

/// Cooperative cancellation handle for the pool's running job.
///
/// Cloneable and usable from signal handlers: [`abort`](Self::abort) flags
/// the job, the controller stops feeding work, tells workers to terminate
/// and surfaces [`PoolError::Cancelled`] to the caller.
#[derive(Debug, Clone)]
pub struct AbortToken {
    inner: Arc<AbortInner>,
}

#[derive(Debug)]
struct AbortInner {
    flag: AtomicBool,
    notify: Notify,
}

impl AbortToken {
    fn new() -> Self {
        Self {
            inner: Arc::new(AbortInner {
                flag: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Cancel the running job.
    pub fn abort(&self) {
        if !self.inner.flag.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_one();
        }
    }

    /// Whether an abort was requested.
    pub fn is_aborted(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    pub(crate) async fn aborted(&self) {
        while !self.is_aborted() {
            self.inner.notify.notified().await;
        }
    }

    pub(crate) fn reset(&self) {
        self.inner.flag.store(false, Ordering::SeqCst);
    }
}

/// The call context handed to the task function and the lifecycle hooks.
///
/// Which parts are populated follows the pool configuration: `worker_id`
/// needs [`PoolConfig::pass_worker_id`], `state` needs
/// [`PoolConfig::use_worker_state`], `shared` needs the pool to have been
/// built with [`WorkerPool::with_shared`].
pub struct TaskContext<'a, Sh> {
    worker_id: Option<usize>,
    shared: Option<&'a Sh>,
    state: Option<&'a mut WorkerState>,
}

impl<'a, Sh> TaskContext<'a, Sh> {
    pub(crate) fn new(
        worker_id: Option<usize>,
        shared: Option<&'a Sh>,
        state: Option<&'a mut WorkerState>,
    ) -> Self {
        Self {
            worker_id,
            shared,
            state,
        }
    }

    /// Index of the worker running this call, in `0..n_jobs`. Stable across
    /// recycles of the same slot.
    pub fn worker_id(&self) -> Option<usize> {
        self.worker_id
    }

    /// The pool-wide shared objects.
    pub fn shared(&self) -> Option<&Sh> {
        self.shared
    }

    /// This worker life's private state bag.
    pub fn state(&mut self) -> Option<&mut WorkerState> {
        self.state.as_deref_mut()
    }
}

type TaskFn<T, R, Sh> =
    dyn Fn(&mut TaskContext<'_, Sh>, T) -> anyhow::Result<R> + Send + Sync;
type InitFn<Sh> = dyn Fn(&mut TaskContext<'_, Sh>) -> anyhow::Result<()> + Send + Sync;
type ExitFn<Sh, E> = dyn Fn(&mut TaskContext<'_, Sh>) -> anyhow::Result<E> + Send + Sync;

pub(crate) struct JobFns<T, R, Sh, E> {
    pub(crate) task: Arc<TaskFn<T, R, Sh>>,
    pub(crate) init: Option<Arc<InitFn<Sh>>>,
    pub(crate) exit: Option<Arc<ExitFn<Sh, E>>>,
}

impl<T, R, Sh, E> Clone for JobFns<T, R, Sh, E> {
    fn clone(&self) -> Self {
        Self {
            task: self.task.clone(),
            init: self.init.clone(),
            exit: self.exit.clone(),
        }
    }
}

/// A task: the user function plus optional per-worker lifecycle hooks.
///
/// Functions are stored behind `Arc`s; passing the same `Task` value to
/// consecutive map calls is what makes a `keep_alive` pool recognize the
/// job signature and reuse its warm workers.
pub struct Task<T, R, Sh = (), E = ()> {
    pub(crate) fns: JobFns<T, R, Sh, E>,
}

impl<T, R, Sh, E> Clone for Task<T, R, Sh, E> {
    fn clone(&self) -> Self {
        Self {
            fns: self.fns.clone(),
        }
    }
}

impl<T, R, Sh, E> Task<T, R, Sh, E> {
    /// A task from a fallible function taking the call context.
    pub fn new(
        f: impl Fn(&mut TaskContext<'_, Sh>, T) -> anyhow::Result<R> + Send + Sync + 'static,
    ) -> Self {
        Self {
            fns: JobFns {
                task: Arc::new(f),
                init: None,
                exit: None,
            },
        }
    }

    /// A task from a plain infallible function.
    pub fn from_fn(f: impl Fn(T) -> R + Send + Sync + 'static) -> Self {
        Self::new(move |_ctx, item| Ok(f(item)))
    }

    /// Attach a `worker_init` hook, run once at the start of every worker
    /// life with a fresh state bag.
    pub fn with_init(
        mut self,
        f: impl Fn(&mut TaskContext<'_, Sh>) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.fns.init = Some(Arc::new(f));
        self
    }

    /// Attach a `worker_exit` hook, run once at the end of every worker
    /// life; its return values are collected into
    /// [`WorkerPool::exit_results`].
    pub fn with_exit(
        mut self,
        f: impl Fn(&mut TaskContext<'_, Sh>) -> anyhow::Result<E> + Send + Sync + 'static,
    ) -> Self {
        self.fns.exit = Some(Arc::new(f));
        self
    }
}

/// Identity of a job's functions and lifespan; drives `keep_alive` reuse.
#[derive(Debug, Clone, PartialEq, Eq)]
struct JobSignature {
    task_fn: usize,
    init_fn: Option<usize>,
    exit_fn: Option<usize>,
    lifespan: Option<usize>,
}

impl JobSignature {
    fn of<T, R, Sh, E>(task: &Task<T, R, Sh, E>, lifespan: Option<usize>) -> Self {
        Self {
            task_fn: Arc::as_ptr(&task.fns.task) as *const () as usize,
            init_fn: task
                .fns
                .init
                .as_ref()
                .map(|f| Arc::as_ptr(f) as *const () as usize),
            exit_fn: task
                .fns
                .exit
                .as_ref()
                .map(|f| Arc::as_ptr(f) as *const () as usize),
            lifespan,
        }
    }
}

/// Lazy result stream returned by [`WorkerPool::imap`] and
/// [`WorkerPool::imap_unordered`].
///
/// At most one `Err` is ever yielded — the job's first failure — after
/// which the stream is exhausted. Dropping the stream early cancels the
/// job.
pub struct MapResults<R> {
    rx: mpsc::Receiver<Result<R, PoolError>>,
    done: bool,
}

impl<R> MapResults<R> {
    /// Next result, in input order for the ordered variants and arrival
    /// order otherwise. `None` once the job is finished.
    pub async fn next(&mut self) -> Option<Result<R, PoolError>> {
        if self.done {
            return None;
        }
        match self.rx.recv().await {
            Some(Ok(value)) => Some(Ok(value)),
            Some(Err(error)) => {
                self.done = true;
                self.rx.close();
                Some(Err(error))
            }
            None => {
                self.done = true;
                None
            }
        }
    }

    /// Drain the stream into a vector, or the job's error.
    pub async fn collect(mut self) -> Result<Vec<R>, PoolError> {
        let mut out = Vec::new();
        while let Some(item) = self.next().await {
            out.push(item?);
        }
        Ok(out)
    }
}

/// A pool of worker threads evaluating one task function over chunks of
/// input.
///
/// Type parameters: `T` input element, `R` output element, `Sh` the shared
/// objects published to every worker, `E` the exit-hook payload.
///
/// Dropping the pool tears workers down best-effort (exit hooks still run
/// on their own threads, but results are lost); use
/// [`stop_and_join`](Self::stop_and_join) for a clean shutdown.
pub struct WorkerPool<T, R, Sh = (), E = ()> {
    config: PoolConfig,
    cpu_ids: Option<Vec<Vec<usize>>>,
    shared: Option<Arc<Sh>>,
    workers: Option<WorkerSet<T, R, E>>,
    prev_signature: Option<JobSignature>,
    reclaim: Option<tokio::task::JoinHandle<JobEnd<T, R, E>>>,
    exit_results: Vec<E>,
    insights: Arc<InsightsStore>,
    events: broadcast::Sender<PoolEvent>,
    abort: AbortToken,
    next_job_id: u64,
}

impl<T, R, Sh, E> WorkerPool<T, R, Sh, E>
where
    T: Send + fmt::Debug + 'static,
    R: Send + 'static,
    Sh: Send + Sync + 'static,
    E: Send + 'static,
{
    /// Create a pool without shared objects.
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        Self::build(config, None)
    }

    /// Create a pool whose workers all see `shared` through
    /// [`TaskContext::shared`]. The pool never mutates it; treating it as
    /// read-only is the contract with the task function.
    pub fn with_shared(config: PoolConfig, shared: Sh) -> Result<Self, PoolError> {
        Self::build(config, Some(Arc::new(shared)))
    }

    fn build(config: PoolConfig, shared: Option<Arc<Sh>>) -> Result<Self, PoolError> {
        if worker::current_worker_daemon() == Some(true) {
            return Err(PoolError::InvalidArgument(
                "workers of a daemonic pool cannot spawn nested pools".to_string(),
            ));
        }
        if config.n_jobs == 0 {
            return Err(PoolError::InvalidArgument(
                "n_jobs must be a positive integer".to_string(),
            ));
        }
        let cpu_ids = match &config.cpu_ids {
            None => None,
            Some(sets) => Some(validate_cpu_ids(sets, config.n_jobs)?),
        };

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let insights = Arc::new(InsightsStore::new(config.n_jobs));
        Ok(Self {
            config,
            cpu_ids,
            shared,
            workers: None,
            prev_signature: None,
            reclaim: None,
            exit_results: Vec::new(),
            insights,
            events,
            abort: AbortToken::new(),
            next_job_id: 0,
        })
    }

    /// Subscribe to the pool event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    /// Cancellation handle for this pool's jobs.
    pub fn abort_token(&self) -> AbortToken {
        self.abort.clone()
    }

    /// Insights recorded by the most recent job that ran with
    /// [`MapOptions::enable_insights`]; `None` when the last job had them
    /// off. After a streaming call, consume the stream (or call
    /// [`wait`](Self::wait)) first.
    pub fn insights(&self) -> Option<Insights> {
        self.insights.summarize()
    }

    /// Exit-hook results from the most recently torn down worker fleet, in
    /// arrival order. With `keep_alive`, workers only run their exit hooks
    /// on teardown, so call [`stop_and_join`](Self::stop_and_join) first.
    pub fn exit_results(&self) -> &[E] {
        &self.exit_results
    }

    /// Take ownership of the collected exit results.
    pub fn take_exit_results(&mut self) -> Vec<E> {
        std::mem::take(&mut self.exit_results)
    }

    /// Ordered, eager: evaluate the task over every element and return the
    /// outputs in input order.
    pub async fn map<I>(
        &mut self,
        task: &Task<T, R, Sh, E>,
        items: I,
        options: &MapOptions,
    ) -> Result<Vec<R>, PoolError>
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        let results = self.start_job(task, items, options, true).await?;
        let collected = results.collect().await;
        self.settle().await?;
        collected
    }

    /// Unordered, eager: like [`map`](Self::map) but outputs come back in
    /// completion order.
    pub async fn map_unordered<I>(
        &mut self,
        task: &Task<T, R, Sh, E>,
        items: I,
        options: &MapOptions,
    ) -> Result<Vec<R>, PoolError>
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        let results = self.start_job(task, items, options, false).await?;
        let collected = results.collect().await;
        self.settle().await?;
        collected
    }

    /// Ordered, streaming: results are yielded in input order as they
    /// become available.
    pub async fn imap<I>(
        &mut self,
        task: &Task<T, R, Sh, E>,
        items: I,
        options: &MapOptions,
    ) -> Result<MapResults<R>, PoolError>
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        self.start_job(task, items, options, true).await
    }

    /// Unordered, streaming: results are yielded in completion order.
    pub async fn imap_unordered<I>(
        &mut self,
        task: &Task<T, R, Sh, E>,
        items: I,
        options: &MapOptions,
    ) -> Result<MapResults<R>, PoolError>
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        self.start_job(task, items, options, false).await
    }

    /// Wait for the in-flight job (if any) to finish and reclaim its
    /// workers. Eager calls do this internally; after consuming a
    /// streaming call, use this before reading exit results or insights.
    pub async fn wait(&mut self) -> Result<(), PoolError> {
        self.settle().await
    }

    /// Gracefully stop the pool: run exit hooks, collect their results,
    /// join all workers.
    pub async fn stop_and_join(&mut self) -> Result<(), PoolError> {
        self.settle().await?;
        if let Some(set) = self.workers.take() {
            let (exit_results, error) =
                engine::teardown_worker_set(set, self.config.graceful_join_timeout).await;
            self.exit_results = exit_results;
            self.prev_signature = None;
            if let Some(error) = error {
                return Err(error);
            }
        }
        Ok(())
    }

    async fn start_job<I>(
        &mut self,
        task: &Task<T, R, Sh, E>,
        items: I,
        options: &MapOptions,
        ordered: bool,
    ) -> Result<MapResults<R>, PoolError>
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        options.validate()?;
        self.settle().await?;

        let iter = items.into_iter();
        let total = options.iterable_len.or_else(|| chunker::exact_len(&iter));
        let chunk_size = chunker::resolve_chunk_size(
            total,
            self.config.n_jobs,
            options.chunk_size,
            options.n_splits,
        );
        let mut chunks = Chunks::new(Box::new(iter), chunk_size);
        let first_chunk = chunks.next();

        self.insights.reset(options.enable_insights);

        let Some(first_chunk) = first_chunk else {
            // Empty input: done before any worker is touched.
            if options.progress_bar {
                let tracker = ProgressTracker::start(Some(0), options.progress_bar_position);
                tracker.finish(ProgressEnd::Completed).await;
            }
            self.insights.mark_finished();
            let (_closed_tx, rx) = mpsc::channel(1);
            return Ok(MapResults { rx, done: false });
        };

        let signature = JobSignature::of(task, options.worker_lifespan);
        let ctx = JobContext {
            fns: task.fns.clone(),
            shared: self.shared.clone(),
            pass_worker_id: self.config.pass_worker_id,
            use_worker_state: self.config.use_worker_state,
            daemon: self.config.daemon,
            lifespan: options.worker_lifespan,
            cpu_ids: self.cpu_ids.clone(),
            insights: self.insights.clone(),
        };

        let workers = match self.workers.take() {
            Some(set)
                if self.config.keep_alive
                    && self.prev_signature.as_ref() == Some(&signature)
                    && set.all_alive() =>
            {
                set
            }
            Some(set) => {
                let (exit_results, error) =
                    engine::teardown_worker_set(set, self.config.graceful_join_timeout).await;
                self.exit_results = exit_results;
                if let Some(error) = error {
                    return Err(error);
                }
                engine::spawn_worker_set(&ctx, self.config.n_jobs, &self.events)?
            }
            None => engine::spawn_worker_set(&ctx, self.config.n_jobs, &self.events)?,
        };
        self.prev_signature = Some(signature);
        self.abort.reset();

        let progress = options.progress_bar.then(|| {
            ProgressTracker::start(total.map(|t| t as u64), options.progress_bar_position)
        });
        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);

        let job_id = self.next_job_id;
        self.next_job_id += 1;

        let runtime = JobRuntime::new(
            job_id,
            ctx,
            workers,
            chunks,
            Some(first_chunk),
            options.resolved_max_active(self.config.n_jobs),
            ordered,
            self.config.keep_alive,
            self.config.graceful_join_timeout,
            output_tx,
            self.abort.clone(),
            progress,
            self.events.clone(),
        );
        self.reclaim = Some(tokio::spawn(runtime.run()));

        Ok(MapResults {
            rx: output_rx,
            done: false,
        })
    }

    /// Reclaim the previous job's workers and exit results.
    async fn settle(&mut self) -> Result<(), PoolError> {
        let Some(handle) = self.reclaim.take() else {
            return Ok(());
        };
        match handle.await {
            Ok(end) => {
                match end.workers {
                    Some(set) => self.workers = Some(set),
                    None => {
                        self.workers = None;
                        self.exit_results = end.exit_results;
                    }
                }
                Ok(())
            }
            Err(err) => Err(PoolError::Internal(format!(
                "job controller task failed: {err}"
            ))),
        }
    }
}

fn validate_cpu_ids(sets: &[Vec<usize>], n_jobs: usize) -> Result<Vec<Vec<usize>>, PoolError> {
    if sets.len() != 1 && sets.len() != n_jobs {
        return Err(PoolError::InvalidArgument(format!(
            "cpu_ids must have length 1 or n_jobs ({n_jobs}), got {}",
            sets.len()
        )));
    }
    let n_cpus = mapforge_affinity::available_cpus();
    for set in sets {
        if set.is_empty() {
            return Err(PoolError::InvalidArgument(
                "cpu_ids entries must not be empty".to_string(),
            ));
        }
        for &cpu in set {
            if cpu >= n_cpus {
                return Err(PoolError::InvalidArgument(format!(
                    "CPU id {cpu} out of range (have {n_cpus} CPUs)"
                )));
            }
        }
    }
    if sets.len() == 1 {
        Ok(vec![sets[0].clone(); n_jobs])
    } else {
        Ok(sets.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Kwargs;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn config(n_jobs: usize) -> PoolConfig {
        PoolConfig {
            n_jobs,
            ..PoolConfig::default()
        }
    }

    fn test_data() -> Vec<(u64, u64)> {
        [1, 2, 3, 5, 6, 9, 37, 42, 1337, 0, 3, 5, 0]
            .into_iter()
            .enumerate()
            .map(|(i, x)| (i as u64, x))
            .collect()
    }

    fn expected_squares() -> Vec<(u64, u64)> {
        test_data().into_iter().map(|(i, x)| (i, x * x)).collect()
    }

    fn square_task() -> Task<(u64, u64), (u64, u64)> {
        Task::from_fn(|(i, x): (u64, u64)| (i, x * x))
    }

    #[tokio::test]
    async fn map_preserves_input_order() {
        let mut pool = WorkerPool::new(config(2)).unwrap();
        let task = square_task();

        let results = pool
            .map(&task, test_data(), &MapOptions::default())
            .await
            .unwrap();
        assert_eq!(results, expected_squares());
        assert_eq!(
            results[8],
            (8, 1_787_569),
            "1337^2 lands on the slot its input held"
        );
    }

    #[tokio::test]
    async fn map_matches_for_every_chunking_config() {
        let task = square_task();
        for n_jobs in [1, 2, 4] {
            for (chunk_size, n_splits, max_active, lifespan) in [
                (None, None, None, None),
                (Some(3), None, Some(2), None),
                (None, Some(3), None, Some(2)),
                (Some(1), None, Some(2), Some(1)),
            ] {
                let mut pool = WorkerPool::new(config(n_jobs)).unwrap();
                let options = MapOptions {
                    chunk_size,
                    n_splits,
                    max_tasks_active: max_active,
                    worker_lifespan: lifespan,
                    ..MapOptions::default()
                };
                let results = pool.map(&task, test_data(), &options).await.unwrap();
                assert_eq!(results, expected_squares(), "n_jobs={n_jobs}");
            }
        }
    }

    #[tokio::test]
    async fn map_unordered_is_a_permutation_of_map() {
        let mut pool = WorkerPool::new(config(4)).unwrap();
        let task = square_task();
        let options = MapOptions {
            chunk_size: Some(1),
            ..MapOptions::default()
        };

        let mut unordered = pool.map_unordered(&task, test_data(), &options).await.unwrap();
        unordered.sort();
        let mut ordered = expected_squares();
        ordered.sort();
        assert_eq!(unordered, ordered);
    }

    #[tokio::test]
    async fn imap_streams_in_input_order() {
        let mut pool = WorkerPool::new(config(2)).unwrap();
        let task = square_task();

        let mut results = pool
            .imap(&task, test_data(), &MapOptions::default())
            .await
            .unwrap();
        let mut collected = Vec::new();
        while let Some(item) = results.next().await {
            collected.push(item.unwrap());
        }
        assert_eq!(collected, expected_squares());
        pool.wait().await.unwrap();
    }

    #[tokio::test]
    async fn imap_unordered_yields_every_result() {
        let mut pool = WorkerPool::new(config(4)).unwrap();
        let task = square_task();

        let results = pool
            .imap_unordered(&task, test_data(), &MapOptions::default())
            .await
            .unwrap();
        let mut collected = results.collect().await.unwrap();
        collected.sort();
        let mut expected = expected_squares();
        expected.sort();
        assert_eq!(collected, expected);
        pool.wait().await.unwrap();
    }

    #[tokio::test]
    async fn unsized_input_works_with_and_without_length_hint() {
        let mut pool = WorkerPool::new(config(2)).unwrap();
        let task = square_task();

        // `filter` hides the exact size, forcing the chunker fallbacks.
        let results = pool
            .map(
                &task,
                test_data().into_iter().filter(|_| true),
                &MapOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(results, expected_squares());

        let options = MapOptions {
            iterable_len: Some(13),
            n_splits: Some(3),
            ..MapOptions::default()
        };
        let results = pool
            .map(&task, test_data().into_iter().filter(|_| true), &options)
            .await
            .unwrap();
        assert_eq!(results, expected_squares());
    }

    #[tokio::test]
    async fn empty_input_completes_without_touching_workers() {
        let inits = Arc::new(AtomicUsize::new(0));
        let inits_in_task = inits.clone();
        let task = Task::<(u64, u64), (u64, u64)>::from_fn(|(i, x)| (i, x * x)).with_init(
            move |_ctx| {
                inits_in_task.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        );

        let mut pool = WorkerPool::new(config(4)).unwrap();
        let options = MapOptions {
            progress_bar: true,
            ..MapOptions::default()
        };
        let results = pool.map(&task, Vec::new(), &options).await.unwrap();
        assert!(results.is_empty());
        assert_eq!(inits.load(Ordering::SeqCst), 0);
    }

    #[derive(Debug, thiserror::Error)]
    #[error("cannot square {0}")]
    struct SquareError(u64);

    fn failing_task() -> Task<(u64, u64), (u64, u64)> {
        Task::new(|_ctx, (i, x): (u64, u64)| {
            if i == 5 {
                return Err(anyhow::Error::new(SquareError(x)));
            }
            Ok((i, x * x))
        })
    }

    #[tokio::test]
    async fn eager_map_surfaces_the_original_error() {
        let mut pool = WorkerPool::new(config(2)).unwrap();
        let err = pool
            .map(&failing_task(), test_data(), &MapOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, PoolError::TaskFailed(_)));
        assert_eq!(err.downcast_user_error::<SquareError>().map(|e| e.0), Some(9));
        let report = err.failure().unwrap();
        assert!(report.args.as_deref().unwrap().contains('9'));
        assert!(!report.backtrace.is_empty());
    }

    #[tokio::test]
    async fn streaming_map_yields_a_prefix_then_the_error() {
        let mut pool = WorkerPool::new(config(2)).unwrap();
        let options = MapOptions {
            chunk_size: Some(1),
            ..MapOptions::default()
        };
        let mut results = pool
            .imap(&failing_task(), test_data(), &options)
            .await
            .unwrap();

        let expected = expected_squares();
        let mut yielded = 0;
        loop {
            match results.next().await {
                Some(Ok(value)) => {
                    assert_eq!(value, expected[yielded]);
                    yielded += 1;
                }
                Some(Err(err)) => {
                    assert!(matches!(err, PoolError::TaskFailed(_)));
                    break;
                }
                None => panic!("stream ended without surfacing the failure"),
            }
        }
        assert!(yielded <= 5, "failure on index 5 allows at most 5 outputs");
        assert!(results.next().await.is_none());
        pool.wait().await.unwrap();
    }

    #[tokio::test]
    async fn keyword_arguments_adapt_and_fail_cleanly() {
        let task = Task::<Kwargs, i64>::new(|_ctx, kw| {
            let x: i64 = kw.get("x")?;
            let y: i64 = kw.get("y")?;
            Ok(x - y)
        });
        let mut pool = WorkerPool::new(config(2)).unwrap();

        let inputs = vec![
            Kwargs::new().set("x", 5).set("y", 2),
            Kwargs::new().set("y", 5).set("x", 2),
        ];
        let results = pool.map(&task, inputs, &MapOptions::default()).await.unwrap();
        assert_eq!(results, vec![3, -3]);

        let bad = vec![Kwargs::new().set("x", 5).set("z", 2)];
        let err = pool.map(&task, bad, &MapOptions::default()).await.unwrap_err();
        assert!(err.to_string().contains("missing argument `y`"));
    }

    #[tokio::test]
    async fn init_and_exit_hooks_balance_across_recycles() {
        let inits = Arc::new(AtomicUsize::new(0));
        let exits = Arc::new(AtomicUsize::new(0));
        let (inits_hook, exits_hook) = (inits.clone(), exits.clone());

        let task = Task::<(u64, u64), (u64, u64), (), u64>::from_fn(|(i, x)| (i, x * x))
            .with_init(move |_ctx| {
                inits_hook.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .with_exit(move |_ctx| {
                exits_hook.fetch_add(1, Ordering::SeqCst);
                Ok(0)
            });

        let n_jobs = 4;
        let mut pool = WorkerPool::new(config(n_jobs)).unwrap();
        let options = MapOptions {
            chunk_size: Some(1),
            worker_lifespan: Some(1),
            ..MapOptions::default()
        };
        let results = pool.map(&task, test_data(), &options).await.unwrap();
        assert_eq!(results, expected_squares());

        let n_inits = inits.load(Ordering::SeqCst);
        assert_eq!(n_inits, exits.load(Ordering::SeqCst));
        assert!(
            (test_data().len()..=test_data().len() + n_jobs).contains(&n_inits),
            "one life per task, plus up to one idle replacement per worker; got {n_inits}"
        );
    }

    #[tokio::test]
    async fn exit_results_carry_large_payloads() {
        const BLOB: usize = 10 * 1024 * 1024;
        let task = Task::<u64, u64, (), Vec<u8>>::from_fn(|x| x)
            .with_exit(|_ctx| Ok(vec![0_u8; BLOB]));

        let mut pool = WorkerPool::new(config(4)).unwrap();
        pool.map(&task, 0..8_u64, &MapOptions::default()).await.unwrap();

        let blobs = pool.take_exit_results();
        assert_eq!(blobs.len(), 4);
        assert!(blobs.iter().all(|b| b.len() == BLOB));
    }

    #[tokio::test]
    async fn in_flight_work_respects_max_tasks_active() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (current_in_task, peak_in_task) = (current.clone(), peak.clone());

        let task = Task::<u64, u64>::from_fn(move |x| {
            let now = current_in_task.fetch_add(1, Ordering::SeqCst) + 1;
            peak_in_task.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(2));
            current_in_task.fetch_sub(1, Ordering::SeqCst);
            x
        });

        let mut pool = WorkerPool::new(config(4)).unwrap();
        let options = MapOptions {
            chunk_size: Some(1),
            max_tasks_active: Some(2),
            ..MapOptions::default()
        };
        pool.map(&task, 0..20_u64, &options).await.unwrap();

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn keep_alive_reuses_workers_until_the_signature_changes() {
        let inits = Arc::new(AtomicUsize::new(0));
        let make_task = |inits: Arc<AtomicUsize>| {
            Task::<(u64, u64), (u64, u64)>::from_fn(|(i, x)| (i, x * x)).with_init(move |_ctx| {
                inits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };
        let task_a = make_task(inits.clone());
        let task_b = make_task(inits.clone());

        let n_jobs = 2;
        let mut pool = WorkerPool::new(PoolConfig {
            n_jobs,
            keep_alive: true,
            ..PoolConfig::default()
        })
        .unwrap();
        let options = MapOptions::default();

        pool.map(&task_a, test_data(), &options).await.unwrap();
        assert_eq!(inits.load(Ordering::SeqCst), n_jobs);

        // Same task, same hooks, same lifespan: the warm fleet is reused.
        pool.map(&task_a, test_data(), &options).await.unwrap();
        assert_eq!(inits.load(Ordering::SeqCst), n_jobs);

        // A different function identity forces a fresh fleet.
        pool.map(&task_b, test_data(), &options).await.unwrap();
        assert_eq!(inits.load(Ordering::SeqCst), 2 * n_jobs);

        // A changed lifespan does too, even with the same task.
        let options = MapOptions {
            worker_lifespan: Some(100),
            ..MapOptions::default()
        };
        pool.map(&task_b, test_data(), &options).await.unwrap();
        assert_eq!(inits.load(Ordering::SeqCst), 3 * n_jobs);

        pool.stop_and_join().await.unwrap();
    }

    #[tokio::test]
    async fn without_keep_alive_every_map_call_restarts_workers() {
        let inits = Arc::new(AtomicUsize::new(0));
        let inits_hook = inits.clone();
        let task = Task::<(u64, u64), (u64, u64)>::from_fn(|(i, x)| (i, x * x)).with_init(
            move |_ctx| {
                inits_hook.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        );

        let n_jobs = 2;
        let mut pool = WorkerPool::new(config(n_jobs)).unwrap();
        for round in 1..=3 {
            pool.map(&task, test_data(), &MapOptions::default()).await.unwrap();
            assert_eq!(inits.load(Ordering::SeqCst), round * n_jobs);
        }
    }

    #[tokio::test]
    async fn keep_alive_exit_results_arrive_on_stop() {
        let task = Task::<u64, u64, (), usize>::from_fn(|x| x)
            .with_exit(|ctx| Ok(ctx.worker_id().unwrap_or(usize::MAX)));

        let mut pool = WorkerPool::new(PoolConfig {
            n_jobs: 3,
            keep_alive: true,
            pass_worker_id: true,
            ..PoolConfig::default()
        })
        .unwrap();

        pool.map(&task, 0..12_u64, &MapOptions::default()).await.unwrap();
        assert!(pool.exit_results().is_empty(), "workers are still warm");

        pool.stop_and_join().await.unwrap();
        let mut ids = pool.take_exit_results();
        ids.sort();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn worker_id_passthrough() {
        let n_jobs = 3;
        let task = Task::<u64, Option<usize>>::new(|ctx, _x| Ok(ctx.worker_id()));

        let mut pool = WorkerPool::new(PoolConfig {
            n_jobs,
            pass_worker_id: true,
            ..PoolConfig::default()
        })
        .unwrap();
        let results = pool.map(&task, 0..20_u64, &MapOptions::default()).await.unwrap();
        assert!(results.iter().all(|id| id.is_some_and(|id| id < n_jobs)));

        let mut plain = WorkerPool::new(config(2)).unwrap();
        let results = plain.map(&task, 0..4_u64, &MapOptions::default()).await.unwrap();
        assert!(results.iter().all(Option::is_none));
    }

    #[tokio::test]
    async fn worker_state_persists_across_tasks_within_a_life() {
        let task = Task::<u64, u64>::new(|ctx, _x| {
            let state = ctx.state().ok_or_else(|| anyhow::anyhow!("state missing"))?;
            if !state.contains("count") {
                state.insert("count", 0_u64);
            }
            let count = state
                .get_mut::<u64>("count")
                .ok_or_else(|| anyhow::anyhow!("count missing"))?;
            *count += 1;
            Ok(*count)
        });

        let mut pool = WorkerPool::new(PoolConfig {
            n_jobs: 1,
            use_worker_state: true,
            ..PoolConfig::default()
        })
        .unwrap();
        let results = pool.map(&task, 0..13_u64, &MapOptions::default()).await.unwrap();
        assert_eq!(results, (1..=13).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn shared_objects_are_visible_to_every_worker() {
        let task = Task::<u64, u64, Arc<AtomicUsize>>::new(|ctx, x| {
            let shared = ctx.shared().ok_or_else(|| anyhow::anyhow!("shared missing"))?;
            shared.fetch_add(1, Ordering::SeqCst);
            Ok(x)
        });

        let counter = Arc::new(AtomicUsize::new(0));
        let mut pool = WorkerPool::with_shared(config(3), counter.clone()).unwrap();
        pool.map(&task, 0..13_u64, &MapOptions::default()).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 13);
    }

    #[tokio::test]
    async fn init_failure_aborts_the_job() {
        let task = Task::<u64, u64>::from_fn(|x| x)
            .with_init(|_ctx| Err(anyhow::anyhow!("no database connection")));
        let mut pool = WorkerPool::new(config(2)).unwrap();

        let err = pool
            .map(&task, 0..13_u64, &MapOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::InitFailed(_)));
        assert!(err.to_string().contains("no database connection"));
    }

    #[tokio::test]
    async fn exit_failure_surfaces_after_a_successful_run() {
        let task = Task::<u64, u64, (), u64>::from_fn(|x| x)
            .with_exit(|_ctx| Err(anyhow::anyhow!("flush failed")));
        let mut pool = WorkerPool::new(config(2)).unwrap();

        let err = pool
            .map(&task, 0..13_u64, &MapOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::ExitFailed(_)));
    }

    #[tokio::test]
    async fn panics_in_user_code_become_task_errors() {
        let task = Task::<u64, u64>::from_fn(|x| {
            if x == 7 {
                panic!("seven is right out");
            }
            x
        });
        let mut pool = WorkerPool::new(config(2)).unwrap();

        let err = pool
            .map(&task, 0..13_u64, &MapOptions::default())
            .await
            .unwrap_err();
        let report = match err {
            PoolError::TaskFailed(report) => report,
            other => panic!("expected TaskFailed, got {other:?}"),
        };
        assert!(report.message.contains("seven is right out"));
        assert!(report.source.is_none());
    }

    #[tokio::test]
    async fn abort_token_cancels_a_running_job() {
        let task = Task::<u64, u64>::from_fn(|x| {
            std::thread::sleep(Duration::from_millis(10));
            x
        });
        let mut pool = WorkerPool::new(config(2)).unwrap();
        let token = pool.abort_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            token.abort();
        });

        let options = MapOptions {
            chunk_size: Some(1),
            ..MapOptions::default()
        };
        let started = Instant::now();
        let err = pool.map(&task, 0..1000_u64, &options).await.unwrap_err();
        assert!(matches!(err, PoolError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn dropping_a_stream_cancels_and_the_pool_recovers() {
        let task = Task::<u64, u64>::from_fn(|x| {
            std::thread::sleep(Duration::from_millis(1));
            x * 2
        });
        let mut pool = WorkerPool::new(config(2)).unwrap();
        let options = MapOptions {
            chunk_size: Some(1),
            ..MapOptions::default()
        };

        let mut stream = pool.imap(&task, 0..200_u64, &options).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), 0);
        assert_eq!(stream.next().await.unwrap().unwrap(), 2);
        drop(stream);

        let results = pool.map(&task, 0..5_u64, &MapOptions::default()).await.unwrap();
        assert_eq!(results, vec![0, 2, 4, 6, 8]);
    }

    #[tokio::test]
    async fn daemon_pools_reject_nested_construction() {
        let task = Task::<u8, bool>::from_fn(|_x| {
            matches!(
                WorkerPool::<u8, u8>::new(config(1)),
                Err(PoolError::InvalidArgument(_))
            )
        });
        let mut pool = WorkerPool::new(config(2)).unwrap();
        let results = pool.map(&task, 0..4_u8, &MapOptions::default()).await.unwrap();
        assert!(results.iter().all(|&rejected| rejected));
    }

    #[tokio::test]
    async fn non_daemon_pools_allow_nested_construction() {
        let task =
            Task::<u8, bool>::from_fn(|_x| WorkerPool::<u8, u8>::new(config(1)).is_ok());
        let mut pool = WorkerPool::new(PoolConfig {
            n_jobs: 2,
            daemon: false,
            ..PoolConfig::default()
        })
        .unwrap();
        let results = pool.map(&task, 0..4_u8, &MapOptions::default()).await.unwrap();
        assert!(results.iter().all(|&allowed| allowed));
    }

    #[tokio::test]
    async fn insights_cover_the_whole_job() {
        let task = Task::<(u64, u64), (u64, u64)>::from_fn(|(i, x)| {
            std::thread::sleep(Duration::from_millis(1));
            (i, x * x)
        });
        let mut pool = WorkerPool::new(config(2)).unwrap();
        let options = MapOptions {
            enable_insights: true,
            chunk_size: Some(1),
            ..MapOptions::default()
        };
        pool.map(&task, test_data(), &options).await.unwrap();

        let insights = pool.insights().expect("insights were enabled");
        assert_eq!(insights.n_completed_tasks.iter().sum::<u64>(), 13);
        assert!(!insights.top_5_max_task_args.is_empty());
        assert!(insights.working_ratio > 0.0);
        assert!(!insights.started_at.is_empty());
        assert!(!insights.finished_at.is_empty());

        pool.map(&task, test_data(), &MapOptions::default()).await.unwrap();
        assert!(pool.insights().is_none(), "insights off resets the store");
    }

    #[tokio::test]
    async fn recycled_workers_keep_their_index_and_the_results_stay_ordered() {
        let mut recycle_events = 0;
        let mut pool = WorkerPool::new(config(2)).unwrap();
        let mut events = pool.subscribe();
        let options = MapOptions {
            chunk_size: Some(1),
            worker_lifespan: Some(2),
            ..MapOptions::default()
        };
        let results = pool.map(&square_task(), test_data(), &options).await.unwrap();
        assert_eq!(results, expected_squares());

        while let Ok(event) = events.try_recv() {
            if let PoolEvent::WorkerRecycled { worker_id, .. } = event {
                assert!(worker_id < 2);
                recycle_events += 1;
            }
        }
        assert!(recycle_events > 0, "13 tasks at lifespan 2 must recycle");
    }

    #[tokio::test]
    async fn event_stream_reports_the_job_lifecycle() {
        let mut pool = WorkerPool::new(config(2)).unwrap();
        let mut events = pool.subscribe();
        pool.map(&square_task(), test_data(), &MapOptions::default())
            .await
            .unwrap();

        let mut saw_started = false;
        let mut saw_finished = false;
        while let Ok(event) = events.try_recv() {
            match event {
                PoolEvent::JobStarted { .. } => saw_started = true,
                PoolEvent::JobFinished { n_tasks, .. } => {
                    saw_finished = true;
                    assert_eq!(n_tasks, 13);
                }
                _ => {}
            }
        }
        assert!(saw_started && saw_finished);
    }

    #[tokio::test]
    async fn invalid_options_are_rejected_before_workers_start() {
        let mut pool = WorkerPool::new(config(2)).unwrap();
        let task = square_task();

        for options in [
            MapOptions {
                chunk_size: Some(0),
                ..MapOptions::default()
            },
            MapOptions {
                n_splits: Some(0),
                ..MapOptions::default()
            },
            MapOptions {
                max_tasks_active: Some(0),
                ..MapOptions::default()
            },
            MapOptions {
                worker_lifespan: Some(0),
                ..MapOptions::default()
            },
        ] {
            let err = pool.map(&task, test_data(), &options).await.unwrap_err();
            assert!(matches!(err, PoolError::InvalidArgument(_)), "{options:?}");
        }
    }

    #[tokio::test]
    async fn invalid_pool_configs_are_rejected() {
        assert!(matches!(
            WorkerPool::<u64, u64>::new(config(0)),
            Err(PoolError::InvalidArgument(_))
        ));
        assert!(
            matches!(
                WorkerPool::<u64, u64>::new(PoolConfig {
                    n_jobs: 4,
                    cpu_ids: Some(vec![vec![0], vec![0]]),
                    ..PoolConfig::default()
                }),
                Err(PoolError::InvalidArgument(_))
            ),
            "cpu_ids length must be 1 or n_jobs"
        );
        assert!(matches!(
            WorkerPool::<u64, u64>::new(PoolConfig {
                n_jobs: 2,
                cpu_ids: Some(vec![vec![]]),
                ..PoolConfig::default()
            }),
            Err(PoolError::InvalidArgument(_))
        ));
        assert!(matches!(
            WorkerPool::<u64, u64>::new(PoolConfig {
                n_jobs: 2,
                cpu_ids: Some(vec![vec![100_000]]),
                ..PoolConfig::default()
            }),
            Err(PoolError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn progress_bar_runs_alongside_the_job() {
        let mut pool = WorkerPool::new(config(2)).unwrap();
        let options = MapOptions {
            progress_bar: true,
            progress_bar_position: 0,
            ..MapOptions::default()
        };
        let results = pool.map(&square_task(), test_data(), &options).await.unwrap();
        assert_eq!(results, expected_squares());
    }
}
