//! Job controller.
//!
//! One `JobRuntime` drives one map call: it feeds chunks to the per-worker
//! one-slot task channels under the in-flight cap, collects worker events
//! from the unbounded fan-in channel, re-sequences chunk results for the
//! ordered variants, recycles lifespan-exhausted workers on their original
//! index, latches the first failure and runs the shutdown protocol. When the
//! job succeeds under `keep_alive`, the worker set is handed back to the
//! pool instead of being torn down.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc};
use tokio::sync::mpsc::error::TrySendError;

use crate::api::{AbortToken, JobFns, PoolEvent, WorkerStage};
use crate::chunker::{Chunk, Chunks};
use crate::error::PoolError;
use crate::insights::InsightsStore;
use crate::progress::{ProgressEnd, ProgressTracker};
use crate::worker::{self, WorkerCommand, WorkerEnd, WorkerEvent, WorkerParams};

/// One running chunk plus one queued in the task channel slot.
const MAX_CHUNKS_PER_WORKER: usize = 2;

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_millis(250);

pub(crate) struct WorkerSlot<T> {
    pub(crate) cmd_tx: Option<mpsc::Sender<WorkerCommand<T>>>,
    pub(crate) join: Option<std::thread::JoinHandle<WorkerEnd<T>>>,
    pub(crate) assigned: usize,
    pub(crate) stage: WorkerStage,
    pub(crate) lives: u32,
    pub(crate) last_event_at: Instant,
}

/// The workers plus their shared channels; owned by the pool between jobs
/// (when `keep_alive` holds them warm) and by the controller during one.
pub(crate) struct WorkerSet<T, R, E> {
    pub(crate) event_tx: mpsc::UnboundedSender<WorkerEvent<R, E>>,
    pub(crate) event_rx: mpsc::UnboundedReceiver<WorkerEvent<R, E>>,
    pub(crate) abort: Arc<AtomicBool>,
    pub(crate) slots: Vec<WorkerSlot<T>>,
}

impl<T, R, E> WorkerSet<T, R, E> {
    pub(crate) fn all_alive(&self) -> bool {
        self.slots.iter().all(|slot| slot.cmd_tx.is_some())
    }
}

/// Per-job immutable spawn template; the controller clones worker params off
/// it when recycling.
pub(crate) struct JobContext<T, R, Sh, E> {
    pub(crate) fns: JobFns<T, R, Sh, E>,
    pub(crate) shared: Option<Arc<Sh>>,
    pub(crate) pass_worker_id: bool,
    pub(crate) use_worker_state: bool,
    pub(crate) daemon: bool,
    pub(crate) lifespan: Option<usize>,
    pub(crate) cpu_ids: Option<Vec<Vec<usize>>>,
    pub(crate) insights: Arc<InsightsStore>,
}

impl<T, R, Sh, E> JobContext<T, R, Sh, E>
where
    T: Send + fmt::Debug + 'static,
    R: Send + 'static,
    Sh: Send + Sync + 'static,
    E: Send + 'static,
{
    fn params(
        &self,
        worker_id: usize,
        abort: Arc<AtomicBool>,
        events: mpsc::UnboundedSender<WorkerEvent<R, E>>,
    ) -> WorkerParams<T, R, Sh, E> {
        WorkerParams {
            worker_id,
            fns: self.fns.clone(),
            shared: self.shared.clone(),
            pass_worker_id: self.pass_worker_id,
            use_worker_state: self.use_worker_state,
            daemon: self.daemon,
            lifespan: self.lifespan,
            cpus: self.cpu_ids.as_ref().and_then(|ids| ids.get(worker_id).cloned()),
            spawned_at: Instant::now(),
            abort,
            insights: self.insights.clone(),
            events,
        }
    }
}

/// Spawn a fresh worker set of `n_jobs` workers.
pub(crate) fn spawn_worker_set<T, R, Sh, E>(
    ctx: &JobContext<T, R, Sh, E>,
    n_jobs: usize,
    events: &broadcast::Sender<PoolEvent>,
) -> Result<WorkerSet<T, R, E>, PoolError>
where
    T: Send + fmt::Debug + 'static,
    R: Send + 'static,
    Sh: Send + Sync + 'static,
    E: Send + 'static,
{
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let abort = Arc::new(AtomicBool::new(false));
    let mut slots = Vec::with_capacity(n_jobs);

    for worker_id in 0..n_jobs {
        let (cmd_tx, cmd_rx) = mpsc::channel(1);
        let params = ctx.params(worker_id, abort.clone(), event_tx.clone());
        let join = worker::spawn(params, cmd_rx)
            .map_err(|err| PoolError::Internal(format!("failed to spawn worker {worker_id}: {err}")))?;
        let _ = events.send(PoolEvent::WorkerStage {
            worker_id,
            stage: WorkerStage::Starting,
        });
        slots.push(WorkerSlot {
            cmd_tx: Some(cmd_tx),
            join: Some(join),
            assigned: 0,
            stage: WorkerStage::Starting,
            lives: 1,
            last_event_at: Instant::now(),
        });
    }

    Ok(WorkerSet {
        event_tx,
        event_rx,
        abort,
        slots,
    })
}

/// What a finished job hands back to the pool.
pub(crate) struct JobEnd<T, R, E> {
    /// The still-warm worker set, present only after a clean `keep_alive`
    /// finish.
    pub(crate) workers: Option<WorkerSet<T, R, E>>,
    pub(crate) exit_results: Vec<E>,
}

struct PendingChunk<R> {
    chunk_id: u64,
    outputs: Vec<R>,
}

impl<R> PartialEq for PendingChunk<R> {
    fn eq(&self, other: &Self) -> bool {
        self.chunk_id == other.chunk_id
    }
}
impl<R> Eq for PendingChunk<R> {}
impl<R> PartialOrd for PendingChunk<R> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl<R> Ord for PendingChunk<R> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.chunk_id.cmp(&other.chunk_id)
    }
}

enum Wake<R, E> {
    Event(Option<WorkerEvent<R, E>>),
    Abort,
    OutputClosed,
    Tick,
}

pub(crate) struct JobRuntime<T, R, Sh, E> {
    pub(crate) job_id: u64,
    pub(crate) ctx: JobContext<T, R, Sh, E>,
    pub(crate) workers: WorkerSet<T, R, E>,
    pub(crate) chunks: Chunks<T>,
    pub(crate) next_chunk: Option<Chunk<T>>,
    pub(crate) chunks_done: bool,
    pub(crate) in_flight: usize,
    pub(crate) max_active: usize,
    pub(crate) ordered: bool,
    pub(crate) keep_alive: bool,
    pub(crate) graceful_join_timeout: Duration,
    pub(crate) output_tx: mpsc::Sender<Result<R, PoolError>>,
    pub(crate) abort_token: AbortToken,
    pub(crate) progress: Option<ProgressTracker>,
    pub(crate) events: broadcast::Sender<PoolEvent>,

    reorder: BinaryHeap<Reverse<PendingChunk<R>>>,
    next_expected: u64,
    latched: Option<PoolError>,
    aborting: bool,
    // Lifespan exits announced by a chunk result but not yet settled by the
    // matching end-of-life report. The job is not complete while any are
    // outstanding.
    recycling: usize,
    exit_results: Vec<E>,
    tasks_total_done: u64,
}

impl<T, R, Sh, E> JobRuntime<T, R, Sh, E>
where
    T: Send + fmt::Debug + 'static,
    R: Send + 'static,
    Sh: Send + Sync + 'static,
    E: Send + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        job_id: u64,
        ctx: JobContext<T, R, Sh, E>,
        workers: WorkerSet<T, R, E>,
        chunks: Chunks<T>,
        first_chunk: Option<Chunk<T>>,
        max_active: usize,
        ordered: bool,
        keep_alive: bool,
        graceful_join_timeout: Duration,
        output_tx: mpsc::Sender<Result<R, PoolError>>,
        abort_token: AbortToken,
        progress: Option<ProgressTracker>,
        events: broadcast::Sender<PoolEvent>,
    ) -> Self {
        Self {
            job_id,
            ctx,
            workers,
            chunks,
            next_chunk: first_chunk,
            chunks_done: false,
            in_flight: 0,
            max_active,
            ordered,
            keep_alive,
            graceful_join_timeout,
            output_tx,
            abort_token,
            progress,
            events,
            reorder: BinaryHeap::new(),
            next_expected: 0,
            latched: None,
            aborting: false,
            recycling: 0,
            exit_results: Vec::new(),
            tasks_total_done: 0,
        }
    }

    pub(crate) async fn run(mut self) -> JobEnd<T, R, E> {
        self.emit(PoolEvent::JobStarted { job_id: self.job_id });
        self.workers.abort.store(false, Ordering::SeqCst);

        let mut housekeeping = tokio::time::interval(HOUSEKEEPING_INTERVAL);
        housekeeping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            if !self.aborting {
                self.dispatch();
            }
            if self.aborting || self.work_complete() {
                break;
            }

            let wake: Wake<R, E> = tokio::select! {
                event = self.workers.event_rx.recv() => Wake::Event(event),
                _ = self.abort_token.aborted() => Wake::Abort,
                _ = self.output_tx.closed() => Wake::OutputClosed,
                _ = housekeeping.tick() => Wake::Tick,
            };
            match wake {
                Wake::Event(Some(event)) => self.on_event(event).await,
                Wake::Event(None) => {
                    self.begin_abort(PoolError::Internal(
                        "worker event channel closed unexpectedly".to_string(),
                    ));
                }
                Wake::Abort => self.begin_abort(PoolError::Cancelled),
                Wake::OutputClosed => self.begin_abort(PoolError::Cancelled),
                Wake::Tick => self.housekeeping().await,
            }
        }

        if self.latched.is_none() && self.ordered && !self.reorder.is_empty() {
            self.begin_abort(PoolError::Internal(
                "chunk results missing from the reorder buffer".to_string(),
            ));
        }

        self.shutdown().await;

        self.ctx.insights.mark_finished();
        if let Some(progress) = self.progress.take() {
            let end = if self.latched.is_none() {
                ProgressEnd::Completed
            } else {
                ProgressEnd::Aborted
            };
            progress.finish(end).await;
        }

        if let Some(error) = self.latched.take() {
            // Streaming callers see the failure as the next element; eager
            // callers surface it after the drain. Nothing to do if the
            // consumer is already gone.
            let _ = self.output_tx.send(Err(error)).await;
        }

        self.emit(PoolEvent::JobFinished {
            job_id: self.job_id,
            n_tasks: self.tasks_total_done,
        });

        let keep = self.keep_alive && !self.workers.slots.is_empty() && self.workers.all_alive();
        JobEnd {
            workers: keep.then_some(self.workers),
            exit_results: self.exit_results,
        }
    }

    fn work_complete(&self) -> bool {
        self.chunks_done
            && self.next_chunk.is_none()
            && self.in_flight == 0
            && self.recycling == 0
    }

    fn emit(&self, event: PoolEvent) {
        let _ = self.events.send(event);
    }

    fn begin_abort(&mut self, error: PoolError) {
        if self.latched.is_none() {
            self.emit(PoolEvent::JobAborting {
                message: error.to_string(),
            });
            self.latched = Some(error);
        }
        if self.aborting {
            return;
        }
        self.aborting = true;
        self.workers.abort.store(true, Ordering::SeqCst);
        // Stop feeding and drop the chunk in hand.
        self.next_chunk = None;
        self.chunks_done = true;
    }

    /// Feed chunks while the in-flight cap and the one-slot channels allow.
    fn dispatch(&mut self) {
        'feed: loop {
            if self.in_flight >= self.max_active {
                return;
            }
            if self.next_chunk.is_none() {
                match self.chunks.next() {
                    Some(chunk) => self.next_chunk = Some(chunk),
                    None => {
                        self.chunks_done = true;
                        return;
                    }
                }
            }

            let mut candidates: Vec<usize> = (0..self.workers.slots.len())
                .filter(|&i| {
                    let slot = &self.workers.slots[i];
                    slot.cmd_tx.is_some() && slot.assigned < MAX_CHUNKS_PER_WORKER
                })
                .collect();
            candidates.sort_by_key(|&i| self.workers.slots[i].assigned);

            for i in candidates {
                let Some(chunk) = self.next_chunk.take() else {
                    return;
                };
                let Some(cmd_tx) = self.workers.slots[i].cmd_tx.as_ref() else {
                    self.next_chunk = Some(chunk);
                    continue;
                };
                match cmd_tx.try_send(WorkerCommand::Chunk(chunk)) {
                    Ok(()) => {
                        self.workers.slots[i].assigned += 1;
                        self.in_flight += 1;
                        continue 'feed;
                    }
                    Err(TrySendError::Full(WorkerCommand::Chunk(chunk)))
                    | Err(TrySendError::Closed(WorkerCommand::Chunk(chunk))) => {
                        self.next_chunk = Some(chunk);
                    }
                    Err(_) => {}
                }
            }
            // Nobody can take the chunk right now.
            return;
        }
    }

    async fn on_event(&mut self, event: WorkerEvent<R, E>) {
        match event {
            WorkerEvent::Stage { worker_id, stage } => {
                if let Some(slot) = self.workers.slots.get_mut(worker_id) {
                    slot.stage = stage;
                    slot.last_event_at = Instant::now();
                }
                self.emit(PoolEvent::WorkerStage { worker_id, stage });
            }
            WorkerEvent::ChunkDone {
                worker_id,
                chunk_id,
                outputs,
                recycle,
            } => {
                if let Some(slot) = self.workers.slots.get_mut(worker_id) {
                    slot.assigned = slot.assigned.saturating_sub(1);
                    slot.last_event_at = Instant::now();
                }
                self.in_flight = self.in_flight.saturating_sub(1);
                if recycle {
                    self.recycling += 1;
                }

                let n_tasks = outputs.len() as u64;
                self.tasks_total_done += n_tasks;
                if let Some(progress) = &self.progress {
                    progress.add(n_tasks);
                }
                self.emit(PoolEvent::ChunkCompleted {
                    worker_id,
                    chunk_id,
                    n_tasks,
                });

                if !self.aborting {
                    if self.ordered {
                        self.buffer_and_flush(chunk_id, outputs).await;
                    } else {
                        self.send_outputs(outputs).await;
                    }
                }
            }
            WorkerEvent::ChunkFailed {
                worker_id,
                chunk_id: _,
                failure,
            } => {
                if let Some(slot) = self.workers.slots.get_mut(worker_id) {
                    slot.assigned = slot.assigned.saturating_sub(1);
                    slot.last_event_at = Instant::now();
                }
                self.in_flight = self.in_flight.saturating_sub(1);
                self.begin_abort(PoolError::TaskFailed(failure));
            }
            WorkerEvent::InitFailed { worker_id: _, failure } => {
                self.begin_abort(PoolError::InitFailed(failure));
            }
            WorkerEvent::Warning { worker_id: _, message } => {
                self.emit(PoolEvent::Warning { message });
            }
            WorkerEvent::LifeEnded {
                worker_id,
                exit_value,
                exit_failure,
                recycle,
            } => {
                if recycle {
                    self.recycling = self.recycling.saturating_sub(1);
                }
                if let Some(value) = exit_value {
                    self.exit_results.push(value);
                }
                if let Some(failure) = exit_failure {
                    self.begin_abort(PoolError::ExitFailed(failure));
                }

                let (end, join_panicked) = match self
                    .workers
                    .slots
                    .get_mut(worker_id)
                    .and_then(|slot| slot.join.take())
                {
                    Some(handle) => match handle.join() {
                        Ok(end) => (Some(end), false),
                        Err(_) => (None, true),
                    },
                    None => (None, false),
                };
                if join_panicked {
                    self.begin_abort(PoolError::WorkerCrashed {
                        worker_id,
                        message: "worker thread panicked during teardown".to_string(),
                    });
                }

                if let Some(slot) = self.workers.slots.get_mut(worker_id) {
                    slot.stage = WorkerStage::Dead;
                    slot.last_event_at = Instant::now();
                }
                self.emit(PoolEvent::WorkerStage {
                    worker_id,
                    stage: WorkerStage::Dead,
                });

                // A keep-alive fleet is replenished even when the input is
                // exhausted, so the next job starts with n_jobs workers.
                let more_work = self
                    .workers
                    .slots
                    .get(worker_id)
                    .is_some_and(|slot| slot.assigned > 0)
                    || !(self.chunks_done && self.next_chunk.is_none())
                    || self.keep_alive;

                if recycle && !self.aborting && more_work {
                    if let Some(end) = end {
                        self.respawn(worker_id, end.task_rx);
                    }
                } else if let Some(slot) = self.workers.slots.get_mut(worker_id) {
                    slot.cmd_tx = None;
                }
            }
        }
    }

    /// Replace a recycled worker on the same index, inheriting its task
    /// channel so a queued chunk is not lost. Affinity for the index is
    /// re-applied by the new thread.
    fn respawn(&mut self, worker_id: usize, task_rx: mpsc::Receiver<WorkerCommand<T>>) {
        let params = self.ctx.params(
            worker_id,
            self.workers.abort.clone(),
            self.workers.event_tx.clone(),
        );
        match worker::spawn(params, task_rx) {
            Ok(join) => {
                let lives = self.workers.slots.get_mut(worker_id).map(|slot| {
                    slot.join = Some(join);
                    slot.stage = WorkerStage::Starting;
                    slot.lives += 1;
                    slot.lives
                });
                if let Some(lives) = lives {
                    self.emit(PoolEvent::WorkerRecycled { worker_id, lives });
                    self.emit(PoolEvent::WorkerStage {
                        worker_id,
                        stage: WorkerStage::Starting,
                    });
                }
            }
            Err(err) => {
                if let Some(slot) = self.workers.slots.get_mut(worker_id) {
                    slot.cmd_tx = None;
                }
                self.begin_abort(PoolError::Internal(format!(
                    "failed to respawn worker {worker_id}: {err}"
                )));
            }
        }
    }

    async fn buffer_and_flush(&mut self, chunk_id: u64, outputs: Vec<R>) {
        self.reorder.push(Reverse(PendingChunk { chunk_id, outputs }));
        while self
            .reorder
            .peek()
            .is_some_and(|Reverse(head)| head.chunk_id == self.next_expected)
        {
            let Some(Reverse(chunk)) = self.reorder.pop() else {
                break;
            };
            self.next_expected += 1;
            self.send_outputs(chunk.outputs).await;
            if self.aborting {
                return;
            }
        }
    }

    /// Deliver outputs to the caller. The output channel is bounded, so a
    /// lazy consumer stalls the flush, which stalls dispatch, which bounds
    /// in-flight work end to end.
    async fn send_outputs(&mut self, outputs: Vec<R>) {
        for output in outputs {
            let cancelled = tokio::select! {
                result = self.output_tx.send(Ok(output)) => result.is_err(),
                _ = self.abort_token.aborted() => true,
            };
            if cancelled {
                self.begin_abort(PoolError::Cancelled);
                return;
            }
        }
    }

    /// Drain stragglers and detect workers that died without reporting.
    async fn housekeeping(&mut self) {
        while let Ok(event) = self.workers.event_rx.try_recv() {
            self.on_event(event).await;
        }
        if self.abort_token.is_aborted() && !self.aborting {
            self.begin_abort(PoolError::Cancelled);
            return;
        }

        // A finished thread always sends its end-of-life event first, and we
        // just drained the channel, so a finished handle here means the
        // thread died without reporting.
        for worker_id in 0..self.workers.slots.len() {
            let crashed = self.workers.slots[worker_id].stage != WorkerStage::Dead
                && self.workers.slots[worker_id]
                    .join
                    .as_ref()
                    .is_some_and(|handle| handle.is_finished());
            if !crashed {
                continue;
            }
            let message = match self.workers.slots[worker_id].join.take() {
                Some(handle) => match handle.join() {
                    Ok(_) => "worker thread ended without reporting".to_string(),
                    Err(_) => "worker thread panicked".to_string(),
                },
                None => continue,
            };
            let slot = &mut self.workers.slots[worker_id];
            slot.cmd_tx = None;
            slot.stage = WorkerStage::Dead;
            self.in_flight = self.in_flight.saturating_sub(slot.assigned);
            slot.assigned = 0;
            self.emit(PoolEvent::WorkerStage {
                worker_id,
                stage: WorkerStage::Dead,
            });
            self.begin_abort(PoolError::WorkerCrashed { worker_id, message });
        }
    }

    /// Success without `keep_alive`, and every failure path: close the task
    /// channels (the poison pills), drain exit reports under the graceful
    /// deadline, then sweep the threads.
    async fn shutdown(&mut self) {
        if self.latched.is_none() && self.keep_alive {
            return;
        }

        // One pill per live worker; dropping the sender right after covers a
        // full slot (a closed channel reads as the pill too).
        for slot in &mut self.workers.slots {
            if let Some(cmd_tx) = slot.cmd_tx.take() {
                let _ = cmd_tx.try_send(WorkerCommand::PoisonPill);
            }
        }

        let deadline = tokio::time::Instant::now() + self.graceful_join_timeout;
        while self.workers.slots.iter().any(|slot| slot.join.is_some()) {
            match tokio::time::timeout_at(deadline, self.workers.event_rx.recv()).await {
                Ok(Some(event)) => self.on_event(event).await,
                Ok(None) => break,
                Err(_) => break,
            }
        }

        // Sweep: join finished stragglers, detach stuck ones. A detached
        // thread cannot be killed; it is left to finish on its own while the
        // job reports the latched error.
        for worker_id in 0..self.workers.slots.len() {
            let Some(handle) = self.workers.slots[worker_id].join.take() else {
                continue;
            };
            if handle.is_finished() {
                if handle.join().is_err() && self.latched.is_none() {
                    self.latched = Some(PoolError::WorkerCrashed {
                        worker_id,
                        message: "worker thread panicked during teardown".to_string(),
                    });
                }
            } else {
                let last_heard = self.workers.slots[worker_id].last_event_at.elapsed();
                self.emit(PoolEvent::Warning {
                    message: format!(
                        "worker {worker_id} did not exit within the graceful join deadline \
                         (last heard from {last_heard:?} ago); detaching"
                    ),
                });
                if self.latched.is_none() {
                    self.latched = Some(PoolError::WorkerCrashed {
                        worker_id,
                        message: "worker did not exit within the graceful join deadline"
                            .to_string(),
                    });
                }
                self.workers.slots[worker_id].cmd_tx = None;
                self.workers.slots[worker_id].stage = WorkerStage::Dead;
            }
        }
    }
}

/// Tear a worker set down outside a job: close the task channels, collect
/// exit results and join under the deadline. Used on signature changes, on
/// `stop_and_join`, and when a non-`keep_alive` pool is reconfigured.
pub(crate) async fn teardown_worker_set<T, R, E>(
    mut set: WorkerSet<T, R, E>,
    timeout: Duration,
) -> (Vec<E>, Option<PoolError>) {
    for slot in &mut set.slots {
        if let Some(cmd_tx) = slot.cmd_tx.take() {
            let _ = cmd_tx.try_send(WorkerCommand::PoisonPill);
        }
    }

    let mut exit_results = Vec::new();
    let mut error: Option<PoolError> = None;

    let deadline = tokio::time::Instant::now() + timeout;
    while set.slots.iter().any(|slot| slot.join.is_some()) {
        let event = match tokio::time::timeout_at(deadline, set.event_rx.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) => break,
            Err(_) => break,
        };
        collect_life_ended(&mut set, event, &mut exit_results, &mut error);
    }
    while let Ok(event) = set.event_rx.try_recv() {
        collect_life_ended(&mut set, event, &mut exit_results, &mut error);
    }

    for (worker_id, slot) in set.slots.iter_mut().enumerate() {
        let Some(handle) = slot.join.take() else {
            continue;
        };
        if handle.is_finished() {
            if handle.join().is_err() && error.is_none() {
                error = Some(PoolError::WorkerCrashed {
                    worker_id,
                    message: "worker thread panicked during teardown".to_string(),
                });
            }
        } else if error.is_none() {
            error = Some(PoolError::WorkerCrashed {
                worker_id,
                message: "worker did not exit within the graceful join deadline".to_string(),
            });
        }
    }

    (exit_results, error)
}

fn collect_life_ended<T, R, E>(
    set: &mut WorkerSet<T, R, E>,
    event: WorkerEvent<R, E>,
    exit_results: &mut Vec<E>,
    error: &mut Option<PoolError>,
) {
    let WorkerEvent::LifeEnded {
        worker_id,
        exit_value,
        exit_failure,
        ..
    } = event
    else {
        return;
    };
    if let Some(value) = exit_value {
        exit_results.push(value);
    }
    if let Some(failure) = exit_failure {
        if error.is_none() {
            *error = Some(PoolError::ExitFailed(failure));
        }
    }
    if let Some(slot) = set.slots.get_mut(worker_id) {
        slot.stage = WorkerStage::Dead;
        if let Some(handle) = slot.join.take() {
            if handle.join().is_err() && error.is_none() {
                *error = Some(PoolError::WorkerCrashed {
                    worker_id,
                    message: "worker thread panicked during teardown".to_string(),
                });
            }
        }
    }
}
