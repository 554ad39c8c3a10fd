//! Worker thread runtime.
//!
//! Each worker life runs on a dedicated OS thread: optional CPU pin, init
//! hook with a fresh state bag, a blocking drain of the task channel, exit
//! hook, end-of-life report. The thread hands its task-channel receiver back
//! through its join handle so a recycled worker's replacement inherits any
//! chunk still queued in the one-slot channel.

use std::cell::Cell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;

use crate::api::{JobFns, TaskContext, WorkerStage};
use crate::chunker::Chunk;
use crate::error::FailureReport;
use crate::insights::{sort_top, InsightsStore, TopTask, TOP_TASKS_PER_WORKER};
use crate::state::WorkerState;

thread_local! {
    // Set on worker threads so a nested pool construction can see whether
    // its surrounding pool allows children.
    static WORKER_DAEMON: Cell<Option<bool>> = const { Cell::new(None) };
}

pub(crate) fn current_worker_daemon() -> Option<bool> {
    WORKER_DAEMON.get()
}

pub(crate) enum WorkerCommand<T> {
    Chunk(Chunk<T>),
    PoisonPill,
}

pub(crate) enum WorkerEvent<R, E> {
    Stage {
        worker_id: usize,
        stage: WorkerStage,
    },
    ChunkDone {
        worker_id: usize,
        chunk_id: u64,
        outputs: Vec<R>,
        recycle: bool,
    },
    ChunkFailed {
        worker_id: usize,
        chunk_id: u64,
        failure: FailureReport,
    },
    InitFailed {
        worker_id: usize,
        failure: FailureReport,
    },
    Warning {
        worker_id: usize,
        message: String,
    },
    LifeEnded {
        worker_id: usize,
        exit_value: Option<E>,
        exit_failure: Option<FailureReport>,
        recycle: bool,
    },
}

/// Everything a worker life needs; the controller builds a fresh set off the
/// job context when it spawns a replacement for a recycled worker.
pub(crate) struct WorkerParams<T, R, Sh, E> {
    pub(crate) worker_id: usize,
    pub(crate) fns: JobFns<T, R, Sh, E>,
    pub(crate) shared: Option<Arc<Sh>>,
    pub(crate) pass_worker_id: bool,
    pub(crate) use_worker_state: bool,
    pub(crate) daemon: bool,
    pub(crate) lifespan: Option<usize>,
    pub(crate) cpus: Option<Vec<usize>>,
    pub(crate) spawned_at: Instant,
    pub(crate) abort: Arc<AtomicBool>,
    pub(crate) insights: Arc<InsightsStore>,
    pub(crate) events: mpsc::UnboundedSender<WorkerEvent<R, E>>,
}

/// What a worker thread leaves behind for the controller.
pub(crate) struct WorkerEnd<T> {
    pub(crate) task_rx: mpsc::Receiver<WorkerCommand<T>>,
}

pub(crate) fn spawn<T, R, Sh, E>(
    params: WorkerParams<T, R, Sh, E>,
    task_rx: mpsc::Receiver<WorkerCommand<T>>,
) -> std::io::Result<std::thread::JoinHandle<WorkerEnd<T>>>
where
    T: Send + fmt::Debug + 'static,
    R: Send + 'static,
    Sh: Send + Sync + 'static,
    E: Send + 'static,
{
    std::thread::Builder::new()
        .name(format!("mapforge-worker-{}", params.worker_id))
        .spawn(move || run_worker(params, task_rx))
}

fn run_worker<T, R, Sh, E>(
    params: WorkerParams<T, R, Sh, E>,
    mut task_rx: mpsc::Receiver<WorkerCommand<T>>,
) -> WorkerEnd<T>
where
    T: Send + fmt::Debug + 'static,
    R: Send + 'static,
    Sh: Send + Sync + 'static,
    E: Send + 'static,
{
    let worker_id = params.worker_id;
    WORKER_DAEMON.set(Some(params.daemon));

    if let Some(cpus) = &params.cpus {
        if let Err(err) = mapforge_affinity::pin_current_thread(cpus) {
            let _ = params.events.send(WorkerEvent::Warning {
                worker_id,
                message: format!("worker {worker_id}: CPU pinning failed: {err}"),
            });
        }
    }
    params
        .insights
        .add_startup(worker_id, params.spawned_at.elapsed());
    send_stage(&params, WorkerStage::Initializing);

    let mut state = params.use_worker_state.then(WorkerState::new);

    if let Some(init) = params.fns.init.clone() {
        let init_started = Instant::now();
        let result = {
            let mut ctx = make_context(&params, &mut state);
            panic::catch_unwind(AssertUnwindSafe(|| init(&mut ctx)))
        };
        params.insights.add_init(worker_id, init_started.elapsed());
        let failure = match result {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(FailureReport::from_error(worker_id, None, err)),
            Err(payload) => Some(FailureReport::from_panic(worker_id, None, payload)),
        };
        if let Some(failure) = failure {
            let _ = params.events.send(WorkerEvent::InitFailed { worker_id, failure });
            finish_life(&params, &mut state, false);
            return WorkerEnd { task_rx };
        }
    }
    send_stage(&params, WorkerStage::Idle);

    let mut tasks_done: usize = 0;
    let mut arrival: u64 = 0;
    let mut top: Vec<TopTask> = Vec::new();
    let mut recycle = false;

    loop {
        let wait_started = Instant::now();
        let command = task_rx.blocking_recv();
        params
            .insights
            .add_waiting(worker_id, wait_started.elapsed());

        let chunk = match command {
            // Closed channel doubles as the poison pill.
            None | Some(WorkerCommand::PoisonPill) => break,
            Some(WorkerCommand::Chunk(chunk)) => chunk,
        };
        if params.abort.load(Ordering::SeqCst) {
            // Terminate signal: the queued chunk is abandoned, not run.
            break;
        }

        send_stage(&params, WorkerStage::Running);
        let work_started = Instant::now();
        let n_items = chunk.items.len();
        let mut outputs = Vec::with_capacity(n_items);
        let mut failure = None;

        for item in chunk.items {
            // The repr has to be taken before the call consumes the item; a
            // panicking Debug impl must not take the worker down with it.
            let args = panic::catch_unwind(AssertUnwindSafe(|| format!("{item:?}")))
                .unwrap_or_else(|_| "<repr unavailable>".to_string());
            let task_started = Instant::now();
            let result = {
                let mut ctx = make_context(&params, &mut state);
                panic::catch_unwind(AssertUnwindSafe(|| (params.fns.task)(&mut ctx, item)))
            };
            let duration = task_started.elapsed();
            if params.insights.enabled() {
                push_top(&mut top, TopTask {
                    duration,
                    args: args.clone(),
                    worker_id,
                    arrival,
                });
            }
            arrival += 1;

            match result {
                Ok(Ok(output)) => outputs.push(output),
                Ok(Err(err)) => {
                    failure = Some(FailureReport::from_error(worker_id, Some(args), err));
                }
                Err(payload) => {
                    failure = Some(FailureReport::from_panic(worker_id, Some(args), payload));
                }
            }
            if failure.is_some() {
                break;
            }
        }
        params
            .insights
            .add_working(worker_id, work_started.elapsed());

        match failure {
            Some(failure) => {
                let _ = params.events.send(WorkerEvent::ChunkFailed {
                    worker_id,
                    chunk_id: chunk.id,
                    failure,
                });
                // No further tasks after a failure; the exit hook still runs.
                break;
            }
            None => {
                params.insights.add_completed(worker_id, outputs.len() as u64);
                tasks_done += n_items;
                recycle = params.lifespan.is_some_and(|lifespan| tasks_done >= lifespan);
                let _ = params.events.send(WorkerEvent::ChunkDone {
                    worker_id,
                    chunk_id: chunk.id,
                    outputs,
                    recycle,
                });
                if recycle {
                    break;
                }
                send_stage(&params, WorkerStage::Idle);
            }
        }
    }

    params.insights.merge_top(worker_id, top);
    finish_life(&params, &mut state, recycle);
    WorkerEnd { task_rx }
}

/// Run the exit hook (state still alive) and send the end-of-life report.
fn finish_life<T, R, Sh, E>(
    params: &WorkerParams<T, R, Sh, E>,
    state: &mut Option<WorkerState>,
    recycle: bool,
) where
    T: Send + fmt::Debug + 'static,
{
    let worker_id = params.worker_id;
    send_stage(params, WorkerStage::Exiting);

    let (exit_value, exit_failure) = match params.fns.exit.clone() {
        None => (None, None),
        Some(exit) => {
            let exit_started = Instant::now();
            let result = {
                let mut ctx = make_context(params, state);
                panic::catch_unwind(AssertUnwindSafe(|| exit(&mut ctx)))
            };
            params.insights.add_exit(worker_id, exit_started.elapsed());
            match result {
                Ok(Ok(value)) => (Some(value), None),
                Ok(Err(err)) => (None, Some(FailureReport::from_error(worker_id, None, err))),
                Err(payload) => (None, Some(FailureReport::from_panic(worker_id, None, payload))),
            }
        }
    };

    let _ = params.events.send(WorkerEvent::LifeEnded {
        worker_id,
        exit_value,
        exit_failure,
        recycle,
    });
}

fn make_context<'a, T, R, Sh, E>(
    params: &'a WorkerParams<T, R, Sh, E>,
    state: &'a mut Option<WorkerState>,
) -> TaskContext<'a, Sh> {
    TaskContext::new(
        params.pass_worker_id.then_some(params.worker_id),
        params.shared.as_deref(),
        state.as_mut(),
    )
}

fn send_stage<T, R, Sh, E>(params: &WorkerParams<T, R, Sh, E>, stage: WorkerStage) {
    let _ = params.events.send(WorkerEvent::Stage {
        worker_id: params.worker_id,
        stage,
    });
}

fn push_top(top: &mut Vec<TopTask>, entry: TopTask) {
    top.push(entry);
    sort_top(top);
    top.truncate(TOP_TASKS_PER_WORKER);
}
