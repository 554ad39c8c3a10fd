//! Pool error types.
//!
//! Worker-side failures cross the thread boundary as a [`FailureReport`]:
//! the failing element's repr, the message, a captured backtrace string and,
//! when the failure was a returned error rather than a panic, the original
//! [`anyhow::Error`] so callers can still `downcast_ref` to the concrete
//! error type.

use std::any::Any;
use std::backtrace::Backtrace;

/// Error returned by every pool operation.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// A configuration value was rejected before any worker started.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The user task function failed or panicked.
    #[error("worker {} task failed on {}: {}", .0.worker_id, .0.args_display(), .0.message)]
    TaskFailed(FailureReport),

    /// The `worker_init` hook failed or panicked.
    #[error("worker {} init hook failed: {}", .0.worker_id, .0.message)]
    InitFailed(FailureReport),

    /// The `worker_exit` hook failed or panicked.
    #[error("worker {} exit hook failed: {}", .0.worker_id, .0.message)]
    ExitFailed(FailureReport),

    /// A worker died without reporting a result or an error.
    #[error("worker {worker_id} crashed: {message}")]
    WorkerCrashed {
        /// Index of the worker that died.
        worker_id: usize,
        /// What the controller observed.
        message: String,
    },

    /// The job was cancelled through an [`crate::AbortToken`] or by the
    /// result stream being dropped.
    #[error("job cancelled")]
    Cancelled,

    /// An internal invariant was violated.
    #[error("internal pool error: {0}")]
    Internal(String),
}

impl PoolError {
    /// The worker failure report attached to this error, if any.
    pub fn failure(&self) -> Option<&FailureReport> {
        match self {
            PoolError::TaskFailed(report)
            | PoolError::InitFailed(report)
            | PoolError::ExitFailed(report) => Some(report),
            _ => None,
        }
    }

    /// Downcast the original user error, when it survived the crossing.
    ///
    /// Panics inside user code only leave a message, so this returns `None`
    /// for those.
    pub fn downcast_user_error<E: std::error::Error + Send + Sync + 'static>(
        &self,
    ) -> Option<&E> {
        self.failure()?.source.as_ref()?.downcast_ref::<E>()
    }
}

/// A failure captured on a worker thread.
#[derive(Debug)]
pub struct FailureReport {
    /// Index of the worker the failure happened on.
    pub worker_id: usize,
    /// Repr of the element being processed, when the failure happened in a
    /// task call.
    pub args: Option<String>,
    /// Human-readable failure message.
    pub message: String,
    /// Stringified backtrace captured at the failure site.
    pub backtrace: String,
    /// The original error, when the user code returned one. Panics only
    /// carry their message.
    pub source: Option<anyhow::Error>,
}

impl FailureReport {
    pub(crate) fn from_error(worker_id: usize, args: Option<String>, err: anyhow::Error) -> Self {
        Self {
            worker_id,
            args,
            message: format!("{err:#}"),
            backtrace: Backtrace::force_capture().to_string(),
            source: Some(err),
        }
    }

    pub(crate) fn from_panic(
        worker_id: usize,
        args: Option<String>,
        payload: Box<dyn Any + Send>,
    ) -> Self {
        Self {
            worker_id,
            args,
            message: format!("panic: {}", panic_message(payload.as_ref())),
            backtrace: Backtrace::force_capture().to_string(),
            source: None,
        }
    }

    fn args_display(&self) -> &str {
        self.args.as_deref().unwrap_or("<unknown args>")
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}
