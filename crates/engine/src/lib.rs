#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! A parallel map worker pool.
//!
//! Evaluations of a task function are spread over a fleet of worker
//! threads; results come back as an ordered list, an unordered list, or a
//! lazy ordered/unordered stream. The pool supports per-worker init/exit
//! hooks with collected exit results, per-worker private state, shared
//! read-only objects, bounded in-flight work, worker recycling by lifespan,
//! warm pool reuse across calls, CPU pinning, progress bars and per-worker
//! timing insights.
//!
//! ```
//! use mapforge::{MapOptions, PoolConfig, Task, WorkerPool};
//!
//! # #[tokio::main(flavor = "multi_thread")]
//! # async fn main() -> Result<(), mapforge::PoolError> {
//! let config = PoolConfig {
//!     n_jobs: 2,
//!     ..PoolConfig::default()
//! };
//! let mut pool = WorkerPool::<u64, u64>::new(config)?;
//! let task = Task::from_fn(|x: u64| x * x);
//!
//! let squares = pool.map(&task, 0..10, &MapOptions::default()).await?;
//! assert_eq!(squares, vec![0, 1, 4, 9, 16, 25, 36, 49, 64, 81]);
//! # Ok(())
//! # }
//! ```

/// Public API for the worker pool.
pub mod api;

mod chunker;
mod engine;
mod error;
mod insights;
mod progress;
mod state;
mod worker;

pub use api::{
    AbortToken, MapOptions, MapResults, PoolConfig, PoolEvent, Task, TaskContext, WorkerPool,
    WorkerStage,
};
pub use error::{FailureReport, PoolError};
pub use insights::Insights;
pub use state::{Kwargs, WorkerState};
