use clap::Parser;

pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(512)
}

#[derive(Debug, Clone, Parser)]
#[command(name = "mapforge", version, about = "mapforge parallel map demo workload")]
pub struct Cli {
    /// Number of workers to run in parallel.
    #[arg(
        short = 'j',
        long,
        env = "MAPFORGE_WORKERS",
        default_value_t = default_workers()
    )]
    pub workers: usize,

    /// Number of tasks to run through the pool.
    #[arg(short = 't', long, env = "MAPFORGE_TASKS", default_value_t = 4096)]
    pub tasks: u64,

    /// Spin iterations per task (controls per-task CPU cost).
    #[arg(long, env = "MAPFORGE_SPIN", default_value_t = 200_000)]
    pub spin: u64,

    /// Fixed chunk size. Defaults to automatic splitting.
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Tasks per worker before it is recycled.
    #[arg(long)]
    pub lifespan: Option<usize>,

    /// Cap on in-flight chunks. Defaults to twice the worker count.
    #[arg(long)]
    pub max_active: Option<usize>,

    /// Collect results in completion order instead of input order.
    #[arg(long, default_value_t = false)]
    pub unordered: bool,

    /// Disable the progress bar.
    #[arg(long, env = "MAPFORGE_NO_PROGRESS", default_value_t = false)]
    pub no_progress: bool,

    /// Print worker insights as JSON after the run.
    #[arg(long, default_value_t = false)]
    pub insights: bool,
}
