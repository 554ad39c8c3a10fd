mod cli;
mod demo;
mod shutdown;

use std::time::Instant;

use clap::Parser;
use tokio::sync::broadcast;

use mapforge::{MapOptions, PoolConfig, PoolEvent, Task, WorkerPool};

use crate::cli::Cli;
use crate::shutdown::spawn_ctrl_c_handler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = PoolConfig {
        n_jobs: cli.workers.max(1),
        ..PoolConfig::default()
    };
    let mut pool = WorkerPool::<u64, u64>::new(config)?;

    spawn_ctrl_c_handler(pool.abort_token());

    let mut events = pool.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(PoolEvent::Warning { message }) => eprintln!("{message}"),
                Ok(PoolEvent::JobAborting { message }) => eprintln!("aborting: {message}"),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let spin = cli.spin;
    let task = Task::from_fn(move |seed: u64| demo::spin_task(seed, spin));
    let options = MapOptions {
        chunk_size: cli.chunk_size,
        worker_lifespan: cli.lifespan,
        max_tasks_active: cli.max_active,
        progress_bar: !cli.no_progress,
        enable_insights: cli.insights,
        ..MapOptions::default()
    };

    println!(
        "mapforge {} workers={} tasks={} spin={}",
        env!("CARGO_PKG_VERSION"),
        cli.workers,
        cli.tasks,
        cli.spin
    );

    let started = Instant::now();
    let results = if cli.unordered {
        pool.map_unordered(&task, 0..cli.tasks, &options).await?
    } else {
        pool.map(&task, 0..cli.tasks, &options).await?
    };
    let duration = started.elapsed();

    let checksum = results.iter().fold(0_u64, |acc, r| acc ^ r);
    println!(
        "Completed {} tasks in {:.2?} ({:.0} tasks/s, checksum {checksum:016x})",
        results.len(),
        duration,
        results.len() as f64 / duration.as_secs_f64().max(f64::EPSILON)
    );

    if cli.insights {
        if let Some(insights) = pool.insights() {
            println!("{}", serde_json::to_string_pretty(&insights)?);
        }
    }

    pool.stop_and_join().await?;
    Ok(())
}
