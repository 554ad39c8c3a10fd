//! Progress observation.
//!
//! The controller bumps a shared counter per completed task; a detached
//! observer task samples it on an interval and drives an `indicatif` bar, so
//! slow rendering can never hold up dispatch. A `watch` channel carries the
//! terminal signal: completed jobs finish the bar, aborted jobs leave it
//! with the exception notice.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::sync::watch;

const SAMPLE_INTERVAL: Duration = Duration::from_millis(100);
const BAR_TEMPLATE: &str =
    "{bar:40.cyan/blue} {pos}/{len} [{elapsed_precise}<{eta_precise}, {per_sec}] {msg}";
const SPINNER_TEMPLATE: &str = "{spinner} {pos} [{elapsed_precise}, {per_sec}] {msg}";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProgressEnd {
    Running,
    Completed,
    Aborted,
}

/// Bars from concurrent pools share one draw area so they stack instead of
/// clobbering each other; `position` picks the line.
fn multi() -> &'static MultiProgress {
    static MULTI: OnceLock<MultiProgress> = OnceLock::new();
    MULTI.get_or_init(MultiProgress::new)
}

pub(crate) struct ProgressTracker {
    completed: Arc<AtomicU64>,
    end_tx: watch::Sender<ProgressEnd>,
    observer: Option<tokio::task::JoinHandle<()>>,
}

impl ProgressTracker {
    /// Start the observer. `total` is the task count when the input size is
    /// known; unsized inputs get a counting spinner.
    pub(crate) fn start(total: Option<u64>, position: usize) -> Self {
        let completed = Arc::new(AtomicU64::new(0));
        let (end_tx, end_rx) = watch::channel(ProgressEnd::Running);
        let observer = tokio::spawn(run_observer(completed.clone(), total, position, end_rx));
        Self {
            completed,
            end_tx,
            observer: Some(observer),
        }
    }

    pub(crate) fn add(&self, n: u64) {
        self.completed.fetch_add(n, Ordering::Relaxed);
    }

    /// Send the terminal signal and wait for the observer to flush and exit.
    pub(crate) async fn finish(mut self, end: ProgressEnd) {
        let _ = self.end_tx.send(end);
        if let Some(observer) = self.observer.take() {
            let _ = observer.await;
        }
    }
}

async fn run_observer(
    completed: Arc<AtomicU64>,
    total: Option<u64>,
    position: usize,
    mut end_rx: watch::Receiver<ProgressEnd>,
) {
    let (bar, template) = match total {
        Some(total) => (ProgressBar::new(total), BAR_TEMPLATE),
        None => (ProgressBar::new_spinner(), SPINNER_TEMPLATE),
    };
    bar.set_style(
        ProgressStyle::with_template(template).expect("progress template must be valid"),
    );
    let bar = multi().insert(position, bar);

    let mut tick = tokio::time::interval(SAMPLE_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tick.tick() => {
                bar.set_position(completed.load(Ordering::Relaxed));
            }
            changed = end_rx.changed() => {
                let end = match changed {
                    Ok(()) => *end_rx.borrow_and_update(),
                    // Tracker dropped without a signal: treat as aborted.
                    Err(_) => ProgressEnd::Aborted,
                };
                bar.set_position(completed.load(Ordering::Relaxed));
                match end {
                    ProgressEnd::Running => continue,
                    ProgressEnd::Completed => bar.finish(),
                    ProgressEnd::Aborted => {
                        bar.abandon_with_message("exception occurred, terminating ...");
                    }
                }
                break;
            }
        }
    }
}
