//! Worker performance insights.
//!
//! Workers accumulate phase durations (start-up, init, waiting, working,
//! exit) and completed-task counts into per-worker atomic slots, and keep a
//! local top-5 of their longest tasks that is merged into the shared store
//! when the worker life ends. Aggregation only reads, so it can run once the
//! job is done without racing the workers.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Number of longest-task slots kept per worker.
pub(crate) const TOP_TASKS_PER_WORKER: usize = 5;

const DATETIME_FORMAT: &str = "%Y-%m-%d, %H:%M:%S";

/// One entry in a worker's longest-task table.
#[derive(Debug, Clone)]
pub(crate) struct TopTask {
    pub(crate) duration: Duration,
    pub(crate) args: String,
    pub(crate) worker_id: usize,
    pub(crate) arrival: u64,
}

pub(crate) struct InsightsStore {
    enabled: AtomicBool,
    startup_ns: Vec<AtomicU64>,
    init_ns: Vec<AtomicU64>,
    waiting_ns: Vec<AtomicU64>,
    working_ns: Vec<AtomicU64>,
    exit_ns: Vec<AtomicU64>,
    n_completed: Vec<AtomicU64>,
    // One slot per worker; each worker only ever locks its own, so the
    // mutexes are uncontended until aggregation.
    top_tasks: Vec<Mutex<Vec<TopTask>>>,
    started_at: Mutex<Option<DateTime<Utc>>>,
    finished_at: Mutex<Option<DateTime<Utc>>>,
}

fn zeroed(n: usize) -> Vec<AtomicU64> {
    (0..n).map(|_| AtomicU64::new(0)).collect()
}

impl InsightsStore {
    pub(crate) fn new(n_jobs: usize) -> Self {
        Self {
            enabled: AtomicBool::new(false),
            startup_ns: zeroed(n_jobs),
            init_ns: zeroed(n_jobs),
            waiting_ns: zeroed(n_jobs),
            working_ns: zeroed(n_jobs),
            exit_ns: zeroed(n_jobs),
            n_completed: zeroed(n_jobs),
            top_tasks: (0..n_jobs).map(|_| Mutex::new(Vec::new())).collect(),
            started_at: Mutex::new(None),
            finished_at: Mutex::new(None),
        }
    }

    pub(crate) fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Reset all slots for a new job.
    pub(crate) fn reset(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
        for slots in [
            &self.startup_ns,
            &self.init_ns,
            &self.waiting_ns,
            &self.working_ns,
            &self.exit_ns,
            &self.n_completed,
        ] {
            for slot in slots {
                slot.store(0, Ordering::Relaxed);
            }
        }
        for slot in &self.top_tasks {
            if let Ok(mut top) = slot.lock() {
                top.clear();
            }
        }
        if let Ok(mut started) = self.started_at.lock() {
            *started = enabled.then(Utc::now);
        }
        if let Ok(mut finished) = self.finished_at.lock() {
            *finished = None;
        }
    }

    pub(crate) fn mark_finished(&self) {
        if !self.enabled() {
            return;
        }
        if let Ok(mut finished) = self.finished_at.lock() {
            *finished = Some(Utc::now());
        }
    }

    fn add(slots: &[AtomicU64], worker_id: usize, duration: Duration) {
        if let Some(slot) = slots.get(worker_id) {
            slot.fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
        }
    }

    pub(crate) fn add_startup(&self, worker_id: usize, duration: Duration) {
        if self.enabled() {
            Self::add(&self.startup_ns, worker_id, duration);
        }
    }

    pub(crate) fn add_init(&self, worker_id: usize, duration: Duration) {
        if self.enabled() {
            Self::add(&self.init_ns, worker_id, duration);
        }
    }

    pub(crate) fn add_waiting(&self, worker_id: usize, duration: Duration) {
        if self.enabled() {
            Self::add(&self.waiting_ns, worker_id, duration);
        }
    }

    pub(crate) fn add_working(&self, worker_id: usize, duration: Duration) {
        if self.enabled() {
            Self::add(&self.working_ns, worker_id, duration);
        }
    }

    pub(crate) fn add_exit(&self, worker_id: usize, duration: Duration) {
        if self.enabled() {
            Self::add(&self.exit_ns, worker_id, duration);
        }
    }

    pub(crate) fn add_completed(&self, worker_id: usize, n: u64) {
        if self.enabled() {
            if let Some(slot) = self.n_completed.get(worker_id) {
                slot.fetch_add(n, Ordering::Relaxed);
            }
        }
    }

    /// Merge a worker life's local longest-task table into the shared slot.
    pub(crate) fn merge_top(&self, worker_id: usize, entries: Vec<TopTask>) {
        if !self.enabled() || entries.is_empty() {
            return;
        }
        let Some(slot) = self.top_tasks.get(worker_id) else {
            return;
        };
        if let Ok(mut top) = slot.lock() {
            top.extend(entries);
            sort_top(&mut top);
            top.truncate(TOP_TASKS_PER_WORKER);
        }
    }

    /// Aggregate into the public summary. `None` while insights are off.
    pub(crate) fn summarize(&self) -> Option<Insights> {
        if !self.enabled() {
            return None;
        }

        let seconds = |slots: &[AtomicU64]| -> Vec<f64> {
            slots
                .iter()
                .map(|s| s.load(Ordering::Relaxed) as f64 / 1e9)
                .collect()
        };

        let startup = seconds(&self.startup_ns);
        let init = seconds(&self.init_ns);
        let waiting = seconds(&self.waiting_ns);
        let working = seconds(&self.working_ns);
        let exit = seconds(&self.exit_ns);

        let sum = |v: &[f64]| v.iter().sum::<f64>();
        let total_time = sum(&startup) + sum(&init) + sum(&waiting) + sum(&working) + sum(&exit);
        let ratio = |v: &[f64]| {
            if total_time > 0.0 {
                sum(v) / total_time
            } else {
                0.0
            }
        };

        let mut top: Vec<TopTask> = Vec::new();
        for slot in &self.top_tasks {
            if let Ok(entries) = slot.lock() {
                top.extend(entries.iter().cloned());
            }
        }
        sort_top(&mut top);
        top.truncate(TOP_TASKS_PER_WORKER);

        let fmt_all = |v: &[f64]| -> Vec<String> {
            v.iter().map(|&s| format_seconds(s, true)).collect()
        };
        let stamp = |t: &Mutex<Option<DateTime<Utc>>>| -> String {
            t.lock()
                .ok()
                .and_then(|t| *t)
                .map(|t| t.format(DATETIME_FORMAT).to_string())
                .unwrap_or_default()
        };

        Some(Insights {
            n_completed_tasks: self
                .n_completed
                .iter()
                .map(|s| s.load(Ordering::Relaxed))
                .collect(),
            start_up_time: fmt_all(&startup),
            init_time: fmt_all(&init),
            waiting_time: fmt_all(&waiting),
            working_time: fmt_all(&working),
            exit_time: fmt_all(&exit),
            total_start_up_time: format_seconds(sum(&startup), true),
            total_init_time: format_seconds(sum(&init), true),
            total_waiting_time: format_seconds(sum(&waiting), true),
            total_working_time: format_seconds(sum(&working), true),
            total_exit_time: format_seconds(sum(&exit), true),
            start_up_ratio: ratio(&startup),
            init_ratio: ratio(&init),
            waiting_ratio: ratio(&waiting),
            working_ratio: ratio(&working),
            exit_ratio: ratio(&exit),
            start_up_time_mean: format_seconds(mean(&startup), true),
            start_up_time_std: format_seconds(std_dev(&startup), true),
            init_time_mean: format_seconds(mean(&init), true),
            init_time_std: format_seconds(std_dev(&init), true),
            waiting_time_mean: format_seconds(mean(&waiting), true),
            waiting_time_std: format_seconds(std_dev(&waiting), true),
            working_time_mean: format_seconds(mean(&working), true),
            working_time_std: format_seconds(std_dev(&working), true),
            exit_time_mean: format_seconds(mean(&exit), true),
            exit_time_std: format_seconds(std_dev(&exit), true),
            top_5_max_task_durations: top
                .iter()
                .map(|t| format_seconds(t.duration.as_secs_f64(), true))
                .collect(),
            top_5_max_task_args: top.into_iter().map(|t| t.args).collect(),
            started_at: stamp(&self.started_at),
            finished_at: stamp(&self.finished_at),
        })
    }
}

/// Longest first; ties broken by worker index, then by arrival order, so the
/// aggregate is deterministic.
pub(crate) fn sort_top(entries: &mut [TopTask]) {
    entries.sort_by(|a, b| {
        b.duration
            .cmp(&a.duration)
            .then(a.worker_id.cmp(&b.worker_id))
            .then(a.arrival.cmp(&b.arrival))
    });
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    (values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / values.len() as f64).sqrt()
}

/// Format a duration in seconds as `H:MM:SS`, with millisecond precision
/// when the value is below one minute.
pub(crate) fn format_seconds(seconds: f64, with_milliseconds: bool) -> String {
    let seconds = if seconds.is_finite() && seconds > 0.0 {
        seconds
    } else {
        0.0
    };
    // Round to milliseconds first so a value like 59.9996 carries into the
    // next second instead of printing a four-digit fraction.
    let total_ms = (seconds * 1000.0).round() as u64;
    let (whole, millis) = (total_ms / 1000, total_ms % 1000);
    let (h, m, s) = (whole / 3600, (whole % 3600) / 60, whole % 60);
    let mut out = format!("{h}:{m:02}:{s:02}");
    if with_milliseconds && whole < 60 && millis > 0 {
        out.push_str(&format!(".{millis:03}"));
    }
    out
}

/// Aggregated worker telemetry for one job.
///
/// Durations are rendered `H:MM:SS`, with millisecond precision for values
/// below one minute. Ratios are each phase's share of the summed worker
/// time. The top-5 lists are ordered longest first, ties broken by worker
/// index then arrival order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[allow(missing_docs)]
pub struct Insights {
    pub n_completed_tasks: Vec<u64>,
    pub start_up_time: Vec<String>,
    pub init_time: Vec<String>,
    pub waiting_time: Vec<String>,
    pub working_time: Vec<String>,
    pub exit_time: Vec<String>,
    pub total_start_up_time: String,
    pub total_init_time: String,
    pub total_waiting_time: String,
    pub total_working_time: String,
    pub total_exit_time: String,
    pub start_up_ratio: f64,
    pub init_ratio: f64,
    pub waiting_ratio: f64,
    pub working_ratio: f64,
    pub exit_ratio: f64,
    pub start_up_time_mean: String,
    pub start_up_time_std: String,
    pub init_time_mean: String,
    pub init_time_std: String,
    pub waiting_time_mean: String,
    pub waiting_time_std: String,
    pub working_time_mean: String,
    pub working_time_std: String,
    pub exit_time_mean: String,
    pub exit_time_std: String,
    pub top_5_max_task_durations: Vec<String>,
    pub top_5_max_task_args: Vec<String>,
    pub started_at: String,
    pub finished_at: String,
}
