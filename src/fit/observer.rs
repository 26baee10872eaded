//! Run observers and cancellation.
//!
//! Observers are pure hooks on the driver lifecycle: they receive events but
//! cannot change what the driver computes. A missing or slow observer never
//! affects fit results.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, info};

/// One completed work unit.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitProgress {
    pub unit_id: usize,
    pub completed_at: DateTime<Utc>,
    /// Pixels with parameters (converged or not).
    pub succeeded: usize,
    pub failed: usize,
    pub elapsed: Duration,
}

/// Receives one event per completed work unit. Called from worker threads.
pub trait ProgressSink: Send + Sync {
    fn unit_completed(&self, event: &UnitProgress);
}

/// Brackets a whole driver invocation.
pub trait ProfilingSink: Send + Sync {
    fn run_started(&self, n_pixels: usize);
    fn run_stopped(&self);
}

/// Progress sink that writes to the `log` facade.
#[derive(Debug, Default)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn unit_completed(&self, event: &UnitProgress) {
        debug!(
            "unit {} done at {}: {} ok, {} failed in {:.1?}",
            event.unit_id,
            event.completed_at.format("%H:%M:%S%.3f"),
            event.succeeded,
            event.failed,
            event.elapsed
        );
    }
}

#[derive(Debug, Default)]
struct ProfileState {
    started: Option<Instant>,
    started_at: Option<DateTime<Utc>>,
    total: Option<Duration>,
    n_pixels: usize,
    units: Vec<(usize, Duration)>,
}

/// Wall-clock profiler.
///
/// Records the total run time (as a `ProfilingSink`) and per-unit times (as a
/// `ProgressSink`), then renders a short text report.
#[derive(Debug, Default)]
pub struct WallClockProfiler {
    state: Mutex<ProfileState>,
}

impl WallClockProfiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total wall time of the last completed run.
    pub fn total(&self) -> Option<Duration> {
        self.state.lock().ok().and_then(|s| s.total)
    }

    pub fn unit_count(&self) -> usize {
        self.state.lock().map(|s| s.units.len()).unwrap_or(0)
    }

    pub fn report(&self) -> String {
        let Ok(state) = self.state.lock() else {
            return "profile unavailable".to_string();
        };

        let mut out = String::new();
        out.push_str("=== pixfit profile ===\n");
        if let Some(at) = state.started_at {
            out.push_str(&format!("Started: {}\n", at.to_rfc3339()));
        }
        match state.total {
            Some(total) => {
                out.push_str(&format!("Total: {total:.3?} for {} pixels\n", state.n_pixels));
                if state.n_pixels > 0 {
                    out.push_str(&format!(
                        "Per pixel: {:.3?}\n",
                        total.div_f64(state.n_pixels as f64)
                    ));
                }
            }
            None => out.push_str("Total: (run not finished)\n"),
        }

        if !state.units.is_empty() {
            let mut times: Vec<Duration> = state.units.iter().map(|(_, d)| *d).collect();
            times.sort();
            let sum: Duration = times.iter().sum();
            let slowest = state
                .units
                .iter()
                .max_by_key(|(_, d)| *d)
                .map(|(id, d)| format!("unit {id} ({d:.3?})"))
                .unwrap_or_default();
            out.push_str(&format!(
                "Units: {} | median {:.3?} | busy {:.3?} | slowest {}\n",
                times.len(),
                times[times.len() / 2],
                sum,
                slowest
            ));
        }
        out
    }
}

impl ProfilingSink for WallClockProfiler {
    fn run_started(&self, n_pixels: usize) {
        if let Ok(mut state) = self.state.lock() {
            *state = ProfileState {
                started: Some(Instant::now()),
                started_at: Some(Utc::now()),
                n_pixels,
                ..ProfileState::default()
            };
        }
    }

    fn run_stopped(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.total = state.started.map(|t| t.elapsed());
            if let Some(total) = state.total {
                info!("fit run finished in {total:.3?}");
            }
        }
    }
}

impl ProgressSink for WallClockProfiler {
    fn unit_completed(&self, event: &UnitProgress) {
        if let Ok(mut state) = self.state.lock() {
            state.units.push((event.unit_id, event.elapsed));
        }
    }
}

/// Cooperative cancellation flag shared between the caller and the workers.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
