//! Shared domain types.
//!
//! These types are intentionally kept lightweight and serializable so they can be:
//!
//! - built from CLI flags / env vars
//! - passed read-only to every worker
//! - exported alongside fitted cubes

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::FitError;

/// How work units are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Scheduler {
    /// One work unit covering the whole cube, fitted on the calling thread.
    Synchronous,
    /// Work units dispatched to the rayon pool.
    #[default]
    Parallel,
}

impl Scheduler {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheduler::Synchronous => "synchronous",
            Scheduler::Parallel => "parallel",
        }
    }
}

impl fmt::Display for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scheduler {
    type Err = FitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "synchronous" | "sync" => Ok(Scheduler::Synchronous),
            "parallel" => Ok(Scheduler::Parallel),
            other => Err(FitError::config(format!(
                "unknown scheduler mode '{other}' (expected 'synchronous' or 'parallel')"
            ))),
        }
    }
}

/// Tuning knobs for the non-linear least-squares solver.
///
/// Passed through the driver untouched; only the fitter interprets them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverOptions {
    /// Hard cap on outer iterations (accepted + rejected steps).
    pub max_iterations: usize,
    /// Relative reduction of the cost below which we stop.
    pub ftol: f64,
    /// Relative step size below which we stop.
    pub xtol: f64,
    /// Max-norm of the scaled gradient below which we stop.
    pub gtol: f64,
    /// Initial damping parameter.
    pub initial_lambda: f64,
    /// Factor applied to lambda after a rejected step.
    pub lambda_up: f64,
    /// Factor applied to lambda after an accepted step.
    pub lambda_down: f64,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            ftol: 1e-15,
            xtol: 1e-15,
            gtol: 1e-15,
            initial_lambda: 1e-3,
            lambda_up: 10.0,
            lambda_down: 0.1,
        }
    }
}

/// Options for a single pixel fit.
#[derive(Debug, Clone, Default)]
pub struct FitOptions {
    /// Drop samples whose x, y or weight is non-finite before optimizing.
    pub filter_non_finite: bool,
    pub solver: SolverOptions,
    /// Cooperative deadline; the solver gives up once it has passed.
    pub deadline: Option<Instant>,
}

/// Driver configuration surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Axis of the cube along which the model is fit.
    pub fitting_axis: usize,
    pub scheduler: Scheduler,
    /// Pixels per work unit. `None` means one unit per index of the leading
    /// independent axis.
    pub chunk_size: Option<usize>,
    pub filter_non_finite: bool,
    pub fitter_options: SolverOptions,
    /// Wall-time budget of a single work unit.
    pub unit_timeout: Option<Duration>,
    /// Abort the whole run when a unit still crashes after its retries.
    pub fatal_on_worker_fault: bool,
    /// How many times a crashed unit is re-run before giving up on it.
    pub worker_retries: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            fitting_axis: 0,
            scheduler: Scheduler::Parallel,
            chunk_size: None,
            filter_non_finite: true,
            fitter_options: SolverOptions::default(),
            unit_timeout: None,
            fatal_on_worker_fault: false,
            worker_retries: 1,
        }
    }
}

/// Why a pixel has no fitted parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Fewer usable samples than free parameters, or zero total weight.
    Degenerate,
    /// Non-finite samples present while filtering was disabled.
    NonFiniteInput,
    /// The solver produced a non-finite cost or an unsolvable step system.
    SolverBreakdown,
    /// The pixel's work unit ran past its timeout.
    TimedOut,
    /// The pixel's work unit crashed on every attempt.
    WorkerFault,
}

impl FailureKind {
    pub const ALL: [FailureKind; 5] = [
        FailureKind::Degenerate,
        FailureKind::NonFiniteInput,
        FailureKind::SolverBreakdown,
        FailureKind::TimedOut,
        FailureKind::WorkerFault,
    ];

    pub fn label(self) -> &'static str {
        match self {
            FailureKind::Degenerate => "degenerate",
            FailureKind::NonFiniteInput => "non_finite_input",
            FailureKind::SolverBreakdown => "solver_breakdown",
            FailureKind::TimedOut => "timed_out",
            FailureKind::WorkerFault => "worker_fault",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Fit quality diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitDiagnostics {
    /// Weighted residual sum of squares `Σ (w_i r_i)^2`.
    pub rss: f64,
    pub iterations: usize,
    /// Samples that took part in the objective after filtering.
    pub n_effective: usize,
    pub converged: bool,
}

/// Outcome of fitting one pixel.
///
/// Created once by a fitter and never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub enum PixelFit {
    Fitted {
        params: Vec<f64>,
        diagnostics: FitDiagnostics,
    },
    Failed {
        kind: FailureKind,
        /// Initial parameters, as a fallback for callers that want one.
        fallback: Vec<f64>,
    },
}

impl PixelFit {
    pub fn failed(kind: FailureKind, fallback: &[f64]) -> Self {
        PixelFit::Failed {
            kind,
            fallback: fallback.to_vec(),
        }
    }

    pub fn status(&self) -> PixelStatus {
        match self {
            PixelFit::Fitted { diagnostics, .. } if diagnostics.converged => PixelStatus::Fitted,
            PixelFit::Fitted { .. } => PixelStatus::NotConverged,
            PixelFit::Failed { kind, .. } => PixelStatus::Failed(*kind),
        }
    }

    /// Fitted parameters, if any.
    pub fn params(&self) -> Option<&[f64]> {
        match self {
            PixelFit::Fitted { params, .. } => Some(params),
            PixelFit::Failed { .. } => None,
        }
    }

    pub fn diagnostics(&self) -> Option<&FitDiagnostics> {
        match self {
            PixelFit::Fitted { diagnostics, .. } => Some(diagnostics),
            PixelFit::Failed { .. } => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, PixelFit::Failed { .. })
    }
}

/// Per-pixel status stored next to the parameter slots of the output cube.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelStatus {
    Fitted,
    /// Solver ran out of iterations; parameters are the last iterate.
    NotConverged,
    Failed(FailureKind),
    /// Slot never written. Never present in a cube returned by the driver.
    #[default]
    Pending,
}

impl PixelStatus {
    pub fn has_params(self) -> bool {
        matches!(self, PixelStatus::Fitted | PixelStatus::NotConverged)
    }

    pub fn label(self) -> &'static str {
        match self {
            PixelStatus::Fitted => "fitted",
            PixelStatus::NotConverged => "not_converged",
            PixelStatus::Failed(kind) => kind.label(),
            PixelStatus::Pending => "pending",
        }
    }
}
