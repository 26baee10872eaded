//! Command-line parsing for the per-pixel fitter.
//!
//! The goal of this module is to keep **argument parsing** separate from the
//! fitting code. Every option can also be set through a `PIXFIT_*` environment
//! variable (or a `.env` file).

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::domain::Scheduler;

/// Top-level CLI.
#[derive(Debug, Parser)]
#[command(name = "pixfit", version, about = "Parallel per-pixel model fitting over N-D data cubes")]
pub struct Cli {
    /// Size of the worker pool (defaults to one thread per core).
    #[arg(long, global = true, env = "PIXFIT_THREADS")]
    pub threads: Option<usize>,

    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fit every pixel of a synthetic raster, print a summary and optionally export.
    Fit(FitArgs),
    /// Fit a single pixel and print its parameters (debugging aid).
    Pixel(PixelArgs),
}

/// Shape and content of the synthetic raster.
#[derive(Debug, Args, Clone)]
pub struct RasterArgs {
    /// Independent pixel axes, e.g. `3,4`.
    #[arg(long, value_delimiter = ',', default_value = "3,4", env = "PIXFIT_PIXELS")]
    pub pixels: Vec<usize>,

    /// Position of the wavelength axis in the cube.
    #[arg(long, default_value_t = 0, env = "PIXFIT_FITTING_AXIS")]
    pub fitting_axis: usize,

    /// Samples along the fitting axis.
    #[arg(long, default_value_t = 56, env = "PIXFIT_N_WAVE")]
    pub n_wave: usize,

    /// One-sigma Gaussian noise added to every sample.
    #[arg(long, default_value_t = 0.0, env = "PIXFIT_NOISE")]
    pub noise: f64,

    /// Reported one-sigma uncertainty of every sample.
    #[arg(long, default_value_t = 1.0, env = "PIXFIT_UNCERTAINTY")]
    pub uncertainty: f64,

    /// Pixel whose spectrum is all NaN, e.g. `1,2` (repeatable).
    #[arg(long = "nan-pixel", value_name = "INDEX")]
    pub nan_pixels: Vec<String>,

    /// Probability that a sample is flagged bad.
    #[arg(long, default_value_t = 0.0, env = "PIXFIT_FLAGGED")]
    pub flagged: f64,

    /// Random seed for noise and flags.
    #[arg(long, default_value_t = 42, env = "PIXFIT_SEED")]
    pub seed: u64,

    /// Hold a parameter at its initial value, e.g. `stddev_1` (repeatable).
    #[arg(long = "fix", value_name = "NAME")]
    pub fixed: Vec<String>,
}

/// Driver and export options for `pixfit fit`.
#[derive(Debug, Args, Clone)]
pub struct FitArgs {
    #[command(flatten)]
    pub raster: RasterArgs,

    /// Scheduling mode.
    #[arg(long, value_enum, default_value_t = Scheduler::Parallel, env = "PIXFIT_SCHEDULER")]
    pub scheduler: Scheduler,

    /// Pixels per work unit (default: one unit per index of the leading pixel axis).
    #[arg(long, env = "PIXFIT_CHUNK_SIZE")]
    pub chunk_size: Option<usize>,

    /// Fail pixels with non-finite samples instead of dropping those samples.
    #[arg(long)]
    pub no_filter: bool,

    /// Solver iteration cap per pixel.
    #[arg(long, default_value_t = 200, env = "PIXFIT_MAX_ITERATIONS")]
    pub max_iterations: usize,

    /// Wall-time budget per work unit, in milliseconds.
    #[arg(long, env = "PIXFIT_UNIT_TIMEOUT_MS")]
    pub unit_timeout_ms: Option<u64>,

    /// Re-runs of a crashed work unit before its pixels are marked failed.
    #[arg(long, default_value_t = 1, env = "PIXFIT_WORKER_RETRIES")]
    pub worker_retries: usize,

    /// Abort the run when a work unit keeps crashing.
    #[arg(long)]
    pub fatal_on_worker_fault: bool,

    /// Re-run synchronously and check that both results are bit-identical.
    #[arg(long)]
    pub compare: bool,

    /// Print a wall-clock profile of the run.
    #[arg(long)]
    pub profile: bool,

    /// Export the parameter cube to JSON.
    #[arg(long, value_name = "JSON")]
    pub export_json: Option<PathBuf>,

    /// Export per-pixel results to CSV.
    #[arg(long, value_name = "CSV")]
    pub export_csv: Option<PathBuf>,
}

/// Options for `pixfit pixel`.
#[derive(Debug, Args, Clone)]
pub struct PixelArgs {
    #[command(flatten)]
    pub raster: RasterArgs,

    /// Multi-index of the pixel over the pixel axes, e.g. `1,2`.
    #[arg(long, value_delimiter = ',', default_value = "0,0", conflicts_with = "average")]
    pub index: Vec<usize>,

    /// Fit the spectrum averaged over all pixels instead of one pixel.
    #[arg(long)]
    pub average: bool,
}

/// Parse a comma-separated multi-index such as `1,2`.
pub fn parse_index(text: &str) -> Result<Vec<usize>, String> {
    text.split(',')
        .map(|part| {
            part.trim()
                .parse::<usize>()
                .map_err(|e| format!("invalid pixel index '{text}': {e}"))
        })
        .collect()
}
