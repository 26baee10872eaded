//! The parallel fitting driver.
//!
//! A run goes through three phases:
//!
//! 1. validate and plan: shapes, axis and work units are checked before any
//!    pixel is fitted, so configuration problems surface as one error;
//! 2. dispatch: every work unit fits its pixel range independently, either on
//!    the rayon pool or one after another on the calling thread;
//! 3. barrier and assembly: results are keyed by pixel number and merged into a
//!    [`ParameterCube`], so unit completion order never matters.
//!
//! Inputs are rearranged once into pixel-major tables (one row per pixel,
//! fitting axis last). Workers only read those tables and each returns its own
//! result vector; nothing mutable is shared between units.

use std::any::Any;
use std::borrow::Cow;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use log::{debug, info, warn};
use ndarray::{Array2, ArrayD, ArrayView1};
use rayon::prelude::*;

use crate::data::build_weights;
use crate::domain::{DriverConfig, FailureKind, PixelFit, PixelStatus, Scheduler};
use crate::error::FitError;
use crate::fit::chunk::{ChunkPlan, ChunkPlanner, WorkUnit};
use crate::fit::cube::ParameterCube;
use crate::fit::fitter::{fit_options, Fitter, LevenbergMarquardt};
use crate::fit::observer::{CancelToken, ProfilingSink, ProgressSink, UnitProgress};
use crate::models::ModelTemplate;

/// Data and weights rearranged to `(n_pixels, n_samples)`.
#[derive(Debug, Clone)]
struct PixelTable {
    data: Array2<f64>,
    weights: Array2<f64>,
}

#[derive(Debug)]
struct UnitOutcome {
    unit: WorkUnit,
    fits: Vec<PixelFit>,
    fault: Option<String>,
    cancelled: bool,
}

/// Fits a model template to every pixel of a cube.
pub struct ParallelFitDriver<F: Fitter = LevenbergMarquardt> {
    fitter: F,
    config: DriverConfig,
    progress: Option<Arc<dyn ProgressSink>>,
    profiler: Option<Arc<dyn ProfilingSink>>,
    cancel: CancelToken,
}

impl Default for ParallelFitDriver<LevenbergMarquardt> {
    fn default() -> Self {
        Self::new(LevenbergMarquardt, DriverConfig::default())
    }
}

impl<F: Fitter> ParallelFitDriver<F> {
    pub fn new(fitter: F, config: DriverConfig) -> Self {
        Self {
            fitter,
            config,
            progress: None,
            profiler: None,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(sink);
        self
    }

    pub fn with_profiler(mut self, sink: Arc<dyn ProfilingSink>) -> Self {
        self.profiler = Some(sink);
        self
    }

    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// The work units this driver would dispatch for a cube of `shape`.
    pub fn plan(&self, shape: &[usize]) -> Result<ChunkPlan, FitError> {
        ChunkPlanner::from_config(&self.config).plan(shape)
    }

    /// Fit every pixel of `data` using precomputed per-sample weights.
    ///
    /// `weights` must have the shape of `data`; a zero weight excludes a sample.
    pub fn run(
        &self,
        template: &ModelTemplate,
        data: &ArrayD<f64>,
        x: &[f64],
        weights: &ArrayD<f64>,
    ) -> Result<ParameterCube, FitError> {
        self.bracketed(data.shape(), || {
            let plan = self.plan(data.shape())?;
            self.execute(template, data, x, weights, plan)
        })
    }

    /// Fit every pixel, deriving weights from one-sigma uncertainties and an
    /// optional mask (`true` = bad sample).
    pub fn run_with_uncertainty(
        &self,
        template: &ModelTemplate,
        data: &ArrayD<f64>,
        x: &[f64],
        uncertainty: &ArrayD<f64>,
        mask: Option<&ArrayD<bool>>,
    ) -> Result<ParameterCube, FitError> {
        self.bracketed(data.shape(), || {
            let sample_weights = build_weights(data, uncertainty, mask)?;
            debug!(
                "{} of {} samples usable",
                sample_weights.n_valid(),
                sample_weights.weights.len()
            );
            let plan = self.plan(data.shape())?;
            self.execute(template, data, x, &sample_weights.weights, plan)
        })
    }

    /// Run an explicit plan, e.g. one whose units were reordered.
    ///
    /// The plan must still partition the pixels of `data`.
    pub fn run_plan(
        &self,
        template: &ModelTemplate,
        data: &ArrayD<f64>,
        x: &[f64],
        weights: &ArrayD<f64>,
        plan: ChunkPlan,
    ) -> Result<ParameterCube, FitError> {
        self.bracketed(data.shape(), || self.execute(template, data, x, weights, plan))
    }

    fn bracketed<T>(&self, shape: &[usize], body: impl FnOnce() -> T) -> T {
        let n_pixels: usize = shape
            .iter()
            .enumerate()
            .filter(|(axis, _)| *axis != self.config.fitting_axis)
            .map(|(_, n)| *n)
            .product();
        if let Some(profiler) = &self.profiler {
            profiler.run_started(n_pixels);
        }
        let out = panic::catch_unwind(AssertUnwindSafe(body));
        if let Some(profiler) = &self.profiler {
            profiler.run_stopped();
        }
        out.unwrap_or_else(|payload| panic::resume_unwind(payload))
    }

    fn execute(
        &self,
        template: &ModelTemplate,
        data: &ArrayD<f64>,
        x: &[f64],
        weights: &ArrayD<f64>,
        plan: ChunkPlan,
    ) -> Result<ParameterCube, FitError> {
        let table = prepare(self.config.fitting_axis, data, x, weights)?;
        let expected_pixels = table.data.nrows();
        if plan.n_pixels() != expected_pixels {
            return Err(FitError::config(format!(
                "plan covers {} pixels but the cube has {expected_pixels}",
                plan.n_pixels()
            )));
        }
        plan.check_partition()?;

        info!(
            "fitting {} pixels x {} samples in {} units ({}, {})",
            expected_pixels,
            x.len(),
            plan.units.len(),
            self.config.scheduler,
            self.fitter.name()
        );

        let outcomes: Vec<UnitOutcome> = match self.config.scheduler {
            Scheduler::Synchronous => plan
                .units
                .iter()
                .map(|unit| self.run_unit(template, &table, x, *unit))
                .collect(),
            Scheduler::Parallel => plan
                .units
                .par_iter()
                .map(|unit| self.run_unit(template, &table, x, *unit))
                .collect(),
        };

        // Barrier crossed: every unit has returned.
        if self.cancel.is_cancelled() || outcomes.iter().any(|o| o.cancelled) {
            info!("run cancelled, discarding {} unit results", outcomes.len());
            return Err(FitError::Cancelled);
        }

        if self.config.fatal_on_worker_fault {
            if let Some(first) = outcomes
                .iter()
                .filter(|o| o.fault.is_some())
                .min_by_key(|o| o.unit.id)
            {
                return Err(FitError::WorkerFault {
                    unit: first.unit.id,
                    message: first.fault.clone().unwrap_or_default(),
                });
            }
        }

        let fits = outcomes.into_iter().flat_map(|outcome| {
            let start = outcome.unit.start;
            outcome
                .fits
                .into_iter()
                .enumerate()
                .map(move |(offset, fit)| (start + offset, fit))
        });
        let cube = ParameterCube::assemble(template.param_names().to_vec(), plan.pixel_shape, fits)?;

        let summary = cube.summary();
        info!(
            "fit complete: {} fitted, {} not converged, {} failed",
            summary.fitted,
            summary.not_converged,
            summary.failed()
        );
        Ok(cube)
    }

    fn run_unit(&self, template: &ModelTemplate, table: &PixelTable, x: &[f64], unit: WorkUnit) -> UnitOutcome {
        let started = Instant::now();
        let mut attempt = 0;

        let outcome = loop {
            let deadline = self.config.unit_timeout.map(|t| Instant::now() + t);
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                self.fit_range(template, table, x, unit, deadline)
            }));

            match result {
                Ok(Some(mut fits)) => {
                    if fits
                        .iter()
                        .any(|f| f.status() == PixelStatus::Failed(FailureKind::TimedOut))
                    {
                        warn!("unit {} exceeded its timeout; marking {} pixels", unit.id, unit.len());
                        fits = vec![PixelFit::failed(FailureKind::TimedOut, template.initial()); unit.len()];
                    }
                    break UnitOutcome {
                        unit,
                        fits,
                        fault: None,
                        cancelled: false,
                    };
                }
                Ok(None) => {
                    break UnitOutcome {
                        unit,
                        fits: Vec::new(),
                        fault: None,
                        cancelled: true,
                    };
                }
                Err(payload) => {
                    let message = panic_message(&*payload);
                    if attempt < self.config.worker_retries {
                        attempt += 1;
                        warn!("unit {} crashed ({message}); retry {attempt}", unit.id);
                        continue;
                    }
                    warn!("unit {} crashed ({message}); giving up after {attempt} retries", unit.id);
                    break UnitOutcome {
                        unit,
                        fits: vec![PixelFit::failed(FailureKind::WorkerFault, template.initial()); unit.len()],
                        fault: Some(message),
                        cancelled: false,
                    };
                }
            }
        };

        if !outcome.cancelled {
            let failed = outcome.fits.iter().filter(|f| f.is_failure()).count();
            let event = UnitProgress {
                unit_id: unit.id,
                completed_at: Utc::now(),
                succeeded: outcome.fits.len() - failed,
                failed,
                elapsed: started.elapsed(),
            };
            debug!(
                "unit {} [{}..{}) done: {} ok, {} failed",
                unit.id, unit.start, unit.end, event.succeeded, event.failed
            );
            if let Some(sink) = &self.progress {
                // Observers never take a unit down with them.
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| sink.unit_completed(&event))) {
                    warn!(
                        "progress sink panicked on unit {}: {}",
                        unit.id,
                        panic_message(&*payload)
                    );
                }
            }
        }
        outcome
    }

    /// Fit the pixels of one unit. `None` when the run was cancelled.
    fn fit_range(
        &self,
        template: &ModelTemplate,
        table: &PixelTable,
        x: &[f64],
        unit: WorkUnit,
        deadline: Option<Instant>,
    ) -> Option<Vec<PixelFit>> {
        let options = fit_options(&self.config, deadline);
        let mut fits = Vec::with_capacity(unit.len());

        for pixel in unit.pixels() {
            if self.cancel.is_cancelled() {
                return None;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                fits.push(PixelFit::failed(FailureKind::TimedOut, template.initial()));
                continue;
            }
            let y = row_slice(table.data.row(pixel));
            let w = row_slice(table.weights.row(pixel));
            fits.push(self.fitter.fit(template, x, &y, &w, &options));
        }
        Some(fits)
    }
}

fn row_slice(row: ArrayView1<'_, f64>) -> Cow<'_, [f64]> {
    match row.to_slice() {
        Some(slice) => Cow::Borrowed(slice),
        None => Cow::Owned(row.to_vec()),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}

/// Validate the inputs and lay them out one pixel per row.
fn prepare(axis: usize, data: &ArrayD<f64>, x: &[f64], weights: &ArrayD<f64>) -> Result<PixelTable, FitError> {
    let ndim = data.ndim();
    if ndim == 0 {
        return Err(FitError::config("data cube has no axes"));
    }
    if axis >= ndim {
        return Err(FitError::config(format!(
            "fitting axis {axis} out of range for a {ndim}-D cube"
        )));
    }
    if weights.shape() != data.shape() {
        return Err(FitError::config(format!(
            "weight shape {:?} does not match data shape {:?}",
            weights.shape(),
            data.shape()
        )));
    }
    if let Some(w) = weights.iter().find(|w| **w < 0.0) {
        return Err(FitError::config(format!("negative sample weight {w}")));
    }
    let n_samples = data.shape()[axis];
    if x.len() != n_samples {
        return Err(FitError::config(format!(
            "independent variable has {} values but the fitting axis has {n_samples}",
            x.len()
        )));
    }
    let n_pixels: usize = data
        .shape()
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != axis)
        .map(|(_, n)| *n)
        .product();

    Ok(PixelTable {
        data: pixel_major(data, axis, n_pixels, n_samples)?,
        weights: pixel_major(weights, axis, n_pixels, n_samples)?,
    })
}

fn pixel_major<T: Clone>(
    array: &ArrayD<T>,
    axis: usize,
    n_pixels: usize,
    n_samples: usize,
) -> Result<Array2<T>, FitError> {
    let mut order: Vec<usize> = (0..array.ndim()).filter(|&a| a != axis).collect();
    order.push(axis);
    let view = array.view().permuted_axes(order);
    let table = view
        .to_shape((n_pixels, n_samples))
        .map_err(|e| FitError::config(format!("cannot reshape cube: {e}")))?
        .into_owned();
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use ndarray::IxDyn;

    use crate::data::{generate_raster, RasterSpec, SyntheticRaster};
    use crate::domain::FitOptions;
    use crate::fit::fitter::fit_pixel;
    use crate::fit::observer::WallClockProfiler;
    use crate::models::Component;

    fn template() -> ModelTemplate {
        ModelTemplate::from_compound(Component::const1d(1.0) + Component::gaussian1d(4.0, 976.8, 1.0))
            .unwrap()
    }

    fn raster(spec: &RasterSpec) -> SyntheticRaster {
        generate_raster(spec).unwrap()
    }

    fn driver(config: DriverConfig) -> ParallelFitDriver {
        ParallelFitDriver::new(LevenbergMarquardt, config)
    }

    fn unit_weights(data: &ArrayD<f64>) -> ArrayD<f64> {
        ArrayD::from_elem(data.raw_dim(), 1.0)
    }

    fn assert_close(got: &[f64], want: &[f64], rel: f64) {
        for (g, w) in got.iter().zip(want) {
            assert!((g - w).abs() <= rel * w.abs(), "got {got:?}, want {want:?}");
        }
    }

    #[test]
    fn recovers_every_pixel_of_a_noiseless_raster() {
        let spec = RasterSpec::default();
        let r = raster(&spec);
        let cube = ParallelFitDriver::default()
            .run_with_uncertainty(&template(), &r.data, &r.wave, &r.uncertainty, None)
            .unwrap();

        assert_eq!(cube.pixel_shape(), &[3, 4]);
        assert_eq!(
            cube.names(),
            &["amplitude_0", "amplitude_1", "mean_1", "stddev_1"]
        );
        for i in 0..3 {
            for j in 0..4 {
                assert_eq!(cube.status_at(&[i, j]), Some(PixelStatus::Fitted));
                let truth = r.truth[i * 4 + j];
                assert_close(&cube.params_at(&[i, j]).unwrap(), &truth, 1e-6);
            }
        }
    }

    #[test]
    fn fits_only_free_parameters() {
        // Continuum and amplitude vary per pixel; the line shape is fixed.
        let wave: Vec<f64> = (0..56).map(|i| 970.0 + 0.25 * i as f64).collect();
        let mut data = ArrayD::zeros(IxDyn(&[56, 3, 4]));
        let truth = |i: usize, j: usize| (0.5 + 0.1 * i as f64, 2.0 + 0.3 * j as f64);
        for ((k, i, j), v) in data
            .view_mut()
            .into_dimensionality::<ndarray::Ix3>()
            .unwrap()
            .indexed_iter_mut()
        {
            let (c, a) = truth(i, j);
            let d = wave[k] - 976.8;
            *v = c + a * (-(d * d) / 2.0).exp();
        }
        let t = template().fix("mean_1").unwrap().fix("stddev_1").unwrap();

        let cube = driver(DriverConfig::default())
            .run(&t, &data, &wave, &unit_weights(&data))
            .unwrap();
        for i in 0..3 {
            for j in 0..4 {
                let (c, a) = truth(i, j);
                assert_close(&cube.params_at(&[i, j]).unwrap(), &[c, a, 976.8, 1.0], 1e-6);
            }
        }
    }

    #[test]
    fn nan_pixel_fails_alone() {
        let spec = RasterSpec {
            nan_pixels: vec![vec![1, 2]],
            ..RasterSpec::default()
        };
        let r = raster(&spec);
        let cube = ParallelFitDriver::default()
            .run_with_uncertainty(&template(), &r.data, &r.wave, &r.uncertainty, None)
            .unwrap();

        assert_eq!(
            cube.status_at(&[1, 2]),
            Some(PixelStatus::Failed(FailureKind::Degenerate))
        );
        assert!(cube.params_at(&[1, 2]).unwrap().iter().all(|v| v.is_nan()));

        let summary = cube.summary();
        assert_eq!(summary.fitted, 11);
        assert_eq!(summary.failed(), 1);
        assert_close(&cube.params_at(&[1, 1]).unwrap(), &r.truth[5], 1e-6);
    }

    #[test]
    fn zero_uncertainty_pixel_is_degenerate() {
        let r = raster(&RasterSpec::default());
        let mut sigma = r.uncertainty.clone();
        for k in 0..r.wave.len() {
            sigma[[k, 0, 1]] = 0.0;
        }
        let cube = ParallelFitDriver::default()
            .run_with_uncertainty(&template(), &r.data, &r.wave, &sigma, None)
            .unwrap();
        assert_eq!(
            cube.status_at(&[0, 1]),
            Some(PixelStatus::Failed(FailureKind::Degenerate))
        );
        assert_eq!(cube.status_at(&[0, 0]), Some(PixelStatus::Fitted));
    }

    #[test]
    fn masked_samples_are_ignored() {
        let mut r = raster(&RasterSpec::default());
        let mut mask = ArrayD::from_elem(r.data.raw_dim(), false);
        // Corrupt a few samples, then flag them.
        for k in [3, 17, 40] {
            r.data[[k, 2, 3]] = 1e6;
            mask[[k, 2, 3]] = true;
        }
        let cube = ParallelFitDriver::default()
            .run_with_uncertainty(&template(), &r.data, &r.wave, &r.uncertainty, Some(&mask))
            .unwrap();
        assert_close(&cube.params_at(&[2, 3]).unwrap(), &r.truth[11], 1e-6);
    }

    #[test]
    fn synchronous_and_parallel_runs_are_bit_identical() {
        let spec = RasterSpec {
            noise_sigma: 0.05,
            nan_pixels: vec![vec![0, 3]],
            ..RasterSpec::default()
        };
        let r = raster(&spec);
        let w = unit_weights(&r.data);

        let sync = driver(DriverConfig {
            scheduler: Scheduler::Synchronous,
            ..DriverConfig::default()
        })
        .run(&template(), &r.data, &r.wave, &w)
        .unwrap();
        let par = driver(DriverConfig {
            scheduler: Scheduler::Parallel,
            chunk_size: Some(1),
            ..DriverConfig::default()
        })
        .run(&template(), &r.data, &r.wave, &w)
        .unwrap();

        assert!(sync.identical(&par));
    }

    #[test]
    fn unit_order_does_not_change_the_result() {
        let r = raster(&RasterSpec {
            noise_sigma: 0.05,
            ..RasterSpec::default()
        });
        let w = unit_weights(&r.data);
        let d = driver(DriverConfig {
            chunk_size: Some(5),
            ..DriverConfig::default()
        });

        let forward = d.run(&template(), &r.data, &r.wave, &w).unwrap();
        let mut plan = d.plan(r.data.shape()).unwrap();
        plan.units.reverse();
        let reversed = d.run_plan(&template(), &r.data, &r.wave, &w, plan).unwrap();

        assert!(forward.identical(&reversed));
    }

    #[test]
    fn fitting_axis_can_be_anywhere() {
        let spec = RasterSpec {
            pixel_shape: vec![2, 3],
            fitting_axis: 2,
            ..RasterSpec::default()
        };
        let r = raster(&spec);
        let cube = driver(DriverConfig {
            fitting_axis: 2,
            ..DriverConfig::default()
        })
        .run_with_uncertainty(&template(), &r.data, &r.wave, &r.uncertainty, None)
        .unwrap();
        assert_eq!(cube.pixel_shape(), &[2, 3]);
        assert_close(&cube.params_at(&[1, 2]).unwrap(), &r.truth[5], 1e-6);
    }

    #[test]
    fn one_dimensional_cube_is_one_pixel() {
        let spec = RasterSpec {
            pixel_shape: vec![],
            ..RasterSpec::default()
        };
        let r = raster(&spec);
        let cube = ParallelFitDriver::default()
            .run(&template(), &r.data, &r.wave, &unit_weights(&r.data))
            .unwrap();
        assert_eq!(cube.n_pixels(), 1);
        assert_close(&cube.params_at(&[]).unwrap(), &r.truth[0], 1e-6);
    }

    #[test]
    fn single_pixel_helper_matches_driver_slot() {
        let r = raster(&RasterSpec {
            noise_sigma: 0.05,
            ..RasterSpec::default()
        });
        let w = unit_weights(&r.data);
        let config = DriverConfig::default();
        let cube = driver(config.clone()).run(&template(), &r.data, &r.wave, &w).unwrap();

        let y: Vec<f64> = (0..r.wave.len()).map(|k| r.data[[k, 1, 2]]).collect();
        let ones = vec![1.0; y.len()];
        let fit = fit_pixel(&LevenbergMarquardt, &template(), &r.wave, &y, &ones, &config);

        let bits = |v: &[f64]| v.iter().map(|p| p.to_bits()).collect::<Vec<_>>();
        assert_eq!(bits(fit.params().unwrap()), bits(&cube.params_at(&[1, 2]).unwrap()));
    }

    #[test]
    fn configuration_errors_are_raised_before_dispatch() {
        let r = raster(&RasterSpec::default());
        let w = unit_weights(&r.data);
        let events = Arc::new(CountingSink::default());
        let d = driver(DriverConfig::default()).with_progress(events.clone());

        let short_x = &r.wave[..10];
        assert!(matches!(
            d.run(&template(), &r.data, short_x, &w),
            Err(FitError::Configuration(_))
        ));

        let bad_w = ArrayD::from_elem(IxDyn(&[56, 4, 3]), 1.0);
        assert!(matches!(
            d.run(&template(), &r.data, &r.wave, &bad_w),
            Err(FitError::Configuration(_))
        ));

        let off_axis = driver(DriverConfig {
            fitting_axis: 3,
            ..DriverConfig::default()
        });
        assert!(matches!(
            off_axis.run(&template(), &r.data, &r.wave, &w),
            Err(FitError::Configuration(_))
        ));

        let mut plan = d.plan(r.data.shape()).unwrap();
        plan.units.pop();
        assert!(matches!(
            d.run_plan(&template(), &r.data, &r.wave, &w, plan),
            Err(FitError::Configuration(_))
        ));

        assert_eq!(events.count(), 0);
    }

    #[test]
    fn negative_weights_are_rejected_before_dispatch() {
        let r = raster(&RasterSpec::default());
        let mut w = unit_weights(&r.data);
        w[[20, 1, 3]] = -0.5;
        let events = Arc::new(CountingSink::default());
        let d = driver(DriverConfig::default()).with_progress(events.clone());

        match d.run(&template(), &r.data, &r.wave, &w) {
            Err(FitError::Configuration(message)) => assert!(message.contains("negative")),
            other => panic!("expected a configuration error, got {other:?}"),
        }
        assert_eq!(events.count(), 0);

        // Negative zero is still a mask.
        w[[20, 1, 3]] = -0.0;
        assert!(d.run(&template(), &r.data, &r.wave, &w).is_ok());
    }

    #[test]
    fn subnormal_uncertainty_does_not_fail_a_pixel() {
        let r = raster(&RasterSpec::default());
        let mut sigma = r.uncertainty.clone();
        sigma[[10, 0, 0]] = 1e-310;
        let cube = driver(DriverConfig {
            filter_non_finite: false,
            ..DriverConfig::default()
        })
        .run_with_uncertainty(&template(), &r.data, &r.wave, &sigma, None)
        .unwrap();
        assert_eq!(cube.status_at(&[0, 0]), Some(PixelStatus::Fitted));
        assert_close(&cube.params_at(&[0, 0]).unwrap(), &r.truth[0], 1e-6);
    }

    #[derive(Default)]
    struct CountingSink(AtomicUsize);

    impl CountingSink {
        fn count(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }

    impl ProgressSink for CountingSink {
        fn unit_completed(&self, _event: &UnitProgress) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn progress_reports_every_unit() {
        let r = raster(&RasterSpec::default());
        let events = Arc::new(CountingSink::default());
        let profiler = Arc::new(WallClockProfiler::new());
        let d = ParallelFitDriver::default()
            .with_progress(events.clone())
            .with_profiler(profiler.clone());

        d.run(&template(), &r.data, &r.wave, &unit_weights(&r.data)).unwrap();
        assert_eq!(events.count(), 3);
        assert!(profiler.total().is_some());
    }

    struct PanickingSink(AtomicUsize);

    impl ProgressSink for PanickingSink {
        fn unit_completed(&self, event: &UnitProgress) {
            self.0.fetch_add(1, Ordering::SeqCst);
            panic!("sink failure on unit {}", event.unit_id);
        }
    }

    #[test]
    fn panicking_progress_sink_does_not_affect_the_run() {
        let r = raster(&RasterSpec::default());
        let sink = Arc::new(PanickingSink(AtomicUsize::new(0)));
        let profiler = Arc::new(WallClockProfiler::new());
        let w = unit_weights(&r.data);

        let observed = ParallelFitDriver::default()
            .with_progress(sink.clone())
            .with_profiler(profiler.clone())
            .run(&template(), &r.data, &r.wave, &w)
            .unwrap();
        assert_eq!(sink.0.load(Ordering::SeqCst), 3);
        assert_eq!(observed.summary().fitted, 12);
        assert!(profiler.total().is_some());

        let quiet = ParallelFitDriver::default().run(&template(), &r.data, &r.wave, &w).unwrap();
        assert!(observed.identical(&quiet));
    }

    #[test]
    fn cancelled_run_returns_no_cube() {
        let r = raster(&RasterSpec::default());
        let token = CancelToken::new();
        token.cancel();
        let d = ParallelFitDriver::default().with_cancel_token(token);
        assert_eq!(
            d.run(&template(), &r.data, &r.wave, &unit_weights(&r.data)),
            Err(FitError::Cancelled)
        );
    }

    struct CancelAfterFirst(CancelToken);

    impl ProgressSink for CancelAfterFirst {
        fn unit_completed(&self, _event: &UnitProgress) {
            self.0.cancel();
        }
    }

    #[test]
    fn cancelling_mid_run_discards_completed_units() {
        let r = raster(&RasterSpec::default());
        let token = CancelToken::new();
        let d = driver(DriverConfig {
            chunk_size: Some(1),
            ..DriverConfig::default()
        })
        .with_cancel_token(token.clone())
        .with_progress(Arc::new(CancelAfterFirst(token)));

        let pool = rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap();
        let result = pool.install(|| d.run(&template(), &r.data, &r.wave, &unit_weights(&r.data)));
        assert_eq!(result, Err(FitError::Cancelled));
    }

    /// Panics on the first `crashes` calls, then fits normally.
    struct Flaky {
        crashes: AtomicUsize,
    }

    impl Fitter for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        fn fit(
            &self,
            template: &ModelTemplate,
            x: &[f64],
            y: &[f64],
            weights: &[f64],
            options: &FitOptions,
        ) -> PixelFit {
            if self
                .crashes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                panic!("injected worker crash");
            }
            LevenbergMarquardt.fit(template, x, y, weights, options)
        }
    }

    fn flaky_driver(crashes: usize, config: DriverConfig) -> ParallelFitDriver<Flaky> {
        ParallelFitDriver::new(
            Flaky {
                crashes: AtomicUsize::new(crashes),
            },
            DriverConfig {
                scheduler: Scheduler::Synchronous,
                ..config
            },
        )
    }

    #[test]
    fn crashed_unit_is_retried() {
        let r = raster(&RasterSpec::default());
        let cube = flaky_driver(1, DriverConfig::default())
            .run(&template(), &r.data, &r.wave, &unit_weights(&r.data))
            .unwrap();
        assert_eq!(cube.summary().fitted, 12);
    }

    #[test]
    fn persistent_crash_marks_unit_pixels() {
        let r = raster(&RasterSpec::default());
        let cube = flaky_driver(usize::MAX, DriverConfig::default())
            .run(&template(), &r.data, &r.wave, &unit_weights(&r.data))
            .unwrap();
        assert_eq!(cube.summary().count(FailureKind::WorkerFault), 12);
        assert!(cube.params_at(&[0, 0]).unwrap().iter().all(|v| v.is_nan()));
    }

    #[test]
    fn fatal_worker_fault_aborts_the_run() {
        let r = raster(&RasterSpec::default());
        let result = flaky_driver(
            usize::MAX,
            DriverConfig {
                fatal_on_worker_fault: true,
                worker_retries: 0,
                ..DriverConfig::default()
            },
        )
        .run(&template(), &r.data, &r.wave, &unit_weights(&r.data));

        match result {
            Err(FitError::WorkerFault { unit, message }) => {
                assert_eq!(unit, 0);
                assert!(message.contains("injected"));
            }
            other => panic!("expected a worker fault, got {other:?}"),
        }
    }

    #[test]
    fn timed_out_units_are_marked_not_fatal() {
        let r = raster(&RasterSpec::default());
        let cube = driver(DriverConfig {
            unit_timeout: Some(Duration::ZERO),
            ..DriverConfig::default()
        })
        .run(&template(), &r.data, &r.wave, &unit_weights(&r.data))
        .unwrap();
        assert_eq!(cube.summary().count(FailureKind::TimedOut), 12);
    }
}
