//! Per-pixel non-linear least squares.
//!
//! Given:
//! - the shared independent variable `x_i`
//! - one pixel's samples `y_i`
//! - weights `w_i` (`1/σ_i`, zero for excluded samples)
//! - a model template with an initial guess
//!
//! we minimize `Σ (w_i (y_i - f(x_i; θ)))²` over the free parameters and return
//! either the fitted parameters with diagnostics or a failure marker.
//!
//! The default strategy is Levenberg–Marquardt. Every step is a damped linear
//! least-squares solve (see `math::lstsq`), which keeps the whole fit free of
//! randomness: identical inputs give bit-identical parameters no matter which
//! thread runs them.

use std::time::Instant;

use nalgebra::{DMatrix, DVector};

use crate::domain::{DriverConfig, FailureKind, FitDiagnostics, FitOptions, PixelFit, SolverOptions};
use crate::math::solve_damped_step;
use crate::models::ModelTemplate;

/// Damping beyond which no further progress is possible in double precision.
const LAMBDA_MAX: f64 = 1e16;

/// A pluggable fitting strategy.
///
/// Implementations must be pure with respect to their inputs: no hidden state
/// that changes the outcome between calls, and no mutation of the template.
pub trait Fitter: Send + Sync {
    fn name(&self) -> &str;

    fn fit(
        &self,
        template: &ModelTemplate,
        x: &[f64],
        y: &[f64],
        weights: &[f64],
        options: &FitOptions,
    ) -> PixelFit;
}

/// Damped Gauss–Newton (Levenberg–Marquardt) with Marquardt column scaling.
#[derive(Debug, Clone, Copy, Default)]
pub struct LevenbergMarquardt;

/// Samples that survive filtering for one pixel.
#[derive(Debug, Clone, Default)]
pub struct SampleSet {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub w: Vec<f64>,
}

impl SampleSet {
    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }
}

/// Select the samples that take part in the objective.
///
/// Zero-weight samples never contribute and are dropped. Non-finite samples are
/// dropped when `filter_non_finite` is set; otherwise their presence is an error.
/// A negative weight is never a mask and makes the pixel degenerate.
pub fn select_samples(
    x: &[f64],
    y: &[f64],
    weights: &[f64],
    filter_non_finite: bool,
) -> Result<SampleSet, FailureKind> {
    if x.len() != y.len() || y.len() != weights.len() {
        return Err(FailureKind::Degenerate);
    }

    let mut set = SampleSet::default();
    for ((&xi, &yi), &wi) in x.iter().zip(y).zip(weights) {
        // Masked samples are excluded whatever their value.
        if wi == 0.0 {
            continue;
        }
        if !(xi.is_finite() && yi.is_finite() && wi.is_finite()) {
            if filter_non_finite {
                continue;
            }
            return Err(FailureKind::NonFiniteInput);
        }
        if wi < 0.0 {
            return Err(FailureKind::Degenerate);
        }
        set.x.push(xi);
        set.y.push(yi);
        set.w.push(wi);
    }
    Ok(set)
}

impl Fitter for LevenbergMarquardt {
    fn name(&self) -> &str {
        "levenberg-marquardt"
    }

    fn fit(
        &self,
        template: &ModelTemplate,
        x: &[f64],
        y: &[f64],
        weights: &[f64],
        options: &FitOptions,
    ) -> PixelFit {
        let samples = match select_samples(x, y, weights, options.filter_non_finite) {
            Ok(s) => s,
            Err(kind) => return PixelFit::failed(kind, template.initial()),
        };

        let free = template.free_indices();
        if samples.is_empty() || samples.len() < free.len() {
            return PixelFit::failed(FailureKind::Degenerate, template.initial());
        }

        match minimize(template, &free, &samples, &options.solver, options.deadline) {
            Ok((params, diagnostics)) => PixelFit::Fitted { params, diagnostics },
            Err(kind) => PixelFit::failed(kind, template.initial()),
        }
    }
}

fn past(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

fn weighted_residuals(template: &ModelTemplate, samples: &SampleSet, params: &[f64], out: &mut DVector<f64>) -> f64 {
    let mut cost = 0.0;
    for i in 0..samples.len() {
        let r = samples.w[i] * (samples.y[i] - template.evaluate(samples.x[i], params));
        out[i] = r;
        cost += r * r;
    }
    cost
}

fn fill_jacobian(
    template: &ModelTemplate,
    samples: &SampleSet,
    params: &[f64],
    free: &[usize],
    row: &mut [f64],
    jac: &mut DMatrix<f64>,
) {
    for i in 0..samples.len() {
        template.jacobian_row(samples.x[i], params, row);
        for (j, &p) in free.iter().enumerate() {
            jac[(i, j)] = samples.w[i] * row[p];
        }
    }
}

fn minimize(
    template: &ModelTemplate,
    free: &[usize],
    samples: &SampleSet,
    opts: &SolverOptions,
    deadline: Option<Instant>,
) -> Result<(Vec<f64>, FitDiagnostics), FailureKind> {
    let n = samples.len();
    let k = free.len();

    let mut params = template.fresh_params();
    template.clamp(&mut params);

    let mut residuals = DVector::<f64>::zeros(n);
    let mut trial_residuals = DVector::<f64>::zeros(n);
    let mut jac = DMatrix::<f64>::zeros(n, k);
    let mut row = vec![0.0; template.n_params()];
    let mut scale = vec![f64::EPSILON; k];

    let mut cost = weighted_residuals(template, samples, &params, &mut residuals);
    if !cost.is_finite() {
        return Err(FailureKind::SolverBreakdown);
    }

    let mut lambda = opts.initial_lambda.max(0.0);
    let mut converged = cost == 0.0;
    let mut iterations = 0;
    let mut need_jacobian = true;

    while !converged && iterations < opts.max_iterations {
        if past(deadline) {
            return Err(FailureKind::TimedOut);
        }
        iterations += 1;

        if need_jacobian {
            fill_jacobian(template, samples, &params, free, &mut row, &mut jac);
            if jac.iter().any(|v| !v.is_finite()) {
                return Err(FailureKind::SolverBreakdown);
            }
            // Marquardt scaling: never shrink a column scale once it has grown.
            for (j, s) in scale.iter_mut().enumerate() {
                *s = s.max(jac.column(j).norm());
            }
            let gradient = jac.tr_mul(&residuals);
            let g_max = gradient
                .iter()
                .zip(&scale)
                .fold(0.0_f64, |acc, (g, s)| acc.max(g.abs() / s));
            if g_max <= opts.gtol {
                converged = true;
                break;
            }
        }

        let Some(step) = solve_damped_step(&jac, &residuals, lambda, &scale) else {
            return Err(FailureKind::SolverBreakdown);
        };

        let mut trial = params.clone();
        for (j, &p) in free.iter().enumerate() {
            trial[p] += step[j];
        }
        template.clamp(&mut trial);

        let trial_cost = weighted_residuals(template, samples, &trial, &mut trial_residuals);

        if trial_cost.is_finite() && trial_cost < cost {
            let reduction = cost - trial_cost;
            let step_norm = free
                .iter()
                .map(|&p| (trial[p] - params[p]).powi(2))
                .sum::<f64>()
                .sqrt();
            let param_norm = free.iter().map(|&p| params[p].powi(2)).sum::<f64>().sqrt();

            params = trial;
            std::mem::swap(&mut residuals, &mut trial_residuals);
            cost = trial_cost;
            lambda *= opts.lambda_down;
            need_jacobian = true;

            if cost == 0.0
                || reduction <= opts.ftol * (cost + reduction)
                || step_norm <= opts.xtol * (param_norm + opts.xtol)
            {
                converged = true;
            }
        } else {
            lambda = (lambda * opts.lambda_up).max(f64::MIN_POSITIVE);
            need_jacobian = false;
            if lambda > LAMBDA_MAX {
                // No descent step exists at working precision: this is the minimum.
                converged = true;
            }
        }
    }

    Ok((
        params,
        FitDiagnostics {
            rss: cost,
            iterations,
            n_effective: n,
            converged,
        },
    ))
}

/// Per-pixel options derived from a driver configuration.
pub fn fit_options(config: &DriverConfig, deadline: Option<Instant>) -> FitOptions {
    FitOptions {
        filter_non_finite: config.filter_non_finite,
        solver: config.fitter_options.clone(),
        deadline,
    }
}

/// Fit a single pixel exactly the way the driver would.
///
/// Meant for debugging one spectrum before launching a full run; the result is
/// bit-identical to the corresponding slot of a driver run.
pub fn fit_pixel<F: Fitter + ?Sized>(
    fitter: &F,
    template: &ModelTemplate,
    x: &[f64],
    y: &[f64],
    weights: &[f64],
    config: &DriverConfig,
) -> PixelFit {
    fitter.fit(template, x, y, weights, &fit_options(config, None))
}
