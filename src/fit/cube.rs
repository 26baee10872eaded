//! The assembled output of a driver run.
//!
//! One array per model parameter, each shaped like the independent pixel axes
//! of the input cube, plus a status array of the same shape. Failed pixels hold
//! `NaN` in every parameter slot; their status says why.

use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};

use crate::domain::{FailureKind, PixelFit, PixelStatus};
use crate::error::FitError;

/// Per-parameter result arrays for every pixel of a cube.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterCube {
    names: Vec<String>,
    pixel_shape: Vec<usize>,
    values: Vec<ArrayD<f64>>,
    status: ArrayD<PixelStatus>,
    rss: ArrayD<f64>,
    iterations: ArrayD<usize>,
}

/// Status counts of a finished run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FitSummary {
    pub n_pixels: usize,
    pub fitted: usize,
    pub not_converged: usize,
    /// Failure counts in `FailureKind::ALL` order, zero counts included.
    pub failures: Vec<(FailureKind, usize)>,
}

impl FitSummary {
    pub fn failed(&self) -> usize {
        self.failures.iter().map(|(_, n)| n).sum()
    }

    pub fn count(&self, kind: FailureKind) -> usize {
        self.failures
            .iter()
            .find(|(k, _)| *k == kind)
            .map_or(0, |(_, n)| *n)
    }

    /// Fraction of pixels that ended up with parameters.
    pub fn success_rate(&self) -> f64 {
        if self.n_pixels == 0 {
            return 1.0;
        }
        (self.fitted + self.not_converged) as f64 / self.n_pixels as f64
    }
}

impl ParameterCube {
    /// Build the cube from `(pixel number, fit)` pairs in any order.
    ///
    /// Every pixel of `pixel_shape` must appear exactly once.
    pub fn assemble<I>(names: Vec<String>, pixel_shape: Vec<usize>, fits: I) -> Result<Self, FitError>
    where
        I: IntoIterator<Item = (usize, PixelFit)>,
    {
        let n_pixels: usize = pixel_shape.iter().product();
        let n_params = names.len();

        let mut columns = vec![vec![f64::NAN; n_pixels]; n_params];
        let mut status = vec![PixelStatus::Pending; n_pixels];
        let mut rss = vec![f64::NAN; n_pixels];
        let mut iterations = vec![0usize; n_pixels];

        for (pixel, fit) in fits {
            if pixel >= n_pixels {
                return Err(FitError::config(format!(
                    "pixel {pixel} is outside a cube of {n_pixels} pixels"
                )));
            }
            if status[pixel] != PixelStatus::Pending {
                return Err(FitError::config(format!("pixel {pixel} was written twice")));
            }
            status[pixel] = fit.status();

            if let PixelFit::Fitted { params, diagnostics } = &fit {
                if params.len() != n_params {
                    return Err(FitError::config(format!(
                        "pixel {pixel} has {} parameters, expected {n_params}",
                        params.len()
                    )));
                }
                for (column, &value) in columns.iter_mut().zip(params) {
                    column[pixel] = value;
                }
                rss[pixel] = diagnostics.rss;
                iterations[pixel] = diagnostics.iterations;
            }
        }

        if let Some(pixel) = status.iter().position(|s| *s == PixelStatus::Pending) {
            return Err(FitError::config(format!("pixel {pixel} was never written")));
        }

        let shape = IxDyn(&pixel_shape);
        let shape_err = |e: ndarray::ShapeError| FitError::config(format!("output shape error: {e}"));
        let values = columns
            .into_iter()
            .map(|c| ArrayD::from_shape_vec(shape.clone(), c).map_err(shape_err))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            names,
            values,
            status: ArrayD::from_shape_vec(shape.clone(), status).map_err(shape_err)?,
            rss: ArrayD::from_shape_vec(shape.clone(), rss).map_err(shape_err)?,
            iterations: ArrayD::from_shape_vec(shape, iterations).map_err(shape_err)?,
            pixel_shape,
        })
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn pixel_shape(&self) -> &[usize] {
        &self.pixel_shape
    }

    pub fn n_pixels(&self) -> usize {
        self.pixel_shape.iter().product()
    }

    /// Result array of one parameter, by name.
    pub fn parameter(&self, name: &str) -> Option<&ArrayD<f64>> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| &self.values[i])
    }

    pub fn parameters(&self) -> impl Iterator<Item = (&str, &ArrayD<f64>)> {
        self.names.iter().map(String::as_str).zip(&self.values)
    }

    pub fn status(&self) -> &ArrayD<PixelStatus> {
        &self.status
    }

    /// Weighted residual sum of squares per pixel (`NaN` for failed pixels).
    pub fn rss(&self) -> &ArrayD<f64> {
        &self.rss
    }

    pub fn iterations(&self) -> &ArrayD<usize> {
        &self.iterations
    }

    /// All parameters of one pixel, in template order.
    pub fn params_at(&self, index: &[usize]) -> Option<Vec<f64>> {
        if index.len() != self.pixel_shape.len() {
            return None;
        }
        self.values
            .iter()
            .map(|v| v.get(IxDyn(index)).copied())
            .collect()
    }

    pub fn status_at(&self, index: &[usize]) -> Option<PixelStatus> {
        if index.len() != self.pixel_shape.len() {
            return None;
        }
        self.status.get(IxDyn(index)).copied()
    }

    pub fn summary(&self) -> FitSummary {
        let mut summary = FitSummary {
            n_pixels: self.n_pixels(),
            fitted: 0,
            not_converged: 0,
            failures: FailureKind::ALL.iter().map(|k| (*k, 0)).collect(),
        };
        for status in &self.status {
            match status {
                PixelStatus::Fitted => summary.fitted += 1,
                PixelStatus::NotConverged => summary.not_converged += 1,
                PixelStatus::Failed(kind) => {
                    if let Some(slot) = summary.failures.iter_mut().find(|(k, _)| k == kind) {
                        slot.1 += 1;
                    }
                }
                PixelStatus::Pending => {}
            }
        }
        summary
    }

    /// Bit-for-bit equality, treating `NaN` slots as equal.
    pub fn identical(&self, other: &ParameterCube) -> bool {
        let same_bits = |a: &ArrayD<f64>, b: &ArrayD<f64>| {
            a.shape() == b.shape() && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
        };
        self.names == other.names
            && self.pixel_shape == other.pixel_shape
            && self.status == other.status
            && self.iterations == other.iterations
            && same_bits(&self.rss, &other.rss)
            && self.values.len() == other.values.len()
            && self.values.iter().zip(&other.values).all(|(a, b)| same_bits(a, b))
    }
}
