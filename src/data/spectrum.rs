//! Spatially averaged spectra.
//!
//! Averaging every pixel of a raster gives one high signal-to-noise spectrum,
//! which is a quick way to check the model and its starting values before
//! fitting the whole cube.

use ndarray::{ArrayD, Axis, Zip};

use crate::data::weights::SampleWeights;
use crate::error::FitError;

/// Mean over the pixel axes, one entry per fitting-axis sample.
#[derive(Debug, Clone, PartialEq)]
pub struct MeanSpectrum {
    pub values: Vec<f64>,
    /// One-sigma uncertainty of each mean, from the per-sample weights.
    pub uncertainty: Vec<f64>,
    /// Samples that entered each mean.
    pub counts: Vec<usize>,
}

/// Average `data` over every axis except `fitting_axis`.
///
/// Masked samples and non-finite values are skipped. A sample position with
/// no usable values gets `NaN` for both value and uncertainty.
pub fn mean_spectrum(
    data: &ArrayD<f64>,
    weights: &SampleWeights,
    fitting_axis: usize,
) -> Result<MeanSpectrum, FitError> {
    if fitting_axis >= data.ndim() {
        return Err(FitError::config(format!(
            "fitting axis {fitting_axis} out of range for a {}-D cube",
            data.ndim()
        )));
    }
    if weights.weights.shape() != data.shape() || weights.invalid.shape() != data.shape() {
        return Err(FitError::config(format!(
            "weight shape {:?} does not match data shape {:?}",
            weights.weights.shape(),
            data.shape()
        )));
    }

    let axis = Axis(fitting_axis);
    let n_samples = data.len_of(axis);
    let mut out = MeanSpectrum {
        values: Vec::with_capacity(n_samples),
        uncertainty: Vec::with_capacity(n_samples),
        counts: Vec::with_capacity(n_samples),
    };

    for ((plane, weight_plane), mask_plane) in data
        .axis_iter(axis)
        .zip(weights.weights.axis_iter(axis))
        .zip(weights.invalid.axis_iter(axis))
    {
        let mut sum = 0.0;
        let mut variance = 0.0;
        let mut count = 0usize;
        Zip::from(&plane).and(&weight_plane).and(&mask_plane).for_each(|&v, &w, &bad| {
            if bad || w == 0.0 || !v.is_finite() {
                return;
            }
            sum += v;
            variance += 1.0 / (w * w);
            count += 1;
        });

        if count == 0 {
            out.values.push(f64::NAN);
            out.uncertainty.push(f64::NAN);
        } else {
            let n = count as f64;
            out.values.push(sum / n);
            out.uncertainty.push(variance.sqrt() / n);
        }
        out.counts.push(count);
    }

    Ok(out)
}
