//! Per-sample validity masks and fit weights.
//!
//! A sample is invalid when its one-sigma uncertainty is non-finite,
//! non-positive or so small that `1/σ` overflows, or when the calibration step
//! flagged it. Valid samples get the
//! weight `1/σ` (the fitter multiplies residuals by it); invalid samples get
//! exactly `0`, so they never contribute to a fit.

use ndarray::{ArrayD, Zip};

use crate::error::FitError;

/// Validity mask and weights, both shaped like the cube.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleWeights {
    /// `true` marks an invalid (excluded) sample.
    pub invalid: ArrayD<bool>,
    pub weights: ArrayD<f64>,
}

impl SampleWeights {
    /// Number of samples that will take part in fits.
    pub fn n_valid(&self) -> usize {
        self.invalid.iter().filter(|bad| !**bad).count()
    }
}

/// `true` when an uncertainty value cannot be used as a weight.
pub fn is_invalid_sigma(sigma: f64) -> bool {
    !sigma.is_finite() || sigma <= 0.0 || !sigma.recip().is_finite()
}

/// Derive the validity mask and weights for a cube.
///
/// `data` is only used to check that all arrays share one shape.
pub fn build_weights(
    data: &ArrayD<f64>,
    uncertainty: &ArrayD<f64>,
    external_mask: Option<&ArrayD<bool>>,
) -> Result<SampleWeights, FitError> {
    if data.shape() != uncertainty.shape() {
        return Err(FitError::config(format!(
            "uncertainty shape {:?} does not match data shape {:?}",
            uncertainty.shape(),
            data.shape()
        )));
    }

    let mut invalid = uncertainty.mapv(is_invalid_sigma);
    if let Some(flags) = external_mask {
        if flags.shape() != data.shape() {
            return Err(FitError::config(format!(
                "mask shape {:?} does not match data shape {:?}",
                flags.shape(),
                data.shape()
            )));
        }
        Zip::from(&mut invalid).and(flags).for_each(|bad, &flag| *bad |= flag);
    }

    let weights = Zip::from(uncertainty)
        .and(&invalid)
        .map_collect(|&sigma, &bad| if bad { 0.0 } else { 1.0 / sigma });

    Ok(SampleWeights { invalid, weights })
}
