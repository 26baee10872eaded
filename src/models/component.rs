//! Atomic 1-D models.
//!
//! Each component is a closed-form function with analytic derivatives. They
//! are combined into larger models with `+` and `*` (see `compound`).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::FitError;
use crate::models::compound::CompoundModel;

/// Atomic model kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Component {
    /// `f(x) = amplitude`
    Const1D,
    /// `f(x) = slope * x + intercept`
    Linear1D,
    /// `f(x) = amplitude * exp(-(x - mean)² / (2 stddev²))`
    Gaussian1D,
    /// `f(x) = amplitude * γ² / ((x - x_0)² + γ²)` with `γ = fwhm / 2`
    Lorentz1D,
}

impl Component {
    pub fn param_names(self) -> &'static [&'static str] {
        match self {
            Component::Const1D => &["amplitude"],
            Component::Linear1D => &["slope", "intercept"],
            Component::Gaussian1D => &["amplitude", "mean", "stddev"],
            Component::Lorentz1D => &["amplitude", "x_0", "fwhm"],
        }
    }

    pub fn n_params(self) -> usize {
        self.param_names().len()
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Component::Const1D => "Const1D",
            Component::Linear1D => "Linear1D",
            Component::Gaussian1D => "Gaussian1D",
            Component::Lorentz1D => "Lorentz1D",
        }
    }

    /// Wrap this component with its initial parameters into a model leaf.
    pub fn with_initial(self, initial: &[f64]) -> Result<CompoundModel, FitError> {
        if initial.len() != self.n_params() {
            return Err(FitError::config(format!(
                "{} takes {} parameters, got {}",
                self.display_name(),
                self.n_params(),
                initial.len()
            )));
        }
        Ok(CompoundModel::Leaf {
            component: self,
            initial: initial.to_vec(),
        })
    }

    /// Evaluate at `x`. `p` holds exactly this component's parameters.
    pub fn eval(self, x: f64, p: &[f64]) -> f64 {
        match self {
            Component::Const1D => p[0],
            Component::Linear1D => p[0] * x + p[1],
            Component::Gaussian1D => {
                let (amplitude, mean, stddev) = (p[0], p[1], p[2]);
                let d = x - mean;
                amplitude * (-(d * d) / (2.0 * stddev * stddev)).exp()
            }
            Component::Lorentz1D => {
                let (amplitude, x_0, fwhm) = (p[0], p[1], p[2]);
                let gamma = 0.5 * fwhm;
                let d = x - x_0;
                amplitude * gamma * gamma / (d * d + gamma * gamma)
            }
        }
    }

    /// Analytic partial derivatives at `x`, written to `out[..n_params]`.
    pub fn jacobian_row(self, x: f64, p: &[f64], out: &mut [f64]) {
        match self {
            Component::Const1D => {
                out[0] = 1.0;
            }
            Component::Linear1D => {
                out[0] = x;
                out[1] = 1.0;
            }
            Component::Gaussian1D => {
                let (amplitude, mean, stddev) = (p[0], p[1], p[2]);
                let d = x - mean;
                let s2 = stddev * stddev;
                let e = (-(d * d) / (2.0 * s2)).exp();
                out[0] = e;
                out[1] = amplitude * e * d / s2;
                out[2] = amplitude * e * d * d / (s2 * stddev);
            }
            Component::Lorentz1D => {
                let (amplitude, x_0, fwhm) = (p[0], p[1], p[2]);
                let gamma = 0.5 * fwhm;
                let g2 = gamma * gamma;
                let d = x - x_0;
                let denom = d * d + g2;
                let denom2 = denom * denom;
                out[0] = g2 / denom;
                out[1] = 2.0 * amplitude * g2 * d / denom2;
                // ∂/∂fwhm = ½ ∂/∂γ
                out[2] = amplitude * gamma * d * d / denom2;
            }
        }
    }

    /// Model leaf: constant.
    pub fn const1d(amplitude: f64) -> CompoundModel {
        CompoundModel::Leaf {
            component: Component::Const1D,
            initial: vec![amplitude],
        }
    }

    /// Model leaf: straight line.
    pub fn linear1d(slope: f64, intercept: f64) -> CompoundModel {
        CompoundModel::Leaf {
            component: Component::Linear1D,
            initial: vec![slope, intercept],
        }
    }

    /// Model leaf: Gaussian line profile.
    pub fn gaussian1d(amplitude: f64, mean: f64, stddev: f64) -> CompoundModel {
        CompoundModel::Leaf {
            component: Component::Gaussian1D,
            initial: vec![amplitude, mean, stddev],
        }
    }

    /// Model leaf: Lorentzian line profile.
    pub fn lorentz1d(amplitude: f64, x_0: f64, fwhm: f64) -> CompoundModel {
        CompoundModel::Leaf {
            component: Component::Lorentz1D,
            initial: vec![amplitude, x_0, fwhm],
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}
