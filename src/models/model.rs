//! The model abstraction the fitter works against.
//!
//! The fitter relies on two primitive operations:
//! - predict `f(x; θ)` for a parameter vector (for residuals)
//! - fill a Jacobian row `∂f(x; θ)/∂θ_j` (for the solver step)
//!
//! Models never own mutable parameter state; parameters are always passed in,
//! so one model value can be shared read-only by every concurrent fit.

use std::fmt;

/// A pure parametric function of one independent variable.
pub trait ParametricModel: Send + Sync + fmt::Debug {
    /// Ordered parameter names. Defines the layout of every parameter vector.
    fn param_names(&self) -> Vec<String>;

    fn n_params(&self) -> usize {
        self.param_names().len()
    }

    /// Evaluate the model at `x`.
    fn eval(&self, x: f64, params: &[f64]) -> f64;

    /// Fill `out[j] = ∂f(x; θ)/∂θ_j`.
    ///
    /// The default uses forward differences; models with closed-form
    /// derivatives should override it.
    fn jacobian_row(&self, x: f64, params: &[f64], out: &mut [f64]) {
        forward_difference_row(self, x, params, out);
    }
}

/// Forward-difference Jacobian row.
///
/// Step per parameter is `sqrt(ε) * max(|θ_j|, 1)`, which is deterministic for a
/// given parameter vector.
pub fn forward_difference_row<M: ParametricModel + ?Sized>(
    model: &M,
    x: f64,
    params: &[f64],
    out: &mut [f64],
) {
    let f0 = model.eval(x, params);
    let mut shifted = params.to_vec();
    for (j, slot) in out.iter_mut().enumerate().take(params.len()) {
        let h = f64::EPSILON.sqrt() * params[j].abs().max(1.0);
        shifted[j] = params[j] + h;
        *slot = (model.eval(x, &shifted) - f0) / h;
        shifted[j] = params[j];
    }
}
