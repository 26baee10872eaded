//! Immutable model templates shared by every pixel fit.
//!
//! A template pairs a model with its initial guess and parameter constraints.
//! It is cheap to clone (the model sits behind an `Arc`) and is only ever read
//! during a run: each fit starts from [`ModelTemplate::fresh_params`], a private
//! copy of the initial vector.

use std::fmt;
use std::sync::Arc;

use crate::error::FitError;
use crate::models::compound::CompoundModel;
use crate::models::model::ParametricModel;

#[derive(Clone)]
pub struct ModelTemplate {
    model: Arc<dyn ParametricModel>,
    label: String,
    names: Vec<String>,
    initial: Vec<f64>,
    fixed: Vec<bool>,
    bounds: Vec<(f64, f64)>,
}

impl ModelTemplate {
    /// Template for a compound model, using the initial values of its leaves.
    pub fn from_compound(model: CompoundModel) -> Result<Self, FitError> {
        let initial = model.initial_params();
        let label = model.to_string();
        Self::build(Arc::new(model), label, initial)
    }

    /// Template for any model implementation with an explicit initial guess.
    pub fn new<M>(model: M, initial: Vec<f64>) -> Result<Self, FitError>
    where
        M: ParametricModel + 'static,
    {
        let label = format!("{model:?}");
        Self::build(Arc::new(model), label, initial)
    }

    fn build(model: Arc<dyn ParametricModel>, label: String, initial: Vec<f64>) -> Result<Self, FitError> {
        let names = model.param_names();
        if names.is_empty() {
            return Err(FitError::config("model has no parameters"));
        }
        if names.len() != initial.len() {
            return Err(FitError::config(format!(
                "model has {} parameters but {} initial values were given",
                names.len(),
                initial.len()
            )));
        }
        for (i, name) in names.iter().enumerate() {
            if names[..i].contains(name) {
                return Err(FitError::config(format!("duplicate parameter name '{name}'")));
            }
        }
        if let Some((name, value)) = names.iter().zip(&initial).find(|(_, v)| !v.is_finite()) {
            return Err(FitError::config(format!(
                "initial value of '{name}' is not finite ({value})"
            )));
        }

        let n = names.len();
        Ok(Self {
            model,
            label,
            names,
            initial,
            fixed: vec![false; n],
            bounds: vec![(f64::NEG_INFINITY, f64::INFINITY); n],
        })
    }

    /// Hold a parameter at its initial value during fitting.
    pub fn fix(mut self, name: &str) -> Result<Self, FitError> {
        let idx = self.index_of(name)?;
        self.fixed[idx] = true;
        if self.n_free() == 0 {
            return Err(FitError::config("all parameters are fixed"));
        }
        Ok(self)
    }

    /// Constrain a parameter to `[lower, upper]`.
    pub fn bound(mut self, name: &str, lower: f64, upper: f64) -> Result<Self, FitError> {
        let idx = self.index_of(name)?;
        if lower.is_nan() || upper.is_nan() || lower > upper {
            return Err(FitError::config(format!(
                "invalid bounds for '{name}': [{lower}, {upper}]"
            )));
        }
        let v = self.initial[idx];
        if v < lower || v > upper {
            return Err(FitError::config(format!(
                "initial value of '{name}' ({v}) lies outside [{lower}, {upper}]"
            )));
        }
        self.bounds[idx] = (lower, upper);
        Ok(self)
    }

    fn index_of(&self, name: &str) -> Result<usize, FitError> {
        self.names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| FitError::config(format!("unknown parameter '{name}'")))
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn param_names(&self) -> &[String] {
        &self.names
    }

    pub fn n_params(&self) -> usize {
        self.names.len()
    }

    pub fn initial(&self) -> &[f64] {
        &self.initial
    }

    pub fn is_fixed(&self, idx: usize) -> bool {
        self.fixed[idx]
    }

    /// Indices of parameters the solver is allowed to move.
    pub fn free_indices(&self) -> Vec<usize> {
        (0..self.names.len()).filter(|&i| !self.fixed[i]).collect()
    }

    pub fn n_free(&self) -> usize {
        self.fixed.iter().filter(|f| !**f).count()
    }

    /// A private, mutable copy of the initial parameters for one fit.
    pub fn fresh_params(&self) -> Vec<f64> {
        self.initial.clone()
    }

    /// Clamp parameters into their bounds (in place).
    pub fn clamp(&self, params: &mut [f64]) {
        for (v, &(lo, hi)) in params.iter_mut().zip(&self.bounds) {
            *v = v.clamp(lo, hi);
        }
    }

    /// Evaluate the model with the given parameters.
    pub fn evaluate(&self, x: f64, params: &[f64]) -> f64 {
        self.model.eval(x, params)
    }

    pub fn jacobian_row(&self, x: f64, params: &[f64], out: &mut [f64]) {
        self.model.jacobian_row(x, params, out);
    }

    /// Template with the same model and constraints but another starting point.
    ///
    /// Useful to turn a fitted parameter vector back into a model instance.
    pub fn with_parameters(&self, params: &[f64]) -> Result<Self, FitError> {
        if params.len() != self.names.len() {
            return Err(FitError::config(format!(
                "expected {} parameters, got {}",
                self.names.len(),
                params.len()
            )));
        }
        let mut out = self.clone();
        out.initial = params.to_vec();
        Ok(out)
    }
}

impl fmt::Debug for ModelTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelTemplate")
            .field("model", &self.label)
            .field("names", &self.names)
            .field("initial", &self.initial)
            .field("fixed", &self.fixed)
            .finish()
    }
}
