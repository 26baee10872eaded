//! Composite models: sums and products of atomic components.
//!
//! ```
//! use pixfit::models::{Component, ParametricModel};
//!
//! let model = Component::const1d(1.0) + Component::gaussian1d(4.0, 976.8, 1.0);
//! assert_eq!(
//!     model.param_names(),
//!     ["amplitude_0", "amplitude_1", "mean_1", "stddev_1"]
//! );
//! ```
//!
//! Parameters are laid out leaf by leaf, left to right. With more than one leaf
//! every name gets the leaf index as a suffix.

use std::fmt;
use std::ops::{Add, Mul};

use crate::models::component::Component;
use crate::models::model::ParametricModel;

/// Expression tree over atomic components.
#[derive(Debug, Clone, PartialEq)]
pub enum CompoundModel {
    Leaf {
        component: Component,
        initial: Vec<f64>,
    },
    Sum(Box<CompoundModel>, Box<CompoundModel>),
    Product(Box<CompoundModel>, Box<CompoundModel>),
}

impl CompoundModel {
    /// Leaves in parameter-layout order.
    pub fn leaves(&self) -> Vec<(Component, &[f64])> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<(Component, &'a [f64])>) {
        match self {
            CompoundModel::Leaf { component, initial } => out.push((*component, initial.as_slice())),
            CompoundModel::Sum(l, r) | CompoundModel::Product(l, r) => {
                l.collect_leaves(out);
                r.collect_leaves(out);
            }
        }
    }

    /// Initial parameter vector in layout order.
    pub fn initial_params(&self) -> Vec<f64> {
        self.leaves()
            .into_iter()
            .flat_map(|(_, initial)| initial.iter().copied())
            .collect()
    }

    fn width(&self) -> usize {
        match self {
            CompoundModel::Leaf { component, .. } => component.n_params(),
            CompoundModel::Sum(l, r) | CompoundModel::Product(l, r) => l.width() + r.width(),
        }
    }

    fn eval_node(&self, x: f64, p: &[f64]) -> f64 {
        match self {
            CompoundModel::Leaf { component, .. } => component.eval(x, p),
            CompoundModel::Sum(l, r) => {
                let (pl, pr) = p.split_at(l.width());
                l.eval_node(x, pl) + r.eval_node(x, pr)
            }
            CompoundModel::Product(l, r) => {
                let (pl, pr) = p.split_at(l.width());
                l.eval_node(x, pl) * r.eval_node(x, pr)
            }
        }
    }

    fn jacobian_node(&self, x: f64, p: &[f64], out: &mut [f64]) {
        match self {
            CompoundModel::Leaf { component, .. } => component.jacobian_row(x, p, out),
            CompoundModel::Sum(l, r) => {
                let nl = l.width();
                let (pl, pr) = p.split_at(nl);
                let (ol, or) = out.split_at_mut(nl);
                l.jacobian_node(x, pl, ol);
                r.jacobian_node(x, pr, or);
            }
            CompoundModel::Product(l, r) => {
                // d(gh) = h dg + g dh
                let nl = l.width();
                let (pl, pr) = p.split_at(nl);
                let g = l.eval_node(x, pl);
                let h = r.eval_node(x, pr);
                let (ol, or) = out.split_at_mut(nl);
                l.jacobian_node(x, pl, ol);
                r.jacobian_node(x, pr, or);
                ol.iter_mut().for_each(|v| *v *= h);
                or.iter_mut().for_each(|v| *v *= g);
            }
        }
    }
}

impl ParametricModel for CompoundModel {
    fn param_names(&self) -> Vec<String> {
        let leaves = self.leaves();
        let suffix = leaves.len() > 1;
        leaves
            .iter()
            .enumerate()
            .flat_map(|(idx, (component, _))| {
                component.param_names().iter().map(move |name| {
                    if suffix {
                        format!("{name}_{idx}")
                    } else {
                        (*name).to_string()
                    }
                })
            })
            .collect()
    }

    fn n_params(&self) -> usize {
        self.width()
    }

    fn eval(&self, x: f64, params: &[f64]) -> f64 {
        self.eval_node(x, params)
    }

    fn jacobian_row(&self, x: f64, params: &[f64], out: &mut [f64]) {
        self.jacobian_node(x, params, out);
    }
}

impl Add for CompoundModel {
    type Output = CompoundModel;

    fn add(self, rhs: CompoundModel) -> CompoundModel {
        CompoundModel::Sum(Box::new(self), Box::new(rhs))
    }
}

impl Mul for CompoundModel {
    type Output = CompoundModel;

    fn mul(self, rhs: CompoundModel) -> CompoundModel {
        CompoundModel::Product(Box::new(self), Box::new(rhs))
    }
}

impl fmt::Display for CompoundModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompoundModel::Leaf { component, .. } => write!(f, "{component}"),
            CompoundModel::Sum(l, r) => write!(f, "{l} + {r}"),
            CompoundModel::Product(l, r) => {
                let wrap = |m: &CompoundModel| match m {
                    CompoundModel::Sum(..) => format!("({m})"),
                    _ => m.to_string(),
                };
                write!(f, "{} * {}", wrap(l), wrap(r))
            }
        }
    }
}
