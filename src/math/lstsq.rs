//! Weighted and damped least squares solves.
//!
//! Every solver step of the per-pixel fitter reduces to a small linear
//! least-squares problem:
//!
//! ```text
//! minimize ‖J δ - r‖² + λ ‖D δ‖²
//! ```
//!
//! where `J` is the weighted Jacobian of the free parameters, `r` the weighted
//! residuals and `D` a diagonal scaling. We solve it by stacking `sqrt(λ) D`
//! under `J` and running an SVD solve on the tall system, which stays well
//! behaved when `JᵀJ` is near singular (e.g. a line whose amplitude has gone
//! to zero makes its width unidentifiable).

use nalgebra::{DMatrix, DVector};

/// Solve a least squares problem using SVD.
///
/// Returns `None` if the system is too ill-conditioned to solve robustly.
pub fn solve_least_squares(x: &DMatrix<f64>, y: &DVector<f64>) -> Option<DVector<f64>> {
    let svd = x.clone().svd(true, true);

    // Try progressively looser tolerances if strict solve fails.
    for &tol in &[1e-14, 1e-10, 1e-8] {
        if let Ok(beta) = svd.solve(y, tol) {
            if beta.iter().all(|v| v.is_finite()) {
                return Some(beta);
            }
        }
    }

    None
}

/// Solve the Levenberg–Marquardt step `min ‖J δ - r‖² + λ ‖diag(scale) δ‖²`.
///
/// `scale` must have one entry per column of `jac`.
pub fn solve_damped_step(
    jac: &DMatrix<f64>,
    residuals: &DVector<f64>,
    lambda: f64,
    scale: &[f64],
) -> Option<DVector<f64>> {
    let (n, p) = jac.shape();
    if scale.len() != p || residuals.len() != n {
        return None;
    }

    let damping = lambda.max(0.0).sqrt();
    let mut a = DMatrix::<f64>::zeros(n + p, p);
    a.view_mut((0, 0), (n, p)).copy_from(jac);
    for j in 0..p {
        a[(n + j, j)] = damping * scale[j];
    }

    let mut b = DVector::<f64>::zeros(n + p);
    b.rows_mut(0, n).copy_from(residuals);

    solve_least_squares(&a, &b)
}
