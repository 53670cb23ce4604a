//! Gaussian log likelihoods of averaged observables.
//!
//! All functions return `-inf` instead of NaN or an error when the inputs do
//! not give a finite result, so the value can go straight to the sampler.

use faer::{linalg::solvers::Solve, Col, Mat, Side};
use itertools::izip;
use ndarray::{Array1, Array2};

/// `-1/2 sum (observed - predicted)^2 / variance` over independent bins.
///
/// Bins where observed and predicted agree exactly contribute nothing, even
/// if their variance is zero or infinite.
pub fn chi_squared(observed: &[f64], predicted: &[f64], variance: &[f64]) -> f64 {
    if observed.len() != predicted.len() || observed.len() != variance.len() {
        return f64::NEG_INFINITY;
    }
    let chi2: f64 = izip!(observed, predicted, variance)
        .map(|(&o, &p, &var)| {
            let diff = o - p;
            if diff == 0. {
                0.
            } else {
                diff * diff / var
            }
        })
        .sum();
    let lnlike = -0.5 * chi2;
    if lnlike.is_nan() {
        f64::NEG_INFINITY
    } else {
        lnlike
    }
}

/// Rescales a reference covariance, estimated for per-bin variances
/// `ind_var_0`, to the current variances `ind_var` and divides it by the
/// effective number of patches:
/// `C_ij = C0_ij sqrt(v_i v_j / (v0_i v0_j)) / n_patches`.
pub fn scaled_covariance(
    cov_mat_0: &Array2<f64>,
    ind_var: &[f64],
    ind_var_0: &Array1<f64>,
    n_patches: f64,
) -> Array2<f64> {
    let ratio: Vec<f64> = ind_var
        .iter()
        .zip(ind_var_0)
        .map(|(v, v0)| (v / v0).sqrt())
        .collect();
    Array2::from_shape_fn(cov_mat_0.dim(), |(i, j)| {
        cov_mat_0[[i, j]] * ratio[i] * ratio[j] / n_patches
    })
}

/// `-1/2 r^T C^-1 r` with `r = observed - predicted`, solved through the
/// Cholesky factor of `covariance`. Returns `-inf` if the covariance is not
/// positive definite or anything is non-finite.
pub fn chi_squared_cov(observed: &[f64], predicted: &[f64], covariance: &Array2<f64>) -> f64 {
    let n = observed.len();
    if predicted.len() != n || covariance.dim() != (n, n) {
        return f64::NEG_INFINITY;
    }
    if covariance.iter().any(|c| !c.is_finite()) {
        return f64::NEG_INFINITY;
    }
    let residual = Col::<f64>::from_fn(n, |i| observed[i] - predicted[i]);
    if residual.iter().any(|r| !r.is_finite()) {
        return f64::NEG_INFINITY;
    }

    let cov = Mat::<f64>::from_fn(n, n, |i, j| covariance[[i, j]]);
    let Ok(llt) = cov.llt(Side::Lower) else {
        log::debug!("Covariance is not positive definite");
        return f64::NEG_INFINITY;
    };
    let weighted = llt.solve(&residual);
    let chi2: f64 = residual.iter().zip(weighted.iter()).map(|(r, w)| r * w).sum();
    let lnlike = -0.5 * chi2;
    if lnlike.is_finite() {
        lnlike
    } else {
        f64::NEG_INFINITY
    }
}
