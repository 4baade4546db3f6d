//! Kalman recursion over one cell: prior seeding, division-noise
//! injection, per-observation update and in-between propagation.
//!
//! The observation model sees the first two state components only,
//! `(x, g)` with independent Gaussian noise `diag(σ²_x, σ²_g)`. Two
//! conventions are inherited from the reference implementation and kept
//! for absolute-likelihood compatibility:
//!
//! - the per-observation constant is `-2 ln 2π` (one `ln 2π` per
//!   observed channel, double the usual `-d/2 ln 2π`);
//! - at root cells the observation variances double as the prior
//!   variances on (x, g), so the first update at a root is partially
//!   redundant. Both are deliberate, not bugs.

use nalgebra::{Matrix2, Matrix4, Vector2, Vector4};
use serde::{Deserialize, Serialize};

use crate::cell_tree::Cell;
use crate::params::Theta;
use crate::propagator::propagate;

/// Determinant floor below which the innovation covariance is treated
/// as singular and the objective coerced to -∞.
const DET_MIN: f64 = 1e-300;

/// Condition-number ceiling for the innovation covariance.
const COND_MAX: f64 = 1e12;

/// A Gaussian belief over the 4D latent state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GaussianState {
    pub mean: Vector4<f64>,
    pub cov: Matrix4<f64>,
}

/// Root prior: means from θ, variances from the observation noise for
/// (x, g) and the OU stationary-entry parameters for (λ, q).
pub fn root_prior(th: &Theta) -> (Vector4<f64>, Matrix4<f64>) {
    let mean = Vector4::new(th.mean_x0, th.mean_g0, th.mean_lambda, th.mean_q);
    let cov = Matrix4::from_diagonal(&Vector4::new(th.var_x, th.var_g, th.var_lambda, th.var_q));
    (mean, cov)
}

/// Division transform: `μ ← F μ + f`, `Σ ← F Σ Fᵀ + D` with
/// `F = diag(1, ½, 1, 1)`, `f = (-ln 2, 0, 0, 0)` and
/// `D = diag(σ²_dx, σ²_dg, 0, 0)`. Log-length drops by `ln 2`, the FP
/// amount halves, rates carry over, and division noise enters (x, g).
pub fn division_transform(
    parent_mean: &Vector4<f64>,
    parent_cov: &Matrix4<f64>,
    th: &Theta,
) -> (Vector4<f64>, Matrix4<f64>) {
    let f_mat = division_matrix();
    let f_vec = Vector4::new(-(2.0f64).ln(), 0.0, 0.0, 0.0);
    let d_mat = division_noise(th);

    let mean = f_mat * parent_mean + f_vec;
    let cov = f_mat * parent_cov * f_mat.transpose() + d_mat;
    (mean, cov)
}

pub(crate) fn division_matrix() -> Matrix4<f64> {
    Matrix4::from_diagonal(&Vector4::new(1.0, 0.5, 1.0, 1.0))
}

pub(crate) fn division_noise(th: &Theta) -> Matrix4<f64> {
    Matrix4::from_diagonal(&Vector4::new(th.var_dx, th.var_dg, 0.0, 0.0))
}

/// One Kalman update with innovation `y` against the (x, g) block.
///
/// Returns the log-likelihood increment, or -∞ when the innovation
/// covariance is singular or ill-conditioned (a correctness guard, not
/// a normal outcome inside the feasible box). `mean`/`cov` are left
/// untouched in that case.
pub fn kalman_update(
    mean: &mut Vector4<f64>,
    cov: &mut Matrix4<f64>,
    y: &Vector2<f64>,
    var_x: f64,
    var_g: f64,
) -> f64 {
    let s = cov.fixed_view::<2, 2>(0, 0) + Matrix2::new(var_x, 0.0, 0.0, var_g);
    let det = s.determinant();
    if !det.is_finite() || det.abs() <= DET_MIN {
        return f64::NEG_INFINITY;
    }
    // eigenvalue ratio of the symmetric 2x2
    let tr = s[(0, 0)] + s[(1, 1)];
    let disc = ((s[(0, 0)] - s[(1, 1)]).powi(2) + 4.0 * s[(0, 1)] * s[(0, 1)]).sqrt();
    let eig_min = (tr - disc) / 2.0;
    let eig_max = (tr + disc) / 2.0;
    if eig_min <= 0.0 || eig_max / eig_min > COND_MAX {
        return f64::NEG_INFINITY;
    }

    let si = match s.try_inverse() {
        Some(si) => si,
        None => return f64::NEG_INFINITY,
    };

    let ll = -0.5 * (y.transpose() * si * y)[(0, 0)]
        - 0.5 * det.ln()
        - 2.0 * (2.0 * std::f64::consts::PI).ln();

    let k = cov.fixed_view::<2, 4>(0, 0).into_owned();
    *mean += k.transpose() * si * y;
    *cov -= k.transpose() * si * k;
    ll
}

/// Runs the filter over one cell whose prior `(mean, cov)` has already
/// been seeded (root prior or division transform from the parent's
/// final state). Observations are processed in time order; the
/// innovation at each step is taken against the current propagated
/// mean, so the first one is measured against the prior itself.
///
/// Returns the cell's log-likelihood contribution; a non-finite value
/// (propagator overflow, singular innovation) short-circuits and is
/// handed back verbatim. When `record` is given, the post-update belief
/// at every observation is appended to it.
pub fn filter_cell(
    cell: &Cell,
    th: &Theta,
    mean: &mut Vector4<f64>,
    cov: &mut Matrix4<f64>,
    mut record: Option<&mut Vec<GaussianState>>,
) -> f64 {
    let mut ll = 0.0;
    let n = cell.len();
    for t in 0..n {
        let y = Vector2::new(cell.log_length[t] - mean[0], cell.fp[t] - mean[1]);
        ll += kalman_update(mean, cov, &y, th.var_x, th.var_g);
        if !ll.is_finite() {
            return ll;
        }
        if let Some(rec) = record.as_mut() {
            rec.push(GaussianState { mean: *mean, cov: *cov });
        }
        if t + 1 < n {
            let (m, c) = propagate(mean, cov, cell.time[t + 1] - cell.time[t], th);
            *mean = m;
            *cov = c;
        }
    }
    ll
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn theta() -> Theta {
        Theta {
            mean_lambda: 0.01,
            gamma_lambda: 0.02,
            var_lambda: 1e-5,
            mean_q: 1.0,
            gamma_q: 0.02,
            var_q: 0.01,
            beta: 0.005,
            var_x: 1e-3,
            var_g: 1e-2,
            var_dx: 1e-3,
            var_dg: 1e-2,
            mean_x0: 0.5,
            mean_g0: 10.0,
        }
    }

    #[test]
    fn test_single_root_observation_exact_scalar() {
        // One observation equal to the prior mean, OU variances zero,
        // unit observation variances. The prior doubles the (x, g)
        // variances, so S = diag(2, 2) and
        //   ll = -0.5 ln det S - 2 ln 2π
        let th = Theta {
            mean_lambda: 0.0,
            gamma_lambda: 0.02,
            var_lambda: 0.0,
            mean_q: 0.0,
            gamma_q: 0.02,
            var_q: 0.0,
            beta: 0.0,
            var_x: 1.0,
            var_g: 1.0,
            var_dx: 0.0,
            var_dg: 0.0,
            mean_x0: 0.0,
            mean_g0: 0.0,
        };
        let mut cell = Cell::new("r", "-");
        cell.time = vec![0.0];
        cell.log_length = vec![0.0];
        cell.fp = vec![0.0];

        let (mut mean, mut cov) = root_prior(&th);
        let ll = filter_cell(&cell, &th, &mut mean, &mut cov, None);
        let expected = -0.5 * 4.0f64.ln() - 2.0 * (2.0 * std::f64::consts::PI).ln();
        assert_relative_eq!(ll, expected, max_relative = 1e-14);
    }

    #[test]
    fn test_division_transform_halves_fp_shifts_log_length() {
        let mut th = theta();
        th.var_dx = 0.0;
        th.var_dg = 0.0;
        let parent_mean = Vector4::new(1.2, 80.0, 0.015, 2.0);
        let parent_cov = Matrix4::new(
            0.02, 0.01, 0.001, 0.002, //
            0.01, 4.0, 0.01, 0.05, //
            0.001, 0.01, 1e-4, 1e-5, //
            0.002, 0.05, 1e-5, 0.04,
        );
        let (m, c) = division_transform(&parent_mean, &parent_cov, &th);
        assert_relative_eq!(m[0], 1.2 - 2.0f64.ln(), max_relative = 1e-15);
        assert_relative_eq!(m[1], 40.0, max_relative = 1e-15);
        assert_relative_eq!(m[2], 0.015, max_relative = 1e-15);
        assert_relative_eq!(m[3], 2.0, max_relative = 1e-15);
        // covariance rows/columns through F = diag(1, ½, 1, 1)
        assert_relative_eq!(c[(0, 0)], 0.02, max_relative = 1e-15);
        assert_relative_eq!(c[(1, 1)], 1.0, max_relative = 1e-15);
        assert_relative_eq!(c[(0, 1)], 0.005, max_relative = 1e-15);
        assert_relative_eq!(c[(1, 3)], 0.025, max_relative = 1e-15);
        assert_relative_eq!(c[(2, 2)], 1e-4, max_relative = 1e-15);
    }

    #[test]
    fn test_division_noise_enters_xg_only() {
        let th = theta();
        let parent_mean = Vector4::zeros();
        let parent_cov = Matrix4::zeros();
        let (_, c) = division_transform(&parent_mean, &parent_cov, &th);
        assert_eq!(c[(0, 0)], th.var_dx);
        assert_eq!(c[(1, 1)], th.var_dg);
        assert_eq!(c[(2, 2)], 0.0);
        assert_eq!(c[(3, 3)], 0.0);
    }

    #[test]
    fn test_observation_at_mean_shrinks_covariance() {
        // y = 0 leaves the mean unchanged and strictly shrinks the
        // determinant of the observed block
        let mut mean = Vector4::new(0.5, 10.0, 0.01, 1.0);
        let mut cov = Matrix4::from_diagonal(&Vector4::new(0.1, 0.2, 1e-4, 1e-2));
        let before = cov.fixed_view::<2, 2>(0, 0).determinant();
        let mean_before = mean;

        let ll = kalman_update(&mut mean, &mut cov, &Vector2::zeros(), 0.0, 0.0);
        assert!(ll.is_finite());
        assert_relative_eq!(mean, mean_before, epsilon = 1e-14);
        let after = cov.fixed_view::<2, 2>(0, 0).determinant();
        assert!(after < before);
    }

    #[test]
    fn test_singular_innovation_yields_neg_infinity() {
        let mut mean = Vector4::zeros();
        let mut cov = Matrix4::zeros();
        let ll = kalman_update(&mut mean, &mut cov, &Vector2::new(1.0, 1.0), 0.0, 0.0);
        assert_eq!(ll, f64::NEG_INFINITY);
        // state untouched on the failure path
        assert_eq!(cov, Matrix4::zeros());
    }

    #[test]
    fn test_filter_records_one_state_per_observation() {
        let th = theta();
        let mut cell = Cell::new("r", "-");
        cell.time = vec![0.0, 1.0, 2.0];
        cell.log_length = vec![0.5, 0.51, 0.52];
        cell.fp = vec![10.0, 10.5, 11.0];

        let (mut mean, mut cov) = root_prior(&th);
        let mut rec = Vec::new();
        let ll = filter_cell(&cell, &th, &mut mean, &mut cov, Some(&mut rec));
        assert!(ll.is_finite());
        assert_eq!(rec.len(), 3);
        assert_eq!(rec[2].mean, mean);
    }
}
