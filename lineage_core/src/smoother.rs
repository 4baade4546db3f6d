//! Posterior prediction: forward filtering plus a backward pass,
//! combined per observation.
//!
//! The backward message at observation t is the Gaussian summary of
//! `p(obs_{>t} | z_t)` — strictly future observations, so the product
//! with the filtered belief `p(z_t | obs_{≤t})` counts every
//! observation exactly once:
//!
//! ```text
//! smoothed:  Σ_s = (Σ_f⁻¹ + Σ_b⁻¹)⁻¹,   μ_s = Σ_s (Σ_f⁻¹ μ_f + Σ_b⁻¹ μ_b)
//! ```
//!
//! Within a cell the message is pulled backwards through each
//! observation interval by inverting the interval transition; the
//! transition `(A, b, Q)` comes from the same closed-form propagator,
//! linearised about the forward filtered state (central-difference
//! Jacobian of the mean map, `Q = Σ_pred - A Σ_f Aᵀ`). At a mitosis the
//! two daughters' messages are pulled through the inverted division
//! transform and combined by the Gaussian product rule; at a leaf's
//! terminal observation the recursion is seeded with a diffuse prior.

use nalgebra::{Matrix4, Vector2, Vector4};

use crate::cell_tree::CellTree;
use crate::error::LineageError;
use crate::filter::{division_matrix, division_noise, kalman_update, GaussianState};
use crate::likelihood::{total_log_likelihood, TreeState};
use crate::params::Theta;
use crate::propagator::propagate;

/// Diffuse-seed scale: the backward covariance at a leaf's last
/// observation is this factor times the largest forward variance.
/// Large but finite; the exact value only influences boundary cells.
pub const DIFFUSE_SEED_FACTOR: f64 = 1e6;

/// Runs forward and backward passes and fills the `forward`,
/// `backward` and `smoothed` sequences of every cell in `state`.
pub fn smooth_tree(th: &Theta, tree: &CellTree, state: &mut TreeState) -> Result<(), LineageError> {
    let ll = total_log_likelihood(th, tree, state, true);
    if !ll.is_finite() {
        return Err(LineageError::Numerical(format!(
            "forward pass produced non-finite likelihood ({ll}); smoothing needs a feasible θ"
        )));
    }

    for &root in &tree.roots {
        backward_up(th, tree, state, root)?;
    }

    for cs in &mut state.cells {
        cs.smoothed.clear();
        for (f, b) in cs.forward.iter().zip(&cs.backward) {
            cs.smoothed.push(gaussian_product(f, b)?);
        }
    }
    Ok(())
}

/// Backward recursion over one cell; returns the message over the
/// *parent's* final state (daughter observations folded in, division
/// transform inverted). Both daughters complete before their parent.
fn backward_up(
    th: &Theta,
    tree: &CellTree,
    state: &mut TreeState,
    idx: usize,
) -> Result<GaussianState, LineageError> {
    let mut from_daughters: Vec<GaussianState> = Vec::new();
    for &d in &tree.cells[idx].daughters {
        from_daughters.push(backward_up(th, tree, state, d)?);
    }

    let cell = &tree.cells[idx];
    let n = cell.len();
    let forward = state.cells[idx].forward.clone();

    let mut msg = match from_daughters.as_slice() {
        [] => diffuse_seed(&forward[n - 1]),
        [one] => *one,
        [a, b] => gaussian_product(a, b)?,
        _ => unreachable!("cells have at most two daughters"),
    };

    let mut backward = vec![msg; n];
    for t in (0..n - 1).rev() {
        // fold observation t+1 into the message...
        fold_observation(&mut msg, cell.log_length[t + 1], cell.fp[t + 1], th)?;
        // ...then pull it through the inverted interval transition
        let dt = cell.time[t + 1] - cell.time[t];
        let (a_mat, b_vec, q_mat) = linearized_transition(&forward[t], dt, th);
        let a_inv = a_mat.try_inverse().ok_or_else(|| {
            LineageError::Numerical("singular transition in backward pass".into())
        })?;
        msg = GaussianState {
            mean: a_inv * (msg.mean - b_vec),
            cov: symmetrize(&(a_inv * (msg.cov + q_mat) * a_inv.transpose())),
        };
        if !msg.mean.iter().all(|v| v.is_finite()) {
            return Err(LineageError::Numerical(
                "non-finite backward message".into(),
            ));
        }
        backward[t] = msg;
    }
    state.cells[idx].backward = backward;

    // message handed to the parent: this cell's first observation folded
    // in, division transform inverted back to the parent's final state
    fold_observation(&mut msg, cell.log_length[0], cell.fp[0], th)?;
    let f_inv = Matrix4::from_diagonal(&Vector4::new(1.0, 2.0, 1.0, 1.0));
    debug_assert_eq!(f_inv * division_matrix(), Matrix4::identity());
    let f_vec = Vector4::new(-(2.0f64).ln(), 0.0, 0.0, 0.0);
    Ok(GaussianState {
        mean: f_inv * (msg.mean - f_vec),
        cov: symmetrize(&(f_inv * (msg.cov + division_noise(th)) * f_inv.transpose())),
    })
}

/// Kalman update of a backward message with one observation.
fn fold_observation(
    msg: &mut GaussianState,
    log_length: f64,
    fp: f64,
    th: &Theta,
) -> Result<(), LineageError> {
    let y = Vector2::new(log_length - msg.mean[0], fp - msg.mean[1]);
    let ll = kalman_update(&mut msg.mean, &mut msg.cov, &y, th.var_x, th.var_g);
    if ll.is_finite() {
        Ok(())
    } else {
        Err(LineageError::Numerical(
            "singular innovation in backward pass".into(),
        ))
    }
}

/// Affine-Gaussian view of the propagator over one interval,
/// linearised about the forward filtered belief.
fn linearized_transition(
    at: &GaussianState,
    dt: f64,
    th: &Theta,
) -> (Matrix4<f64>, Vector4<f64>, Matrix4<f64>) {
    let (mean_pred, cov_pred) = propagate(&at.mean, &at.cov, dt, th);

    let mut a = Matrix4::zeros();
    for j in 0..4 {
        let h = 1e-6 * (1.0 + at.mean[j].abs());
        let mut up = at.mean;
        let mut dn = at.mean;
        up[j] += h;
        dn[j] -= h;
        let (m_up, _) = propagate(&up, &at.cov, dt, th);
        let (m_dn, _) = propagate(&dn, &at.cov, dt, th);
        a.set_column(j, &((m_up - m_dn) / (2.0 * h)));
    }

    let b = mean_pred - a * at.mean;
    let q = symmetrize(&(cov_pred - a * at.cov * a.transpose()));
    (a, b, q)
}

/// Product of two Gaussian densities, renormalised.
pub fn gaussian_product(a: &GaussianState, b: &GaussianState) -> Result<GaussianState, LineageError> {
    let ia = a
        .cov
        .try_inverse()
        .ok_or_else(|| LineageError::Numerical("singular covariance in Gaussian product".into()))?;
    let ib = b
        .cov
        .try_inverse()
        .ok_or_else(|| LineageError::Numerical("singular covariance in Gaussian product".into()))?;
    let cov = (ia + ib)
        .try_inverse()
        .ok_or_else(|| LineageError::Numerical("singular precision sum in Gaussian product".into()))?;
    let cov = symmetrize(&cov);
    let mean = cov * (ia * a.mean + ib * b.mean);
    Ok(GaussianState { mean, cov })
}

fn diffuse_seed(forward: &GaussianState) -> GaussianState {
    let scale = forward.cov.diagonal().max().max(1e-6) * DIFFUSE_SEED_FACTOR;
    GaussianState {
        mean: forward.mean,
        cov: Matrix4::identity() * scale,
    }
}

fn symmetrize(m: &Matrix4<f64>) -> Matrix4<f64> {
    (m + m.transpose()) * 0.5
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell_tree::{Cell, CellTree};
    use approx::assert_relative_eq;

    fn theta() -> Theta {
        Theta {
            mean_lambda: 1.0,
            gamma_lambda: 0.2,
            var_lambda: 0.01,
            mean_q: 0.5,
            gamma_q: 0.2,
            var_q: 0.01,
            beta: 0.1,
            var_x: 1e-3,
            var_g: 1e-3,
            var_dx: 1e-3,
            var_dg: 1e-3,
            mean_x0: 0.0,
            mean_g0: 1.0,
        }
    }

    fn observed_cell(id: &str, parent: &str, t0: f64, x0: f64, g0: f64, n: usize) -> Cell {
        let mut c = Cell::new(id, parent);
        let dt = 0.1;
        for k in 0..n {
            let t = t0 + k as f64 * dt;
            c.time.push(t);
            c.log_length.push(x0 + (t - t0));
            c.fp.push(g0 + 0.2 * (t - t0));
        }
        c
    }

    fn lineage() -> CellTree {
        CellTree::link(vec![
            observed_cell("p", "-", 0.0, 0.0, 1.0, 5),
            observed_cell("c1", "p", 0.5, -0.3, 0.55, 4),
            observed_cell("c2", "p", 0.5, -0.35, 0.5, 4),
        ])
    }

    #[test]
    fn test_sequences_aligned_with_observations() {
        let th = theta();
        let tree = lineage();
        let mut state = TreeState::new(&tree);
        smooth_tree(&th, &tree, &mut state).unwrap();
        for (cell, cs) in tree.cells.iter().zip(&state.cells) {
            assert_eq!(cs.forward.len(), cell.len());
            assert_eq!(cs.backward.len(), cell.len());
            assert_eq!(cs.smoothed.len(), cell.len());
        }
    }

    #[test]
    fn test_smoothed_covariance_below_forward() {
        // Loewner order: Σ_f - Σ_s is positive semi-definite
        let th = theta();
        let tree = lineage();
        let mut state = TreeState::new(&tree);
        smooth_tree(&th, &tree, &mut state).unwrap();
        for cs in &state.cells {
            for (f, s) in cs.forward.iter().zip(&cs.smoothed) {
                let diff = f.cov - s.cov;
                for ev in diff.symmetric_eigenvalues().iter() {
                    assert!(*ev >= -1e-9, "forward - smoothed has eigenvalue {ev}");
                }
            }
        }
    }

    #[test]
    fn test_terminal_leaf_smoothed_matches_forward() {
        // at a leaf's last observation the backward message is diffuse,
        // so the product barely moves the filtered belief
        let th = theta();
        let tree = CellTree::link(vec![observed_cell("a", "-", 0.0, 0.0, 1.0, 6)]);
        let mut state = TreeState::new(&tree);
        smooth_tree(&th, &tree, &mut state).unwrap();
        let cs = &state.cells[0];
        let f = cs.forward.last().unwrap();
        let s = cs.smoothed.last().unwrap();
        assert_relative_eq!(s.mean, f.mean, max_relative = 1e-4, epsilon = 1e-6);
        assert_relative_eq!(s.cov, f.cov, max_relative = 1e-3, epsilon = 1e-8);
    }

    #[test]
    fn test_interior_smoothing_tightens_covariance() {
        // an interior observation gains information from the future:
        // the smoothed x-variance must drop below the filtered one
        let th = theta();
        let tree = CellTree::link(vec![observed_cell("a", "-", 0.0, 0.0, 1.0, 8)]);
        let mut state = TreeState::new(&tree);
        smooth_tree(&th, &tree, &mut state).unwrap();
        let cs = &state.cells[0];
        let mid = 3;
        assert!(cs.smoothed[mid].cov[(0, 0)] < cs.forward[mid].cov[(0, 0)]);
    }

    #[test]
    fn test_gaussian_product_of_identical_beliefs_halves_covariance() {
        let g = GaussianState {
            mean: Vector4::new(1.0, 2.0, 3.0, 4.0),
            cov: Matrix4::from_diagonal(&Vector4::new(0.4, 0.6, 0.2, 0.8)),
        };
        let p = gaussian_product(&g, &g).unwrap();
        assert_relative_eq!(p.mean, g.mean, max_relative = 1e-12);
        assert_relative_eq!(p.cov, g.cov * 0.5, max_relative = 1e-12);
    }

    #[test]
    fn test_infeasible_theta_is_an_error_for_smoothing() {
        let mut th = theta();
        th.gamma_q = 0.0; // propagator g-entries divide by γ_q
        let tree = lineage();
        let mut state = TreeState::new(&tree);
        assert!(matches!(
            smooth_tree(&th, &tree, &mut state),
            Err(LineageError::Numerical(_))
        ));
    }
}
