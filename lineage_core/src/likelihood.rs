//! Total log-likelihood of a cell tree.
//!
//! Pre-order traversal from each root: a cell's filter pass completes
//! before either daughter's begins, because the daughter's prior is the
//! division transform of the parent's final filtered state. One
//! evaluation is a pure function of θ given the tree; per-evaluation
//! state lives in [`TreeState`], reset at the start of every call, so
//! repeated evaluations are serialisable.

use nalgebra::{Matrix4, Vector4};
use serde::{Deserialize, Serialize};

use crate::cell_tree::CellTree;
use crate::filter::{division_transform, filter_cell, root_prior, GaussianState};
use crate::optimize::Objective;
use crate::params::{ParameterSet, Theta};

/// Per-cell filter/smoother state for one evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellState {
    /// Filtered belief after the cell's last observation
    pub final_mean: Vector4<f64>,
    /// Covariance after the cell's last observation
    pub final_cov: Matrix4<f64>,
    /// This cell's log-likelihood contribution
    pub log_likelihood: f64,
    /// Forward (filtered) belief per observation, recorded on demand
    pub forward: Vec<GaussianState>,
    /// Backward message per observation (smoothing only)
    pub backward: Vec<GaussianState>,
    /// Combined posterior per observation (smoothing only)
    pub smoothed: Vec<GaussianState>,
}

impl Default for CellState {
    fn default() -> Self {
        Self {
            final_mean: Vector4::zeros(),
            final_cov: Matrix4::zeros(),
            log_likelihood: 0.0,
            forward: Vec::new(),
            backward: Vec::new(),
            smoothed: Vec::new(),
        }
    }
}

/// Per-evaluation state parallel to the (immutable) tree arena.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeState {
    pub cells: Vec<CellState>,
}

impl TreeState {
    pub fn new(tree: &CellTree) -> Self {
        Self {
            cells: vec![CellState::default(); tree.len()],
        }
    }

    /// Zeroes accumulators and drops any recorded sequences.
    pub fn reset(&mut self) {
        for c in &mut self.cells {
            c.final_mean = Vector4::zeros();
            c.final_cov = Matrix4::zeros();
            c.log_likelihood = 0.0;
            c.forward.clear();
            c.backward.clear();
            c.smoothed.clear();
        }
    }
}

/// Sum of per-cell log-likelihoods over the whole forest.
///
/// Non-finite contributions (infeasible θ, overflowed propagation,
/// singular innovation) poison the sum and are returned as-is — the
/// optimiser reads them as an out-of-region probe. With `record` set,
/// the filtered belief at every observation is kept in `state` for the
/// smoother.
pub fn total_log_likelihood(th: &Theta, tree: &CellTree, state: &mut TreeState, record: bool) -> f64 {
    state.reset();
    let mut total = 0.0;
    for &root in &tree.roots {
        filter_down(th, tree, state, root, record, &mut total);
    }
    total
}

fn filter_down(
    th: &Theta,
    tree: &CellTree,
    state: &mut TreeState,
    idx: usize,
    record: bool,
    total: &mut f64,
) {
    let cell = &tree.cells[idx];
    let (mut mean, mut cov) = match cell.parent {
        None => root_prior(th),
        Some(p) => division_transform(&state.cells[p].final_mean, &state.cells[p].final_cov, th),
    };

    let ll = if record {
        let mut forward = std::mem::take(&mut state.cells[idx].forward);
        let ll = filter_cell(cell, th, &mut mean, &mut cov, Some(&mut forward));
        state.cells[idx].forward = forward;
        ll
    } else {
        filter_cell(cell, th, &mut mean, &mut cov, None)
    };

    state.cells[idx].log_likelihood = ll;
    state.cells[idx].final_mean = mean;
    state.cells[idx].final_cov = cov;
    *total += ll;

    for &d in &tree.cells[idx].daughters {
        filter_down(th, tree, state, d, record, total);
    }
}

/// Objective over the free-parameter subvector, as handed to the
/// optimiser. Every evaluation is appended to `history` so the driver
/// can write the optimisation trace.
pub struct LikelihoodObjective<'a> {
    tree: &'a CellTree,
    params: &'a ParameterSet,
    state: TreeState,
    /// (θ, log-likelihood) per evaluation, in call order
    pub history: Vec<(Theta, f64)>,
}

impl<'a> LikelihoodObjective<'a> {
    pub fn new(tree: &'a CellTree, params: &'a ParameterSet) -> Self {
        Self {
            tree,
            params,
            state: TreeState::new(tree),
            history: Vec::new(),
        }
    }
}

impl Objective for LikelihoodObjective<'_> {
    fn evaluate(&mut self, free: &[f64], _grad: Option<&mut [f64]>) -> f64 {
        let th = self.params.expand(free);
        let ll = total_log_likelihood(&th, self.tree, &mut self.state, false);
        self.history.push((th, ll));
        ll
    }
}

/// 1D likelihood scan of the free parameter at canonical index
/// `param_idx` over its `[lower, upper)` grid at `step`, all other
/// components held at their current values. Uses the same evaluation
/// path as the optimiser objective, so values are identical to probing
/// the objective at those points.
pub fn scan_1d(tree: &CellTree, params: &ParameterSet, param_idx: usize) -> Vec<(Theta, f64)> {
    let mut state = TreeState::new(tree);
    let mut out = Vec::new();
    for v in params.all[param_idx].grid() {
        let mut th = params.theta();
        th.set_dynamic(param_idx, v);
        let ll = total_log_likelihood(&th, tree, &mut state, false);
        out.push((th, ll));
    }
    out
}
