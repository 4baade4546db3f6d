//! Derivative-free bounded maximisation of the likelihood.
//!
//! The objective contract mirrors the classic NLopt-style callback: the
//! callee receives the free-parameter subvector and an optional
//! gradient slot which is ignored (the method is derivative-free).
//! Non-finite objective values are legal — they mark an out-of-region
//! probe and the simplex simply moves away from them.
//!
//! The local method is a box-constrained Nelder-Mead simplex: every
//! candidate vertex is clipped to the bounds, the initial simplex is
//! spanned by the per-parameter steps, and termination is a relative
//! tolerance on the parameter vector.

use tracing::{debug, info};

use crate::cell_tree::CellTree;
use crate::likelihood::LikelihoodObjective;
use crate::params::{ParameterSet, Theta};

/// Objective as seen by the optimiser: log-likelihood over the free
/// subvector. `grad` is accepted for interface compatibility and
/// ignored.
pub trait Objective {
    fn evaluate(&mut self, free: &[f64], grad: Option<&mut [f64]>) -> f64;
}

/// Outcome of a maximisation run.
#[derive(Debug, Clone)]
pub struct OptimResult {
    /// Best free-parameter vector found
    pub x: Vec<f64>,
    /// Objective value at `x`
    pub value: f64,
    /// Number of objective evaluations
    pub evaluations: usize,
    /// Whether the tolerance criterion was met (vs. the eval budget)
    pub converged: bool,
}

/// Box-constrained Nelder-Mead maximiser.
#[derive(Debug, Clone)]
pub struct NelderMead {
    /// Relative tolerance on the parameter vector
    pub rel_tol: f64,
    /// Evaluation budget
    pub max_evals: usize,
}

impl Default for NelderMead {
    fn default() -> Self {
        Self {
            rel_tol: 1e-2,
            max_evals: 20_000,
        }
    }
}

impl NelderMead {
    pub fn new(rel_tol: f64) -> Self {
        Self {
            rel_tol,
            ..Self::default()
        }
    }

    /// Maximises `obj` from `x0` with the given per-parameter steps and
    /// bounds. With no free parameters the objective is evaluated once.
    pub fn maximize(
        &self,
        obj: &mut dyn Objective,
        x0: &[f64],
        step: &[f64],
        lower: &[f64],
        upper: &[f64],
    ) -> OptimResult {
        let n = x0.len();
        let mut evals = 0usize;
        // internally minimise -f; non-finite probes rank worst
        let mut eval = |x: &[f64], evals: &mut usize| -> f64 {
            *evals += 1;
            let v = obj.evaluate(x, None);
            if v.is_finite() {
                -v
            } else {
                f64::INFINITY
            }
        };

        if n == 0 {
            let f = eval(x0, &mut evals);
            return OptimResult {
                x: Vec::new(),
                value: -f,
                evaluations: evals,
                converged: true,
            };
        }

        let clip = |x: &mut Vec<f64>| {
            for i in 0..n {
                x[i] = x[i].clamp(lower[i], upper[i]);
            }
        };

        // initial simplex: x0 plus one step along each coordinate
        let mut simplex: Vec<(Vec<f64>, f64)> = Vec::with_capacity(n + 1);
        let mut v0 = x0.to_vec();
        clip(&mut v0);
        let f0 = eval(&v0, &mut evals);
        simplex.push((v0.clone(), f0));
        for i in 0..n {
            let mut v = v0.clone();
            v[i] += step[i];
            clip(&mut v);
            if v[i] == v0[i] {
                v[i] -= step[i];
                clip(&mut v);
            }
            let f = eval(&v, &mut evals);
            simplex.push((v, f));
        }

        let (alpha, gamma, rho, sigma) = (1.0, 2.0, 0.5, 0.5);
        let mut converged = false;

        while evals < self.max_evals {
            simplex.sort_by(|a, b| a.1.total_cmp(&b.1));

            if self.simplex_converged(&simplex) {
                converged = true;
                break;
            }

            // centroid of all but the worst
            let mut centroid = vec![0.0; n];
            for (v, _) in simplex.iter().take(n) {
                for i in 0..n {
                    centroid[i] += v[i] / n as f64;
                }
            }
            let worst = simplex[n].clone();

            let mut reflected: Vec<f64> = (0..n)
                .map(|i| centroid[i] + alpha * (centroid[i] - worst.0[i]))
                .collect();
            clip(&mut reflected);
            let f_r = eval(&reflected, &mut evals);

            if f_r < simplex[0].1 {
                // try to expand
                let mut expanded: Vec<f64> = (0..n)
                    .map(|i| centroid[i] + gamma * (reflected[i] - centroid[i]))
                    .collect();
                clip(&mut expanded);
                let f_e = eval(&expanded, &mut evals);
                simplex[n] = if f_e < f_r { (expanded, f_e) } else { (reflected, f_r) };
            } else if f_r < simplex[n - 1].1 {
                simplex[n] = (reflected, f_r);
            } else {
                // contract towards the better of worst/reflected
                let base = if f_r < worst.1 { &reflected } else { &worst.0 };
                let mut contracted: Vec<f64> = (0..n)
                    .map(|i| centroid[i] + rho * (base[i] - centroid[i]))
                    .collect();
                clip(&mut contracted);
                let f_c = eval(&contracted, &mut evals);
                if f_c < worst.1.min(f_r) {
                    simplex[n] = (contracted, f_c);
                } else {
                    // shrink towards the best vertex
                    let best = simplex[0].0.clone();
                    for k in 1..=n {
                        let mut v: Vec<f64> = (0..n)
                            .map(|i| best[i] + sigma * (simplex[k].0[i] - best[i]))
                            .collect();
                        clip(&mut v);
                        let f = eval(&v, &mut evals);
                        simplex[k] = (v, f);
                    }
                }
            }
        }

        simplex.sort_by(|a, b| a.1.total_cmp(&b.1));
        let best = simplex.remove(0);
        OptimResult {
            x: best.0,
            value: -best.1,
            evaluations: evals,
            converged,
        }
    }

    fn simplex_converged(&self, simplex: &[(Vec<f64>, f64)]) -> bool {
        let best = &simplex[0].0;
        simplex.iter().skip(1).all(|(v, _)| {
            v.iter()
                .zip(best)
                .all(|(a, b)| (a - b).abs() <= self.rel_tol * (b.abs() + self.rel_tol))
        })
    }
}

/// Maximises the tree likelihood over the free parameters of `params`,
/// writing the optimum back into the set. Returns the optimiser result
/// together with the full evaluation history for the output table.
pub fn maximize_likelihood(
    tree: &CellTree,
    params: &mut ParameterSet,
    rel_tol: f64,
) -> (OptimResult, Vec<(Theta, f64)>) {
    let free = params.free_indices();
    let x0: Vec<f64> = free.iter().map(|&i| params.all[i].value).collect();
    let step: Vec<f64> = free.iter().map(|&i| params.all[i].step).collect();
    let lower: Vec<f64> = free.iter().map(|&i| params.all[i].lower).collect();
    let upper: Vec<f64> = free.iter().map(|&i| params.all[i].upper).collect();

    info!(free = free.len(), rel_tol, "starting likelihood maximisation");

    let mut objective = LikelihoodObjective::new(tree, params);
    let result = NelderMead::new(rel_tol).maximize(&mut objective, &x0, &step, &lower, &upper);
    let history = objective.history;

    debug!(
        evaluations = result.evaluations,
        converged = result.converged,
        "maximisation finished, ℓ = {}",
        result.value
    );

    params.update_free(&result.x);
    (result, history)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Quadratic {
        center: Vec<f64>,
    }

    impl Objective for Quadratic {
        fn evaluate(&mut self, free: &[f64], _grad: Option<&mut [f64]>) -> f64 {
            -free
                .iter()
                .zip(&self.center)
                .map(|(x, c)| (x - c) * (x - c))
                .sum::<f64>()
        }
    }

    #[test]
    fn test_interior_maximum_found() {
        let mut obj = Quadratic {
            center: vec![0.3, -0.7],
        };
        let nm = NelderMead::new(1e-6);
        let r = nm.maximize(&mut obj, &[0.0, 0.0], &[0.1, 0.1], &[-2.0, -2.0], &[2.0, 2.0]);
        assert!(r.converged);
        assert!((r.x[0] - 0.3).abs() < 1e-4);
        assert!((r.x[1] + 0.7).abs() < 1e-4);
    }

    #[test]
    fn test_maximum_on_boundary() {
        // unconstrained optimum at 5 lies outside the box
        let mut obj = Quadratic { center: vec![5.0] };
        let nm = NelderMead::new(1e-8);
        let r = nm.maximize(&mut obj, &[0.0], &[0.5], &[-1.0], &[1.0]);
        assert!((r.x[0] - 1.0).abs() < 1e-6);
    }

    struct Gated;

    impl Objective for Gated {
        fn evaluate(&mut self, free: &[f64], _grad: Option<&mut [f64]>) -> f64 {
            // infeasible beyond |x| > 1, peak at 0.4
            if free[0].abs() > 1.0 {
                f64::NAN
            } else {
                -(free[0] - 0.4).powi(2)
            }
        }
    }

    #[test]
    fn test_non_finite_probes_are_survivable() {
        let mut obj = Gated;
        let nm = NelderMead::new(1e-6);
        let r = nm.maximize(&mut obj, &[0.9], &[0.5], &[-3.0], &[3.0]);
        assert!((r.x[0] - 0.4).abs() < 1e-3);
        assert!(r.value <= 0.0 && r.value.is_finite());
    }

    #[test]
    fn test_no_free_parameters_evaluates_once() {
        let mut obj = Quadratic { center: vec![] };
        let nm = NelderMead::default();
        let r = nm.maximize(&mut obj, &[], &[], &[], &[]);
        assert_eq!(r.evaluations, 1);
        assert_eq!(r.value, 0.0);
        assert!(r.converged);
    }
}
