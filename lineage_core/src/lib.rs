//! Lineage Core - Growth-Parameter Inference for Single-Cell Time Lapses
//!
//! This library estimates the hidden parameters of a stochastic model of
//! bacterial growth from lineages of cell-length and fluorescence
//! measurements:
//! 1. **Latent model**: a 4D Gauss-Markov process (log-length, FP
//!    amount, elongation rate, production rate) with OU dynamics on the
//!    rates and closed-form moment propagation via imaginary error
//!    functions
//! 2. **Tree-recursive filter**: Kalman updates along an arbitrary
//!    binary genealogy with explicit division-noise injection at mitosis
//! 3. **Likelihood surface**: a scalar objective over free parameters,
//!    consumed by a derivative-free bounded optimiser and 1D scans
//! 4. **Posterior prediction**: forward/backward smoothing by the
//!    two-filter formulation

pub mod cell_tree;
pub mod error;
pub mod filter;
pub mod ingest;
pub mod likelihood;
pub mod optimize;
pub mod params;
pub mod propagator;
pub mod smoother;
pub mod special;

// Re-export key types for convenience
pub use cell_tree::{Cell, CellTree};
pub use error::LineageError;
pub use filter::{division_transform, filter_cell, kalman_update, root_prior, GaussianState};
pub use ingest::{load_tree, read_cells, seed_root_prior, CsvConfig};
pub use likelihood::{scan_1d, total_log_likelihood, CellState, LikelihoodObjective, TreeState};
pub use optimize::{maximize_likelihood, NelderMead, Objective, OptimResult};
pub use params::{Parameter, ParameterSet, Theta, PARAM_KEYS};
pub use propagator::propagate;
pub use smoother::{smooth_tree, DIFFUSE_SEED_FACTOR};
