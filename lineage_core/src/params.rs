//! Model parameters and the parameter-bounds file.
//!
//! The model is governed by 13 scalars in a fixed canonical order:
//! the OU triples for the elongation rate λ and the production rate q,
//! the dilution rate β, the observation variances, the division-noise
//! variances, and the root prior means of (x, g). The first 11 are read
//! from a line-based bounds file; `mean_x0` / `mean_g0` are seeded from
//! the data (mean first observation over root cells).
//!
//! File format, one parameter per line, `#` starts a comment:
//!
//! ```text
//! mean_lambda = 0.01, 0.002, 1e-4, 0.1    # free: value, step, lower, upper
//! gamma_lambda = 0.02                     # fixed: value only
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;

use crate::error::LineageError;

/// The 11 keys recognised in a parameter-bounds file, canonical order.
pub const PARAM_KEYS: [&str; 11] = [
    "mean_lambda",
    "gamma_lambda",
    "var_lambda",
    "mean_q",
    "gamma_q",
    "var_q",
    "beta",
    "var_x",
    "var_g",
    "var_dx",
    "var_dg",
];

/// Full parameter vector θ in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Theta {
    /// Asymptotic mean of the elongation rate OU process
    pub mean_lambda: f64,
    /// Mean-reversion rate of λ
    pub gamma_lambda: f64,
    /// Diffusion variance of λ
    pub var_lambda: f64,
    /// Asymptotic mean of the production rate OU process
    pub mean_q: f64,
    /// Mean-reversion rate of q
    pub gamma_q: f64,
    /// Diffusion variance of q
    pub var_q: f64,
    /// FP dilution/degradation rate
    pub beta: f64,
    /// Observation variance of log-length (doubles as root prior variance on x)
    pub var_x: f64,
    /// Observation variance of FP (doubles as root prior variance on g)
    pub var_g: f64,
    /// Division-noise variance injected into x
    pub var_dx: f64,
    /// Division-noise variance injected into g
    pub var_dg: f64,
    /// Root prior mean of log-length
    pub mean_x0: f64,
    /// Root prior mean of FP amount
    pub mean_g0: f64,
}

impl Theta {
    /// The 11 dynamic components in canonical order (scan/optimiser order).
    pub fn dynamic(&self) -> [f64; 11] {
        [
            self.mean_lambda,
            self.gamma_lambda,
            self.var_lambda,
            self.mean_q,
            self.gamma_q,
            self.var_q,
            self.beta,
            self.var_x,
            self.var_g,
            self.var_dx,
            self.var_dg,
        ]
    }

    /// Writes the dynamic component at canonical index `idx`.
    pub fn set_dynamic(&mut self, idx: usize, value: f64) {
        match idx {
            0 => self.mean_lambda = value,
            1 => self.gamma_lambda = value,
            2 => self.var_lambda = value,
            3 => self.mean_q = value,
            4 => self.gamma_q = value,
            5 => self.var_q = value,
            6 => self.beta = value,
            7 => self.var_x = value,
            8 => self.var_g = value,
            9 => self.var_dx = value,
            10 => self.var_dg = value,
            _ => panic!("dynamic parameter index out of range: {idx}"),
        }
    }
}

/// One entry of the bounds file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameter {
    /// Canonical key
    pub name: String,
    /// Initial (or fixed) value
    pub value: f64,
    /// Held constant during optimisation
    pub fixed: bool,
    /// Initial optimiser step / scan grid spacing (free parameters only)
    pub step: f64,
    /// Lower bound (free parameters only)
    pub lower: f64,
    /// Upper bound (free parameters only)
    pub upper: f64,
}

impl Parameter {
    /// Scan grid `[lower, lower+step, ...)` up to but excluding `upper`.
    pub fn grid(&self) -> Vec<f64> {
        let mut points = Vec::new();
        let mut v = self.lower;
        while v < self.upper {
            points.push(v);
            v += self.step;
        }
        points
    }
}

/// The 11 dynamic parameters plus the data-derived root prior means.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterSet {
    /// Entries in canonical order, one per key of [`PARAM_KEYS`]
    pub all: Vec<Parameter>,
    /// Root prior mean of log-length, seeded from data
    pub mean_x0: f64,
    /// Root prior mean of FP, seeded from data
    pub mean_g0: f64,
}

impl ParameterSet {
    /// Parses a bounds file. All 11 keys must be present.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, LineageError> {
        let text = fs::read_to_string(path)?;
        Self::from_str_contents(&text)
    }

    /// Parses bounds-file contents.
    pub fn from_str_contents(text: &str) -> Result<Self, LineageError> {
        let mut entries: Vec<Option<Parameter>> = vec![None; PARAM_KEYS.len()];

        for raw in text.lines() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let (key, rhs) = line
                .split_once('=')
                .ok_or_else(|| LineageError::ParameterFile(format!("missing '=' in line '{raw}'")))?;
            let key = key.trim();
            let idx = PARAM_KEYS
                .iter()
                .position(|k| *k == key)
                .ok_or_else(|| LineageError::ParameterFile(format!("unknown parameter '{key}'")))?;

            let parts: Vec<f64> = rhs
                .split(',')
                .map(|p| {
                    p.trim().parse::<f64>().map_err(|_| {
                        LineageError::ParameterFile(format!("bad number '{}' for '{key}'", p.trim()))
                    })
                })
                .collect::<Result<_, _>>()?;

            let param = match parts.as_slice() {
                [value] => Parameter {
                    name: key.to_string(),
                    value: *value,
                    fixed: true,
                    step: 0.0,
                    lower: f64::NEG_INFINITY,
                    upper: f64::INFINITY,
                },
                [value, step, lower, upper] => Parameter {
                    name: key.to_string(),
                    value: *value,
                    fixed: false,
                    step: *step,
                    lower: *lower,
                    upper: *upper,
                },
                _ => {
                    return Err(LineageError::ParameterFile(format!(
                        "'{key}' needs 1 (fixed) or 4 (free) comma-separated values"
                    )))
                }
            };
            entries[idx] = Some(param);
        }

        let missing: Vec<&str> = PARAM_KEYS
            .iter()
            .zip(&entries)
            .filter(|(_, e)| e.is_none())
            .map(|(k, _)| *k)
            .collect();
        if !missing.is_empty() {
            return Err(LineageError::ParameterFile(format!(
                "missing parameters: {}",
                missing.join(", ")
            )));
        }

        Ok(Self {
            all: entries.into_iter().map(|e| e.unwrap()).collect(),
            mean_x0: 0.0,
            mean_g0: 0.0,
        })
    }

    /// Current values as a full θ.
    pub fn theta(&self) -> Theta {
        let v: Vec<f64> = self.all.iter().map(|p| p.value).collect();
        Theta {
            mean_lambda: v[0],
            gamma_lambda: v[1],
            var_lambda: v[2],
            mean_q: v[3],
            gamma_q: v[4],
            var_q: v[5],
            beta: v[6],
            var_x: v[7],
            var_g: v[8],
            var_dx: v[9],
            var_dg: v[10],
            mean_x0: self.mean_x0,
            mean_g0: self.mean_g0,
        }
    }

    /// Canonical indices of the free parameters.
    pub fn free_indices(&self) -> Vec<usize> {
        self.all
            .iter()
            .enumerate()
            .filter(|(_, p)| !p.fixed)
            .map(|(i, _)| i)
            .collect()
    }

    /// Expands a compact free-parameter vector into a full θ, holding the
    /// fixed components at their declared values.
    pub fn expand(&self, free_values: &[f64]) -> Theta {
        let mut theta = self.theta();
        for (slot, value) in self.free_indices().into_iter().zip(free_values) {
            theta.set_dynamic(slot, *value);
        }
        theta
    }

    /// Writes optimised free values back into the set.
    pub fn update_free(&mut self, free_values: &[f64]) {
        let indices = self.free_indices();
        for (slot, value) in indices.into_iter().zip(free_values) {
            self.all[slot].value = *value;
        }
    }
}

impl fmt::Display for ParameterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for p in &self.all {
            if p.fixed {
                writeln!(f, "{:<15} (fixed) = {}", p.name, p.value)?;
            } else {
                writeln!(
                    f,
                    "{:<15} (free)  = {} , bounds: ({}, {}), step: {}",
                    p.name, p.value, p.lower, p.upper, p.step
                )?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOUNDS: &str = "\
# growth
mean_lambda = 0.01, 0.002, 1e-4, 0.1
gamma_lambda = 0.02
var_lambda = 1e-6

# production
mean_q = 10.0, 1.0, 0.1, 100.0
gamma_q = 0.02
var_q = 0.1
beta = 0.005

# noise
var_x = 1e-3
var_g = 5000.0
var_dx = 1e-4
var_dg = 100.0
";

    #[test]
    fn test_parse_fixed_and_free() {
        let set = ParameterSet::from_str_contents(BOUNDS).unwrap();
        assert_eq!(set.all.len(), 11);
        assert_eq!(set.free_indices(), vec![0, 3]);
        assert!(!set.all[0].fixed);
        assert_eq!(set.all[0].step, 0.002);
        assert_eq!(set.all[0].lower, 1e-4);
        assert!(set.all[1].fixed);
        assert_eq!(set.all[8].value, 5000.0);
    }

    #[test]
    fn test_missing_key_rejected() {
        let err = ParameterSet::from_str_contents("mean_lambda = 0.01").unwrap_err();
        assert!(matches!(err, LineageError::ParameterFile(_)));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let text = format!("{BOUNDS}\nwibble = 1.0");
        assert!(ParameterSet::from_str_contents(&text).is_err());
    }

    #[test]
    fn test_expand_maps_free_subvector() {
        let set = ParameterSet::from_str_contents(BOUNDS).unwrap();
        let theta = set.expand(&[0.05, 42.0]);
        assert_eq!(theta.mean_lambda, 0.05);
        assert_eq!(theta.mean_q, 42.0);
        assert_eq!(theta.gamma_lambda, 0.02); // fixed untouched
    }

    #[test]
    fn test_grid_excludes_upper() {
        let set = ParameterSet::from_str_contents(BOUNDS).unwrap();
        let grid = set.all[0].grid();
        assert!((grid[0] - 1e-4).abs() < 1e-12);
        assert!(grid.iter().all(|&v| v < 0.1));
        assert!(grid.len() > 10);
    }
}
