//! Output tables for the three run modes.
//!
//! Everything is CSV. Maximisation and scans write one row per
//! objective evaluation (the 11 dynamic θ components plus the total
//! log-likelihood); prediction writes one row per (cell, observation)
//! with the 4 means and the 10 independent covariance entries of the
//! forward, backward or smoothed belief.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use lineage_core::{CellTree, GaussianState, Theta, TreeState, PARAM_KEYS};

/// Builds `<outdir or input dir>/<input stem><suffix>.csv`.
pub fn outfile_name(infile: &Path, outdir: Option<&Path>, suffix: &str) -> PathBuf {
    let stem = infile.file_stem().unwrap_or_default().to_string_lossy();
    let dir = outdir
        .map(Path::to_path_buf)
        .unwrap_or_else(|| infile.parent().unwrap_or(Path::new(".")).to_path_buf());
    dir.join(format!("{stem}{suffix}.csv"))
}

/// Writes an evaluation trace (maximisation or scan).
pub fn write_evaluations(path: &Path, evaluations: &[(Theta, f64)]) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)
        .with_context(|| format!("cannot create {}", path.display()))?;
    let mut header: Vec<&str> = PARAM_KEYS.to_vec();
    header.push("log_likelihood");
    wtr.write_record(&header)?;
    for (theta, ll) in evaluations {
        let mut row: Vec<String> = theta.dynamic().iter().map(|v| v.to_string()).collect();
        row.push(ll.to_string());
        wtr.write_record(&row)?;
    }
    wtr.flush()?;
    Ok(())
}

const PREDICTION_HEADER: [&str; 16] = [
    "cell_id", "time", "mean_x", "mean_g", "mean_l", "mean_q", "cov_xx", "cov_xg", "cov_xl",
    "cov_xq", "cov_gg", "cov_gl", "cov_gq", "cov_ll", "cov_lq", "cov_qq",
];

/// Which per-observation sequence of the smoother to dump.
#[derive(Debug, Clone, Copy)]
pub enum Pass {
    Forward,
    Backward,
    Smoothed,
}

/// Writes one prediction table for the chosen pass.
pub fn write_predictions(path: &Path, tree: &CellTree, state: &TreeState, pass: Pass) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)
        .with_context(|| format!("cannot create {}", path.display()))?;
    wtr.write_record(PREDICTION_HEADER)?;
    for (cell, cs) in tree.cells.iter().zip(&state.cells) {
        let seq: &[GaussianState] = match pass {
            Pass::Forward => &cs.forward,
            Pass::Backward => &cs.backward,
            Pass::Smoothed => &cs.smoothed,
        };
        for (t, g) in cell.time.iter().zip(seq) {
            let m = &g.mean;
            let c = &g.cov;
            let row = [
                cell.cell_id.clone(),
                t.to_string(),
                m[0].to_string(),
                m[1].to_string(),
                m[2].to_string(),
                m[3].to_string(),
                c[(0, 0)].to_string(),
                c[(0, 1)].to_string(),
                c[(0, 2)].to_string(),
                c[(0, 3)].to_string(),
                c[(1, 1)].to_string(),
                c[(1, 2)].to_string(),
                c[(1, 3)].to_string(),
                c[(2, 2)].to_string(),
                c[(2, 3)].to_string(),
                c[(3, 3)].to_string(),
            ];
            wtr.write_record(&row)?;
        }
    }
    wtr.flush()?;
    Ok(())
}
