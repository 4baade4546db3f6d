//! CSV ingestion of time-lapse measurements.
//!
//! One row per observation; rows of the same cell must be contiguous.
//! Cell identity is the `cell` column; the mother's identity is
//! composed as `{date}.{pos}.{gl}.{int(parent_id)}` — the integer cast
//! strips the decimal formatting some exports put on `parent_id`.
//! Column names for time, length and fluorescence are configurable, as
//! is the delimiter; length is log-transformed on load unless the
//! config says it already is.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cell_tree::{Cell, CellTree};
use crate::error::LineageError;
use crate::params::ParameterSet;

/// Column selection and delimiter for the input CSV.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsvConfig {
    /// Name of the time column
    pub time_col: String,
    /// Name of the length column
    pub length_col: String,
    /// Length values are already log-transformed
    pub length_islog: bool,
    /// Name of the fluorescence column
    pub fp_col: String,
    /// Field delimiter
    pub delimiter: u8,
}

impl Default for CsvConfig {
    fn default() -> Self {
        Self {
            time_col: "time_sec".to_string(),
            length_col: "length_um".to_string(),
            length_islog: false,
            fp_col: "gfp_nb".to_string(),
            delimiter: b',',
        }
    }
}

impl CsvConfig {
    /// Reads a `key = value` config file; unknown keys are rejected.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, LineageError> {
        let text = std::fs::read_to_string(path)?;
        let mut cfg = Self::default();
        for raw in text.lines() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                LineageError::ParameterFile(format!("missing '=' in csv config line '{raw}'"))
            })?;
            let value = value.trim();
            match key.trim() {
                "time_col" => cfg.time_col = value.to_string(),
                "length_col" => cfg.length_col = value.to_string(),
                "fp_col" => cfg.fp_col = value.to_string(),
                "length_islog" => {
                    cfg.length_islog = value.parse().map_err(|_| {
                        LineageError::ParameterFile(format!("length_islog must be true/false, got '{value}'"))
                    })?
                }
                "delimiter" => {
                    cfg.delimiter = *value.as_bytes().first().ok_or_else(|| {
                        LineageError::ParameterFile("empty delimiter".to_string())
                    })?
                }
                other => {
                    return Err(LineageError::ParameterFile(format!(
                        "unknown csv config key '{other}'"
                    )))
                }
            }
        }
        Ok(cfg)
    }
}

/// The columns every input file must carry besides the configured ones.
const ID_COLUMNS: [&str; 5] = ["date", "pos", "gl", "cell", "parent_id"];

/// Parses measurement rows into unlinked cells.
pub fn read_cells<R: Read>(reader: R, cfg: &CsvConfig) -> Result<Vec<Cell>, LineageError> {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(cfg.delimiter)
        .from_reader(reader);

    let headers = rdr.headers()?.clone();
    let col = |name: &str| -> Result<usize, LineageError> {
        headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| LineageError::MissingColumn(name.to_string()))
    };
    let [date_i, pos_i, gl_i, cell_i, parent_i] = [
        col(ID_COLUMNS[0])?,
        col(ID_COLUMNS[1])?,
        col(ID_COLUMNS[2])?,
        col(ID_COLUMNS[3])?,
        col(ID_COLUMNS[4])?,
    ];
    let time_i = col(&cfg.time_col)?;
    let length_i = col(&cfg.length_col)?;
    let fp_i = col(&cfg.fp_col)?;

    fn field<'r>(record: &'r csv::StringRecord, i: usize, row: usize) -> Result<&'r str, LineageError> {
        record
            .get(i)
            .ok_or_else(|| LineageError::malformed(row, "row shorter than header"))
    }

    fn number(record: &csv::StringRecord, i: usize, row: usize, what: &str) -> Result<f64, LineageError> {
        let raw = field(record, i, row)?;
        raw.trim()
            .parse::<f64>()
            .map_err(|_| LineageError::malformed(row, format!("bad {what} '{raw}'")))
    }

    let mut cells: Vec<Cell> = Vec::new();
    let mut last_cell_id = String::new();

    for (n, record) in rdr.records().enumerate() {
        let row = n + 2; // header is line 1
        let record = record?;

        let cell_id = field(&record, cell_i, row)?.to_string();
        if cell_id != last_cell_id || cells.is_empty() {
            // parent_id may carry decimals ("81.0"): truncate to int
            let parent_int = number(&record, parent_i, row, "parent_id")? as i64;
            let parent_id = format!(
                "{}.{}.{}.{}",
                field(&record, date_i, row)?,
                field(&record, pos_i, row)?,
                field(&record, gl_i, row)?,
                parent_int
            );
            if cells.iter().any(|c| c.cell_id == cell_id) {
                warn!(cell = %cell_id, row, "cell id reappears non-contiguously");
            }
            cells.push(Cell::new(cell_id.clone(), parent_id));
            last_cell_id = cell_id;
        }

        let time = number(&record, time_i, row, "time")?;
        let raw_length = number(&record, length_i, row, "length")?;
        let log_length = if cfg.length_islog {
            raw_length
        } else {
            if raw_length <= 0.0 {
                return Err(LineageError::malformed(
                    row,
                    format!("length must be positive before log transform, got {raw_length}"),
                ));
            }
            raw_length.ln()
        };
        let fp = number(&record, fp_i, row, "fp")?;

        let cell = cells.last_mut().unwrap();
        if let Some(&prev) = cell.time.last() {
            if time <= prev {
                return Err(LineageError::malformed(
                    row,
                    format!("time must be strictly increasing within a cell ({prev} -> {time})"),
                ));
            }
        }
        cell.time.push(time);
        cell.log_length.push(log_length);
        cell.fp.push(fp);
    }

    Ok(cells)
}

/// Loads a CSV file and links the genealogy.
pub fn load_tree(path: impl AsRef<Path>, cfg: &CsvConfig) -> Result<CellTree, LineageError> {
    let path = path.as_ref();
    let cells = read_cells(File::open(path)?, cfg)?;
    info!(cells = cells.len(), file = %path.display(), "cells found in file");
    Ok(CellTree::link(cells))
}

/// Seeds the root prior means of θ from the data: the average first
/// observation of (log-length, fp) over root cells.
pub fn seed_root_prior(params: &mut ParameterSet, tree: &CellTree) {
    let firsts: Vec<(f64, f64)> = tree
        .roots
        .iter()
        .map(|&r| &tree.cells[r])
        .filter(|c| !c.is_empty())
        .map(|c| (c.log_length[0], c.fp[0]))
        .collect();
    if firsts.is_empty() {
        return;
    }
    let n = firsts.len() as f64;
    params.mean_x0 = firsts.iter().map(|f| f.0).sum::<f64>() / n;
    params.mean_g0 = firsts.iter().map(|f| f.1).sum::<f64>() / n;
}

#[cfg(test)]
mod tests {
    use super::*;

    const CSV: &str = "\
date,pos,gl,cell,parent_id,time_sec,length_um,gfp_nb
20150624,0,1,20150624.0.1.4,-1,0.0,1.0,100.0
20150624,0,1,20150624.0.1.4,-1,3.0,1.2,110.0
20150624,0,1,20150624.0.1.7,4.0,6.0,0.7,60.0
20150624,0,1,20150624.0.1.8,4.0,6.0,0.6,55.0
";

    #[test]
    fn test_read_and_link() {
        let cells = read_cells(CSV.as_bytes(), &CsvConfig::default()).unwrap();
        assert_eq!(cells.len(), 3);
        assert_eq!(cells[0].len(), 2);
        // decimal parent_id stripped to the integer
        assert_eq!(cells[1].parent_id, "20150624.0.1.4");

        let tree = CellTree::link(cells);
        assert_eq!(tree.roots, vec![0]);
        assert_eq!(tree.cells[0].daughters, vec![1, 2]);
    }

    #[test]
    fn test_length_log_transformed() {
        let cells = read_cells(CSV.as_bytes(), &CsvConfig::default()).unwrap();
        assert!((cells[0].log_length[0] - 0.0).abs() < 1e-12); // ln 1.0
        assert!((cells[0].log_length[1] - 1.2f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn test_length_islog_passthrough() {
        let cfg = CsvConfig {
            length_islog: true,
            ..CsvConfig::default()
        };
        let cells = read_cells(CSV.as_bytes(), &cfg).unwrap();
        assert_eq!(cells[0].log_length[0], 1.0);
    }

    #[test]
    fn test_missing_column_rejected() {
        let cfg = CsvConfig {
            fp_col: "does_not_exist".to_string(),
            ..CsvConfig::default()
        };
        let err = read_cells(CSV.as_bytes(), &cfg).unwrap_err();
        assert!(matches!(err, LineageError::MissingColumn(c) if c == "does_not_exist"));
    }

    #[test]
    fn test_non_positive_length_rejected() {
        let bad = CSV.replace("3.0,1.2,110.0", "3.0,0.0,110.0");
        let err = read_cells(bad.as_bytes(), &CsvConfig::default()).unwrap_err();
        assert!(matches!(err, LineageError::MalformedRow { .. }));
    }

    #[test]
    fn test_non_monotone_time_rejected() {
        let bad = CSV.replace("20150624,0,1,20150624.0.1.4,-1,3.0", "20150624,0,1,20150624.0.1.4,-1,0.0");
        let err = read_cells(bad.as_bytes(), &CsvConfig::default()).unwrap_err();
        assert!(matches!(err, LineageError::MalformedRow { .. }));
    }

    #[test]
    fn test_seed_root_prior_from_roots() {
        let cells = read_cells(CSV.as_bytes(), &CsvConfig::default()).unwrap();
        let tree = CellTree::link(cells);
        let mut params = ParameterSet::from_str_contents(
            "mean_lambda = 0.01\ngamma_lambda = 0.02\nvar_lambda = 1e-5\nmean_q = 1\n\
             gamma_q = 0.02\nvar_q = 0.01\nbeta = 0.005\nvar_x = 1e-3\nvar_g = 1e-2\n\
             var_dx = 1e-3\nvar_dg = 1e-2",
        )
        .unwrap();
        seed_root_prior(&mut params, &tree);
        assert_eq!(params.mean_x0, 0.0); // ln 1.0 of the single root
        assert_eq!(params.mean_g0, 100.0);
    }

    #[test]
    fn test_semicolon_delimiter() {
        let data = CSV.replace(',', ";");
        let cfg = CsvConfig {
            delimiter: b';',
            ..CsvConfig::default()
        };
        // "20150624.0.1.4" contains dots, not semicolons, so ids survive
        let cells = read_cells(data.as_bytes(), &cfg).unwrap();
        assert_eq!(cells.len(), 3);
    }
}
