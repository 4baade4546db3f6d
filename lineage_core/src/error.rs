//! Error types for lineage inference.

use thiserror::Error;

/// Errors raised while loading data or configuration, or when the
/// smoother hits an unrecoverable numerical failure.
///
/// Non-finite likelihood values are *not* errors: they are valid
/// objective values that tell the optimiser a parameter probe left the
/// feasible region.
#[derive(Debug, Error)]
pub enum LineageError {
    /// File could not be opened or read
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV-level parse failure
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// A required or configured column is absent from the header row
    #[error("column '{0}' not found in header")]
    MissingColumn(String),

    /// A data row could not be interpreted
    #[error("malformed row {row}: {reason}")]
    MalformedRow { row: usize, reason: String },

    /// Parameter file syntax or content problem
    #[error("parameter file: {0}")]
    ParameterFile(String),

    /// Matrix inversion or decomposition failed where the model
    /// guarantees it should not (outside the filter hot path)
    #[error("numerical failure: {0}")]
    Numerical(String),
}

impl LineageError {
    /// Creates a malformed-row error.
    pub fn malformed(row: usize, reason: impl Into<String>) -> Self {
        Self::MalformedRow {
            row,
            reason: reason.into(),
        }
    }
}
