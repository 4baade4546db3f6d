//! In-memory genealogy of cells.
//!
//! Cells are stored in an arena (`Vec<Cell>`); parent and daughter
//! links are integer indices into it, so the topology can be shared
//! immutably while per-evaluation filter state lives in a parallel
//! vector (see [`crate::likelihood::TreeState`]). Linking uses the
//! parent-id strings produced at ingestion: a cell is a root iff its
//! parent-id matches no cell id, and a cell has at most two daughters —
//! a third daughter link is logged and dropped.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// One cell: a contiguous sequence of observations between divisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cell {
    /// Identity, e.g. `20150624.0.1.5`
    pub cell_id: String,
    /// Identity of the mother cell (may match nothing for roots)
    pub parent_id: String,
    /// Arena index of the mother, if linked
    pub parent: Option<usize>,
    /// Arena indices of the daughters (at most two)
    pub daughters: Vec<usize>,
    /// Observation times, strictly increasing
    pub time: Vec<f64>,
    /// Observed log-length per time point
    pub log_length: Vec<f64>,
    /// Observed fluorescence per time point
    pub fp: Vec<f64>,
}

impl Cell {
    /// Creates an unlinked cell with no observations.
    pub fn new(cell_id: impl Into<String>, parent_id: impl Into<String>) -> Self {
        Self {
            cell_id: cell_id.into(),
            parent_id: parent_id.into(),
            parent: None,
            daughters: Vec::new(),
            time: Vec::new(),
            log_length: Vec::new(),
            fp: Vec::new(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn is_leaf(&self) -> bool {
        self.daughters.is_empty()
    }

    /// Number of observations.
    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }
}

/// The linked genealogy: arena plus root indices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellTree {
    /// All cells, in ingestion order
    pub cells: Vec<Cell>,
    /// Indices of cells whose parent-id matched nothing
    pub roots: Vec<usize>,
}

impl CellTree {
    /// Wires parent/daughter indices by matching each cell's parent-id
    /// against every cell id (the double scan of the data loader).
    pub fn link(mut cells: Vec<Cell>) -> Self {
        for k in 0..cells.len() {
            let mut parent_idx = None;
            for j in 0..cells.len() {
                if j != k && cells[j].cell_id == cells[k].parent_id {
                    parent_idx = Some(j);
                    break;
                }
            }
            if let Some(j) = parent_idx {
                cells[k].parent = Some(j);
                if cells[j].daughters.len() < 2 {
                    cells[j].daughters.push(k);
                } else {
                    warn!(
                        cell = %cells[j].cell_id,
                        extra = %cells[k].cell_id,
                        "cell already has two daughters, dropping link"
                    );
                    cells[k].parent = None;
                }
            }
        }
        let roots = cells
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_root())
            .map(|(i, _)| i)
            .collect();
        Self { cells, roots }
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Indices of all leaves.
    pub fn leaves(&self) -> Vec<usize> {
        self.cells
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_leaf())
            .map(|(i, _)| i)
            .collect()
    }

    /// Total number of observations over all cells.
    pub fn observation_count(&self) -> usize {
        self.cells.iter().map(|c| c.len()).sum()
    }
}

impl fmt::Display for CellTree {
    /// Genealogy dump, one block per cell:
    ///
    /// ```text
    /// 20150624.0.1.0
    ///     \_ daughter 1: 20150624.0.1.2
    ///     \_ daughter 2: 20150624.0.1.4
    /// 20150624.0.1.2   <- parent: 20150624.0.1.0
    /// ```
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for cell in &self.cells {
            match cell.parent {
                None => writeln!(f, "{}", cell.cell_id)?,
                Some(p) => writeln!(f, "{} \t <- parent: {}", cell.cell_id, self.cells[p].cell_id)?,
            }
            for (n, d) in cell.daughters.iter().enumerate() {
                writeln!(f, "\t \\_ daughter {}: {}", n + 1, self.cells[*d].cell_id)?;
            }
        }
        Ok(())
    }
}
