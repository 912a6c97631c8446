// ========================================================================================
//                           Column types shared across modules
// ========================================================================================

use ndarray::{Array1, ArrayView1};
use std::fmt;
use thiserror::Error;

/// Raw molecule estimates in `(COLLAPSE_FLOOR, 1]` are counted as one captured molecule.
const COLLAPSE_FLOOR: f64 = 0.1;

/// Errors raised when a per-exon column cannot be scored as given.
#[derive(Debug, Error, PartialEq)]
pub enum ColumnError {
    #[error("observed column has {observed} cells but the molecule column has {molecules}")]
    LengthMismatch { observed: usize, molecules: usize },
    #[error("column has {cells} cells but the neighbor graph describes {graph_cells}")]
    GraphMismatch { cells: usize, graph_cells: usize },
    #[error("cell {cell} has observed ratio {value}; ratios must lie in [0, 1] or be missing (NaN)")]
    ObservedOutOfRange { cell: usize, value: f64 },
    #[error("cell {cell} has molecule estimate {value}; estimates must be finite and non-negative")]
    InvalidMoleculeEstimate { cell: usize, value: f64 },
}

/// A validated, index-aligned view over one exon's observations.
///
/// `observed` holds one splicing ratio per cell with `NaN` marking a missing
/// observation. `molecules` holds the raw (pre-rounding) captured-molecule estimate for
/// the same cells. Molecule estimates are only checked for cells whose observation is
/// defined, since the others never reach the scoring stage.
#[derive(Debug, Clone, Copy)]
pub struct ExonColumn<'a> {
    observed: ArrayView1<'a, f64>,
    molecules: ArrayView1<'a, f64>,
}

impl<'a> ExonColumn<'a> {
    pub fn new(
        observed: ArrayView1<'a, f64>,
        molecules: ArrayView1<'a, f64>,
    ) -> Result<Self, ColumnError> {
        if observed.len() != molecules.len() {
            return Err(ColumnError::LengthMismatch {
                observed: observed.len(),
                molecules: molecules.len(),
            });
        }
        for (cell, (&ratio, &estimate)) in observed.iter().zip(molecules.iter()).enumerate() {
            if ratio.is_nan() {
                continue;
            }
            if !(0.0..=1.0).contains(&ratio) {
                return Err(ColumnError::ObservedOutOfRange { cell, value: ratio });
            }
            if !estimate.is_finite() || estimate < 0.0 {
                return Err(ColumnError::InvalidMoleculeEstimate {
                    cell,
                    value: estimate,
                });
            }
        }
        Ok(Self {
            observed,
            molecules,
        })
    }

    /// Wraps arrays that are a reordering of an already validated column.
    pub(crate) fn from_validated(
        observed: ArrayView1<'a, f64>,
        molecules: ArrayView1<'a, f64>,
    ) -> Self {
        Self {
            observed,
            molecules,
        }
    }

    #[inline]
    pub fn n_cells(&self) -> usize {
        self.observed.len()
    }

    #[inline]
    pub fn observed(&self) -> ArrayView1<'a, f64> {
        self.observed
    }

    #[inline]
    pub fn molecules(&self) -> ArrayView1<'a, f64> {
        self.molecules
    }

    /// Number of cells carrying a defined observation.
    pub fn n_observed(&self) -> usize {
        self.observed.iter().filter(|v| !v.is_nan()).count()
    }
}

/// An owned column, typically the output of a permutation.
#[derive(Debug, Clone)]
pub struct OwnedExonColumn {
    pub(crate) observed: Array1<f64>,
    pub(crate) molecules: Array1<f64>,
}

impl OwnedExonColumn {
    pub fn view(&self) -> ExonColumn<'_> {
        ExonColumn::from_validated(self.observed.view(), self.molecules.view())
    }
}

/// The exon-level statistic.
///
/// `Undefined` means there was no informative cell to average over. It is kept apart
/// from a real `0.0`, which would claim the neighborhood carries no signal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExonScore {
    Defined(f64),
    Undefined,
}

impl ExonScore {
    #[inline]
    pub fn value(self) -> Option<f64> {
        match self {
            Self::Defined(v) => Some(v),
            Self::Undefined => None,
        }
    }

    #[inline]
    pub fn is_defined(self) -> bool {
        matches!(self, Self::Defined(_))
    }
}

impl fmt::Display for ExonScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Defined(v) => write!(f, "{v}"),
            Self::Undefined => f.write_str("NA"),
        }
    }
}

/// Converts a raw molecule estimate into the integer count used by the noise model.
///
/// Values in `(0.1, 1]` collapse to one molecule; everything else is rounded half to
/// even. Estimates at or below `0.1` therefore round to zero and make the cell
/// uninformative.
#[inline]
pub fn captured_molecule_count(raw: f64) -> u32 {
    let collapsed = if raw > COLLAPSE_FLOOR && raw <= 1.0 {
        1.0
    } else {
        raw
    };
    collapsed.round_ties_even() as u32
}
