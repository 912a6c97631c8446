// ========================================================================================
//
//                    Neighborhood smoothing over a weighted cell graph
//
// ========================================================================================
//
// The neighbor graph is built elsewhere and arrives as two aligned matrices: one row per
// cell, one column per neighbor slot. Slot 0 is the cell itself and never contributes to
// its own estimate.

use crate::types::{ColumnError, ExonColumn, captured_molecule_count};
use ndarray::{Array1, Array2, ArrayView1};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum GraphError {
    #[error("neighbor index matrix is {index_rows}x{index_cols} but weight matrix is {weight_rows}x{weight_cols}")]
    ShapeMismatch {
        index_rows: usize,
        index_cols: usize,
        weight_rows: usize,
        weight_cols: usize,
    },
    #[error("every cell must list at least itself in neighbor slot 0")]
    NoSelfSlot,
    #[error("cell {cell} lists {found} neighbor slots, expected {expected}")]
    RaggedRow {
        cell: usize,
        found: usize,
        expected: usize,
    },
    #[error("cell {cell} lists neighbor {neighbor}, but the graph only has {cells} cells")]
    IndexOutOfRange {
        cell: usize,
        neighbor: usize,
        cells: usize,
    },
    #[error("cell {cell} has weight {weight} in slot {slot}; weights must be finite and non-negative")]
    InvalidWeight { cell: usize, slot: usize, weight: f64 },
}

/// A read-only, fixed-degree neighbor graph.
#[derive(Debug, Clone)]
pub struct NeighborGraph {
    indices: Array2<usize>,
    weights: Array2<f64>,
}

impl NeighborGraph {
    /// Builds a graph from `n_cells × k` index and weight matrices.
    pub fn new(indices: Array2<usize>, weights: Array2<f64>) -> Result<Self, GraphError> {
        if indices.dim() != weights.dim() {
            return Err(GraphError::ShapeMismatch {
                index_rows: indices.nrows(),
                index_cols: indices.ncols(),
                weight_rows: weights.nrows(),
                weight_cols: weights.ncols(),
            });
        }
        if indices.nrows() > 0 && indices.ncols() == 0 {
            return Err(GraphError::NoSelfSlot);
        }
        let cells = indices.nrows();
        for ((cell, slot), &neighbor) in indices.indexed_iter() {
            if neighbor >= cells {
                return Err(GraphError::IndexOutOfRange {
                    cell,
                    neighbor,
                    cells,
                });
            }
            let weight = weights[[cell, slot]];
            if !weight.is_finite() || weight < 0.0 {
                return Err(GraphError::InvalidWeight { cell, slot, weight });
            }
        }
        Ok(Self { indices, weights })
    }

    /// Builds a graph from per-cell `(neighbor, weight)` lists of equal length.
    pub fn from_rows(rows: &[Vec<(usize, f64)>]) -> Result<Self, GraphError> {
        let cells = rows.len();
        let slots = rows.first().map_or(0, Vec::len);
        if let Some((cell, row)) = rows.iter().enumerate().find(|(_, row)| row.len() != slots) {
            return Err(GraphError::RaggedRow {
                cell,
                found: row.len(),
                expected: slots,
            });
        }
        let mut indices = Array2::zeros((cells, slots));
        let mut weights = Array2::zeros((cells, slots));
        for (cell, row) in rows.iter().enumerate() {
            for (slot, &(neighbor, weight)) in row.iter().enumerate() {
                indices[[cell, slot]] = neighbor;
                weights[[cell, slot]] = weight;
            }
        }
        Self::new(indices, weights)
    }

    #[inline]
    pub fn n_cells(&self) -> usize {
        self.indices.nrows()
    }

    /// Number of slots per cell, including the self slot.
    #[inline]
    pub fn n_slots(&self) -> usize {
        self.indices.ncols()
    }

    /// Neighbors of `cell` with their weights, skipping the self slot.
    pub fn neighbors(&self, cell: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.indices
            .row(cell)
            .into_iter()
            .zip(self.weights.row(cell))
            .skip(1)
            .map(|(&neighbor, &weight)| (neighbor, weight))
    }
}

/// Weighted mean of the defined observations among `cell`'s neighbors.
///
/// Returns `None` when no neighbor carries an observation or the contributing weights
/// sum to zero.
pub fn neighborhood_estimate(
    observed: ArrayView1<f64>,
    graph: &NeighborGraph,
    cell: usize,
) -> Option<f64> {
    let mut weighted_sum = 0.0;
    let mut weight_sum = 0.0;
    for (neighbor, weight) in graph.neighbors(cell) {
        let value = observed[neighbor];
        if !value.is_nan() {
            weighted_sum += value * weight;
            weight_sum += weight;
        }
    }
    (weight_sum > 0.0).then(|| weighted_sum / weight_sum)
}

/// The cells of one exon that carry an observation, with their smoothed references.
///
/// `neighborhood` holds `NaN` for cells whose estimate is undefined; such cells are
/// kept because they still count toward the exon's informative cells.
#[derive(Debug, Clone)]
pub struct SmoothedColumn {
    /// Original index of each retained cell.
    pub cells: Vec<usize>,
    pub observed: Array1<f64>,
    pub neighborhood: Array1<f64>,
    /// Captured-molecule counts after the collapse and rounding rules.
    pub molecules: Array1<u32>,
}

impl SmoothedColumn {
    #[inline]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Cells that will carry weight in the exon average.
    pub fn informative_cells(&self) -> usize {
        self.molecules.iter().filter(|&&m| m > 0).count()
    }

    /// Mean observed ratio across retained cells, `NaN` when none are retained.
    pub fn global_estimate(&self) -> f64 {
        self.observed.mean().unwrap_or(f64::NAN)
    }
}

/// Drops unobserved cells and computes each remaining cell's neighborhood estimate.
pub fn smooth(column: &ExonColumn, graph: &NeighborGraph) -> Result<SmoothedColumn, ColumnError> {
    if column.n_cells() != graph.n_cells() {
        return Err(ColumnError::GraphMismatch {
            cells: column.n_cells(),
            graph_cells: graph.n_cells(),
        });
    }

    let observed = column.observed();
    let molecules = column.molecules();
    let retained = column.n_observed();

    let mut cells = Vec::with_capacity(retained);
    let mut observed_out = Vec::with_capacity(retained);
    let mut neighborhood_out = Vec::with_capacity(retained);
    let mut molecules_out = Vec::with_capacity(retained);

    for (cell, &ratio) in observed.iter().enumerate() {
        if ratio.is_nan() {
            continue;
        }
        cells.push(cell);
        observed_out.push(ratio);
        neighborhood_out.push(neighborhood_estimate(observed, graph, cell).unwrap_or(f64::NAN));
        molecules_out.push(captured_molecule_count(molecules[cell]));
    }

    let undefined = neighborhood_out.iter().filter(|v| v.is_nan()).count();
    if undefined > 0 {
        log::trace!("{undefined} of {retained} observed cells have no observed neighbors");
    }

    Ok(SmoothedColumn {
        cells,
        observed: Array1::from(observed_out),
        neighborhood: Array1::from(neighborhood_out),
        molecules: Array1::from(molecules_out),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn chain_graph() -> NeighborGraph {
        NeighborGraph::from_rows(&[
            vec![(0, 0.0), (1, 1.0), (2, 1.0)],
            vec![(1, 0.0), (0, 1.0), (2, 3.0)],
            vec![(2, 0.0), (1, 1.0), (3, 1.0)],
            vec![(3, 0.0), (2, 2.0), (1, 0.0)],
        ])
        .unwrap()
    }

    #[test]
    fn estimate_is_weight_normalised_over_contributors() {
        let graph = chain_graph();
        let observed = array![0.1, 0.5, f64::NAN, 0.9];
        // Cell 1: neighbor 2 is missing, so only cell 0 contributes.
        assert_relative_eq!(
            neighborhood_estimate(observed.view(), &graph, 1).unwrap(),
            0.1
        );
        // Cell 2 sees cells 1 and 3 with equal weight.
        assert_relative_eq!(
            neighborhood_estimate(observed.view(), &graph, 2).unwrap(),
            0.7
        );
    }

    #[test]
    fn self_slot_is_ignored() {
        let graph = NeighborGraph::from_rows(&[
            vec![(0, 5.0), (1, 1.0)],
            vec![(1, 5.0), (0, 1.0)],
        ])
        .unwrap();
        let observed = array![0.0, 1.0];
        assert_eq!(neighborhood_estimate(observed.view(), &graph, 0), Some(1.0));
        assert_eq!(neighborhood_estimate(observed.view(), &graph, 1), Some(0.0));
    }

    #[test]
    fn estimate_is_undefined_without_contributors() {
        let graph = chain_graph();
        // Cell 3 only sees cell 2 (missing) and cell 1 with zero weight.
        let observed = array![0.1, 0.5, f64::NAN, 0.9];
        assert_eq!(neighborhood_estimate(observed.view(), &graph, 3), None);
    }

    #[test]
    fn smoothing_drops_missing_cells_and_keeps_undefined_estimates() {
        let graph = chain_graph();
        let observed = array![0.1, 0.5, f64::NAN, 0.9];
        let molecules = array![2.0, 0.5, 4.0, 0.05];
        let column = ExonColumn::new(observed.view(), molecules.view()).unwrap();
        let smoothed = smooth(&column, &graph).unwrap();

        assert_eq!(smoothed.cells, vec![0, 1, 3]);
        assert_eq!(smoothed.observed, array![0.1, 0.5, 0.9]);
        assert_eq!(smoothed.molecules, array![2_u32, 1, 0]);
        assert_relative_eq!(smoothed.neighborhood[0], 0.5);
        assert_relative_eq!(smoothed.neighborhood[1], 0.1);
        assert!(smoothed.neighborhood[2].is_nan());
        assert_eq!(smoothed.informative_cells(), 2);
        assert_relative_eq!(smoothed.global_estimate(), 0.5);
    }

    #[test]
    fn column_must_match_graph() {
        let graph = chain_graph();
        let observed = array![0.1, 0.5];
        let molecules = array![1.0, 1.0];
        let column = ExonColumn::new(observed.view(), molecules.view()).unwrap();
        assert_eq!(
            smooth(&column, &graph).unwrap_err(),
            ColumnError::GraphMismatch {
                cells: 2,
                graph_cells: 4
            }
        );
    }

    #[test]
    fn graph_rejects_negative_weights_and_bad_indices() {
        assert_eq!(
            NeighborGraph::from_rows(&[vec![(0, 0.0), (1, -1.0)], vec![(1, 0.0), (0, 1.0)]])
                .unwrap_err(),
            GraphError::InvalidWeight {
                cell: 0,
                slot: 1,
                weight: -1.0
            }
        );
        assert_eq!(
            NeighborGraph::from_rows(&[vec![(0, 0.0), (4, 1.0)], vec![(1, 0.0), (0, 1.0)]])
                .unwrap_err(),
            GraphError::IndexOutOfRange {
                cell: 0,
                neighbor: 4,
                cells: 2
            }
        );
        assert!(matches!(
            NeighborGraph::from_rows(&[vec![(0, 0.0), (1, 1.0)], vec![(1, 0.0)]]),
            Err(GraphError::RaggedRow { cell: 1, .. })
        ));
        assert!(matches!(
            NeighborGraph::new(Array2::zeros((2, 3)), Array2::zeros((2, 2))),
            Err(GraphError::ShapeMismatch { .. })
        ));
    }
}
