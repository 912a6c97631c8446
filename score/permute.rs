use crate::types::{ExonColumn, OwnedExonColumn};
use ndarray::{ArrayView1, Axis};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

/// How a column is reordered to break the link between cells and their neighborhoods.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PermutationStrategy {
    /// Uniform shuffle of every cell, observed or not.
    #[default]
    Full,
    /// Missing cells stay where they are; only observed cells are shuffled among
    /// themselves.
    PreserveMissing,
}

/// A uniform random ordering of `n_cells` indices, fixed by `seed`.
pub fn shuffled_order(n_cells: usize, seed: u64) -> Vec<usize> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut order: Vec<usize> = (0..n_cells).collect();
    order.shuffle(&mut rng);
    order
}

/// An ordering that moves observed cells among observed positions only.
pub fn missing_preserving_order(observed: ArrayView1<f64>, seed: u64) -> Vec<usize> {
    let mut rng = StdRng::seed_from_u64(seed);
    let positions: Vec<usize> = observed
        .iter()
        .enumerate()
        .filter(|(_, value)| !value.is_nan())
        .map(|(cell, _)| cell)
        .collect();
    let mut sources = positions.clone();
    sources.shuffle(&mut rng);

    let mut order: Vec<usize> = (0..observed.len()).collect();
    for (&slot, source) in positions.iter().zip(sources) {
        order[slot] = source;
    }
    order
}

/// The ordering `strategy` draws for `column` under `seed`.
pub fn permutation_order(column: &ExonColumn, strategy: PermutationStrategy, seed: u64) -> Vec<usize> {
    match strategy {
        PermutationStrategy::Full => shuffled_order(column.n_cells(), seed),
        PermutationStrategy::PreserveMissing => missing_preserving_order(column.observed(), seed),
    }
}

/// Reindexes both columns with the same ordering: cell `i` of the result carries the
/// observation and molecule estimate of cell `order[i]`. The neighbor graph is left
/// alone, which is what decouples observations from their neighborhoods.
pub fn apply_order(column: &ExonColumn, order: &[usize]) -> OwnedExonColumn {
    OwnedExonColumn {
        observed: column.observed().select(Axis(0), order),
        molecules: column.molecules().select(Axis(0), order),
    }
}

/// Draws and applies one permutation.
pub fn permute_column(
    column: &ExonColumn,
    strategy: PermutationStrategy,
    seed: u64,
) -> OwnedExonColumn {
    let order = permutation_order(column, strategy, seed);
    apply_order(column, &order)
}

/// `(1 + #{null ≥ observed}) / (1 + |null|)`.
///
/// The added one keeps the estimate away from zero with a finite number of draws.
pub fn empirical_p_value(observed: f64, null: &[f64]) -> f64 {
    let at_least = null.iter().filter(|&&score| score >= observed).count();
    (1 + at_least) as f64 / (1 + null.len()) as f64
}

/// Scores of permuted columns for one exon.
#[derive(Debug, Clone, PartialEq)]
pub struct NullDistribution {
    scores: Vec<f64>,
    undefined: usize,
}

impl NullDistribution {
    pub(crate) fn new(scores: Vec<f64>, undefined: usize) -> Self {
        Self { scores, undefined }
    }

    /// Defined permuted scores, in permutation order.
    #[inline]
    pub fn scores(&self) -> &[f64] {
        &self.scores
    }

    /// Permutations that produced no defined score.
    #[inline]
    pub fn undefined_count(&self) -> usize {
        self.undefined
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.scores.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    pub fn mean(&self) -> Option<f64> {
        if self.scores.is_empty() {
            None
        } else {
            Some(self.scores.iter().sum::<f64>() / self.scores.len() as f64)
        }
    }

    pub fn p_value(&self, observed: f64) -> f64 {
        empirical_p_value(observed, &self.scores)
    }
}
