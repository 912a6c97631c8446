// ========================================================================================
//
//                      Per-cell log-likelihood ratios and exon scores
//
// ========================================================================================
//
// Each observed cell contributes `ln P(o | neighborhood) − ln P(o | global)`. The exon
// score is the sum of those contributions divided by the number of cells that carry at
// least one captured molecule.

use crate::config::{ConfigError, ModelParameters, ScoringConfig};
use crate::noise::probability_observed_ratio;
use crate::permute::{NullDistribution, permute_column};
use crate::smoothing::{GraphError, NeighborGraph, SmoothedColumn, smooth};
use crate::turbo::{TurboError, TurboTable};
use crate::types::{ColumnError, ExonColumn, ExonScore};
use itertools::izip;
use ndarray::Array1;
use rayon::prelude::*;
use thiserror::Error;

/// Neighborhood estimates are pulled into this range before the model sees them.
pub const REFERENCE_FLOOR: f64 = 0.01;
pub const REFERENCE_CEILING: f64 = 0.99;

#[derive(Error, Debug)]
pub enum ScoreError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Column(#[from] ColumnError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Turbo(#[from] TurboError),
    #[error("a null distribution needs at least one permutation")]
    NoPermutations,
    #[error(
        "turbo tables were built with capture efficiency {table_efficiency} and floor {table_floor}, \
         but scoring is configured with {config_efficiency} and {config_floor}"
    )]
    TurboParameterMismatch {
        table_efficiency: f64,
        table_floor: f64,
        config_efficiency: f64,
        config_floor: f64,
    },
}

/// `ln(max(floor, p))`, keeping `NaN` so the caller can neutralise it.
#[inline]
fn floored_ln(probability: f64, floor: f64) -> f64 {
    if probability.is_nan() {
        f64::NAN
    } else {
        probability.max(floor).ln()
    }
}

/// Log-likelihood ratio of one cell's observation under its neighborhood estimate
/// versus the exon-wide estimate.
///
/// A missing observation, or any undefined quantity on the way, scores exactly zero.
/// The magnitude never exceeds [`ModelParameters::score_bound`].
pub fn observation_score(
    observed: f64,
    neighborhood: f64,
    global: f64,
    molecules: u32,
    params: &ModelParameters,
) -> f64 {
    if observed.is_nan() {
        return 0.0;
    }
    let efficiency = params.capture_efficiency();
    let floor = params.min_probability();
    let reference = neighborhood.clamp(REFERENCE_FLOOR, REFERENCE_CEILING);

    let local = floored_ln(
        probability_observed_ratio(observed, reference, efficiency, molecules),
        floor,
    );
    let background = floored_ln(
        probability_observed_ratio(observed, global, efficiency, molecules),
        floor,
    );
    let score = local - background;
    if score.is_nan() { 0.0 } else { score }
}

/// Direct-model scores for every retained cell of a smoothed column.
pub fn observation_scores(
    smoothed: &SmoothedColumn,
    global: f64,
    params: &ModelParameters,
) -> Array1<f64> {
    izip!(
        smoothed.observed.iter(),
        smoothed.neighborhood.iter(),
        smoothed.molecules.iter()
    )
    .map(|(&observed, &neighborhood, &molecules)| {
        observation_score(observed, neighborhood, global, molecules, params)
    })
    .collect()
}

/// Table-lookup scores for every retained cell of a smoothed column.
pub fn observation_scores_turbo(
    smoothed: &SmoothedColumn,
    global: f64,
    turbo: &TurboTable,
) -> Array1<f64> {
    izip!(
        smoothed.observed.iter(),
        smoothed.neighborhood.iter(),
        smoothed.molecules.iter()
    )
    .map(|(&observed, &neighborhood, &molecules)| {
        turbo.log_likelihood_ratio(observed, neighborhood, global, molecules)
    })
    .collect()
}

/// Everything computed on the way to an exon score.
#[derive(Debug, Clone)]
pub struct ScoredExon {
    /// Original indices of the cells with a defined observation.
    pub cells: Vec<usize>,
    /// Per-cell log-likelihood ratios, aligned with `cells`.
    pub scores: Array1<f64>,
    /// Retained cells with at least one captured molecule.
    pub total_scored_cells: usize,
    /// Mean observed ratio over retained cells.
    pub global_estimate: f64,
    pub exon_score: ExonScore,
}

/// Shared, validated state for scoring many exons against one neighbor graph.
#[derive(Debug, Clone, Copy)]
pub struct ExonScorer<'a> {
    graph: &'a NeighborGraph,
    config: ScoringConfig,
    params: ModelParameters,
    turbo: Option<&'a TurboTable>,
}

impl<'a> ExonScorer<'a> {
    /// Validates `config` and, when tables are given, checks they were built with the
    /// same model parameters.
    pub fn new(
        graph: &'a NeighborGraph,
        config: &ScoringConfig,
        turbo: Option<&'a TurboTable>,
    ) -> Result<Self, ScoreError> {
        let params = config.validate()?;
        if let Some(table) = turbo
            && table.params() != &params
        {
            return Err(ScoreError::TurboParameterMismatch {
                table_efficiency: table.params().capture_efficiency(),
                table_floor: table.params().min_probability(),
                config_efficiency: params.capture_efficiency(),
                config_floor: params.min_probability(),
            });
        }
        Ok(Self {
            graph,
            config: *config,
            params,
            turbo,
        })
    }

    #[inline]
    pub fn params(&self) -> &ModelParameters {
        &self.params
    }

    #[inline]
    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    pub fn score(&self, column: &ExonColumn) -> Result<ExonScore, ScoreError> {
        Ok(self.score_detailed(column)?.exon_score)
    }

    /// Scores one column, permuting it first when the configuration asks for it.
    pub fn score_detailed(&self, column: &ExonColumn) -> Result<ScoredExon, ScoreError> {
        if self.config.randomize {
            let permuted = permute_column(column, self.config.permutation, self.config.seed);
            self.score_in_place(&permuted.view())
        } else {
            self.score_in_place(column)
        }
    }

    /// Scores the column after one seeded permutation, whatever `randomize` says.
    pub fn score_permuted(&self, column: &ExonColumn, seed: u64) -> Result<ExonScore, ScoreError> {
        let permuted = permute_column(column, self.config.permutation, seed);
        Ok(self.score_in_place(&permuted.view())?.exon_score)
    }

    /// Scores `n_permutations` permuted copies of `column` in parallel.
    ///
    /// Permutation `i` uses seed `base_seed + i` (wrapping), so the result does not
    /// depend on how the work is scheduled. Permutations with an undefined score are
    /// counted but left out of the distribution.
    pub fn null_distribution(
        &self,
        column: &ExonColumn,
        n_permutations: usize,
        base_seed: u64,
    ) -> Result<NullDistribution, ScoreError> {
        if n_permutations == 0 {
            return Err(ScoreError::NoPermutations);
        }
        let results: Vec<ExonScore> = (0..n_permutations)
            .into_par_iter()
            .map(|i| self.score_permuted(column, base_seed.wrapping_add(i as u64)))
            .collect::<Result<_, _>>()?;

        let scores: Vec<f64> = results.iter().filter_map(|score| score.value()).collect();
        let undefined = results.len() - scores.len();
        if undefined > 0 {
            log::debug!("{undefined} of {n_permutations} permutations gave an undefined score");
        }
        Ok(NullDistribution::new(scores, undefined))
    }

    fn score_in_place(&self, column: &ExonColumn) -> Result<ScoredExon, ScoreError> {
        let smoothed = smooth(column, self.graph)?;
        let global_estimate = smoothed.global_estimate();
        let total_scored_cells = smoothed.informative_cells();

        if total_scored_cells == 0 {
            log::debug!(
                "No informative cells among {} observed; exon score is undefined",
                smoothed.len()
            );
            return Ok(ScoredExon {
                scores: Array1::zeros(smoothed.len()),
                cells: smoothed.cells,
                total_scored_cells,
                global_estimate,
                exon_score: ExonScore::Undefined,
            });
        }

        let scores = match self.turbo {
            Some(turbo) => observation_scores_turbo(&smoothed, global_estimate, turbo),
            None => observation_scores(&smoothed, global_estimate, &self.params),
        };
        let exon_score = scores.sum() / total_scored_cells as f64;

        Ok(ScoredExon {
            cells: smoothed.cells,
            scores,
            total_scored_cells,
            global_estimate,
            exon_score: ExonScore::Defined(exon_score),
        })
    }
}

/// Scores one exon column in a single call.
pub fn psix_score(
    column: &ExonColumn,
    graph: &NeighborGraph,
    config: &ScoringConfig,
    turbo: Option<&TurboTable>,
) -> Result<ExonScore, ScoreError> {
    ExonScorer::new(graph, config, turbo)?.score(column)
}
