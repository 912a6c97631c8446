#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod config;
pub mod engine;
pub mod noise;
pub mod permute;
pub mod progress;
pub mod smoothing;
pub mod turbo;
pub mod types;

pub use config::{ConfigError, ModelParameters, ScoringConfig};
pub use engine::{ExonScorer, ScoreError, ScoredExon, psix_score};
pub use permute::{NullDistribution, PermutationStrategy, empirical_p_value};
pub use smoothing::{GraphError, NeighborGraph, SmoothedColumn};
pub use turbo::{TurboError, TurboTable};
pub use types::{ColumnError, ExonColumn, ExonScore};
