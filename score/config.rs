use crate::permute::PermutationStrategy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

pub const DEFAULT_CAPTURE_EFFICIENCY: f64 = 0.1;
pub const DEFAULT_MIN_PROBABILITY: f64 = 0.01;
/// Efficiencies below this still validate but make unknown-regime evaluations slow.
pub const PRACTICAL_MIN_CAPTURE_EFFICIENCY: f64 = 1e-3;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("capture_efficiency must lie in (0, 1], got {0}")]
    InvalidCaptureEfficiency(f64),
    #[error("min_probability must lie in (0, 1], got {0}")]
    InvalidMinProbability(f64),
}

/// Noise-model parameters that have passed validation.
///
/// Every scoring entry point takes this type rather than raw floats, so an efficiency
/// outside `(0, 1]` or a non-positive probability floor cannot reach the model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelParameters {
    capture_efficiency: f64,
    min_probability: f64,
}

impl ModelParameters {
    /// Validates an efficiency in `(0, 1]` and a floor in `(0, 1]`.
    ///
    /// When the model cannot pin the cell's total molecule count it sums over
    /// `m ∈ [r, 10·r/c)`, so one evaluation costs on the order of `r/c` terms. The sum
    /// stops once its remaining terms fall below `1e-16 · c` of the running total, but a
    /// peak far from `r` still has to be reached first. Values under
    /// [`PRACTICAL_MIN_CAPTURE_EFFICIENCY`] are accepted with a warning.
    pub fn new(capture_efficiency: f64, min_probability: f64) -> Result<Self, ConfigError> {
        if !(capture_efficiency > 0.0 && capture_efficiency <= 1.0) {
            return Err(ConfigError::InvalidCaptureEfficiency(capture_efficiency));
        }
        if !(min_probability > 0.0 && min_probability <= 1.0) {
            return Err(ConfigError::InvalidMinProbability(min_probability));
        }
        if capture_efficiency < PRACTICAL_MIN_CAPTURE_EFFICIENCY {
            log::warn!(
                "capture efficiency {capture_efficiency} is below {PRACTICAL_MIN_CAPTURE_EFFICIENCY}; \
                 each unknown-regime evaluation sums up to 10·r/{capture_efficiency} terms"
            );
        }
        Ok(Self {
            capture_efficiency,
            min_probability,
        })
    }

    #[inline]
    pub fn capture_efficiency(&self) -> f64 {
        self.capture_efficiency
    }

    #[inline]
    pub fn min_probability(&self) -> f64 {
        self.min_probability
    }

    /// Largest magnitude a single cell's log-likelihood ratio can take.
    #[inline]
    pub fn score_bound(&self) -> f64 {
        -self.min_probability.ln()
    }
}

impl Default for ModelParameters {
    fn default() -> Self {
        Self {
            capture_efficiency: DEFAULT_CAPTURE_EFFICIENCY,
            min_probability: DEFAULT_MIN_PROBABILITY,
        }
    }
}

/// Run-level scoring settings, stored as TOML.
///
/// Keys left out of a file take the defaults below, so an empty file is a valid
/// configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScoringConfig {
    /// Probability that any one molecule in a cell is captured.
    pub capture_efficiency: f64,
    /// Floor applied to model probabilities before taking logarithms.
    pub min_probability: f64,
    /// Score a permuted column instead of the observed one.
    pub randomize: bool,
    /// Seed for the permutation drawn when `randomize` is set.
    pub seed: u64,
    /// How cells are reordered when `randomize` is set.
    pub permutation: PermutationStrategy,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            capture_efficiency: DEFAULT_CAPTURE_EFFICIENCY,
            min_probability: DEFAULT_MIN_PROBABILITY,
            randomize: false,
            seed: 0,
            permutation: PermutationStrategy::Full,
        }
    }
}

impl ScoringConfig {
    /// Checks the numeric settings and returns the parameters the model runs with.
    pub fn validate(&self) -> Result<ModelParameters, ConfigError> {
        ModelParameters::new(self.capture_efficiency, self.min_probability)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Loads and validates a configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)?;
        log::debug!("Loaded scoring configuration from {}", path.display());
        Ok(config)
    }

    /// Saves the configuration to a file in a human-readable TOML format.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let toml_string = self.to_toml_string()?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = ScoringConfig::from_toml_str("").unwrap();
        assert_eq!(config, ScoringConfig::default());
        assert_eq!(config.capture_efficiency, 0.1);
        assert_eq!(config.min_probability, 0.01);
        assert!(!config.randomize);
        assert_eq!(config.seed, 0);
        assert_eq!(config.permutation, PermutationStrategy::Full);
    }

    #[test]
    fn partial_document_overrides_named_keys() {
        let text = "capture_efficiency = 0.25\nrandomize = true\nseed = 7\npermutation = \"preserve-missing\"\n";
        let config = ScoringConfig::from_toml_str(text).unwrap();
        assert_eq!(config.capture_efficiency, 0.25);
        assert_eq!(config.min_probability, DEFAULT_MIN_PROBABILITY);
        assert!(config.randomize);
        assert_eq!(config.seed, 7);
        assert_eq!(config.permutation, PermutationStrategy::PreserveMissing);
    }

    #[test]
    fn invalid_efficiency_fails_fast() {
        for bad in [0.0, -0.3, 1.5, f64::NAN] {
            assert!(matches!(
                ModelParameters::new(bad, 0.01),
                Err(ConfigError::InvalidCaptureEfficiency(_))
            ));
        }
        assert!(ModelParameters::new(1.0, 0.01).is_ok());
        let tiny = ModelParameters::new(PRACTICAL_MIN_CAPTURE_EFFICIENCY / 10.0, 0.01).unwrap();
        assert_eq!(tiny.capture_efficiency(), 1e-4);
        let err = ScoringConfig::from_toml_str("capture_efficiency = 2.0").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidCaptureEfficiency(v) if v == 2.0));
    }

    #[test]
    fn invalid_floor_fails_fast() {
        for bad in [0.0, -1e-3, 1.5] {
            assert!(matches!(
                ModelParameters::new(0.1, bad),
                Err(ConfigError::InvalidMinProbability(_))
            ));
        }
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(matches!(
            ScoringConfig::from_toml_str("capture_eficiency = 0.2"),
            Err(ConfigError::TomlParseError(_))
        ));
    }

    #[test]
    fn score_bound_matches_floor() {
        let params = ModelParameters::new(0.1, 0.01).unwrap();
        assert!((params.score_bound() - 100.0_f64.ln()).abs() < 1e-12);
    }
}
