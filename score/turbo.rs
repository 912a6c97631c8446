// ========================================================================================
//
//                  Precomputed noise-model tables on a percent grid
//
// ========================================================================================
//
// One matrix per captured-molecule count `k`. Row `i` is the observed ratio `i/100`
// for `i ∈ 0..=100`; column `j` is the reference ratio `(j+1)/100` for `j ∈ 0..=98`.
// Entries are already floored, so every stored value is strictly positive and its
// logarithm is finite. A `turbo.toml` manifest beside the matrices records the model
// parameters they were evaluated with.

use crate::config::{ConfigError, ModelParameters};
use crate::noise::probability_observed_ratio;
use crate::progress::{TurboBuildObserver, TurboBuildStage};
use ndarray::Array2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Rows per table: observed ratios 0.00 through 1.00.
pub const OBSERVED_BINS: usize = 101;
/// Columns per table: reference ratios 0.01 through 0.99.
pub const REFERENCE_BINS: usize = 99;

const FILE_PREFIX: &str = "turbo_mrna_";
const FILE_SUFFIX: &str = ".tsv";
/// Parameter manifest written next to the tables.
pub const MANIFEST_FILE: &str = "turbo.toml";

#[derive(Error, Debug)]
pub enum TurboError {
    #[error("a turbo table set needs at least one molecule count")]
    Empty,
    #[error(
        "table for {molecules} molecules is {rows}x{cols}, expected {expected_rows}x{expected_cols}"
    )]
    Shape {
        molecules: u32,
        rows: usize,
        cols: usize,
        expected_rows: usize,
        expected_cols: usize,
    },
    #[error("table for {molecules} molecules holds {value} at ({row}, {col}); entries must be finite and positive")]
    NonPositive {
        molecules: u32,
        row: usize,
        col: usize,
        value: f64,
    },
    #[error("no turbo tables found in '{}'", .0.display())]
    NotFound(PathBuf),
    #[error("turbo tables in '{}' have no turbo.toml recording their model parameters", .0.display())]
    MissingManifest(PathBuf),
    #[error("failed to parse turbo manifest: {0}")]
    ManifestParse(#[from] toml::de::Error),
    #[error("failed to serialize turbo manifest: {0}")]
    ManifestSerialize(#[from] toml::ser::Error),
    #[error("turbo manifest holds invalid model parameters: {0}")]
    ManifestParameters(#[from] ConfigError),
    #[error("turbo manifest declares {declared} tables but {found} were found")]
    CountMismatch { declared: u32, found: u32 },
    #[error("refusing to overwrite existing turbo table '{}'", .0.display())]
    AlreadyExists(PathBuf),
    #[error("I/O error on turbo tables: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed turbo table file: {0}")]
    Csv(#[from] csv::Error),
    #[error("'{}' line {line}: cannot parse '{value}' as a number", .path.display())]
    Number {
        path: PathBuf,
        line: usize,
        value: String,
    },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct Manifest {
    capture_efficiency: f64,
    min_probability: f64,
    max_molecules: u32,
}

/// Read-only lookup tables indexed by captured molecules, observed bin and reference bin.
#[derive(Debug, Clone, PartialEq)]
pub struct TurboTable {
    params: ModelParameters,
    tables: Vec<Array2<f64>>,
}

impl TurboTable {
    /// Wraps tables for molecule counts `1..=tables.len()`, in that order, evaluated
    /// under `params`.
    pub fn from_tables(
        params: ModelParameters,
        tables: Vec<Array2<f64>>,
    ) -> Result<Self, TurboError> {
        if tables.is_empty() {
            return Err(TurboError::Empty);
        }
        for (index, table) in tables.iter().enumerate() {
            validate_table(index as u32 + 1, table)?;
        }
        Ok(Self { params, tables })
    }

    /// Evaluates the noise model on the full grid for every count in `1..=max_molecules`.
    pub fn build(
        params: &ModelParameters,
        max_molecules: u32,
        observer: &impl TurboBuildObserver,
    ) -> Result<Self, TurboError> {
        if max_molecules == 0 {
            return Err(TurboError::Empty);
        }
        log::info!(
            "Building turbo tables for 1..={max_molecules} molecules (capture efficiency {}, floor {})",
            params.capture_efficiency(),
            params.min_probability()
        );
        observer.on_stage_start(TurboBuildStage::Evaluation, max_molecules as usize);
        let tables: Vec<Array2<f64>> = (1..=max_molecules)
            .into_par_iter()
            .map(|molecules| {
                let table = evaluate_table(params, molecules);
                observer.on_table_finished(TurboBuildStage::Evaluation, molecules);
                table
            })
            .collect();
        observer.on_stage_finish(TurboBuildStage::Evaluation);
        log::info!("Built {} turbo tables", tables.len());
        Ok(Self {
            params: *params,
            tables,
        })
    }

    /// Model parameters the tables were evaluated with.
    #[inline]
    pub fn params(&self) -> &ModelParameters {
        &self.params
    }

    /// Largest molecule count with a table; larger counts are looked up here.
    #[inline]
    pub fn max_molecules(&self) -> u32 {
        self.tables.len() as u32
    }

    pub fn table(&self, molecules: u32) -> Option<&Array2<f64>> {
        let index = usize::try_from(molecules).ok()?.checked_sub(1)?;
        self.tables.get(index)
    }

    #[inline]
    pub fn observed_bin(observed: f64) -> usize {
        ((100.0 * observed).round_ties_even().max(0.0) as usize).min(OBSERVED_BINS - 1)
    }

    #[inline]
    pub fn reference_bin(reference: f64) -> usize {
        let percent = (100.0 * reference).round_ties_even() - 1.0;
        (percent.max(0.0) as usize).min(REFERENCE_BINS - 1)
    }

    /// Table value for an exact molecule count; `None` when either ratio is `NaN` or no
    /// table covers `molecules`.
    pub fn probability(&self, observed: f64, reference: f64, molecules: u32) -> Option<f64> {
        if observed.is_nan() || reference.is_nan() {
            return None;
        }
        let table = self.table(molecules)?;
        Some(table[[Self::observed_bin(observed), Self::reference_bin(reference)]])
    }

    /// `ln P(o | neighborhood) − ln P(o | global)` read from the tables.
    ///
    /// Counts above [`Self::max_molecules`] use the largest table. Zero molecules and
    /// undefined ratios score zero.
    pub fn log_likelihood_ratio(
        &self,
        observed: f64,
        neighborhood: f64,
        global: f64,
        molecules: u32,
    ) -> f64 {
        let molecules = molecules.min(self.max_molecules());
        match (
            self.probability(observed, neighborhood, molecules),
            self.probability(observed, global, molecules),
        ) {
            (Some(local), Some(background)) => local.ln() - background.ln(),
            _ => 0.0,
        }
    }

    pub fn file_name(molecules: u32) -> String {
        format!("{FILE_PREFIX}{molecules}{FILE_SUFFIX}")
    }

    /// Writes one tab-separated matrix per molecule count into `dir`, followed by the
    /// parameter manifest.
    pub fn save(&self, dir: &Path, observer: &impl TurboBuildObserver) -> Result<(), TurboError> {
        fs::create_dir_all(dir)?;
        for existing in [dir.join(Self::file_name(1)), dir.join(MANIFEST_FILE)] {
            if existing.exists() {
                return Err(TurboError::AlreadyExists(existing));
            }
        }

        observer.on_stage_start(TurboBuildStage::Persistence, self.tables.len());
        let mut buffer = ryu::Buffer::new();
        let mut record: Vec<String> = Vec::with_capacity(REFERENCE_BINS);
        for (index, table) in self.tables.iter().enumerate() {
            let molecules = index as u32 + 1;
            let path = dir.join(Self::file_name(molecules));
            let mut writer = csv::WriterBuilder::new()
                .delimiter(b'\t')
                .has_headers(false)
                .from_path(&path)?;
            for row in table.rows() {
                record.clear();
                record.extend(row.iter().map(|&value| buffer.format(value).to_owned()));
                writer.write_record(&record)?;
            }
            writer.flush()?;
            observer.on_table_finished(TurboBuildStage::Persistence, molecules);
        }
        let manifest = Manifest {
            capture_efficiency: self.params.capture_efficiency(),
            min_probability: self.params.min_probability(),
            max_molecules: self.max_molecules(),
        };
        fs::write(dir.join(MANIFEST_FILE), toml::to_string_pretty(&manifest)?)?;
        observer.on_stage_finish(TurboBuildStage::Persistence);
        log::info!(
            "Saved {} turbo tables to {}",
            self.tables.len(),
            dir.display()
        );
        Ok(())
    }

    /// Reads consecutive tables starting at one molecule until the first missing file.
    ///
    /// The manifest must be present and must agree with the number of tables found.
    pub fn load(dir: &Path) -> Result<Self, TurboError> {
        let manifest_path = dir.join(MANIFEST_FILE);
        let manifest = match fs::read_to_string(&manifest_path) {
            Ok(text) => Some(toml::from_str::<Manifest>(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        let mut tables = Vec::new();
        loop {
            let molecules = tables.len() as u32 + 1;
            let path = dir.join(Self::file_name(molecules));
            if !path.is_file() {
                break;
            }
            let table = read_table(&path)?;
            validate_table(molecules, &table)?;
            tables.push(table);
        }
        if tables.is_empty() {
            return Err(TurboError::NotFound(dir.to_path_buf()));
        }
        let manifest = manifest.ok_or_else(|| TurboError::MissingManifest(dir.to_path_buf()))?;
        let found = tables.len() as u32;
        if manifest.max_molecules != found {
            return Err(TurboError::CountMismatch {
                declared: manifest.max_molecules,
                found,
            });
        }
        let params = ModelParameters::new(manifest.capture_efficiency, manifest.min_probability)?;
        log::info!(
            "Loaded {found} turbo tables from {} (capture efficiency {}, floor {})",
            dir.display(),
            params.capture_efficiency(),
            params.min_probability()
        );
        Ok(Self { params, tables })
    }
}

fn evaluate_table(params: &ModelParameters, molecules: u32) -> Array2<f64> {
    let floor = params.min_probability();
    Array2::from_shape_fn((OBSERVED_BINS, REFERENCE_BINS), |(row, col)| {
        let observed = row as f64 / 100.0;
        let reference = (col + 1) as f64 / 100.0;
        let probability =
            probability_observed_ratio(observed, reference, params.capture_efficiency(), molecules);
        if probability.is_finite() {
            probability.max(floor)
        } else {
            floor
        }
    })
}

fn validate_table(molecules: u32, table: &Array2<f64>) -> Result<(), TurboError> {
    if table.dim() != (OBSERVED_BINS, REFERENCE_BINS) {
        return Err(TurboError::Shape {
            molecules,
            rows: table.nrows(),
            cols: table.ncols(),
            expected_rows: OBSERVED_BINS,
            expected_cols: REFERENCE_BINS,
        });
    }
    if let Some(((row, col), &value)) = table
        .indexed_iter()
        .find(|(_, value)| !(value.is_finite() && **value > 0.0))
    {
        return Err(TurboError::NonPositive {
            molecules,
            row,
            col,
            value,
        });
    }
    Ok(())
}

fn read_table(path: &Path) -> Result<Array2<f64>, TurboError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .flexible(true)
        .from_path(path)?;

    let mut values = Vec::with_capacity(OBSERVED_BINS * REFERENCE_BINS);
    let mut rows = 0;
    let mut cols = 0;
    for result in reader.records() {
        let record = result?;
        if rows == 0 {
            cols = record.len();
        } else if record.len() != cols {
            return Err(TurboError::Shape {
                molecules: molecules_from_path(path),
                rows: rows + 1,
                cols: record.len(),
                expected_rows: OBSERVED_BINS,
                expected_cols: REFERENCE_BINS,
            });
        }
        for field in record.iter() {
            let value = field.trim().parse::<f64>().map_err(|_| TurboError::Number {
                path: path.to_path_buf(),
                line: rows + 1,
                value: field.to_string(),
            })?;
            values.push(value);
        }
        rows += 1;
    }

    Array2::from_shape_vec((rows, cols), values).map_err(|_| TurboError::Shape {
        molecules: molecules_from_path(path),
        rows,
        cols,
        expected_rows: OBSERVED_BINS,
        expected_cols: REFERENCE_BINS,
    })
}

fn molecules_from_path(path: &Path) -> u32 {
    path.file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| name.strip_prefix(FILE_PREFIX))
        .and_then(|name| name.strip_suffix(FILE_SUFFIX))
        .and_then(|count| count.parse().ok())
        .unwrap_or(0)
}
