use approx::assert_abs_diff_eq;
use ndarray::Array1;
use psix::progress::NoopTurboProgress;
use psix::turbo::MANIFEST_FILE;
use psix::{
    ExonColumn, ExonScorer, ModelParameters, NeighborGraph, ScoreError, ScoringConfig, TurboError,
    TurboTable,
};
use tempfile::tempdir;

fn clustered_exon() -> (NeighborGraph, Array1<f64>, Array1<f64>) {
    let rows: Vec<Vec<(usize, f64)>> = (0..40)
        .map(|cell| {
            let base = if cell < 20 { 0 } else { 20 };
            let mut row = vec![(cell, 0.0)];
            row.extend((1..=4).map(|step| (base + (cell - base + step) % 20, 1.0)));
            row
        })
        .collect();
    let graph = NeighborGraph::from_rows(&rows).unwrap();
    let observed = Array1::from_shape_fn(40, |cell| {
        let offset = 0.01 * (cell % 5) as f64;
        if cell < 20 { 0.1 + offset } else { 0.85 + offset }
    });
    let molecules = Array1::from_shape_fn(40, |cell| 2.0 + (cell % 4) as f64);
    (graph, observed, molecules)
}

#[test]
fn turbo_scores_track_the_direct_model() {
    let (graph, observed, molecules) = clustered_exon();
    let column = ExonColumn::new(observed.view(), molecules.view()).unwrap();
    let turbo = TurboTable::build(&ModelParameters::default(), 5, &NoopTurboProgress).unwrap();

    let config = ScoringConfig::default();
    let direct = ExonScorer::new(&graph, &config, None)
        .unwrap()
        .score(&column)
        .unwrap();
    let fast = ExonScorer::new(&graph, &config, Some(&turbo))
        .unwrap()
        .score(&column)
        .unwrap();

    assert_abs_diff_eq!(direct.value().unwrap(), fast.value().unwrap(), epsilon = 1e-2);
}

#[test]
fn molecules_beyond_the_table_use_the_largest_count() {
    let (graph, observed, molecules) = clustered_exon();
    let column = ExonColumn::new(observed.view(), molecules.view()).unwrap();
    let small = TurboTable::build(&ModelParameters::default(), 3, &NoopTurboProgress).unwrap();
    let capped_molecules = molecules.mapv(|m| m.min(3.0));
    let capped_column = ExonColumn::new(observed.view(), capped_molecules.view()).unwrap();

    let scorer = ExonScorer::new(&graph, &ScoringConfig::default(), Some(&small)).unwrap();
    assert_eq!(
        scorer.score(&column).unwrap(),
        scorer.score(&capped_column).unwrap()
    );
}

#[test]
fn saved_tables_score_like_freshly_built_ones() {
    let (graph, observed, molecules) = clustered_exon();
    let column = ExonColumn::new(observed.view(), molecules.view()).unwrap();
    let built = TurboTable::build(&ModelParameters::default(), 5, &NoopTurboProgress).unwrap();

    let dir = tempdir().unwrap();
    built.save(dir.path(), &NoopTurboProgress).unwrap();
    let loaded = TurboTable::load(dir.path()).unwrap();
    assert_eq!(loaded.max_molecules(), 5);

    let config = ScoringConfig::default();
    let from_built = ExonScorer::new(&graph, &config, Some(&built))
        .unwrap()
        .score(&column)
        .unwrap();
    let from_loaded = ExonScorer::new(&graph, &config, Some(&loaded))
        .unwrap()
        .score(&column)
        .unwrap();
    assert_eq!(from_built, from_loaded);
}

#[test]
fn loaded_tables_refuse_a_different_efficiency() {
    let (graph, _, _) = clustered_exon();
    let params = ModelParameters::new(0.2, 0.01).unwrap();
    let built = TurboTable::build(&params, 3, &NoopTurboProgress).unwrap();
    let dir = tempdir().unwrap();
    built.save(dir.path(), &NoopTurboProgress).unwrap();
    let loaded = TurboTable::load(dir.path()).unwrap();

    assert!(matches!(
        ExonScorer::new(&graph, &ScoringConfig::default(), Some(&loaded)),
        Err(ScoreError::TurboParameterMismatch { .. })
    ));
    let config = ScoringConfig {
        capture_efficiency: 0.2,
        ..ScoringConfig::default()
    };
    assert!(ExonScorer::new(&graph, &config, Some(&loaded)).is_ok());

    std::fs::remove_file(dir.path().join(MANIFEST_FILE)).unwrap();
    assert!(matches!(
        TurboTable::load(dir.path()),
        Err(TurboError::MissingManifest(_))
    ));
}
