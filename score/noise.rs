//! Capture-noise model for observed splicing ratios.
//!
//! A cell holds some number of transcripts for an exon, split between the included
//! and excluded isoform according to the true splicing ratio `t`. Each transcript is
//! captured independently with probability `c` (the capture efficiency), and we see
//! `r` of them with an observed ratio `o`. This module gives
//! `P(o | t, c, r)`.
//!
//! # Regimes
//!
//! The naive estimate of the cell's molecule count is `M = r / c`. When `M` molecules
//! split at `t` could have produced the observed split (`M·t ≥ r·o` and
//! `M·(1−t) ≥ r·(1−o)`), the count is treated as known and the probability is the
//! hypergeometric ratio
//!
//! `C(M·t, r·o) · C(M·(1−t), r·(1−o)) / C(M, r)`.
//!
//! Otherwise the count is treated as unknown and marginalised over a geometric-style
//! prior on `m ∈ [r, ⌊10·r/c⌋)`:
//!
//! `Σ_m C(m·t, r·o) · C(m·(1−t), r·(1−o)) · c^(r+1) · (1−c)^(m−r)`.
//!
//! Binomial coefficients use the log-gamma extension to real arguments and vanish
//! outside `0 ≤ k ≤ n`. All terms are accumulated in log space before exponentiating,
//! so large molecule counts do not overflow.

use statrs::function::gamma::ln_gamma;

/// The unknown-molecule sum runs up to this multiple of `r / c`.
const MOLECULE_SEARCH_FACTOR: f64 = 10.0;

/// Relative slack on support and regime comparisons. Products such as `m·(1−t)` land
/// a few ulp away from the integer they represent, and an exact comparison would drop
/// or keep whole terms depending on which isoform is labelled first.
const SUPPORT_TOLERANCE: f64 = 1e-9;

/// The unknown-molecule sum stops once a decreasing term falls below this fraction of
/// the running total (scaled by `c`, which bounds the geometric tail).
const NEGLIGIBLE_TERM: f64 = 1e-16;

#[inline]
fn slack(a: f64, b: f64) -> f64 {
    SUPPORT_TOLERANCE * a.abs().max(b.abs()).max(1.0)
}

/// `needed` exceeds `available` by more than rounding noise.
#[inline]
fn falls_short(available: f64, needed: f64) -> bool {
    needed - available > slack(available, needed)
}

/// Which of the two probability formulas produced a value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MoleculeRegime {
    /// `r / c` molecules can explain the observed split.
    Known,
    /// The split needs a different molecule count; the count is summed out.
    Unknown,
}

/// A model evaluation tagged with the regime that produced it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NoiseProbability {
    pub regime: MoleculeRegime,
    pub probability: f64,
}

/// Natural log of the generalised binomial coefficient `C(n, k)`.
///
/// Returns `-inf` outside the support `0 ≤ k ≤ n` and `NaN` if either argument is
/// `NaN`, so an undefined ratio propagates instead of reading as zero probability.
/// Arguments within a relative `1e-9` of the support edge count as on it.
#[inline]
pub fn ln_choose(n: f64, k: f64) -> f64 {
    if n.is_nan() || k.is_nan() {
        return f64::NAN;
    }
    if falls_short(0.0, -k) || falls_short(n, k) {
        return f64::NEG_INFINITY;
    }
    let k = k.max(0.0);
    let rest = (n - k).max(0.0);
    ln_gamma(n + 1.0) - ln_gamma(k + 1.0) - ln_gamma(rest + 1.0)
}

/// `exponent · ln(base)` with `0^0 = 1`.
#[inline]
fn ln_power(base: f64, exponent: u64) -> f64 {
    if exponent == 0 {
        0.0
    } else {
        exponent as f64 * base.ln()
    }
}

/// Decides whether the naive molecule count `r / c` can explain the observed split.
#[inline]
pub fn molecule_regime(
    observed: f64,
    true_ratio: f64,
    capture_efficiency: f64,
    captured_molecules: u32,
) -> MoleculeRegime {
    let captured = f64::from(captured_molecules);
    let cell_molecules = captured / capture_efficiency;
    if falls_short(cell_molecules * true_ratio, captured * observed)
        || falls_short(cell_molecules * (1.0 - true_ratio), captured * (1.0 - observed))
    {
        MoleculeRegime::Unknown
    } else {
        MoleculeRegime::Known
    }
}

/// Evaluates `P(observed | true_ratio, capture_efficiency, captured_molecules)`.
///
/// The caller is responsible for `capture_efficiency ∈ (0, 1]`; use
/// [`crate::config::ModelParameters`] to guarantee it. The result lies in `[0, 1]`
/// unless an input is `NaN`, in which case the probability is `NaN`.
pub fn evaluate(
    observed: f64,
    true_ratio: f64,
    capture_efficiency: f64,
    captured_molecules: u32,
) -> NoiseProbability {
    let regime = molecule_regime(observed, true_ratio, capture_efficiency, captured_molecules);
    let probability = match regime {
        MoleculeRegime::Unknown => {
            unknown_molecule_probability(observed, true_ratio, capture_efficiency, captured_molecules)
        }
        MoleculeRegime::Known => {
            known_molecule_probability(observed, true_ratio, capture_efficiency, captured_molecules)
        }
    };
    // The real-valued extension can drift a hair above one; NaN must pass through.
    let probability = if probability > 1.0 { 1.0 } else { probability };
    NoiseProbability {
        regime,
        probability,
    }
}

/// Shorthand for [`evaluate`] when the regime is not needed.
#[inline]
pub fn probability_observed_ratio(
    observed: f64,
    true_ratio: f64,
    capture_efficiency: f64,
    captured_molecules: u32,
) -> f64 {
    evaluate(observed, true_ratio, capture_efficiency, captured_molecules).probability
}

fn known_molecule_probability(
    observed: f64,
    true_ratio: f64,
    capture_efficiency: f64,
    captured_molecules: u32,
) -> f64 {
    let captured = f64::from(captured_molecules);
    let cell_molecules = captured / capture_efficiency;
    let ln_probability = ln_choose(cell_molecules * true_ratio, captured * observed)
        + ln_choose(cell_molecules * (1.0 - true_ratio), captured * (1.0 - observed))
        - ln_choose(cell_molecules, captured);
    ln_probability.exp()
}

fn unknown_molecule_probability(
    observed: f64,
    true_ratio: f64,
    capture_efficiency: f64,
    captured_molecules: u32,
) -> f64 {
    let captured = f64::from(captured_molecules);
    let first = u64::from(captured_molecules);
    // Truncation, not rounding: the upper end of the range is exclusive.
    let last = (MOLECULE_SEARCH_FACTOR * captured / capture_efficiency) as u64;

    let included = captured * observed;
    let excluded = captured * (1.0 - observed);
    let ln_captured = (captured + 1.0) * capture_efficiency.ln();
    let miss = 1.0 - capture_efficiency;

    let ln_negligible = NEGLIGIBLE_TERM.ln() + capture_efficiency.ln();

    let mut total: f64 = 0.0;
    let mut previous = f64::NEG_INFINITY;
    for m in first..last {
        let molecules = m as f64;
        let ln_term = ln_choose(molecules * true_ratio, included)
            + ln_choose(molecules * (1.0 - true_ratio), excluded)
            + ln_captured
            + ln_power(miss, m - first);
        // Past the mode the terms only shrink; once they are lost in rounding, stop.
        if total > 0.0 && ln_term < previous && ln_term < total.ln() + ln_negligible {
            break;
        }
        total += ln_term.exp();
        previous = ln_term;
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    #[test]
    fn ln_choose_matches_integer_binomials() {
        assert_relative_eq!(ln_choose(10.0, 3.0).exp(), 120.0, max_relative = 1e-10);
        assert_relative_eq!(ln_choose(20.0, 2.0).exp(), 190.0, max_relative = 1e-10);
        assert_abs_diff_eq!(ln_choose(5.0, 0.0), 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(ln_choose(0.0, 0.0), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn ln_choose_interpolates_between_integers() {
        // C(4, 1.6) is Γ(5) over the product Γ(2.6)·Γ(3.4)
        let expected = 24.0 / (1.429_624_558_860_304_5 * 2.981_206_426_810_332_7);
        assert_relative_eq!(ln_choose(4.0, 1.6).exp(), expected, max_relative = 1e-8);
    }

    #[test]
    fn ln_choose_vanishes_outside_support() {
        assert_eq!(ln_choose(2.0, 3.0), f64::NEG_INFINITY);
        assert_eq!(ln_choose(2.0, -0.5), f64::NEG_INFINITY);
        assert!(ln_choose(f64::NAN, 1.0).is_nan());
        assert!(ln_choose(3.0, f64::NAN).is_nan());
    }

    #[test]
    fn known_regime_reduces_to_hypergeometric() {
        // r = 1, c = 0.1 gives M = 10 molecules, three of them included.
        let result = evaluate(1.0, 0.3, 0.1, 1);
        assert_eq!(result.regime, MoleculeRegime::Known);
        assert_relative_eq!(result.probability, 0.3, max_relative = 1e-9);

        let result = evaluate(0.0, 0.3, 0.1, 1);
        assert_eq!(result.regime, MoleculeRegime::Known);
        assert_relative_eq!(result.probability, 0.7, max_relative = 1e-9);
    }

    #[test]
    fn known_regime_sums_to_one_over_observable_ratios() {
        // M = 8 molecules split 4/4, four of them captured.
        let total: f64 = (0..=4)
            .map(|k| {
                let observed = k as f64 / 4.0;
                let result = evaluate(observed, 0.5, 0.5, 4);
                assert_eq!(result.regime, MoleculeRegime::Known);
                result.probability
            })
            .sum();
        assert_relative_eq!(total, 1.0, max_relative = 1e-9);
    }

    #[test]
    fn unknown_regime_is_selected_when_split_is_unreachable() {
        // M = 30, but only 1.5 included molecules could explain three included reads.
        let result = evaluate(1.0, 0.05, 0.1, 3);
        assert_eq!(result.regime, MoleculeRegime::Unknown);
        assert!(result.probability > 0.0);
        assert!(result.probability < 1.0);
    }

    #[test]
    fn unknown_regime_favours_nearby_true_ratios() {
        let near = probability_observed_ratio(1.0, 0.09, 0.1, 3);
        let far = probability_observed_ratio(1.0, 0.02, 0.1, 3);
        assert_eq!(molecule_regime(1.0, 0.02, 0.1, 3), MoleculeRegime::Unknown);
        assert!(near > far, "expected {near} > {far}");
    }

    #[test]
    fn model_is_symmetric_in_isoform_labels() {
        for &efficiency in &[0.05, 0.1, 0.3, 1.0] {
            for captured in (1_u32..=13).chain([20, 30]) {
                for &observed in &[0.0, 0.25, 0.5, 0.8, 1.0] {
                    for &true_ratio in &[0.01, 0.1, 0.12, 0.33, 0.5, 0.72, 0.9, 0.99] {
                        let direct = evaluate(observed, true_ratio, efficiency, captured);
                        let mirrored =
                            evaluate(1.0 - observed, 1.0 - true_ratio, efficiency, captured);
                        assert_eq!(
                            direct.regime, mirrored.regime,
                            "regime flips for o = {observed}, t = {true_ratio}, c = {efficiency}, r = {captured}"
                        );
                        assert_relative_eq!(
                            direct.probability,
                            mirrored.probability,
                            epsilon = 1e-12,
                            max_relative = 1e-8
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn one_of_each_isoform_matches_its_mirror() {
        // r = 2, c = 0.3: the m = 10 term sits exactly on the support edge.
        let included = evaluate(0.5, 0.1, 0.3, 2);
        let excluded = evaluate(0.5, 0.9, 0.3, 2);
        assert_eq!(included.regime, MoleculeRegime::Unknown);
        assert_relative_eq!(included.probability, 0.074_659_933_129_876, max_relative = 1e-8);
        assert_relative_eq!(excluded.probability, included.probability, max_relative = 1e-10);
    }

    #[test]
    fn ln_choose_tolerates_rounding_at_the_support_edge() {
        let n = 10.0 * (1.0 - 0.9);
        assert!(n < 1.0);
        assert_abs_diff_eq!(ln_choose(n, 1.0), 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(ln_choose(1.0, -1e-15), 0.0, epsilon = 1e-12);
        assert_eq!(ln_choose(1.0, 1.001), f64::NEG_INFINITY);
    }

    #[test]
    fn truncated_tail_matches_the_exhaustive_sum() {
        for &(observed, true_ratio, efficiency, captured) in &[
            (1.0, 0.05, 0.1, 3_u32),
            (0.5, 0.1, 0.3, 2),
            // Stops after roughly 1300 of 2970 terms.
            (1.0, 0.05, 0.1, 30),
            (1.0, 0.0002, 1e-3, 2),
        ] {
            assert_eq!(
                molecule_regime(observed, true_ratio, efficiency, captured),
                MoleculeRegime::Unknown
            );
            let r = f64::from(captured);
            let last = (MOLECULE_SEARCH_FACTOR * r / efficiency) as u64;
            let exhaustive: f64 = (u64::from(captured)..last)
                .map(|m| {
                    let molecules = m as f64;
                    (ln_choose(molecules * true_ratio, r * observed)
                        + ln_choose(molecules * (1.0 - true_ratio), r * (1.0 - observed))
                        + (r + 1.0) * efficiency.ln()
                        + ln_power(1.0 - efficiency, m - u64::from(captured)))
                    .exp()
                })
                .sum();
            let truncated = unknown_molecule_probability(observed, true_ratio, efficiency, captured);
            assert_relative_eq!(truncated, exhaustive, max_relative = 1e-12);
        }
    }

    #[test]
    fn zero_captured_molecules_is_certain() {
        let result = evaluate(0.4, 0.9, 0.1, 0);
        assert_eq!(result.regime, MoleculeRegime::Known);
        assert_abs_diff_eq!(result.probability, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn full_capture_efficiency_stays_finite() {
        let p = probability_observed_ratio(0.5, 0.3, 1.0, 2);
        assert!(p.is_finite());
        assert!((0.0..=1.0).contains(&p));
        let exact = probability_observed_ratio(0.5, 0.5, 1.0, 2);
        assert_abs_diff_eq!(exact, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn undefined_true_ratio_propagates() {
        assert!(probability_observed_ratio(0.5, f64::NAN, 0.1, 4).is_nan());
    }

    #[test]
    fn probabilities_stay_in_unit_interval() {
        for &captured in &[1_u32, 4, 12, 40] {
            for i in 0..=20 {
                for j in 1..20 {
                    let p = probability_observed_ratio(i as f64 / 20.0, j as f64 / 20.0, 0.1, captured);
                    assert!((0.0..=1.0).contains(&p), "p = {p} for r = {captured}");
                }
            }
        }
    }
}
