use std::collections::BTreeMap;

use portfolio_core::estimation::AssumptionSet;
use portfolio_core::screening::{screen, AssetMetadata, ScreeningInput, SignalWeights};
use portfolio_core::{AssetClass, CovMethod, MuEstimator};

// ===========================================================================
// Screener tests: seed ranking scenario, determinism, normalization
// ===========================================================================

/// Reference {A, B} equal weight; candidate C highly correlated with the
/// reference, candidate D uncorrelated.
fn assumptions() -> AssumptionSet {
    let keys: Vec<String> = ["A", "B", "C", "D"].iter().map(|s| s.to_string()).collect();
    let vol = [0.20, 0.18, 0.21, 0.16];
    let corr = [
        [1.0, 0.55, 0.92, 0.0],
        [0.55, 1.0, 0.88, 0.0],
        [0.92, 0.88, 1.0, 0.0],
        [0.0, 0.0, 0.0, 1.0],
    ];
    let sigma: Vec<Vec<f64>> = (0..4)
        .map(|i| (0..4).map(|j| corr[i][j] * vol[i] * vol[j]).collect())
        .collect();
    AssumptionSet {
        asset_keys: keys,
        mu_annual: vec![0.08, 0.07, 0.09, 0.05],
        sigma_annual: sigma,
        vol_annual: vol.to_vec(),
        correlation: corr.iter().map(|row| row.to_vec()).collect(),
        annualization_factor: 252.0,
        rf_annual: 0.02,
        estimator: MuEstimator::Historical,
        cov_method: CovMethod::Sample,
        psd_repair_applied: false,
        psd_repair_note: None,
    }
}

fn metadata() -> BTreeMap<String, AssetMetadata> {
    let mut map = BTreeMap::new();
    for (key, sector) in [
        ("A", "Information Technology"),
        ("B", "Financials"),
        ("C", "Information Technology"),
        ("D", "Utilities"),
    ] {
        map.insert(
            key.to_string(),
            AssetMetadata {
                asset_class: AssetClass::Equity,
                sector: Some(sector.to_string()),
            },
        );
    }
    map
}

fn base_input() -> ScreeningInput {
    let mut reference_weights = BTreeMap::new();
    reference_weights.insert("A".to_string(), 0.5);
    reference_weights.insert("B".to_string(), 0.5);
    ScreeningInput {
        assumptions: assumptions(),
        reference_weights,
        candidate_keys: vec!["C".into(), "D".into()],
        metadata: metadata(),
        nominal_add_weight: 0.05,
        signal_weights: SignalWeights::default(),
        sector_gap_threshold: None,
        top_k: None,
    }
}

// ---------------------------------------------------------------------------
// Seed scenario: the uncorrelated candidate ranks first
// ---------------------------------------------------------------------------

#[test]
fn test_seed_uncorrelated_ranks_first() {
    let out = screen(&base_input()).unwrap();
    let rows = &out.result;

    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].asset_key, "D");
    assert_eq!(rows[0].rank, 1);
    assert_eq!(rows[0].norm_avg_correlation, 1.0);
    assert_eq!(rows[1].asset_key, "C");
    assert_eq!(rows[1].rank, 2);
    assert_eq!(rows[1].norm_avg_correlation, 0.0);
}

// ---------------------------------------------------------------------------
// Property: byte-identical outputs for identical inputs
// ---------------------------------------------------------------------------

#[test]
fn test_screen_deterministic() {
    let a = serde_json::to_vec(&screen(&base_input()).unwrap().result).unwrap();
    let b = serde_json::to_vec(&screen(&base_input()).unwrap().result).unwrap();
    assert_eq!(a, b);
}

// ---------------------------------------------------------------------------
// Property: normalized signals attain exactly 0 and 1 at the extremes
// ---------------------------------------------------------------------------

#[test]
fn test_normalization_attains_extremes() {
    let mut input = base_input();
    input.candidate_keys = vec!["C".into(), "D".into()];
    let out = screen(&input).unwrap();

    type Pick = fn(&portfolio_core::screening::ScreeningScoreRow) -> f64;
    let picks: [Pick; 3] = [
        |r| r.norm_avg_correlation,
        |r| r.norm_marginal_vol_reduction,
        |r| r.norm_hhi_reduction,
    ];
    for pick in picks {
        let values: Vec<f64> = out.result.iter().map(pick).collect();
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        assert_eq!(min, 0.0, "values: {values:?}");
        assert_eq!(max, 1.0, "values: {values:?}");
    }
}

// ---------------------------------------------------------------------------
// Rank is a dense permutation for larger candidate sets
// ---------------------------------------------------------------------------

#[test]
fn test_rank_dense_permutation() {
    let mut input = base_input();
    input.candidate_keys = vec!["C".into(), "D".into(), "A".into(), "B".into()];
    let out = screen(&input).unwrap();

    let mut ranks: Vec<u32> = out.result.iter().map(|r| r.rank).collect();
    ranks.sort_unstable();
    assert_eq!(ranks, vec![1, 2, 3, 4]);
}

// ---------------------------------------------------------------------------
// Custom lambda weights shift the ranking
// ---------------------------------------------------------------------------

#[test]
fn test_custom_signal_weights() {
    // Weight the sector-gap signal alone: C (sector already held) scores 0,
    // D (new sector) scores 0.5.
    let mut input = base_input();
    input.signal_weights = SignalWeights {
        correlation: 0.0,
        marginal_vol: 0.0,
        sector_gap: 1.0,
        hhi: 0.0,
    };
    let out = screen(&input).unwrap();
    let d = out.result.iter().find(|r| r.asset_key == "D").unwrap();
    let c = out.result.iter().find(|r| r.asset_key == "C").unwrap();
    assert_eq!(d.rank, 1);
    assert!((d.composite_score - 0.5).abs() < 1e-12);
    assert!((c.composite_score - 0.0).abs() < 1e-12);
}

// ---------------------------------------------------------------------------
// Explanation quotes the volatility change with concrete numbers
// ---------------------------------------------------------------------------

#[test]
fn test_explanation_concrete_numbers() {
    let out = screen(&base_input()).unwrap();
    let top = &out.result[0];
    let explanation = top.explanation.as_ref().unwrap();
    assert!(explanation.contains("Rank 1"));
    assert!(explanation.contains("5.0% nominal weight"));
    assert!(explanation.contains("annualised"));
    assert!(explanation.contains("HHI changes from"));
}
