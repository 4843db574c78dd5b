use chrono::NaiveDate;
use portfolio_core::estimation::{compute_returns, estimate, EstimateInput, ReturnPanel};
use portfolio_core::{CovMethod, Frequency, MuEstimator, PricePanel, ReturnKind};

// ===========================================================================
// Estimator tests: annualization, PSD pipeline, correlation identities
// ===========================================================================

fn date(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
}

fn panel(asset_keys: Vec<&str>, returns: Vec<Vec<f64>>) -> ReturnPanel {
    ReturnPanel {
        asset_keys: asset_keys.into_iter().map(String::from).collect(),
        dates: (1..=returns.len() as u32).map(date).collect(),
        returns,
        frequency: Frequency::Daily,
        return_kind: ReturnKind::Simple,
    }
}

fn input(panel: ReturnPanel) -> EstimateInput {
    EstimateInput {
        panel,
        rf_annual: 0.02,
        estimator: MuEstimator::Historical,
        cov_method: CovMethod::Sample,
        ewma_halflife: None,
        shrinkage_alpha: None,
    }
}

// ---------------------------------------------------------------------------
// Seed scenario: two assets, daily simple returns
// ---------------------------------------------------------------------------

#[test]
fn test_seed_two_asset_daily() {
    let out = estimate(&input(panel(
        vec!["A", "B"],
        vec![
            vec![0.01, -0.005],
            vec![-0.02, 0.01],
            vec![0.015, 0.02],
        ],
    )))
    .unwrap();
    let set = &out.result;

    assert!(set.mu_annual.iter().all(|mu| mu.is_finite()));
    assert!(!set.psd_repair_applied);
    assert!(set.psd_repair_note.is_none());

    // Symmetry and positive-definiteness of the 2x2 case
    assert_eq!(set.sigma_annual[0][1], set.sigma_annual[1][0]);
    let det = set.sigma_annual[0][0] * set.sigma_annual[1][1]
        - set.sigma_annual[0][1] * set.sigma_annual[1][0];
    assert!(det > 0.0, "lambda_min must be positive, det = {det}");
    assert!(set.vol_annual.iter().all(|v| *v > 0.0));
}

// ---------------------------------------------------------------------------
// Property: correlation bounds and exact diagonal
// ---------------------------------------------------------------------------

#[test]
fn test_correlation_bounds() {
    let out = estimate(&input(panel(
        vec!["A", "B", "C"],
        vec![
            vec![0.011, -0.004, 0.002],
            vec![-0.018, 0.012, -0.001],
            vec![0.013, 0.017, 0.009],
            vec![0.002, -0.008, -0.013],
            vec![-0.007, 0.003, 0.011],
        ],
    )))
    .unwrap();
    let rho = &out.result.correlation;

    for i in 0..3 {
        assert_eq!(rho[i][i], 1.0, "diag(rho) must be exactly 1");
        for j in 0..3 {
            assert!(rho[i][j].abs() <= 1.0, "rho[{i}][{j}] = {}", rho[i][j]);
            assert_eq!(rho[i][j], rho[j][i], "rho must be symmetric");
        }
    }
}

// ---------------------------------------------------------------------------
// Round-trip law: sigma (x) sigma elementwise rho reconstructs Sigma
// ---------------------------------------------------------------------------

#[test]
fn test_sigma_roundtrip() {
    let out = estimate(&input(panel(
        vec!["A", "B", "C"],
        vec![
            vec![0.004, -0.002, 0.0065],
            vec![-0.011, 0.009, -0.0025],
            vec![0.0155, 0.0125, 0.008],
            vec![-0.003, 0.001, -0.0095],
        ],
    )))
    .unwrap();
    let set = &out.result;

    for i in 0..3 {
        for j in 0..3 {
            let reconstructed = set.vol_annual[i] * set.vol_annual[j] * set.correlation[i][j];
            assert!(
                (reconstructed - set.sigma_annual[i][j]).abs() < 1e-12,
                "reconstruction off at [{i}][{j}]: {} vs {}",
                reconstructed,
                set.sigma_annual[i][j]
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Annualization factors per frequency
// ---------------------------------------------------------------------------

#[test]
fn test_annualization_factor_by_frequency() {
    for (frequency, factor) in [
        (Frequency::Daily, 252.0),
        (Frequency::Weekly, 52.0),
        (Frequency::Monthly, 12.0),
    ] {
        let mut p = panel(
            vec!["A", "B"],
            vec![vec![0.01, -0.005], vec![-0.02, 0.01], vec![0.015, 0.02]],
        );
        p.frequency = frequency;
        let out = estimate(&input(p)).unwrap();
        let set = &out.result;
        assert_eq!(set.annualization_factor, factor);

        let mean = (0.01 - 0.02 + 0.015) / 3.0;
        assert!(
            (set.mu_annual[0] - mean * factor).abs() < 1e-12,
            "mu mismatch at factor {factor}"
        );
    }
}

// ---------------------------------------------------------------------------
// Price panel to return panel chaining into the estimator
// ---------------------------------------------------------------------------

#[test]
fn test_prices_to_assumptions_chain() {
    let prices = PricePanel {
        asset_keys: vec!["A".into(), "B".into()],
        dates: (1..=6).map(date).collect(),
        prices: vec![
            vec![100.0, 50.0],
            vec![101.0, 49.5],
            vec![99.5, 50.2],
            vec![100.8, 50.9],
            vec![102.0, 50.1],
            vec![101.1, 50.6],
        ],
    };
    let returns = compute_returns(&prices, Frequency::Daily, ReturnKind::Simple).unwrap();
    assert_eq!(returns.n_observations(), 5);

    let out = estimate(&input(returns)).unwrap();
    assert!(!out.result.psd_repair_applied);
    assert!(out.result.vol_annual.iter().all(|v| *v > 0.0));
}

// ---------------------------------------------------------------------------
// Estimator variants agree on shape and disagree on values
// ---------------------------------------------------------------------------

#[test]
fn test_estimator_variants() {
    let base = panel(
        vec!["A", "B"],
        vec![
            vec![0.01, -0.005],
            vec![-0.02, 0.01],
            vec![0.015, 0.02],
            vec![0.004, -0.012],
            vec![-0.006, 0.008],
        ],
    );

    let historical = estimate(&input(base.clone())).unwrap().result;

    let mut shrunk_input = input(base.clone());
    shrunk_input.estimator = MuEstimator::Shrinkage;
    shrunk_input.shrinkage_alpha = Some(0.5);
    let shrunk = estimate(&shrunk_input).unwrap().result;

    // Shrinkage narrows the cross-sectional spread of mu
    let spread_hist = (historical.mu_annual[0] - historical.mu_annual[1]).abs();
    let spread_shrunk = (shrunk.mu_annual[0] - shrunk.mu_annual[1]).abs();
    assert!(
        spread_shrunk < spread_hist,
        "shrinkage must narrow the mu spread: {spread_shrunk} vs {spread_hist}"
    );

    // Ledoit-Wolf pulls off-diagonals toward zero relative to sample
    let mut lw_input = input(base);
    lw_input.cov_method = CovMethod::LedoitWolf;
    let lw = estimate(&lw_input).unwrap().result;
    assert!(
        lw.sigma_annual[0][1].abs() <= historical.sigma_annual[0][1].abs() + 1e-12,
        "LW off-diagonal {} vs sample {}",
        lw.sigma_annual[0][1],
        historical.sigma_annual[0][1]
    );
}
