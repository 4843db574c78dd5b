use portfolio_core::risk;
use portfolio_core::Frequency;

// ===========================================================================
// Risk kernel tests: decomposition identities, wealth/drawdown, VaR/CVaR
// ===========================================================================

fn three_asset_cov() -> Vec<Vec<f64>> {
    vec![
        vec![0.0225, 0.0054, 0.0014],
        vec![0.0054, 0.0400, 0.0250],
        vec![0.0014, 0.0250, 0.0625],
    ]
}

// ---------------------------------------------------------------------------
// Decomposition identities hold for arbitrary weight vectors
// ---------------------------------------------------------------------------

#[test]
fn test_decomposition_identities() {
    let cov = three_asset_cov();
    for weights in [
        vec![0.4, 0.35, 0.25],
        vec![1.0, 0.0, 0.0],
        vec![0.1, 0.2, 0.7],
        vec![0.6, -0.1, 0.5],
    ] {
        let stdev = risk::portfolio_volatility(&weights, &cov).unwrap();
        let decomp = risk::risk_decomposition(&weights, &cov).unwrap();

        let crc_sum: f64 = decomp.crc.iter().sum();
        let prc_sum: f64 = decomp.prc.iter().sum();
        assert!(
            (crc_sum - stdev).abs() < 1e-8,
            "sum(CRC) = {crc_sum} != sigma_p = {stdev} for {weights:?}"
        );
        assert!(
            (prc_sum - 1.0).abs() < 1e-8,
            "sum(PRC) = {prc_sum} != 1 for {weights:?}"
        );
    }
}

// ---------------------------------------------------------------------------
// Wealth / drawdown monotonicity properties
// ---------------------------------------------------------------------------

#[test]
fn test_wealth_drawdown_properties() {
    let returns = [0.02, -0.05, 0.01, 0.03, -0.10, 0.04, 0.06];
    let wealth = risk::wealth_index(&returns);
    assert_eq!(wealth.len(), returns.len() + 1);
    assert_eq!(wealth[0], 1.0);

    let dd = risk::drawdown(&wealth);
    assert!(dd.iter().all(|d| *d <= 0.0), "drawdown must be <= 0: {dd:?}");

    let max_dd = risk::max_drawdown(&wealth);
    let min_dd = dd.iter().copied().fold(f64::INFINITY, f64::min);
    assert_eq!(max_dd, min_dd, "max_drawdown must equal min(drawdown)");
}

// ---------------------------------------------------------------------------
// VaR / CVaR ordering at both standard levels
// ---------------------------------------------------------------------------

#[test]
fn test_var_cvar_levels() {
    let returns: Vec<f64> = (0..250)
        .map(|i| 0.0005 * ((i % 21) as f64 - 10.0) - 0.0001 * (i % 7) as f64)
        .collect();

    for alpha in [0.05, 0.01] {
        let var = risk::historical_var(&returns, alpha).unwrap();
        let cvar = risk::cvar(&returns, alpha).unwrap();
        assert!(
            cvar >= var - 1e-12,
            "CVaR {cvar} must dominate VaR {var} at alpha {alpha}"
        );
    }

    let var_1 = risk::historical_var(&returns, 0.01).unwrap();
    let var_5 = risk::historical_var(&returns, 0.05).unwrap();
    assert!(var_1 >= var_5, "deeper tail must not shrink the loss");
}

// ---------------------------------------------------------------------------
// Effective N tracks concentration monotonically
// ---------------------------------------------------------------------------

#[test]
fn test_effective_n_monotone() {
    let diversified = [0.25, 0.25, 0.25, 0.25];
    let tilted = [0.55, 0.25, 0.15, 0.05];
    let concentrated = [0.97, 0.01, 0.01, 0.01];

    let n_div = risk::effective_n(&diversified);
    let n_tilt = risk::effective_n(&tilted);
    let n_conc = risk::effective_n(&concentrated);
    assert!(n_div > n_tilt && n_tilt > n_conc);
    assert!((n_div - 4.0).abs() < 1e-12);
}

// ---------------------------------------------------------------------------
// Performance summary ties the kernel pieces together
// ---------------------------------------------------------------------------

#[test]
fn test_performance_summary_consistency() {
    let returns = [0.012, -0.02, 0.007, 0.015, -0.004, 0.009, -0.013, 0.018];
    let summary = risk::performance_summary(&returns, Frequency::Monthly, 0.02).unwrap();

    let wealth = risk::wealth_index(&returns);
    assert!((summary.total_return - (wealth[wealth.len() - 1] - 1.0)).abs() < 1e-12);
    assert!((summary.max_drawdown - risk::max_drawdown(&wealth)).abs() < 1e-15);
    assert!((summary.var_95 - risk::historical_var(&returns, 0.05).unwrap()).abs() < 1e-15);
    assert!((summary.cvar_95 - risk::cvar(&returns, 0.05).unwrap()).abs() < 1e-15);
    assert!(summary.annualized_vol > 0.0);
}
