use std::time::Instant;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::PortfolioError;
use crate::types::{with_metadata, ComputationOutput, PricePanel};
use crate::PortfolioResult;

/// Default breach threshold: 5 percentage points.
const DEFAULT_THRESHOLD: f64 = 0.05;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Input to a drift check against the target weights of an optimization run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftCheckInput {
    /// Opaque reference to the optimization run that set the targets.
    pub run_key: String,
    /// Target asset keys, aligned with `target_weights`.
    pub asset_keys: Vec<String>,
    pub target_weights: Vec<f64>,
    /// Price panel spanning at least [rebalance_date, check_date].
    pub prices: PricePanel,
    pub rebalance_date: NaiveDate,
    pub check_date: NaiveDate,
    /// Breach threshold theta in (0, 1); defaults to 0.05.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
}

/// Per-asset drift measurement.
///
/// current_weight is implied by price appreciation since the rebalance date;
/// explanation is present exactly when the position breaches the threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftPosition {
    pub asset_key: String,
    pub target_weight: f64,
    pub current_weight: f64,
    pub drift_abs: f64,
    pub breached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

/// A dated drift check; any_breach is true when at least one position's
/// drift exceeds the threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftReport {
    pub run_key: String,
    pub check_date: NaiveDate,
    pub threshold: f64,
    pub any_breach: bool,
    pub positions: Vec<DriftPosition>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Compute implied current weights via wealth-growth renormalization and
/// flag positions that drifted beyond the threshold.
///
/// Growth always compounds simple returns (g_i = P_i(t1) / P_i(t0)),
/// independent of the return kind used during estimation.
pub fn check_drift(input: &DriftCheckInput) -> PortfolioResult<ComputationOutput<DriftReport>> {
    let start = Instant::now();
    let warnings: Vec<String> = Vec::new();

    let threshold = input.threshold.unwrap_or(DEFAULT_THRESHOLD);
    validate_input(input, threshold)?;

    let t0 = input.prices.date_index(input.rebalance_date).ok_or_else(|| {
        PortfolioError::InvalidInput {
            field: "rebalance_date".into(),
            reason: format!(
                "Price panel has no observation on {}",
                input.rebalance_date
            ),
        }
    })?;
    let t1 = input.prices.date_index(input.check_date).ok_or_else(|| {
        PortfolioError::InvalidInput {
            field: "check_date".into(),
            reason: format!("Price panel has no observation on {}", input.check_date),
        }
    })?;

    // --- Cumulative growth per target asset ---
    let n = input.asset_keys.len();
    let mut growth = Vec::with_capacity(n);
    for key in &input.asset_keys {
        let p0 = price_at(&input.prices, key, t0, input.rebalance_date)?;
        let p1 = price_at(&input.prices, key, t1, input.check_date)?;
        growth.push(p1 / p0);
    }

    // --- Implied current weights ---
    let denominator: f64 = input
        .target_weights
        .iter()
        .zip(growth.iter())
        .map(|(w, g)| w * g)
        .sum();
    if denominator <= 0.0 {
        return Err(PortfolioError::Numerical(format!(
            "Aggregate portfolio growth is non-positive ({denominator:.6e})"
        )));
    }

    let mut positions = Vec::with_capacity(n);
    let mut any_breach = false;
    for i in 0..n {
        let target = input.target_weights[i];
        let current = target * growth[i] / denominator;
        let drift_abs = (current - target).abs();
        let breached = drift_abs > threshold;
        any_breach |= breached;

        let explanation = breached.then(|| {
            let direction = if current >= target {
                "appreciation"
            } else {
                "depreciation"
            };
            format!(
                "{} has drifted from {:.1}% to {:.1}% ({:+.1} pp) due to price \
                 {} since last rebalance.",
                input.asset_keys[i],
                target * 100.0,
                current * 100.0,
                (current - target) * 100.0,
                direction,
            )
        });

        positions.push(DriftPosition {
            asset_key: input.asset_keys[i].clone(),
            target_weight: target,
            current_weight: current,
            drift_abs,
            breached,
            explanation,
        });
    }

    let report = DriftReport {
        run_key: input.run_key.clone(),
        check_date: input.check_date,
        threshold,
        any_breach,
        positions,
    };

    let elapsed = start.elapsed().as_micros() as u64;
    Ok(with_metadata(
        "Portfolio Drift Check",
        &serde_json::json!({
            "run_key": input.run_key,
            "n_assets": n,
            "rebalance_date": input.rebalance_date,
            "check_date": input.check_date,
            "threshold": threshold,
        }),
        warnings,
        elapsed,
        report,
    ))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn price_at(
    panel: &PricePanel,
    asset_key: &str,
    row: usize,
    date: NaiveDate,
) -> PortfolioResult<f64> {
    let column = panel
        .asset_keys
        .iter()
        .position(|k| k == asset_key)
        .ok_or_else(|| PortfolioError::MissingPrice {
            asset: asset_key.to_string(),
            date,
        })?;
    let price = panel.prices[row][column];
    if !price.is_finite() {
        return Err(PortfolioError::MissingPrice {
            asset: asset_key.to_string(),
            date,
        });
    }
    if price <= 0.0 {
        return Err(PortfolioError::NonPositivePrice {
            asset: asset_key.to_string(),
            date,
            price,
        });
    }
    Ok(price)
}

fn validate_input(input: &DriftCheckInput, threshold: f64) -> PortfolioResult<()> {
    let n = input.asset_keys.len();
    if n == 0 {
        return Err(PortfolioError::InvalidInput {
            field: "asset_keys".into(),
            reason: "At least one target asset required".into(),
        });
    }
    if input.target_weights.len() != n {
        return Err(PortfolioError::InvalidInput {
            field: "target_weights".into(),
            reason: format!(
                "Expected {} weights to match the asset keys but got {}",
                n,
                input.target_weights.len()
            ),
        });
    }
    let mut total = 0.0;
    for (key, weight) in input.asset_keys.iter().zip(input.target_weights.iter()) {
        if !(weight.is_finite() && (0.0..=1.0).contains(weight)) {
            return Err(PortfolioError::InvalidInput {
                field: "target_weights".into(),
                reason: format!("Weight for {key} must be in [0, 1], got {weight}"),
            });
        }
        total += weight;
    }
    if (total - 1.0).abs() > 1e-6 {
        return Err(PortfolioError::InvalidInput {
            field: "target_weights".into(),
            reason: format!("Target weights sum to {total:.8}, expected 1"),
        });
    }
    if !(threshold.is_finite() && threshold > 0.0 && threshold < 1.0) {
        return Err(PortfolioError::InvalidInput {
            field: "threshold".into(),
            reason: format!("Threshold must be in (0, 1), got {threshold}"),
        });
    }
    if input.check_date <= input.rebalance_date {
        return Err(PortfolioError::InvalidInput {
            field: "check_date".into(),
            reason: format!(
                "Check date {} must be after the rebalance date {}",
                input.check_date, input.rebalance_date
            ),
        });
    }
    let m = input.prices.n_dates();
    if input.prices.prices.len() != m {
        return Err(PortfolioError::InvalidInput {
            field: "prices".into(),
            reason: format!(
                "Expected {} rows to match the date index but got {}",
                m,
                input.prices.prices.len()
            ),
        });
    }
    for (t, row) in input.prices.prices.iter().enumerate() {
        if row.len() != input.prices.n_assets() {
            return Err(PortfolioError::InvalidInput {
                field: "prices".into(),
                reason: format!(
                    "Row {} has {} columns, expected {}",
                    t,
                    row.len(),
                    input.prices.n_assets()
                ),
            });
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, day).unwrap()
    }

    fn input_with_final_prices(p1: Vec<f64>) -> DriftCheckInput {
        DriftCheckInput {
            run_key: "run-42".into(),
            asset_keys: vec!["AAA".into(), "BBB".into()],
            target_weights: vec![0.5, 0.5],
            prices: PricePanel {
                asset_keys: vec!["AAA".into(), "BBB".into()],
                dates: vec![date(1), date(15)],
                prices: vec![vec![100.0, 100.0], p1],
            },
            rebalance_date: date(1),
            check_date: date(15),
            threshold: None,
        }
    }

    // ------------------------------------------------------------------
    // 1. Sub-threshold drift: no breach
    // ------------------------------------------------------------------
    #[test]
    fn test_drift_below_threshold() {
        let out = check_drift(&input_with_final_prices(vec![120.0, 100.0])).unwrap();
        let report = &out.result;

        assert!(!report.any_breach);
        let implied: Vec<f64> = report.positions.iter().map(|p| p.current_weight).collect();
        assert!((implied[0] - 0.6 / 1.1).abs() < 1e-12, "implied: {implied:?}");
        assert!((implied[1] - 0.5 / 1.1).abs() < 1e-12);
        for position in &report.positions {
            assert!((position.drift_abs - 0.5 / 11.0).abs() < 1e-12);
            assert!(!position.breached);
            assert!(position.explanation.is_none());
        }
    }

    // ------------------------------------------------------------------
    // 2. Breach with the templated explanation
    // ------------------------------------------------------------------
    #[test]
    fn test_drift_breach_explanation() {
        let out = check_drift(&input_with_final_prices(vec![150.0, 100.0])).unwrap();
        let report = &out.result;

        assert!(report.any_breach);
        let winner = &report.positions[0];
        assert!((winner.current_weight - 0.6).abs() < 1e-12);
        assert!(winner.breached);
        let explanation = winner.explanation.as_ref().unwrap();
        assert!(explanation.contains("+10.0 pp"), "explanation: {explanation}");
        assert!(explanation.contains("price appreciation"));

        let loser = &report.positions[1];
        assert!((loser.current_weight - 0.4).abs() < 1e-12);
        let explanation = loser.explanation.as_ref().unwrap();
        assert!(explanation.contains("-10.0 pp"), "explanation: {explanation}");
        assert!(explanation.contains("price depreciation"));
    }

    // ------------------------------------------------------------------
    // 3. Implied weights always sum to one
    // ------------------------------------------------------------------
    #[test]
    fn test_implied_weights_sum_to_one() {
        let out = check_drift(&input_with_final_prices(vec![137.5, 81.25])).unwrap();
        let total: f64 = out.result.positions.iter().map(|p| p.current_weight).sum();
        assert!((total - 1.0).abs() < 1e-10);
    }

    // ------------------------------------------------------------------
    // 4. Missing and non-positive prices are named errors
    // ------------------------------------------------------------------
    #[test]
    fn test_price_failures() {
        let mut input = input_with_final_prices(vec![120.0, 100.0]);
        input.prices.prices[1][1] = f64::NAN;
        let err = check_drift(&input).unwrap_err();
        assert!(err.to_string().contains("Missing price for BBB"));

        let mut input = input_with_final_prices(vec![120.0, -5.0]);
        input.prices.prices[1][1] = -5.0;
        let err = check_drift(&input).unwrap_err();
        assert!(err.to_string().contains("Non-positive price for BBB"));

        // Target asset absent from the panel entirely
        let mut input = input_with_final_prices(vec![120.0, 100.0]);
        input.asset_keys[1] = "CCC".into();
        let err = check_drift(&input).unwrap_err();
        assert!(err.to_string().contains("CCC"));
    }

    // ------------------------------------------------------------------
    // 5. Validation failures
    // ------------------------------------------------------------------
    #[test]
    fn test_validation_failures() {
        // Weights not summing to one
        let mut input = input_with_final_prices(vec![120.0, 100.0]);
        input.target_weights = vec![0.6, 0.6];
        assert!(check_drift(&input).is_err());

        // Threshold out of range
        let mut input = input_with_final_prices(vec![120.0, 100.0]);
        input.threshold = Some(1.5);
        assert!(check_drift(&input).is_err());

        // Check date before rebalance date
        let mut input = input_with_final_prices(vec![120.0, 100.0]);
        input.check_date = date(1);
        input.rebalance_date = date(15);
        assert!(check_drift(&input).is_err());

        // Date not present in the panel
        let mut input = input_with_final_prices(vec![120.0, 100.0]);
        input.check_date = date(20);
        assert!(check_drift(&input).is_err());
    }
}
