use std::time::Instant;

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::error::PortfolioError;
use crate::types::{with_metadata, ComputationOutput, CovMethod, MuEstimator};
use crate::PortfolioResult;

use super::panel::ReturnPanel;
use super::psd;

/// Default shrinkage intensity for the shrinkage mu estimator.
const DEFAULT_SHRINKAGE_ALPHA: f64 = 0.1;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Input to return/covariance estimation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EstimateInput {
    pub panel: ReturnPanel,
    /// Annual risk-free rate, carried through to downstream consumers.
    pub rf_annual: f64,
    pub estimator: MuEstimator,
    pub cov_method: CovMethod,
    /// EWMA half-life in periods; defaults to half the annualization factor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ewma_halflife: Option<f64>,
    /// Shrinkage intensity toward the grand mean; defaults to 0.1.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shrinkage_alpha: Option<f64>,
}

/// Versioned bundle of annualized estimation outputs.
///
/// Every downstream computation (screening, optimization) is parameterized
/// by exactly one assumption set; the record is never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssumptionSet {
    pub asset_keys: Vec<String>,
    /// Annualized expected returns, length n.
    pub mu_annual: Vec<f64>,
    /// Annualized covariance matrix, dense n x n, symmetric and PSD
    /// (possibly after repair).
    pub sigma_annual: Vec<Vec<f64>>,
    /// Annualized per-asset volatilities sqrt(diag(Sigma)).
    pub vol_annual: Vec<f64>,
    /// Correlation matrix with unit diagonal and entries in [-1, 1].
    pub correlation: Vec<Vec<f64>>,
    pub annualization_factor: f64,
    pub rf_annual: f64,
    pub estimator: MuEstimator,
    pub cov_method: CovMethod,
    pub psd_repair_applied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub psd_repair_note: Option<String>,
}

impl AssumptionSet {
    pub fn n_assets(&self) -> usize {
        self.asset_keys.len()
    }

    /// Column index of `key`, or None when the set does not cover it.
    pub fn asset_index(&self, key: &str) -> Option<usize> {
        self.asset_keys.iter().position(|k| k == key)
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Estimate annualized (mu, Sigma, rho) from an aligned return panel.
///
/// The validation pipeline symmetrizes Sigma, eigen-checks it, and applies
/// nearest-PSD repair when the check fails; the repair is reported via
/// `psd_repair_applied` and an envelope warning, never as an error.
pub fn estimate(input: &EstimateInput) -> PortfolioResult<ComputationOutput<AssumptionSet>> {
    let start = Instant::now();
    let mut warnings: Vec<String> = Vec::new();

    input.panel.validate()?;
    if !input.rf_annual.is_finite() {
        return Err(PortfolioError::InvalidInput {
            field: "rf_annual".into(),
            reason: format!("Risk-free rate must be finite, got {}", input.rf_annual),
        });
    }

    let panel = &input.panel;
    let n = panel.n_assets();
    let m = panel.n_observations();
    let factor = panel.frequency.periods_per_year();

    // A column with zero sample variance cannot be priced against the rest
    // of the universe and is rejected before any matrix work.
    let means = column_means(&panel.returns, n);
    for i in 0..n {
        let var: f64 = panel
            .returns
            .iter()
            .map(|row| (row[i] - means[i]).powi(2))
            .sum();
        if var == 0.0 {
            return Err(PortfolioError::DegenerateAsset {
                asset: panel.asset_keys[i].clone(),
                reason: "All returns are identical; sample variance is zero".into(),
            });
        }
    }

    // --- Expected returns ---
    let mu_periodic = match input.estimator {
        MuEstimator::Historical => means.clone(),
        MuEstimator::Ewma => {
            let halflife = input.ewma_halflife.unwrap_or(factor / 2.0);
            if !(halflife.is_finite() && halflife > 0.0) {
                return Err(PortfolioError::InvalidInput {
                    field: "ewma_halflife".into(),
                    reason: format!("Half-life must be positive, got {halflife}"),
                });
            }
            ewma_means(&panel.returns, n, halflife)
        }
        MuEstimator::Shrinkage => {
            let alpha = input.shrinkage_alpha.unwrap_or(DEFAULT_SHRINKAGE_ALPHA);
            if !(0.0..=1.0).contains(&alpha) {
                return Err(PortfolioError::InvalidInput {
                    field: "shrinkage_alpha".into(),
                    reason: format!("Shrinkage intensity must be in [0, 1], got {alpha}"),
                });
            }
            let grand = means.iter().sum::<f64>() / n as f64;
            means.iter().map(|mu| (1.0 - alpha) * mu + alpha * grand).collect()
        }
    };
    let mu_annual: Vec<f64> = mu_periodic.iter().map(|mu| mu * factor).collect();

    // --- Covariance ---
    let cov_periodic = match input.cov_method {
        CovMethod::Sample => sample_covariance(&panel.returns, &means, n, m),
        CovMethod::LedoitWolf => ledoit_wolf_covariance(&panel.returns, &means, n, m),
    };
    let mut sigma = cov_periodic * factor;

    // --- Validation pipeline: symmetrize, check, repair ---
    psd::symmetrize(&mut sigma);
    let check = psd::check_psd(&sigma);
    let mut psd_repair_applied = false;
    let mut psd_repair_note = None;
    if !check.is_psd {
        let (repaired, note) = psd::nearest_psd(&sigma);
        sigma = repaired;
        psd_repair_applied = true;
        warnings.push(format!("PSD repair applied: {note}"));
        psd_repair_note = Some(note);
    }

    // --- Volatilities and correlation from the (possibly repaired) Sigma ---
    let mut vol_annual = Vec::with_capacity(n);
    for i in 0..n {
        let variance = sigma[(i, i)];
        if variance <= 0.0 {
            return Err(PortfolioError::DegenerateAsset {
                asset: panel.asset_keys[i].clone(),
                reason: format!("Annualized variance is non-positive ({variance:.6e})"),
            });
        }
        vol_annual.push(variance.sqrt());
    }
    let correlation = psd::correlation_from(&sigma, &vol_annual);

    let sigma_annual: Vec<Vec<f64>> = (0..n)
        .map(|i| (0..n).map(|j| sigma[(i, j)]).collect())
        .collect();

    let result = AssumptionSet {
        asset_keys: panel.asset_keys.clone(),
        mu_annual,
        sigma_annual,
        vol_annual,
        correlation,
        annualization_factor: factor,
        rf_annual: input.rf_annual,
        estimator: input.estimator,
        cov_method: input.cov_method,
        psd_repair_applied,
        psd_repair_note,
    };

    let elapsed = start.elapsed().as_micros() as u64;
    Ok(with_metadata(
        "Annualized Return & Covariance Estimation",
        &serde_json::json!({
            "n_assets": n,
            "n_observations": m,
            "frequency": panel.frequency,
            "return_kind": panel.return_kind,
            "estimator": input.estimator,
            "cov_method": input.cov_method,
            "rf_annual": input.rf_annual,
        }),
        warnings,
        elapsed,
        result,
    ))
}

// ---------------------------------------------------------------------------
// Mu estimators
// ---------------------------------------------------------------------------

fn column_means(returns: &[Vec<f64>], n: usize) -> Vec<f64> {
    let m = returns.len() as f64;
    (0..n)
        .map(|i| returns.iter().map(|row| row[i]).sum::<f64>() / m)
        .collect()
}

/// Exponentially weighted column means. Observation t (0-based, oldest
/// first) receives weight proportional to (1/2)^((T-1-t)/h).
fn ewma_means(returns: &[Vec<f64>], n: usize, halflife: f64) -> Vec<f64> {
    let m = returns.len();
    let mut weights: Vec<f64> = (0..m)
        .map(|t| 0.5_f64.powf((m - 1 - t) as f64 / halflife))
        .collect();
    let total: f64 = weights.iter().sum();
    for w in &mut weights {
        *w /= total;
    }

    (0..n)
        .map(|i| {
            returns
                .iter()
                .zip(weights.iter())
                .map(|(row, w)| row[i] * w)
                .sum()
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Covariance estimators
// ---------------------------------------------------------------------------

/// Sample covariance with denominator m - 1.
fn sample_covariance(returns: &[Vec<f64>], means: &[f64], n: usize, m: usize) -> DMatrix<f64> {
    let mut cov = DMatrix::zeros(n, n);
    for i in 0..n {
        for j in i..n {
            let sum: f64 = returns
                .iter()
                .map(|row| (row[i] - means[i]) * (row[j] - means[j]))
                .sum();
            let value = sum / (m - 1) as f64;
            cov[(i, j)] = value;
            cov[(j, i)] = value;
        }
    }
    cov
}

/// Ledoit-Wolf shrinkage toward the scaled identity F = (trace(S)/n) I.
///
/// S is the maximum-likelihood sample covariance (denominator m) and the
/// intensity is the analytic estimate from the 2004 well-conditioned
/// estimator; the result is symmetric by construction.
fn ledoit_wolf_covariance(returns: &[Vec<f64>], means: &[f64], n: usize, m: usize) -> DMatrix<f64> {
    let t = m as f64;

    // Demeaned observations.
    let x: Vec<Vec<f64>> = returns
        .iter()
        .map(|row| (0..n).map(|i| row[i] - means[i]).collect())
        .collect();

    let mut emp = DMatrix::zeros(n, n);
    for i in 0..n {
        for j in i..n {
            let sum: f64 = x.iter().map(|row| row[i] * row[j]).sum();
            emp[(i, j)] = sum / t;
            emp[(j, i)] = emp[(i, j)];
        }
    }

    let mu = emp.trace() / n as f64;

    // d^2 = ||S - mu I||_F^2 / n
    let mut d2 = 0.0;
    for i in 0..n {
        for j in 0..n {
            let target = if i == j { mu } else { 0.0 };
            d2 += (emp[(i, j)] - target).powi(2);
        }
    }
    d2 /= n as f64;

    // b^2 = min(d^2, (1/T^2 n) * sum_t ||x_t x_t' - S||_F^2)
    let mut b2_sum = 0.0;
    for i in 0..n {
        for j in 0..n {
            let fourth: f64 = x.iter().map(|row| (row[i] * row[j]).powi(2)).sum();
            b2_sum += fourth - t * emp[(i, j)].powi(2);
        }
    }
    let b2 = (b2_sum / (t * t * n as f64)).min(d2);

    let shrinkage = if d2 > 0.0 { (b2 / d2).clamp(0.0, 1.0) } else { 0.0 };

    let mut shrunk = emp * (1.0 - shrinkage);
    for i in 0..n {
        shrunk[(i, i)] += shrinkage * mu;
    }
    shrunk
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
