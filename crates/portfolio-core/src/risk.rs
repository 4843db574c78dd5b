use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::PortfolioError;
use crate::types::Frequency;
use crate::PortfolioResult;

/// Weights with absolute value below this are treated as zero risk mass.
const VOL_TOL: f64 = 1e-12;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Per-asset risk contributions, positionally aligned to the weight vector.
///
///     g     = Sigma w
///     MCR_i = g_i / sigma_p          (marginal contribution to risk)
///     CRC_i = w_i * MCR_i            (component contribution to risk)
///     PRC_i = CRC_i / sigma_p        (percent risk contribution)
///
/// Identities: sum(CRC) = sigma_p, sum(PRC) = 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskDecomposition {
    pub mcr: Vec<f64>,
    pub crc: Vec<f64>,
    pub prc: Vec<f64>,
}

/// Aggregate statistics for a realized portfolio return series.
///
/// var_95 / cvar_95 are positive loss magnitudes:
///     VaR_a  = -Quantile_a(r)
///     CVaR_a = -E[r | r <= Quantile_a(r)]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub total_return: f64,
    pub annualized_return: f64,
    pub annualized_vol: f64,
    pub sharpe: f64,
    pub max_drawdown: f64,
    pub var_95: f64,
    pub cvar_95: f64,
}

// ---------------------------------------------------------------------------
// Portfolio variance and risk decomposition
// ---------------------------------------------------------------------------

/// Portfolio variance w' Sigma w.
pub fn portfolio_variance(weights: &[f64], covariance: &[Vec<f64>]) -> PortfolioResult<f64> {
    validate_weights_covariance(weights, covariance)?;
    let w = DVector::from_column_slice(weights);
    let sigma = to_dmatrix(covariance);
    let variance = (w.transpose() * &sigma * &w)[(0, 0)];
    Ok(variance.max(0.0))
}

/// Portfolio volatility sqrt(w' Sigma w).
pub fn portfolio_volatility(weights: &[f64], covariance: &[Vec<f64>]) -> PortfolioResult<f64> {
    Ok(portfolio_variance(weights, covariance)?.sqrt())
}

/// Compute MCR, CRC, and PRC for each asset.
///
/// Returns zero arrays when portfolio volatility is effectively zero
/// (e.g. a single-asset portfolio held as cash).
pub fn risk_decomposition(
    weights: &[f64],
    covariance: &[Vec<f64>],
) -> PortfolioResult<RiskDecomposition> {
    validate_weights_covariance(weights, covariance)?;
    let n = weights.len();

    let w = DVector::from_column_slice(weights);
    let sigma = to_dmatrix(covariance);
    let variance = (w.transpose() * &sigma * &w)[(0, 0)].max(0.0);
    let stdev = variance.sqrt();

    if stdev < VOL_TOL {
        return Ok(RiskDecomposition {
            mcr: vec![0.0; n],
            crc: vec![0.0; n],
            prc: vec![0.0; n],
        });
    }

    let g = &sigma * &w;
    let mut mcr = Vec::with_capacity(n);
    let mut crc = Vec::with_capacity(n);
    let mut prc = Vec::with_capacity(n);
    for i in 0..n {
        let m = g[i] / stdev;
        let c = weights[i] * m;
        mcr.push(m);
        crc.push(c);
        prc.push(c / stdev);
    }

    Ok(RiskDecomposition { mcr, crc, prc })
}

// ---------------------------------------------------------------------------
// Concentration
// ---------------------------------------------------------------------------

/// Herfindahl-Hirschman index of the weight vector: sum(w_i^2).
pub fn hhi(weights: &[f64]) -> f64 {
    weights.iter().map(|w| w * w).sum()
}

/// Effective number of holdings 1 / HHI.
///
/// Returns +inf for an all-zero weight vector, where the measure is undefined.
pub fn effective_n(weights: &[f64]) -> f64 {
    let h = hhi(weights);
    if h > VOL_TOL {
        1.0 / h
    } else {
        f64::INFINITY
    }
}

// ---------------------------------------------------------------------------
// Wealth and drawdown
// ---------------------------------------------------------------------------

/// Wealth index from a series of simple periodic returns.
///
/// V_0 = 1, V_t = V_{t-1} * (1 + r_t). The returned series has one more
/// element than the input. Returns must be simple; log returns do not
/// compound multiplicatively.
pub fn wealth_index(returns: &[f64]) -> Vec<f64> {
    let mut wealth = Vec::with_capacity(returns.len() + 1);
    let mut v = 1.0;
    wealth.push(v);
    for r in returns {
        v *= 1.0 + r;
        wealth.push(v);
    }
    wealth
}

/// Running drawdown DD_t = V_t / max(V_u, u <= t) - 1. Always <= 0.
pub fn drawdown(wealth: &[f64]) -> Vec<f64> {
    let mut peak = f64::NEG_INFINITY;
    wealth
        .iter()
        .map(|v| {
            peak = peak.max(*v);
            v / peak - 1.0
        })
        .collect()
}

/// Maximum drawdown: the minimum of the running drawdown series.
pub fn max_drawdown(wealth: &[f64]) -> f64 {
    drawdown(wealth).into_iter().fold(0.0, f64::min)
}

// ---------------------------------------------------------------------------
// Historical VaR / CVaR
// ---------------------------------------------------------------------------

/// Historical value-at-risk at level alpha: -quantile(r, alpha).
pub fn historical_var(returns: &[f64], alpha: f64) -> PortfolioResult<f64> {
    Ok(-tail_quantile(returns, alpha)?)
}

/// Conditional value-at-risk: -mean(r | r <= quantile(r, alpha)).
pub fn cvar(returns: &[f64], alpha: f64) -> PortfolioResult<f64> {
    let q = tail_quantile(returns, alpha)?;
    let tail: Vec<f64> = returns.iter().copied().filter(|r| *r <= q).collect();
    // The tail always contains at least the sample minimum.
    let mean = tail.iter().sum::<f64>() / tail.len() as f64;
    Ok(-mean)
}

/// Linearly interpolated quantile of the return series at level alpha.
fn tail_quantile(returns: &[f64], alpha: f64) -> PortfolioResult<f64> {
    if returns.is_empty() {
        return Err(PortfolioError::InsufficientData(
            "At least 1 return observation required for quantile estimation".into(),
        ));
    }
    if !(0.0..1.0).contains(&alpha) || alpha == 0.0 {
        return Err(PortfolioError::InvalidInput {
            field: "alpha".into(),
            reason: format!("Quantile level must be in (0, 1), got {alpha}"),
        });
    }
    if returns.iter().any(|r| !r.is_finite()) {
        return Err(PortfolioError::InvalidInput {
            field: "returns".into(),
            reason: "Return series contains non-finite values".into(),
        });
    }

    let mut sorted = returns.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).expect("finite returns"));

    let pos = alpha * (sorted.len() - 1) as f64;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    let frac = pos - lower as f64;
    Ok(sorted[lower] + frac * (sorted[upper] - sorted[lower]))
}

// ---------------------------------------------------------------------------
// Realized performance summary
// ---------------------------------------------------------------------------

/// Summarise a realized simple-return series the way the backtest reports it.
pub fn performance_summary(
    returns: &[f64],
    frequency: Frequency,
    rf_annual: f64,
) -> PortfolioResult<PerformanceSummary> {
    let n = returns.len();
    if n < 2 {
        return Err(PortfolioError::InsufficientData(
            "At least 2 return observations required for a performance summary".into(),
        ));
    }
    if returns.iter().any(|r| !r.is_finite()) {
        return Err(PortfolioError::InvalidInput {
            field: "returns".into(),
            reason: "Return series contains non-finite values".into(),
        });
    }

    let periods = frequency.periods_per_year();
    let wealth = wealth_index(returns);
    let total_return = wealth[wealth.len() - 1] - 1.0;

    let mean = returns.iter().sum::<f64>() / n as f64;
    let annualized_return = mean * periods;

    let sum_sq: f64 = returns.iter().map(|r| (r - mean) * (r - mean)).sum();
    let annualized_vol = (sum_sq / (n - 1) as f64).sqrt() * periods.sqrt();

    let sharpe = if annualized_vol > VOL_TOL {
        (annualized_return - rf_annual) / annualized_vol
    } else {
        0.0
    };

    Ok(PerformanceSummary {
        total_return,
        annualized_return,
        annualized_vol,
        sharpe,
        max_drawdown: max_drawdown(&wealth),
        var_95: historical_var(returns, 0.05)?,
        cvar_95: cvar(returns, 0.05)?,
    })
}

// ---------------------------------------------------------------------------
// Validation helpers
// ---------------------------------------------------------------------------

fn validate_weights_covariance(weights: &[f64], covariance: &[Vec<f64>]) -> PortfolioResult<()> {
    let n = weights.len();
    if n == 0 {
        return Err(PortfolioError::InvalidInput {
            field: "weights".into(),
            reason: "Weight vector cannot be empty".into(),
        });
    }
    if weights.iter().any(|w| !w.is_finite()) {
        return Err(PortfolioError::InvalidInput {
            field: "weights".into(),
            reason: "Weight vector contains non-finite values".into(),
        });
    }
    if covariance.len() != n {
        return Err(PortfolioError::InvalidInput {
            field: "covariance".into(),
            reason: format!("Expected {}x{} matrix but got {} rows", n, n, covariance.len()),
        });
    }
    for (i, row) in covariance.iter().enumerate() {
        if row.len() != n {
            return Err(PortfolioError::InvalidInput {
                field: "covariance".into(),
                reason: format!("Row {} has {} columns, expected {}", i, row.len(), n),
            });
        }
        if row.iter().any(|v| !v.is_finite()) {
            return Err(PortfolioError::InvalidInput {
                field: "covariance".into(),
                reason: format!("Row {i} contains non-finite values"),
            });
        }
    }
    Ok(())
}

pub(crate) fn to_dmatrix(rows: &[Vec<f64>]) -> DMatrix<f64> {
    let n_rows = rows.len();
    let n_cols = if n_rows > 0 { rows[0].len() } else { 0 };
    DMatrix::from_fn(n_rows, n_cols, |i, j| rows[i][j])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
