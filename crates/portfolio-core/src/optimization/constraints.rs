use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::PortfolioError;
use crate::PortfolioResult;

use super::qp::CONSTRAINT_TOL;

/// Per-asset weight bounds, keyed by asset key in the constraint bundle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AssetBound {
    pub min_weight: f64,
    pub max_weight: f64,
}

/// Solver constraint bundle. Full investment (sum of weights = 1) is always
/// active and is not represented here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OptimizationConstraints {
    /// No short selling: w >= 0.
    pub long_only: bool,
    /// Uniform per-asset minimum weight.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_weight: Option<f64>,
    /// Uniform per-asset maximum weight.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_weight: Option<f64>,
    /// Sparse per-asset overrides, resolved to column indices per call.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub asset_bounds: BTreeMap<String, AssetBound>,
    /// Gross exposure cap: sum |w_i| <= L, L >= 1.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leverage_cap: Option<f64>,
    /// Single-position cap: max |w_i| <= c, c in (0, 1].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concentration_cap: Option<f64>,
    /// Trading cap against previous weights: sum |w_i - w_prev_i| <= T.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turnover_cap: Option<f64>,
}

impl OptimizationConstraints {
    /// Internal-consistency checks on the bundle itself; feasibility against
    /// the full-investment constraint is diagnosed separately in `precheck`.
    pub fn validate(&self) -> PortfolioResult<()> {
        if let (Some(min), Some(max)) = (self.min_weight, self.max_weight) {
            if min > max {
                return Err(PortfolioError::InvalidInput {
                    field: "min_weight/max_weight".into(),
                    reason: format!("min_weight ({min}) exceeds max_weight ({max})"),
                });
            }
        }
        for (key, bound) in &self.asset_bounds {
            if bound.min_weight > bound.max_weight {
                return Err(PortfolioError::InvalidInput {
                    field: format!("asset_bounds[{key}]"),
                    reason: format!(
                        "min_weight ({}) exceeds max_weight ({})",
                        bound.min_weight, bound.max_weight
                    ),
                });
            }
        }
        if let Some(cap) = self.leverage_cap {
            if !(cap.is_finite() && cap >= 1.0) {
                return Err(PortfolioError::InvalidInput {
                    field: "leverage_cap".into(),
                    reason: format!("Leverage cap must be >= 1, got {cap}"),
                });
            }
        }
        if let Some(cap) = self.concentration_cap {
            if !(cap.is_finite() && cap > 0.0 && cap <= 1.0) {
                return Err(PortfolioError::InvalidInput {
                    field: "concentration_cap".into(),
                    reason: format!("Concentration cap must be in (0, 1], got {cap}"),
                });
            }
        }
        if let Some(cap) = self.turnover_cap {
            if !(cap.is_finite() && cap >= 0.0) {
                return Err(PortfolioError::InvalidInput {
                    field: "turnover_cap".into(),
                    reason: format!("Turnover cap must be >= 0, got {cap}"),
                });
            }
        }
        Ok(())
    }

    /// Resolve the bundle to dense per-column (lower, upper) bounds.
    ///
    /// Base bounds come from long_only; uniform and per-asset overrides are
    /// layered on top and the concentration cap is folded in as a box bound
    /// (|w_i| <= c is exactly -c <= w_i <= c). Bound keys that match no
    /// column are reported as warnings, not errors.
    pub fn resolve_bounds(&self, asset_keys: &[String]) -> ResolvedBounds {
        let n = asset_keys.len();
        let base_lower = if self.long_only { 0.0 } else { -1.0 };
        let mut lower = vec![self.min_weight.unwrap_or(base_lower); n];
        let mut upper = vec![self.max_weight.unwrap_or(1.0); n];
        let mut warnings = Vec::new();

        for (key, bound) in &self.asset_bounds {
            match asset_keys.iter().position(|k| k == key) {
                Some(i) => {
                    lower[i] = bound.min_weight;
                    upper[i] = bound.max_weight;
                }
                None => warnings.push(format!(
                    "Per-asset bound for unknown asset '{key}' ignored"
                )),
            }
        }

        if self.long_only {
            for lb in &mut lower {
                *lb = lb.max(0.0);
            }
        }
        if let Some(cap) = self.concentration_cap {
            for i in 0..n {
                lower[i] = lower[i].max(-cap);
                upper[i] = upper[i].min(cap);
            }
        }

        ResolvedBounds {
            lower,
            upper,
            warnings,
        }
    }

    /// Human-readable summary of the active constraints.
    pub(crate) fn describe(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        if self.long_only {
            parts.push("long-only".into());
        }
        if self.min_weight.is_some() || self.max_weight.is_some() {
            parts.push("uniform weight bounds".into());
        }
        if !self.asset_bounds.is_empty() {
            parts.push(format!("{} per-asset bounds", self.asset_bounds.len()));
        }
        if let Some(cap) = self.leverage_cap {
            parts.push(format!("leverage <= {:.0}%", cap * 100.0));
        }
        if let Some(cap) = self.concentration_cap {
            parts.push(format!("concentration <= {:.0}%", cap * 100.0));
        }
        if let Some(cap) = self.turnover_cap {
            parts.push(format!("turnover <= {:.0}%", cap * 100.0));
        }
        parts.join(", ")
    }
}

/// Dense column bounds after key resolution, with any resolution warnings.
#[derive(Debug, Clone)]
pub struct ResolvedBounds {
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
    pub warnings: Vec<String>,
}

impl ResolvedBounds {
    /// Per-column coherence after all layers are folded in.
    pub fn validate(&self, asset_keys: &[String]) -> PortfolioResult<()> {
        for i in 0..self.lower.len() {
            if self.lower[i] > self.upper[i] + CONSTRAINT_TOL {
                return Err(PortfolioError::InvalidInput {
                    field: format!("bounds[{}]", asset_keys[i]),
                    reason: format!(
                        "Resolved lower bound {:.4} exceeds upper bound {:.4}",
                        self.lower[i], self.upper[i]
                    ),
                });
            }
        }
        Ok(())
    }
}

/// Necessary feasibility conditions checked before the solver runs.
///
/// Returns the first binding condition as a plain-language reason quoting
/// concrete numbers, or None when no obvious infeasibility is detected.
pub(crate) fn precheck(
    mu: &[f64],
    rf: Option<f64>,
    target_return: Option<f64>,
    long_only: bool,
    bounds: &ResolvedBounds,
) -> Option<String> {
    let max_mu = mu.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let min_mu = mu.iter().copied().fold(f64::INFINITY, f64::min);

    if let Some(rf) = rf {
        if max_mu <= rf {
            return Some(
                "No asset has expected return exceeding the risk-free rate; \
                 tangency portfolio undefined."
                    .into(),
            );
        }
    }

    if let Some(target) = target_return {
        if long_only {
            if target > max_mu + CONSTRAINT_TOL {
                return Some(format!(
                    "Target return of {:.2}% exceeds the maximum achievable return \
                     of {:.2}% under long-only constraints.",
                    target * 100.0,
                    max_mu * 100.0
                ));
            }
            if target < min_mu - CONSTRAINT_TOL {
                return Some(format!(
                    "Target return of {:.2}% is below the minimum achievable return \
                     of {:.2}% under long-only constraints.",
                    target * 100.0,
                    min_mu * 100.0
                ));
            }
        }
    }

    let min_sum: f64 = bounds.lower.iter().sum();
    if min_sum > 1.0 + CONSTRAINT_TOL {
        return Some(format!(
            "Sum of minimum asset bounds ({min_sum:.4}) exceeds 1.0; \
             full investment constraint cannot be satisfied."
        ));
    }
    let max_sum: f64 = bounds.upper.iter().sum();
    if max_sum < 1.0 - CONSTRAINT_TOL {
        return Some(format!(
            "Sum of maximum asset bounds ({max_sum:.4}) is below 1.0; \
             full investment constraint cannot be satisfied."
        ));
    }

    None
}
