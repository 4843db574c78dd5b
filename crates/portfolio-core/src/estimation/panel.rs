use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::PortfolioError;
use crate::types::{Frequency, ReturnKind};
use crate::PortfolioResult;

/// Aligned panel of periodic asset returns.
///
/// Callers are responsible for common-date alignment and missing-data
/// handling; the panel is rejected outright if any cell is non-finite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReturnPanel {
    pub asset_keys: Vec<String>,
    pub dates: Vec<NaiveDate>,
    /// Row-major m x n matrix: returns[t][i] is asset i on dates[t].
    pub returns: Vec<Vec<f64>>,
    pub frequency: Frequency,
    pub return_kind: ReturnKind,
}

impl ReturnPanel {
    pub fn n_assets(&self) -> usize {
        self.asset_keys.len()
    }

    pub fn n_observations(&self) -> usize {
        self.dates.len()
    }

    /// Shape, ordering, and finiteness checks applied before any estimation.
    pub fn validate(&self) -> PortfolioResult<()> {
        let n = self.n_assets();
        let m = self.n_observations();

        if n < 2 {
            return Err(PortfolioError::InvalidInput {
                field: "asset_keys".into(),
                reason: format!("At least 2 assets required, got {n}"),
            });
        }
        if m < 2 {
            return Err(PortfolioError::InsufficientData(format!(
                "At least 2 return observations required, got {m}"
            )));
        }
        if self.returns.len() != m {
            return Err(PortfolioError::InvalidInput {
                field: "returns".into(),
                reason: format!(
                    "Expected {} rows to match the date index but got {}",
                    m,
                    self.returns.len()
                ),
            });
        }
        for (t, row) in self.returns.iter().enumerate() {
            if row.len() != n {
                return Err(PortfolioError::InvalidInput {
                    field: "returns".into(),
                    reason: format!("Row {} has {} columns, expected {}", t, row.len(), n),
                });
            }
            if let Some(i) = row.iter().position(|r| !r.is_finite()) {
                return Err(PortfolioError::InvalidInput {
                    field: "returns".into(),
                    reason: format!(
                        "Non-finite return for {} on {}",
                        self.asset_keys[i], self.dates[t]
                    ),
                });
            }
        }
        for pair in self.dates.windows(2) {
            if pair[1] <= pair[0] {
                return Err(PortfolioError::InvalidInput {
                    field: "dates".into(),
                    reason: format!(
                        "Dates must be strictly ascending: {} followed by {}",
                        pair[0], pair[1]
                    ),
                });
            }
        }
        Ok(())
    }
}
