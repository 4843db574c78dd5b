use crate::error::PortfolioError;
use crate::types::{Frequency, PricePanel, ReturnKind};
use crate::PortfolioResult;

use super::panel::ReturnPanel;

/// Convert a price panel to a panel of periodic returns.
///
///     Simple: r_t = P_t / P_{t-1} - 1
///     Log:    r_t = ln(P_t / P_{t-1})
///
/// The first observation is always dropped because there is no prior period.
pub fn compute_returns(
    prices: &PricePanel,
    frequency: Frequency,
    return_kind: ReturnKind,
) -> PortfolioResult<ReturnPanel> {
    let n = prices.n_assets();
    let m = prices.n_dates();

    if n == 0 {
        return Err(PortfolioError::InvalidInput {
            field: "asset_keys".into(),
            reason: "Price panel has no assets".into(),
        });
    }
    if m < 3 {
        return Err(PortfolioError::InsufficientData(format!(
            "At least 3 price observations required to produce 2 returns, got {m}"
        )));
    }
    if prices.prices.len() != m {
        return Err(PortfolioError::InvalidInput {
            field: "prices".into(),
            reason: format!(
                "Expected {} rows to match the date index but got {}",
                m,
                prices.prices.len()
            ),
        });
    }
    for (t, row) in prices.prices.iter().enumerate() {
        if row.len() != n {
            return Err(PortfolioError::InvalidInput {
                field: "prices".into(),
                reason: format!("Row {} has {} columns, expected {}", t, row.len(), n),
            });
        }
        for (i, price) in row.iter().enumerate() {
            if !price.is_finite() {
                return Err(PortfolioError::MissingPrice {
                    asset: prices.asset_keys[i].clone(),
                    date: prices.dates[t],
                });
            }
            if *price <= 0.0 {
                return Err(PortfolioError::NonPositivePrice {
                    asset: prices.asset_keys[i].clone(),
                    date: prices.dates[t],
                    price: *price,
                });
            }
        }
    }

    let mut returns = Vec::with_capacity(m - 1);
    for t in 1..m {
        let row: Vec<f64> = (0..n)
            .map(|i| {
                let ratio = prices.prices[t][i] / prices.prices[t - 1][i];
                match return_kind {
                    ReturnKind::Simple => ratio - 1.0,
                    ReturnKind::Log => ratio.ln(),
                }
            })
            .collect();
        returns.push(row);
    }

    Ok(ReturnPanel {
        asset_keys: prices.asset_keys.clone(),
        dates: prices.dates[1..].to_vec(),
        returns,
        frequency,
        return_kind,
    })
}
