use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Rates expressed as decimals (0.05 = 5%). Never as percentages.
pub type Rate = f64;

/// Observation frequency of a return or price panel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
}

impl Frequency {
    /// Standard annualisation factor for this frequency
    pub fn periods_per_year(&self) -> f64 {
        match self {
            Frequency::Daily => 252.0,
            Frequency::Weekly => 52.0,
            Frequency::Monthly => 12.0,
        }
    }
}

/// How periodic returns were computed from prices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnKind {
    Simple,
    Log,
}

/// Expected-return (mu) estimation method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MuEstimator {
    Historical,
    Ewma,
    Shrinkage,
}

/// Covariance matrix (Sigma) estimation method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CovMethod {
    Sample,
    LedoitWolf,
}

/// Broad asset classification used by the screening gap signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetClass {
    Equity,
    FixedIncome,
    Commodity,
    RealEstate,
    Cash,
    Crypto,
    Other,
}

/// Optimization problem form
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunType {
    Mvp,
    FrontierPoint,
    FrontierSeries,
    Tangency,
}

/// Terminal status of a single optimization run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OptimizationStatus {
    Success,
    Infeasible,
    Error,
}

/// Dense panel of adjusted closing prices, dates ascending, one column per asset.
///
/// Consumed by the drift analyzer and by the price-to-return conversion.
/// Missing observations must be resolved by the caller before the panel is
/// handed to the core; a NaN cell is treated as a missing price.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricePanel {
    pub asset_keys: Vec<String>,
    pub dates: Vec<NaiveDate>,
    /// Row-major m x n matrix: prices[t][i] is asset i on dates[t].
    pub prices: Vec<Vec<f64>>,
}

impl PricePanel {
    pub fn n_assets(&self) -> usize {
        self.asset_keys.len()
    }

    pub fn n_dates(&self) -> usize {
        self.dates.len()
    }

    /// Row index of `date`, or None when the panel has no such observation.
    pub fn date_index(&self, date: NaiveDate) -> Option<usize> {
        self.dates.iter().position(|d| *d == date)
    }
}

/// Standard computation output envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputationOutput<T: Serialize> {
    pub result: T,
    pub methodology: String,
    pub assumptions: serde_json::Value,
    pub warnings: Vec<String>,
    pub metadata: ComputationMetadata,
}

/// Metadata for every computation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputationMetadata {
    pub version: String,
    pub computation_time_us: u64,
    pub precision: String,
}

/// Helper to wrap computation results with metadata
pub fn with_metadata<T: Serialize>(
    methodology: &str,
    assumptions: &impl Serialize,
    warnings: Vec<String>,
    elapsed_us: u64,
    result: T,
) -> ComputationOutput<T> {
    ComputationOutput {
        result,
        methodology: methodology.to_string(),
        assumptions: serde_json::to_value(assumptions).unwrap_or_default(),
        warnings,
        metadata: ComputationMetadata {
            version: env!("CARGO_PKG_VERSION").to_string(),
            computation_time_us: elapsed_us,
            precision: "f64".to_string(),
        },
    }
}
