use chrono::NaiveDate;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PortfolioError {
    #[error("Invalid input: {field} — {reason}")]
    InvalidInput { field: String, reason: String },

    #[error("Degenerate asset: {asset} — {reason}")]
    DegenerateAsset { asset: String, reason: String },

    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error(
        "Convergence failure: {function} did not converge after {iterations} iterations"
    )]
    ConvergenceFailure { function: String, iterations: u32 },

    #[error("Missing price for {asset} at {date}")]
    MissingPrice { asset: String, date: NaiveDate },

    #[error("Non-positive price for {asset} at {date}: {price}")]
    NonPositivePrice {
        asset: String,
        date: NaiveDate,
        price: f64,
    },

    #[error("Numerical error: {0}")]
    Numerical(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<serde_json::Error> for PortfolioError {
    fn from(e: serde_json::Error) -> Self {
        PortfolioError::SerializationError(e.to_string())
    }
}
