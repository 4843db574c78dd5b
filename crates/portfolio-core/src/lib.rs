pub mod drift;
pub mod error;
pub mod estimation;
pub mod optimization;
pub mod risk;
pub mod screening;
pub mod types;

pub use error::PortfolioError;
pub use types::*;

/// Standard result type for all portfolio-core operations
pub type PortfolioResult<T> = Result<T, PortfolioError>;
