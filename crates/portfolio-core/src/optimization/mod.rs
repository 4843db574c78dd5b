mod constraints;
mod mean_variance;
mod qp;

pub use constraints::{AssetBound, OptimizationConstraints, ResolvedBounds};
pub use mean_variance::{
    frontier, optimize, FrontierInput, OptimizationOutcome, OptimizeInput, SolverResult,
};
