mod assumptions;
mod panel;
mod psd;
mod returns;

pub use assumptions::{estimate, AssumptionSet, EstimateInput};
pub use panel::ReturnPanel;
pub use returns::compute_returns;
