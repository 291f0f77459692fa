pub mod bootstrap;
pub mod decision;

pub use bootstrap::RouterRuntime;
pub use decision::{ConsistencyReport, DecisionRouter, RouterSettings};
