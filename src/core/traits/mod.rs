pub mod budget_persistence_trait;
pub mod decision_sink_trait;
pub mod ev_persistence_trait;

pub use budget_persistence_trait::BudgetPersistence;
pub use decision_sink_trait::{DecisionSink, MemoryDecisionSink};
pub use ev_persistence_trait::EvPersistence;
