pub mod budget;
pub mod memory;
pub mod sqlite;

pub use budget::{
    advance_reservation_ids, OpenReservation, ReleasedPosition, Reservation, RiskBudgetEnforcer,
    RiskBudgetState, RiskVerdict,
};
pub use memory::MemoryBudgetPersistence;
pub use sqlite::SqliteBudgetPersistence;
