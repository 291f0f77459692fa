pub mod bypass;
pub mod memory;
pub mod profile;
pub mod sqlite;
pub mod store;

pub use bypass::{BypassVerdict, EvBypassPolicy};
pub use memory::MemoryEvPersistence;
pub use profile::EvProfile;
pub use sqlite::SqliteEvPersistence;
pub use store::{EvSnapshot, EvStateStore, NamespacedProfile};
