pub mod wal;

pub use wal::{chain_hash, AuditEntry, AuditLog, AuditSummary, GENESIS_HASH};
