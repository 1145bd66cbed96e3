pub mod audit;
pub mod memory;
pub mod traits;

pub use audit::AuditLog;
pub use memory::InMemoryAuditStore;
pub use traits::{AuditEntry, AuditFilter, AuditRecord, AuditStore, OpenEscalation, OverrideAction};
