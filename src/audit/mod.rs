// Audit / Change Tracking
//
// snapshot → context → (commit) → log → restore
//
// - snapshot: field maps for tracked entities
// - context:  per-operation capture of pending changes
// - record:   the immutable AuditRecord row
// - log:      append-only storage and queries
// - restore:  replay a prior state (blocked for split lineage)

pub mod context;
pub mod log;
pub mod record;
pub mod restore;
pub mod snapshot;

pub use context::{AuditContext, EntityChange, EntityState, SYSTEM_USER};
pub use log::AuditStats;
pub use record::{AuditAction, AuditRecord, AUDIT_TABLE};
pub use snapshot::{diff_fields, EntityKey, FieldMap, FieldSnapshot};
