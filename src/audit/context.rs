// 🎬 Audit Context - per-operation change capture
//
// One AuditContext per unit of work. It is created by the caller, filled by
// `capture` BEFORE the primary commit (while original values are still
// known), and turned into AuditRecords once the commit succeeded.
// Nothing here is shared between operations.

use crate::audit::record::{AuditAction, AuditRecord, AUDIT_TABLE};
use crate::audit::snapshot::{diff_fields, EntityKey, FieldMap, FieldSnapshot};
use crate::error::ExpenseResult;
use chrono::{DateTime, Utc};

/// Acting user when none is known
pub const SYSTEM_USER: &str = "System";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    Added,
    Modified,
    Deleted,
    Unchanged,
    Detached,
}

/// One pending change as seen by the unit of work
#[derive(Debug, Clone, PartialEq)]
pub struct EntityChange {
    pub table: String,
    pub state: EntityState,
    pub key: EntityKey,

    /// Values as loaded (None for Added)
    pub original: Option<FieldMap>,

    /// Values about to be written (None for Deleted)
    pub current: Option<FieldMap>,
}

impl EntityChange {
    pub fn added<E: FieldSnapshot>(entity: &E) -> ExpenseResult<Self> {
        Ok(EntityChange {
            table: E::TABLE.to_string(),
            state: EntityState::Added,
            key: entity.entity_key(),
            original: None,
            current: Some(entity.snapshot()?),
        })
    }

    pub fn modified<E: FieldSnapshot>(before: &E, after: &E) -> ExpenseResult<Self> {
        Ok(EntityChange {
            table: E::TABLE.to_string(),
            state: EntityState::Modified,
            key: after.entity_key(),
            original: Some(before.snapshot()?),
            current: Some(after.snapshot()?),
        })
    }

    pub fn deleted<E: FieldSnapshot>(entity: &E) -> ExpenseResult<Self> {
        Ok(EntityChange {
            table: E::TABLE.to_string(),
            state: EntityState::Deleted,
            key: entity.entity_key(),
            original: Some(entity.snapshot()?),
            current: None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
struct CapturedChange {
    action: AuditAction,
    table: String,
    record_id: String,
    old_value: Option<FieldMap>,
    new_value: Option<FieldMap>,
}

#[derive(Debug, Clone)]
pub struct AuditContext {
    user_id: String,
    comment: Option<String>,
    restored_from: Option<i64>,
    captured: Vec<CapturedChange>,
}

impl AuditContext {
    /// Blank or missing user falls back to "System"
    pub fn new(user: Option<&str>) -> Self {
        let user_id = user
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .unwrap_or(SYSTEM_USER)
            .to_string();

        AuditContext {
            user_id,
            comment: None,
            restored_from: None,
            captured: Vec::new(),
        }
    }

    pub fn system() -> Self {
        AuditContext::new(None)
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Every record this context writes becomes a `Restored` entry
    pub fn restoring(mut self, audit_id: i64) -> Self {
        self.restored_from = Some(audit_id);
        self
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn len(&self) -> usize {
        self.captured.len()
    }

    pub fn is_empty(&self) -> bool {
        self.captured.is_empty()
    }

    /// Snapshot the pending changes. Returns how many produce a record.
    pub fn capture(&mut self, changes: &[EntityChange]) -> usize {
        let before = self.captured.len();

        for change in changes {
            if change.table == AUDIT_TABLE {
                continue;
            }

            let (action, old_value, new_value) = match change.state {
                EntityState::Unchanged | EntityState::Detached => continue,
                EntityState::Added => (AuditAction::Added, None, change.current.clone()),
                EntityState::Deleted => (AuditAction::Deleted, change.original.clone(), None),
                EntityState::Modified => {
                    let empty = FieldMap::new();
                    let (old, new) = diff_fields(
                        change.original.as_ref().unwrap_or(&empty),
                        change.current.as_ref().unwrap_or(&empty),
                    );
                    if old.is_empty() && new.is_empty() {
                        continue;
                    }
                    (AuditAction::Modified, Some(old), Some(new))
                }
            };

            let action = if self.restored_from.is_some() {
                AuditAction::Restored
            } else {
                action
            };

            self.captured.push(CapturedChange {
                action,
                table: change.table.clone(),
                record_id: change.key.to_record_id(),
                old_value,
                new_value,
            });
        }

        self.captured.len() - before
    }

    /// Records stamped with the commit instant (ids assigned on write)
    pub fn into_records(self, timestamp: DateTime<Utc>) -> Vec<AuditRecord> {
        let AuditContext {
            user_id,
            comment,
            restored_from,
            captured,
        } = self;

        captured
            .into_iter()
            .map(|c| AuditRecord {
                id: 0,
                timestamp,
                user_id: user_id.clone(),
                action: c.action,
                table_name: c.table,
                record_id: c.record_id,
                old_value: c.old_value,
                new_value: c.new_value,
                comment: comment.clone(),
                restored_from,
            })
            .collect()
    }
}

// ============================================================================
// TESTS
// ============================================================================
