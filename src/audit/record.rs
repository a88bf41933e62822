// 📜 Audit Record - one immutable row of the change history

use crate::audit::snapshot::FieldMap;
use crate::error::{ExpenseError, ExpenseResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Table name used by audit records themselves; never audited
pub const AUDIT_TABLE: &str = "AuditRecord";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditAction {
    Added,
    Modified,
    Deleted,
    Restored,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Added => "Added",
            AuditAction::Modified => "Modified",
            AuditAction::Deleted => "Deleted",
            AuditAction::Restored => "Restored",
        }
    }

    pub fn parse(value: &str) -> ExpenseResult<Self> {
        match value {
            "Added" => Ok(AuditAction::Added),
            "Modified" => Ok(AuditAction::Modified),
            "Deleted" => Ok(AuditAction::Deleted),
            "Restored" => Ok(AuditAction::Restored),
            other => Err(ExpenseError::validation(format!(
                "Unknown audit action '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Written once at commit time, never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Assigned by the store; 0 until written
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    pub action: AuditAction,
    pub table_name: String,

    /// Raw id, or a JSON object for composite keys
    pub record_id: String,

    /// Prior values: every field for Deleted, changed fields for Modified
    pub old_value: Option<FieldMap>,

    /// New values: every field for Added, changed fields for Modified
    pub new_value: Option<FieldMap>,

    pub comment: Option<String>,

    /// Audit record a Restored entry was replayed from
    pub restored_from: Option<i64>,
}

impl AuditRecord {
    pub fn changed_fields(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .old_value
            .iter()
            .chain(self.new_value.iter())
            .flat_map(|m| m.keys().map(|k| k.as_str()))
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }
}

// ============================================================================
// TESTS
// ============================================================================
