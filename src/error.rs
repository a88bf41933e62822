// ⚠️ Error Taxonomy
// Every failure the core can surface to a caller, in one enum.
//
// A missing tax rule is NOT here: it means zero exposure, not an error.

use thiserror::Error;

/// Errors from the expense compliance core
#[derive(Debug, Error)]
pub enum ExpenseError {
    /// Referenced transaction, trip, or audit record does not exist
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Operation aborted before any write
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The store saw a conflicting concurrent update (no retry is attempted)
    #[error("Concurrency conflict on {entity} {id}: row changed or removed since it was read")]
    ConcurrencyConflict { entity: &'static str, id: String },

    /// Primary mutation is committed, the audit trail for it is not
    #[error("Audit write failed after commit: {0}")]
    AuditWrite(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl ExpenseError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        ExpenseError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn validation(reason: impl Into<String>) -> Self {
        ExpenseError::Validation(reason.into())
    }

    /// False only for audit-write failures: the data change itself went through.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ExpenseError::AuditWrite(_))
    }
}

/// Result type for expense compliance operations
pub type ExpenseResult<T> = Result<T, ExpenseError>;
