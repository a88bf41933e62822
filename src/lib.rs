// Expense Compliance - Core Library
// Exposes all modules for use in CLI, API server, and tests

pub mod error;
pub mod config;
pub mod entities;       // Transaction, Trip
pub mod violation;      // Severity, PolicyViolation, PolicyComplianceResult
pub mod policy;         // Thresholds as data
pub mod tax;            // Fiscal tax exposure
pub mod compliance;     // Rule engine
pub mod report;         // Severity-ranked report
pub mod audit;          // Change tracking + restore
pub mod db;             // SQLite store / unit of work
pub mod import;         // CSV import

// Re-export commonly used types
pub use error::{ExpenseError, ExpenseResult};
pub use config::AppConfig;
pub use entities::{
    find_trip_for, split_transaction, CabinClass, ExpenseCategory, ManualFlag, PolicyException,
    SplitPlan, Transaction, Trip, TripValidationStatus,
};
pub use violation::{PolicyComplianceResult, PolicyViolation, Severity, ViolationType};
pub use policy::{PolicyRuleSet, PolicyRules};
pub use tax::{calculate_tax_exposure, TaxExposureResult, TaxRule, TaxRuleTable};
pub use compliance::{ComplianceEngine, ComplianceRequest};
pub use report::{ComplianceReport, RankedViolation, SeverityCounts};
pub use audit::{
    AuditAction, AuditContext, AuditRecord, AuditStats, EntityChange, EntityKey, EntityState,
    FieldMap, FieldSnapshot,
};
pub use db::{setup_database, ChangeSet, ExpenseStore, PendingChange, SaveOutcome, TrackedEntity};
pub use import::{import_csv, import_transactions, load_csv, load_csv_from_reader, ImportSummary};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
