// Entity Models
// "Identity persists, values change"
//
// Each entity has:
// - Stable identity (UUID) that NEVER changes
// - A version number for optimistic concurrency
// - A FieldSnapshot implementation so the audit layer can diff it

pub mod transaction;
pub mod trip;

pub use transaction::{
    split_transaction, CabinClass, ExpenseCategory, ManualFlag, PolicyException, SplitPlan,
    Transaction,
};
pub use trip::{find_trip_for, Trip, TripValidationStatus};
