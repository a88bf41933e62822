// ✈️ Trip Entity - a date range of travel owned by one employee
//
// Duration is derived from the date range every time it is read; it is never
// stored separately, so it cannot drift from start/end.

use crate::audit::snapshot::{EntityKey, FieldSnapshot};
use crate::entities::transaction::Transaction;
use crate::error::{ExpenseError, ExpenseResult};
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

// ============================================================================
// VALIDATION STATUS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TripValidationStatus {
    NotReadyToValidate,
    ReadyToValidate,
    Validated,
}

impl TripValidationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TripValidationStatus::NotReadyToValidate => "NotReadyToValidate",
            TripValidationStatus::ReadyToValidate => "ReadyToValidate",
            TripValidationStatus::Validated => "Validated",
        }
    }

    /// Forward one step at a time; any state may fall back to the start
    pub fn can_transition_to(&self, next: TripValidationStatus) -> bool {
        use TripValidationStatus::*;
        matches!(
            (self, next),
            (NotReadyToValidate, ReadyToValidate)
                | (ReadyToValidate, Validated)
                | (_, NotReadyToValidate)
        )
    }
}

// ============================================================================
// TRIP ENTITY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trip {
    /// Stable identity (UUID)
    pub id: String,

    /// Row version for optimistic concurrency
    pub version: i64,

    pub name: String,
    pub owner_email: String,

    /// Legal entity the traveler is employed by (tax rules are per subsidiary)
    pub subsidiary: String,

    pub start_date: NaiveDate,
    pub end_date: NaiveDate,

    pub primary_country: String,
    pub primary_city: String,
    pub secondary_country: Option<String>,
    pub secondary_city: Option<String>,

    pub validation_status: TripValidationStatus,
}

impl Trip {
    /// Create a trip; fails if the range ends before it starts
    pub fn new(
        name: impl Into<String>,
        owner_email: impl Into<String>,
        subsidiary: impl Into<String>,
        start_date: NaiveDate,
        end_date: NaiveDate,
        primary_country: impl Into<String>,
        primary_city: impl Into<String>,
    ) -> ExpenseResult<Self> {
        check_range(start_date, end_date)?;

        Ok(Trip {
            id: uuid::Uuid::new_v4().to_string(),
            version: 1,
            name: name.into(),
            owner_email: owner_email.into(),
            subsidiary: subsidiary.into(),
            start_date,
            end_date,
            primary_country: primary_country.into(),
            primary_city: primary_city.into(),
            secondary_country: None,
            secondary_city: None,
            validation_status: TripValidationStatus::NotReadyToValidate,
        })
    }

    pub fn with_secondary(mut self, country: impl Into<String>, city: impl Into<String>) -> Self {
        self.secondary_country = Some(country.into());
        self.secondary_city = Some(city.into());
        self
    }

    /// Inclusive day count. Zero or negative only for a corrupt range.
    pub fn duration(&self) -> i64 {
        (self.end_date - self.start_date).num_days() + 1
    }

    /// Fiscal year used to pick the tax rule (calendar year of departure)
    pub fn fiscal_year(&self) -> i32 {
        self.start_date.year()
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start_date <= date && date <= self.end_date
    }

    /// Move the date range. Any validation done against the old range is void.
    pub fn set_dates(&mut self, start_date: NaiveDate, end_date: NaiveDate) -> ExpenseResult<()> {
        check_range(start_date, end_date)?;
        self.start_date = start_date;
        self.end_date = end_date;
        self.validation_status = TripValidationStatus::NotReadyToValidate;
        Ok(())
    }

    pub fn transition_to(&mut self, next: TripValidationStatus) -> ExpenseResult<()> {
        if !self.validation_status.can_transition_to(next) {
            return Err(ExpenseError::validation(format!(
                "Trip {} cannot move from {} to {}",
                self.id,
                self.validation_status.as_str(),
                next.as_str()
            )));
        }
        self.validation_status = next;
        Ok(())
    }
}

fn check_range(start_date: NaiveDate, end_date: NaiveDate) -> ExpenseResult<()> {
    if end_date < start_date {
        return Err(ExpenseError::validation(format!(
            "Trip ends ({}) before it starts ({})",
            end_date, start_date
        )));
    }
    Ok(())
}

impl FieldSnapshot for Trip {
    const TABLE: &'static str = "Trip";

    fn entity_key(&self) -> EntityKey {
        EntityKey::single(self.id.clone())
    }
}

// ============================================================================
// TRIP MATCHING
// ============================================================================

/// Trip of the same owner whose range covers the transaction date.
/// On overlap the trip that started first wins.
pub fn find_trip_for<'a>(tx: &Transaction, trips: &'a [Trip]) -> Option<&'a Trip> {
    trips
        .iter()
        .filter(|trip| trip.owner_email.eq_ignore_ascii_case(&tx.email))
        .filter(|trip| trip.contains(tx.transaction_date))
        .min_by(|a, b| a.start_date.cmp(&b.start_date).then_with(|| a.id.cmp(&b.id)))
}

// ============================================================================
// TESTS
// ============================================================================
