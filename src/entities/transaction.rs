// 💳 Transaction Entity - one financial event on an expense report
//
// Identity: `id` (UUID) never changes.
// Optimistic concurrency: `version` is bumped by the store on every update.
// Split lineage: a split parent has `is_split = true`; each child points back
// through `original_transaction_id`. Child USD amounts sum EXACTLY to the
// parent's USD amount at split time (Decimal equality, never floats).

use crate::audit::snapshot::{EntityKey, FieldSnapshot};
use crate::error::{ExpenseError, ExpenseResult};
use crate::violation::ViolationType;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ============================================================================
// CATEGORY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExpenseCategory {
    Airfare,
    Lodging,
    Meals,
    ClientEntertainment,
    GroundTransportation,
    /// Catch-all for anything not yet classified
    Other,
    NonTravel,
}

impl ExpenseCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExpenseCategory::Airfare => "Airfare",
            ExpenseCategory::Lodging => "Lodging",
            ExpenseCategory::Meals => "Meals",
            ExpenseCategory::ClientEntertainment => "Client Entertainment",
            ExpenseCategory::GroundTransportation => "Ground Transportation",
            ExpenseCategory::Other => "Other",
            ExpenseCategory::NonTravel => "Non-travel",
        }
    }

    /// Parse a free-text category label. Unknown labels land in `Other`.
    pub fn from_label(label: &str) -> Self {
        let normalized: String = label
            .trim()
            .to_lowercase()
            .chars()
            .filter(|c| c.is_alphanumeric())
            .collect();

        match normalized.as_str() {
            "airfare" | "air" | "flight" | "flights" => ExpenseCategory::Airfare,
            "lodging" | "hotel" | "hotels" | "accommodation" => ExpenseCategory::Lodging,
            "meals" | "meal" | "food" => ExpenseCategory::Meals,
            "cliententertainment" | "entertainment" => ExpenseCategory::ClientEntertainment,
            "groundtransportation" | "transportation" | "taxi" | "rail" => {
                ExpenseCategory::GroundTransportation
            }
            "nontravel" => ExpenseCategory::NonTravel,
            _ => ExpenseCategory::Other,
        }
    }

    /// "Other" and "Non-travel" both mean nobody classified the spend yet
    pub fn is_uncategorized(&self) -> bool {
        matches!(self, ExpenseCategory::Other | ExpenseCategory::NonTravel)
    }
}

// ============================================================================
// CABIN CLASS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CabinClass {
    Economy,
    PremiumEconomy,
    Business,
    First,
}

impl CabinClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            CabinClass::Economy => "Economy",
            CabinClass::PremiumEconomy => "Premium Economy",
            CabinClass::Business => "Business",
            CabinClass::First => "First",
        }
    }

    pub fn parse(label: &str) -> Option<Self> {
        let normalized: String = label
            .trim()
            .to_lowercase()
            .chars()
            .filter(|c| c.is_alphanumeric())
            .collect();

        match normalized.as_str() {
            "economy" | "coach" => Some(CabinClass::Economy),
            "premiumeconomy" => Some(CabinClass::PremiumEconomy),
            "business" => Some(CabinClass::Business),
            "first" | "firstclass" => Some(CabinClass::First),
            _ => None,
        }
    }

    /// Business and First are premium cabins for tax reporting
    pub fn is_premium(&self) -> bool {
        matches!(self, CabinClass::Business | CabinClass::First)
    }
}

// ============================================================================
// OVERRIDE STATE
// ============================================================================

/// An approved exception: suppresses one violation type until the
/// transaction's amount, category, or cabin class changes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyException {
    pub violation_type: ViolationType,
    pub approved_by: String,
    pub reason: String,
    pub approved_at: DateTime<Utc>,
}

/// A human-identified issue the automated rules did not catch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualFlag {
    pub violation_type: ViolationType,
    pub reason: String,
    pub flagged_by: String,
    pub flagged_at: DateTime<Utc>,
}

// ============================================================================
// TRANSACTION ENTITY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    // ========================================================================
    // IDENTITY
    // ========================================================================
    /// Stable identity (UUID) - NEVER changes
    pub id: String,

    /// Row version for optimistic concurrency
    pub version: i64,

    // ========================================================================
    // VALUES
    // ========================================================================
    pub transaction_date: NaiveDate,
    pub description: String,
    pub merchant: String,

    /// Amount in the original currency
    pub amount: Decimal,
    pub currency: String,
    pub exchange_rate: Option<Decimal>,

    /// Converted amount; None until an exchange rate is applied
    pub amount_usd: Option<Decimal>,

    pub category: ExpenseCategory,

    /// Owner of the charge
    pub email: String,

    /// At most one trip at a time
    pub trip_id: Option<String>,

    /// Only meaningful for Airfare
    pub cabin_class: Option<CabinClass>,

    /// Comma-delimited participant emails
    pub participants: Option<String>,

    /// Receipt / invoice location
    pub document_url: Option<String>,

    pub is_valid: bool,
    pub participants_validated: bool,

    // ========================================================================
    // SPLIT LINEAGE
    // ========================================================================
    pub is_split: bool,
    pub original_transaction_id: Option<String>,

    // ========================================================================
    // IMPORT / OVERRIDES
    // ========================================================================
    /// Deduplication hash (NOT identity)
    pub import_hash: Option<String>,

    pub approved_exceptions: Vec<PolicyException>,
    pub manual_flags: Vec<ManualFlag>,
}

impl Transaction {
    /// Create a new transaction with a fresh UUID
    pub fn new(
        transaction_date: NaiveDate,
        merchant: impl Into<String>,
        amount: Decimal,
        currency: impl Into<String>,
        category: ExpenseCategory,
        email: impl Into<String>,
    ) -> Self {
        let merchant = merchant.into();
        let currency = currency.into().trim().to_uppercase();

        // USD charges need no conversion
        let (exchange_rate, amount_usd) = if currency == "USD" {
            (Some(Decimal::ONE), Some(amount))
        } else {
            (None, None)
        };

        Transaction {
            id: uuid::Uuid::new_v4().to_string(),
            version: 1,
            transaction_date,
            description: merchant.clone(),
            merchant,
            amount,
            currency,
            exchange_rate,
            amount_usd,
            category,
            email: email.into(),
            trip_id: None,
            cabin_class: None,
            participants: None,
            document_url: None,
            is_valid: true,
            participants_validated: false,
            is_split: false,
            original_transaction_id: None,
            import_hash: None,
            approved_exceptions: Vec::new(),
            manual_flags: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_cabin_class(mut self, cabin_class: CabinClass) -> Self {
        self.cabin_class = Some(cabin_class);
        self
    }

    pub fn with_participants(mut self, participants: impl Into<String>) -> Self {
        self.participants = Some(participants.into());
        self
    }

    pub fn with_document_url(mut self, url: impl Into<String>) -> Self {
        self.document_url = Some(url.into());
        self
    }

    pub fn with_trip(mut self, trip_id: impl Into<String>) -> Self {
        self.trip_id = Some(trip_id.into());
        self
    }

    /// Apply an exchange rate: `amount_usd = round(amount * rate, 2)`
    pub fn convert_to_usd(&mut self, rate: Decimal) -> ExpenseResult<()> {
        if rate <= Decimal::ZERO {
            return Err(ExpenseError::validation(format!(
                "Exchange rate must be positive, got {}",
                rate
            )));
        }
        let usd = self.amount.checked_mul(rate).ok_or_else(|| {
            ExpenseError::validation(format!("{} * {} overflows", self.amount, rate))
        })?;
        self.exchange_rate = Some(rate);
        self.amount_usd = Some(usd.round_dp(2));
        Ok(())
    }

    /// Participant emails, trimmed, blanks dropped
    pub fn participant_list(&self) -> Vec<String> {
        self.participants
            .as_deref()
            .unwrap_or("")
            .split(',')
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .map(|p| p.to_string())
            .collect()
    }

    pub fn has_participants(&self) -> bool {
        !self.participant_list().is_empty()
    }

    pub fn has_documentation(&self) -> bool {
        self.document_url
            .as_deref()
            .map_or(false, |url| !url.trim().is_empty())
    }

    pub fn is_split_child(&self) -> bool {
        self.original_transaction_id.is_some()
    }

    /// Parent or child of a split
    pub fn in_split_lineage(&self) -> bool {
        self.is_split || self.is_split_child()
    }

    pub fn is_exception_approved(&self, violation_type: ViolationType) -> bool {
        self.approved_exceptions
            .iter()
            .any(|e| e.violation_type == violation_type)
    }

    /// Record an approved exception (replaces an earlier one of the same type)
    pub fn approve_exception(
        &mut self,
        violation_type: ViolationType,
        approved_by: impl Into<String>,
        reason: impl Into<String>,
        approved_at: DateTime<Utc>,
    ) {
        self.approved_exceptions
            .retain(|e| e.violation_type != violation_type);
        self.approved_exceptions.push(PolicyException {
            violation_type,
            approved_by: approved_by.into(),
            reason: reason.into(),
            approved_at,
        });
    }

    pub fn flag(
        &mut self,
        violation_type: ViolationType,
        reason: impl Into<String>,
        flagged_by: impl Into<String>,
        flagged_at: DateTime<Utc>,
    ) {
        self.manual_flags.push(ManualFlag {
            violation_type,
            reason: reason.into(),
            flagged_by: flagged_by.into(),
            flagged_at,
        });
    }

    /// Did any field that approvals depend on change?
    pub fn policy_fields_changed(&self, other: &Transaction) -> bool {
        self.amount != other.amount
            || self.amount_usd != other.amount_usd
            || self.category != other.category
            || self.cabin_class != other.cabin_class
    }

    pub fn void_exceptions(&mut self) {
        self.approved_exceptions.clear();
    }

    /// Hash for duplicate detection on import
    /// NOTE: This is for DEDUPLICATION, not IDENTITY!
    pub fn compute_import_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!(
            "{}|{}|{}|{}|{}",
            self.transaction_date,
            self.amount.normalize(),
            self.currency,
            self.merchant.to_lowercase(),
            self.email.to_lowercase()
        ));
        format!("{:x}", hasher.finalize())
    }
}

impl FieldSnapshot for Transaction {
    const TABLE: &'static str = "Transaction";

    fn entity_key(&self) -> EntityKey {
        EntityKey::single(self.id.clone())
    }
}

// ============================================================================
// SPLIT
// ============================================================================

/// Outcome of a split: the parent marked split, plus its new children
#[derive(Debug, Clone)]
pub struct SplitPlan {
    pub parent: Transaction,
    pub children: Vec<Transaction>,
}

/// Divide one charge into children whose USD amounts sum exactly to the
/// parent's USD amount. Nothing is written; the caller commits the plan.
pub fn split_transaction(parent: &Transaction, parts_usd: &[Decimal]) -> ExpenseResult<SplitPlan> {
    let parent_usd = parent.amount_usd.ok_or_else(|| {
        ExpenseError::validation(format!(
            "Transaction {} has no USD amount to split",
            parent.id
        ))
    })?;

    if parent.is_split {
        return Err(ExpenseError::validation(format!(
            "Transaction {} is already split",
            parent.id
        )));
    }
    if parent.is_split_child() {
        return Err(ExpenseError::validation(format!(
            "Transaction {} is a split child and cannot be split again",
            parent.id
        )));
    }
    if parts_usd.is_empty() {
        return Err(ExpenseError::validation("A split needs at least one part"));
    }
    if let Some(bad) = parts_usd.iter().find(|p| **p <= Decimal::ZERO) {
        return Err(ExpenseError::validation(format!(
            "Split parts must be positive, got {}",
            bad
        )));
    }

    let total = parts_usd
        .iter()
        .try_fold(Decimal::ZERO, |acc, part| acc.checked_add(*part))
        .ok_or_else(|| ExpenseError::validation("Split parts overflow"))?;
    if total != parent_usd {
        return Err(ExpenseError::validation(format!(
            "Split parts sum to {} but transaction {} is {} USD",
            total, parent.id, parent_usd
        )));
    }

    let children = parts_usd
        .iter()
        .map(|part| {
            let mut child = parent.clone();
            child.id = uuid::Uuid::new_v4().to_string();
            child.version = 1;
            child.amount_usd = Some(*part);
            child.amount = if parent_usd.is_zero() {
                *part
            } else {
                parent
                    .amount
                    .checked_mul(*part)
                    .and_then(|scaled| scaled.checked_div(parent_usd))
                    .ok_or_else(|| ExpenseError::validation("Split part amount overflows"))?
                    .round_dp(2)
            };
            child.is_split = false;
            child.original_transaction_id = Some(parent.id.clone());
            child.import_hash = None;
            child.approved_exceptions.clear();
            child.manual_flags.clear();
            Ok(child)
        })
        .collect::<ExpenseResult<Vec<_>>>()?;

    let mut updated_parent = parent.clone();
    updated_parent.is_split = true;

    Ok(SplitPlan {
        parent: updated_parent,
        children,
    })
}

// ============================================================================
// TESTS
// ============================================================================
