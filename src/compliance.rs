// 🛂 Compliance Engine - policy rules evaluated against one transaction
//
// Pure function of (transaction, trip, rules, tax rule, same-day siblings,
// evaluation instant). No I/O, no clock reads, no shared mutable state:
// safe to call from any number of threads at once.
//
// Rules run in a FIXED order and each one is independent:
//   1. HighValueMeal          5. MissingDocumentation
//   2. LowValueLodging        6. UncategorizedTransaction
//   3. PremiumCabinClass      7. InvalidCurrency
//   4. MissingParticipants    8. ExcessiveSpending
// Manual flags follow, then approved exceptions are removed.
// Sorting by severity is the caller's business.

use crate::entities::transaction::{ExpenseCategory, Transaction};
use crate::entities::trip::Trip;
use crate::policy::{PolicyRuleSet, PolicyRules};
use crate::tax::{calculate_tax_exposure, TaxRule, TaxRuleTable};
use crate::violation::{PolicyComplianceResult, PolicyViolation, ViolationType};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;

// ============================================================================
// REQUEST
// ============================================================================

/// Everything one evaluation reads
#[derive(Debug, Clone, Copy)]
pub struct ComplianceRequest<'a> {
    pub transaction: &'a Transaction,
    pub trip: Option<&'a Trip>,
    pub tax_rule: Option<&'a TaxRule>,

    /// The owner's transactions on the same calendar day, from one read view.
    /// May or may not contain `transaction` itself.
    pub same_day_transactions: &'a [Transaction],

    pub evaluated_at: DateTime<Utc>,
}

impl<'a> ComplianceRequest<'a> {
    pub fn new(transaction: &'a Transaction, evaluated_at: DateTime<Utc>) -> Self {
        ComplianceRequest {
            transaction,
            trip: None,
            tax_rule: None,
            same_day_transactions: &[],
            evaluated_at,
        }
    }

    pub fn with_trip(mut self, trip: Option<&'a Trip>) -> Self {
        self.trip = trip;
        self
    }

    pub fn with_tax_rule(mut self, tax_rule: Option<&'a TaxRule>) -> Self {
        self.tax_rule = tax_rule;
        self
    }

    pub fn with_same_day(mut self, transactions: &'a [Transaction]) -> Self {
        self.same_day_transactions = transactions;
        self
    }
}

// ============================================================================
// ENGINE
// ============================================================================

#[derive(Debug, Clone)]
pub struct ComplianceEngine {
    rules: Arc<PolicyRules>,
}

impl ComplianceEngine {
    pub fn new(rules: Arc<PolicyRules>) -> Self {
        ComplianceEngine { rules }
    }

    /// Engine bound to the snapshot in effect right now
    pub fn from_rule_set(rule_set: &PolicyRuleSet) -> Self {
        ComplianceEngine::new(rule_set.current())
    }

    pub fn rules(&self) -> &PolicyRules {
        &self.rules
    }

    /// Evaluate one transaction
    pub fn check_compliance(&self, request: &ComplianceRequest<'_>) -> PolicyComplianceResult {
        let tx = request.transaction;

        let mut violations: Vec<PolicyViolation> = [
            self.check_high_value_meal(tx),
            self.check_low_value_lodging(tx),
            self.check_premium_cabin(tx),
            self.check_missing_participants(tx),
            self.check_missing_documentation(tx, request.evaluated_at),
            self.check_uncategorized(tx),
            self.check_currency(tx),
            self.check_excessive_spending(tx, request.same_day_transactions),
        ]
        .into_iter()
        .flatten()
        .collect();

        for flag in &tx.manual_flags {
            if violations.iter().any(|v| v.violation_type == flag.violation_type) {
                continue;
            }
            let mut violation = PolicyViolation::new(flag.violation_type, flag.reason.clone())
                .requiring_approval(true);
            if flag.violation_type == ViolationType::ManualReview {
                violation.rule = format!("Flagged by {}: {}", flag.flagged_by, flag.reason);
            }
            violations.push(violation);
        }

        let before = violations.len();
        violations.retain(|v| !tx.is_exception_approved(v.violation_type));
        let suppressed = before - violations.len();

        let mut result = PolicyComplianceResult::new(tx.id.clone(), violations, request.evaluated_at);

        if let (Some(trip), Some(rule)) = (request.trip, request.tax_rule) {
            result.tax_exposure = Some(calculate_tax_exposure(
                trip,
                std::slice::from_ref(tx),
                Some(rule),
            ));
        }

        tracing::debug!(
            transaction_id = %tx.id,
            violations = result.violations.len(),
            suppressed,
            "compliance evaluated"
        );

        result
    }

    /// Evaluate a batch read from one snapshot. Same-day siblings and trips
    /// are taken from the batch itself.
    pub fn check_all(
        &self,
        transactions: &[Transaction],
        trips: &[Trip],
        tax_rules: &TaxRuleTable,
        evaluated_at: DateTime<Utc>,
    ) -> Vec<PolicyComplianceResult> {
        let mut by_owner_day: HashMap<(String, chrono::NaiveDate), Vec<Transaction>> = HashMap::new();
        for tx in transactions {
            by_owner_day
                .entry((tx.email.to_lowercase(), tx.transaction_date))
                .or_default()
                .push(tx.clone());
        }

        transactions
            .iter()
            .map(|tx| {
                let trip = tx
                    .trip_id
                    .as_deref()
                    .and_then(|id| trips.iter().find(|t| t.id == id));
                let tax_rule = trip.and_then(|t| tax_rules.for_trip(t));
                let siblings = by_owner_day
                    .get(&(tx.email.to_lowercase(), tx.transaction_date))
                    .map(|v| v.as_slice())
                    .unwrap_or(&[]);

                let request = ComplianceRequest::new(tx, evaluated_at)
                    .with_trip(trip)
                    .with_tax_rule(tax_rule)
                    .with_same_day(siblings);
                self.check_compliance(&request)
            })
            .collect()
    }

    // ========================================================================
    // RULES
    // ========================================================================

    fn check_high_value_meal(&self, tx: &Transaction) -> Option<PolicyViolation> {
        let usd = tx.amount_usd?;
        let threshold = self.rules.high_value_meal_threshold;
        if tx.category != ExpenseCategory::Meals || usd <= threshold {
            return None;
        }
        Some(
            PolicyViolation::new(
                ViolationType::HighValueMeal,
                format!("Meal of {} USD exceeds the {} USD high-value meal threshold", usd, threshold),
            )
            .with_values(threshold, usd)
            .requiring_approval(true),
        )
    }

    /// Informational: cheap lodging usually means a misclassified charge or
    /// missing nights. Flags BELOW the threshold.
    fn check_low_value_lodging(&self, tx: &Transaction) -> Option<PolicyViolation> {
        let usd = tx.amount_usd?;
        let threshold = self.rules.low_value_lodging_threshold;
        if tx.category != ExpenseCategory::Lodging || usd >= threshold {
            return None;
        }
        Some(
            PolicyViolation::new(
                ViolationType::LowValueLodging,
                format!(
                    "Lodging of {} USD is below {} USD; check for misclassification or missing charges",
                    usd, threshold
                ),
            )
            .with_values(threshold, usd),
        )
    }

    fn check_premium_cabin(&self, tx: &Transaction) -> Option<PolicyViolation> {
        let cabin = tx.cabin_class?;
        if tx.category != ExpenseCategory::Airfare || !self.rules.is_premium_cabin(cabin) {
            return None;
        }
        Some(
            PolicyViolation::new(
                ViolationType::PremiumCabinClass,
                format!("{} cabin is a premium class", cabin.as_str()),
            )
            .requiring_approval(self.rules.premium_cabin_requires_approval),
        )
    }

    fn check_missing_participants(&self, tx: &Transaction) -> Option<PolicyViolation> {
        let needs_participants = match tx.category {
            ExpenseCategory::ClientEntertainment => true,
            ExpenseCategory::Meals => self.rules.meals_require_participants,
            _ => false,
        };
        if !needs_participants || tx.has_participants() {
            return None;
        }
        Some(PolicyViolation::new(
            ViolationType::MissingParticipants,
            format!("{} requires a participant list", tx.category.as_str()),
        ))
    }

    fn check_missing_documentation(
        &self,
        tx: &Transaction,
        evaluated_at: DateTime<Utc>,
    ) -> Option<PolicyViolation> {
        let usd = tx.amount_usd?;
        let threshold = self.rules.documentation_required_threshold;
        if usd <= threshold || tx.has_documentation() {
            return None;
        }

        let age_days = (evaluated_at.date_naive() - tx.transaction_date).num_days();
        if age_days <= self.rules.documentation_grace_period_days {
            return None;
        }

        Some(
            PolicyViolation::new(
                ViolationType::MissingDocumentation,
                format!(
                    "No receipt for {} USD after {} days (grace period {} days)",
                    usd, age_days, self.rules.documentation_grace_period_days
                ),
            )
            .with_values(threshold, usd)
            .requiring_approval(true),
        )
    }

    fn check_uncategorized(&self, tx: &Transaction) -> Option<PolicyViolation> {
        if !tx.category.is_uncategorized() || !self.rules.uncategorized_requires_review {
            return None;
        }
        Some(PolicyViolation::new(
            ViolationType::UncategorizedTransaction,
            format!("Category '{}' needs review", tx.category.as_str()),
        ))
    }

    fn check_currency(&self, tx: &Transaction) -> Option<PolicyViolation> {
        if self.rules.is_approved_currency(&tx.currency) {
            return None;
        }
        Some(PolicyViolation::new(
            ViolationType::InvalidCurrency,
            format!("Currency '{}' is not approved", tx.currency),
        ))
    }

    /// Same-day total for the owner, INCLUDING the transaction being checked.
    fn check_excessive_spending(
        &self,
        tx: &Transaction,
        same_day: &[Transaction],
    ) -> Option<PolicyViolation> {
        let own = if tx.is_split {
            Decimal::ZERO
        } else {
            tx.amount_usd.unwrap_or(Decimal::ZERO)
        };

        let siblings: Decimal = same_day
            .iter()
            .filter(|s| s.id != tx.id)
            .filter(|s| !s.is_split)
            .filter(|s| s.email.eq_ignore_ascii_case(&tx.email))
            .filter(|s| s.transaction_date == tx.transaction_date)
            .filter_map(|s| s.amount_usd)
            .fold(Decimal::ZERO, Decimal::saturating_add);

        let total = own.saturating_add(siblings);
        let limit = self.rules.excessive_spending_daily_limit;
        if total <= limit {
            return None;
        }
        Some(
            PolicyViolation::new(
                ViolationType::ExcessiveSpending,
                format!(
                    "{} spent {} USD on {}, over the {} USD daily limit",
                    tx.email, total, tx.transaction_date, limit
                ),
            )
            .with_values(limit, total)
            .requiring_approval(true),
        )
    }
}

impl Default for ComplianceEngine {
    fn default() -> Self {
        ComplianceEngine::new(Arc::new(PolicyRules::default()))
    }
}

// ============================================================================
// TESTS
// ============================================================================
