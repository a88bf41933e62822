// 🚦 Violations - severity order, violation kinds, compliance results
//
// Severity has ONE explicit total order: Low < Medium < High < Critical.
// It is defined by rank(), never by enum declaration order.

use crate::tax::TaxExposureResult;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

// ============================================================================
// SEVERITY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Position in the total order (Low = 1 … Critical = 4)
    pub fn rank(&self) -> u8 {
        match self {
            Severity::Low => 1,
            Severity::Medium => 2,
            Severity::High => 3,
            Severity::Critical => 4,
        }
    }

    /// Compare two severities by urgency
    pub fn compare(a: Severity, b: Severity) -> Ordering {
        a.rank().cmp(&b.rank())
    }

    /// Most urgent severity in a set, if any
    pub fn max_of<I: IntoIterator<Item = Severity>>(severities: I) -> Option<Severity> {
        severities.into_iter().max_by(|a, b| Severity::compare(*a, *b))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "Low",
            Severity::Medium => "Medium",
            Severity::High => "High",
            Severity::Critical => "Critical",
        }
    }
}

impl PartialOrd for Severity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Severity {
    fn cmp(&self, other: &Self) -> Ordering {
        Severity::compare(*self, *other)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// VIOLATION TYPE
// ============================================================================

/// Kinds of policy violation, listed in rule-evaluation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ViolationType {
    HighValueMeal,
    LowValueLodging,
    PremiumCabinClass,
    MissingParticipants,
    MissingDocumentation,
    UncategorizedTransaction,
    InvalidCurrency,
    ExcessiveSpending,
    /// Raised by a reviewer, not by an automated rule
    ManualReview,
}

impl ViolationType {
    /// Severity a rule of this kind carries
    pub fn default_severity(&self) -> Severity {
        match self {
            ViolationType::HighValueMeal => Severity::Medium,
            ViolationType::LowValueLodging => Severity::Low,
            ViolationType::PremiumCabinClass => Severity::High,
            ViolationType::MissingParticipants => Severity::Medium,
            ViolationType::MissingDocumentation => Severity::High,
            ViolationType::UncategorizedTransaction => Severity::Low,
            ViolationType::InvalidCurrency => Severity::Medium,
            ViolationType::ExcessiveSpending => Severity::High,
            ViolationType::ManualReview => Severity::Medium,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationType::HighValueMeal => "HighValueMeal",
            ViolationType::LowValueLodging => "LowValueLodging",
            ViolationType::PremiumCabinClass => "PremiumCabinClass",
            ViolationType::MissingParticipants => "MissingParticipants",
            ViolationType::MissingDocumentation => "MissingDocumentation",
            ViolationType::UncategorizedTransaction => "UncategorizedTransaction",
            ViolationType::InvalidCurrency => "InvalidCurrency",
            ViolationType::ExcessiveSpending => "ExcessiveSpending",
            ViolationType::ManualReview => "ManualReview",
        }
    }
}

impl fmt::Display for ViolationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// POLICY VIOLATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyViolation {
    pub violation_type: ViolationType,
    pub severity: Severity,

    /// Human-readable rule that fired
    pub rule: String,

    pub threshold_value: Option<Decimal>,
    pub actual_value: Option<Decimal>,
    pub requires_approval: bool,
}

impl PolicyViolation {
    pub fn new(violation_type: ViolationType, rule: impl Into<String>) -> Self {
        PolicyViolation {
            violation_type,
            severity: violation_type.default_severity(),
            rule: rule.into(),
            threshold_value: None,
            actual_value: None,
            requires_approval: false,
        }
    }

    pub fn with_values(mut self, threshold: Decimal, actual: Decimal) -> Self {
        self.threshold_value = Some(threshold);
        self.actual_value = Some(actual);
        self
    }

    pub fn requiring_approval(mut self, requires: bool) -> Self {
        self.requires_approval = requires;
        self
    }
}

// ============================================================================
// COMPLIANCE RESULT
// ============================================================================

/// Computed view of one transaction's compliance. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyComplianceResult {
    pub transaction_id: String,

    /// True iff `violations` is empty
    pub is_compliant: bool,

    /// In rule-evaluation order, not severity order
    pub violations: Vec<PolicyViolation>,

    /// Evaluation instant supplied by the caller
    pub evaluated_at: DateTime<Utc>,

    /// Standalone tax exposure of this transaction within its trip, when a
    /// trip and a tax rule were supplied
    pub tax_exposure: Option<TaxExposureResult>,
}

impl PolicyComplianceResult {
    pub fn new(
        transaction_id: impl Into<String>,
        violations: Vec<PolicyViolation>,
        evaluated_at: DateTime<Utc>,
    ) -> Self {
        PolicyComplianceResult {
            transaction_id: transaction_id.into(),
            is_compliant: violations.is_empty(),
            violations,
            evaluated_at,
            tax_exposure: None,
        }
    }

    pub fn highest_severity(&self) -> Option<Severity> {
        Severity::max_of(self.violations.iter().map(|v| v.severity))
    }

    pub fn requires_approval(&self) -> bool {
        self.violations.iter().any(|v| v.requires_approval)
    }

    pub fn has_violation(&self, violation_type: ViolationType) -> bool {
        self.violations
            .iter()
            .any(|v| v.violation_type == violation_type)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_total_order() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
        assert_eq!(
            Severity::compare(Severity::Critical, Severity::Low),
            Ordering::Greater
        );
    }

    #[test]
    fn test_severity_max_of() {
        let max = Severity::max_of([Severity::Medium, Severity::High, Severity::Low]);
        assert_eq!(max, Some(Severity::High));
        assert_eq!(Severity::max_of(Vec::new()), None);
    }

    #[test]
    fn test_result_compliant_iff_empty() {
        let now = Utc::now();
        let clean = PolicyComplianceResult::new("tx-1", vec![], now);
        assert!(clean.is_compliant);
        assert_eq!(clean.highest_severity(), None);

        let dirty = PolicyComplianceResult::new(
            "tx-2",
            vec![PolicyViolation::new(ViolationType::HighValueMeal, "meal over cap")
                .requiring_approval(true)],
            now,
        );
        assert!(!dirty.is_compliant);
        assert!(dirty.requires_approval());
        assert_eq!(dirty.highest_severity(), Some(Severity::Medium));
        assert!(dirty.has_violation(ViolationType::HighValueMeal));
    }
}
