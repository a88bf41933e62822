// 📊 Compliance Report - severity-ranked view over many results
//
// Input order is preserved inside each severity band, so two runs over the
// same results produce the same report.

use crate::violation::{PolicyComplianceResult, PolicyViolation, Severity};
use serde::{Deserialize, Serialize};

/// One violation with the transaction it belongs to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedViolation {
    pub transaction_id: String,
    pub violation: PolicyViolation,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityCounts {
    pub critical: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

impl SeverityCounts {
    fn add(&mut self, severity: Severity) {
        match severity {
            Severity::Critical => self.critical += 1,
            Severity::High => self.high += 1,
            Severity::Medium => self.medium += 1,
            Severity::Low => self.low += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.critical + self.high + self.medium + self.low
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceReport {
    pub total_transactions: usize,
    pub compliant: usize,
    pub non_compliant: usize,
    pub requiring_approval: usize,
    pub by_severity: SeverityCounts,

    /// Highest severity first, then evaluation order
    pub violations: Vec<RankedViolation>,
}

impl ComplianceReport {
    pub fn from_results(results: &[PolicyComplianceResult]) -> Self {
        let mut by_severity = SeverityCounts::default();
        let mut violations = Vec::new();

        for result in results {
            for violation in &result.violations {
                by_severity.add(violation.severity);
                violations.push(RankedViolation {
                    transaction_id: result.transaction_id.clone(),
                    violation: violation.clone(),
                });
            }
        }

        // stable sort keeps evaluation order within a severity
        violations.sort_by(|a, b| Severity::compare(b.violation.severity, a.violation.severity));

        let compliant = results.iter().filter(|r| r.is_compliant).count();

        ComplianceReport {
            total_transactions: results.len(),
            compliant,
            non_compliant: results.len() - compliant,
            requiring_approval: results.iter().filter(|r| r.requires_approval()).count(),
            by_severity,
            violations,
        }
    }

    pub fn highest_severity(&self) -> Option<Severity> {
        self.violations.first().map(|v| v.violation.severity)
    }

    /// Print summary to console
    pub fn print_summary(&self) {
        println!("\n📊 Compliance Report");
        println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        println!("Transactions:        {}", self.total_transactions);
        println!("✅ Compliant:        {}", self.compliant);
        println!("❌ Non-compliant:    {}", self.non_compliant);
        println!("📝 Need approval:    {}", self.requiring_approval);
        println!(
            "Violations:          {} (critical {}, high {}, medium {}, low {})",
            self.by_severity.total(),
            self.by_severity.critical,
            self.by_severity.high,
            self.by_severity.medium,
            self.by_severity.low
        );

        for ranked in &self.violations {
            println!(
                "  [{:<8}] {} {}: {}",
                ranked.violation.severity.as_str(),
                ranked.transaction_id,
                ranked.violation.violation_type.as_str(),
                ranked.violation.rule
            );
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::violation::ViolationType;
    use chrono::{TimeZone, Utc};

    fn result(id: &str, types: &[ViolationType]) -> PolicyComplianceResult {
        let violations = types
            .iter()
            .map(|t| PolicyViolation::new(*t, t.as_str()).requiring_approval(*t == ViolationType::HighValueMeal))
            .collect();
        PolicyComplianceResult::new(id, violations, Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap())
    }

    #[test]
    fn test_counts() {
        let results = vec![
            result("a", &[]),
            result("b", &[ViolationType::HighValueMeal, ViolationType::InvalidCurrency]),
            result("c", &[ViolationType::LowValueLodging]),
        ];

        let report = ComplianceReport::from_results(&results);

        assert_eq!(report.total_transactions, 3);
        assert_eq!(report.compliant, 1);
        assert_eq!(report.non_compliant, 2);
        assert_eq!(report.requiring_approval, 1);
        assert_eq!(report.by_severity.medium, 2);
        assert_eq!(report.by_severity.low, 1);
        assert_eq!(report.by_severity.total(), 3);
    }

    #[test]
    fn test_sorted_by_severity_then_evaluation_order() {
        let results = vec![
            result("a", &[ViolationType::LowValueLodging, ViolationType::HighValueMeal]),
            result("b", &[ViolationType::PremiumCabinClass, ViolationType::InvalidCurrency]),
        ];

        let report = ComplianceReport::from_results(&results);
        let order: Vec<(&str, ViolationType)> = report
            .violations
            .iter()
            .map(|v| (v.transaction_id.as_str(), v.violation.violation_type))
            .collect();

        assert_eq!(
            order,
            vec![
                ("b", ViolationType::PremiumCabinClass),
                ("a", ViolationType::HighValueMeal),
                ("b", ViolationType::InvalidCurrency),
                ("a", ViolationType::LowValueLodging),
            ]
        );
        assert_eq!(report.highest_severity(), Some(Severity::High));
    }

    #[test]
    fn test_empty_report() {
        let report = ComplianceReport::from_results(&[]);
        assert_eq!(report.total_transactions, 0);
        assert!(report.violations.is_empty());
        assert_eq!(report.highest_severity(), None);
    }
}
