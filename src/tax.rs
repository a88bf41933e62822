// 🧾 Fiscal Tax Exposure - per-country/subsidiary daily caps
//
// When an employee's trip spend in a capped category (meals, lodging) goes
// over the daily cap for the trip's fiscal year/country/subsidiary, the excess
// is a taxable benefit:
//
//   MealsPerDay     = MealsTotal / Duration
//   MealsExposure   = (MealsPerDay - MealsCap) * Duration   when over the cap
//   LodgingExposure = same formula with LodgingCap (nights = Duration)
//   Total           = MealsExposure + LodgingExposure
//
// No matching rule means zero exposure, not an error.

use crate::entities::transaction::{ExpenseCategory, Transaction};
use crate::entities::trip::Trip;
use crate::error::{ExpenseError, ExpenseResult};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

// ============================================================================
// TAX RULE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxRule {
    pub fiscal_year: i32,

    /// ISO country code
    pub country: String,

    pub subsidiary: String,

    /// Daily meals allowance in USD
    #[serde(default)]
    pub meals_cap: Option<Decimal>,

    /// Nightly lodging allowance in USD
    #[serde(default)]
    pub lodging_cap: Option<Decimal>,

    /// Rate applied to exposure to estimate tax liability
    #[serde(default)]
    pub tax_shield: Option<Decimal>,
}

impl TaxRule {
    pub fn matches(&self, fiscal_year: i32, country: &str, subsidiary: &str) -> bool {
        self.fiscal_year == fiscal_year
            && self.country.eq_ignore_ascii_case(country.trim())
            && self.subsidiary.eq_ignore_ascii_case(subsidiary.trim())
    }
}

// ============================================================================
// TAX RULE TABLE
// ============================================================================

/// All configured tax rules, keyed by (fiscal year, country, subsidiary)
#[derive(Debug, Clone, Default)]
pub struct TaxRuleTable {
    rules: Vec<TaxRule>,
}

impl TaxRuleTable {
    pub fn new() -> Self {
        TaxRuleTable { rules: Vec::new() }
    }

    /// Build from a list; a later rule for the same key replaces an earlier one
    pub fn from_rules(rules: Vec<TaxRule>) -> Self {
        let mut table = TaxRuleTable::new();
        for rule in rules {
            table.upsert(rule);
        }
        table
    }

    /// Load rules from a JSON array file
    pub fn from_file<P: AsRef<Path>>(path: P) -> ExpenseResult<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        let rules: Vec<TaxRule> = serde_json::from_str(&content).map_err(|e| {
            ExpenseError::Config(format!(
                "Failed to parse tax rules {:?}: {}",
                path.as_ref(),
                e
            ))
        })?;
        Ok(TaxRuleTable::from_rules(rules))
    }

    pub fn upsert(&mut self, rule: TaxRule) {
        self.rules
            .retain(|r| !r.matches(rule.fiscal_year, &rule.country, &rule.subsidiary));
        self.rules.push(rule);
    }

    pub fn find(&self, fiscal_year: i32, country: &str, subsidiary: &str) -> Option<&TaxRule> {
        self.rules
            .iter()
            .find(|r| r.matches(fiscal_year, country, subsidiary))
    }

    /// Rule for the trip's fiscal year, primary country, and subsidiary
    pub fn for_trip(&self, trip: &Trip) -> Option<&TaxRule> {
        self.find(trip.fiscal_year(), &trip.primary_country, &trip.subsidiary)
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

// ============================================================================
// TAX EXPOSURE RESULT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxExposureResult {
    pub trip_id: String,
    pub duration_days: i64,

    pub meals_total: Decimal,
    pub lodging_total: Decimal,
    pub meals_per_day: Decimal,
    pub lodging_per_night: Decimal,

    pub meals_cap: Option<Decimal>,
    pub lodging_cap: Option<Decimal>,

    pub meals_exposure: Decimal,
    pub lodging_exposure: Decimal,

    /// Exactly meals + lodging; premium cabins are informational only
    pub total_tax_exposure: Decimal,

    pub has_meals_issue: bool,
    pub has_lodging_issue: bool,
    pub has_premium_cabin_class: bool,

    pub tax_shield: Option<Decimal>,
    pub estimated_tax_liability: Decimal,
}

impl TaxExposureResult {
    fn empty(trip: &Trip) -> Self {
        TaxExposureResult {
            trip_id: trip.id.clone(),
            duration_days: trip.duration(),
            meals_total: Decimal::ZERO,
            lodging_total: Decimal::ZERO,
            meals_per_day: Decimal::ZERO,
            lodging_per_night: Decimal::ZERO,
            meals_cap: None,
            lodging_cap: None,
            meals_exposure: Decimal::ZERO,
            lodging_exposure: Decimal::ZERO,
            total_tax_exposure: Decimal::ZERO,
            has_meals_issue: false,
            has_lodging_issue: false,
            has_premium_cabin_class: false,
            tax_shield: None,
            estimated_tax_liability: Decimal::ZERO,
        }
    }
}

// ============================================================================
// CALCULATION
// ============================================================================

/// Excess of `total` over `cap` per day, across `days`.
/// `(total/days - cap) * days == total - cap*days`, computed the exact way.
/// Arithmetic saturates at the Decimal bounds instead of panicking.
fn capped_excess(total: Decimal, cap: Option<Decimal>, days: Decimal) -> Decimal {
    match cap {
        Some(cap) => {
            let allowance = cap.saturating_mul(days);
            if total > allowance {
                total.saturating_sub(allowance).round_dp(2)
            } else {
                Decimal::ZERO
            }
        }
        None => Decimal::ZERO,
    }
}

/// Trip-level tax exposure. Never fails: an empty trip, a corrupt date range
/// (`Duration <= 0`), or a missing rule all produce zero exposure.
///
/// `transactions` are the trip's transactions; split parents are skipped
/// because their children carry the amounts.
pub fn calculate_tax_exposure(
    trip: &Trip,
    transactions: &[Transaction],
    tax_rule: Option<&TaxRule>,
) -> TaxExposureResult {
    let mut result = TaxExposureResult::empty(trip);

    let counted: Vec<&Transaction> = transactions.iter().filter(|tx| !tx.is_split).collect();

    for tx in &counted {
        let usd = tx.amount_usd.unwrap_or(Decimal::ZERO);
        match tx.category {
            ExpenseCategory::Meals => {
                result.meals_total = result.meals_total.saturating_add(usd)
            }
            ExpenseCategory::Lodging => {
                result.lodging_total = result.lodging_total.saturating_add(usd)
            }
            ExpenseCategory::Airfare => {
                if tx.cabin_class.map_or(false, |c| c.is_premium()) {
                    result.has_premium_cabin_class = true;
                }
            }
            _ => {}
        }
    }

    if let Some(rule) = tax_rule {
        result.meals_cap = rule.meals_cap;
        result.lodging_cap = rule.lodging_cap;
        result.tax_shield = rule.tax_shield;
    }

    let duration = trip.duration();
    if counted.is_empty() || duration <= 0 {
        return result;
    }

    let days = Decimal::from(duration);
    result.meals_per_day = (result.meals_total / days).round_dp(2);
    result.lodging_per_night = (result.lodging_total / days).round_dp(2);

    let rule = match tax_rule {
        Some(rule) => rule,
        None => return result,
    };

    result.meals_exposure = capped_excess(result.meals_total, rule.meals_cap, days);
    result.lodging_exposure = capped_excess(result.lodging_total, rule.lodging_cap, days);
    result.has_meals_issue = result.meals_exposure > Decimal::ZERO;
    result.has_lodging_issue = result.lodging_exposure > Decimal::ZERO;
    result.total_tax_exposure = result.meals_exposure.saturating_add(result.lodging_exposure);

    if let Some(shield) = rule.tax_shield {
        result.estimated_tax_liability =
            result.total_tax_exposure.saturating_mul(shield).round_dp(2);
    }

    tracing::debug!(
        trip_id = %trip.id,
        meals_exposure = %result.meals_exposure,
        lodging_exposure = %result.lodging_exposure,
        "tax exposure calculated"
    );

    result
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::transaction::CabinClass;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;
    use std::io::Write;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn five_day_trip() -> Trip {
        Trip::new("Paris", "ana@example.com", "ACME-FR", date(2024, 6, 3), date(2024, 6, 7), "FR", "Paris")
            .unwrap()
    }

    fn charge(trip: &Trip, category: ExpenseCategory, usd: Decimal) -> Transaction {
        Transaction::new(date(2024, 6, 4), "Vendor", usd, "USD", category, "ana@example.com")
            .with_trip(trip.id.clone())
    }

    fn rule(meals: Option<Decimal>, lodging: Option<Decimal>) -> TaxRule {
        TaxRule {
            fiscal_year: 2024,
            country: "FR".to_string(),
            subsidiary: "ACME-FR".to_string(),
            meals_cap: meals,
            lodging_cap: lodging,
            tax_shield: Some(dec!(0.25)),
        }
    }

    #[test]
    fn test_meals_over_cap() {
        let trip = five_day_trip();
        let txs = vec![charge(&trip, ExpenseCategory::Meals, dec!(300))];

        let result = calculate_tax_exposure(&trip, &txs, Some(&rule(Some(dec!(50)), None)));

        assert_eq!(result.meals_per_day, dec!(60));
        assert_eq!(result.meals_exposure, dec!(50));
        assert!(result.has_meals_issue);
        assert_eq!(result.total_tax_exposure, dec!(50));
        assert_eq!(result.estimated_tax_liability, dec!(12.50));
    }

    #[test]
    fn test_lodging_under_cap() {
        let trip = five_day_trip();
        let txs = vec![charge(&trip, ExpenseCategory::Lodging, dec!(400))];

        let result = calculate_tax_exposure(&trip, &txs, Some(&rule(None, Some(dec!(100)))));

        assert_eq!(result.lodging_per_night, dec!(80));
        assert_eq!(result.lodging_exposure, dec!(0));
        assert!(!result.has_lodging_issue);
        assert_eq!(result.total_tax_exposure, dec!(0));
    }

    #[test]
    fn test_business_cabin_flag_regardless_of_amount() {
        let trip = five_day_trip();
        let txs = vec![charge(&trip, ExpenseCategory::Airfare, dec!(1)).with_cabin_class(CabinClass::Business)];

        let result = calculate_tax_exposure(&trip, &txs, None);

        assert!(result.has_premium_cabin_class);
        assert_eq!(result.total_tax_exposure, dec!(0));
    }

    #[test]
    fn test_total_is_meals_plus_lodging_only() {
        let trip = five_day_trip();
        let txs = vec![
            charge(&trip, ExpenseCategory::Meals, dec!(300)),
            charge(&trip, ExpenseCategory::Lodging, dec!(1000)),
            charge(&trip, ExpenseCategory::Airfare, dec!(4000)).with_cabin_class(CabinClass::First),
        ];

        let result = calculate_tax_exposure(&trip, &txs, Some(&rule(Some(dec!(50)), Some(dec!(150)))));

        assert_eq!(result.meals_exposure, dec!(50));
        assert_eq!(result.lodging_exposure, dec!(250));
        assert_eq!(result.total_tax_exposure, dec!(300));
        assert!(result.has_premium_cabin_class);
    }

    #[test]
    fn test_no_transactions_is_zero() {
        let trip = five_day_trip();
        let result = calculate_tax_exposure(&trip, &[], Some(&rule(Some(dec!(1)), Some(dec!(1)))));
        assert_eq!(result.total_tax_exposure, Decimal::ZERO);
    }

    #[test]
    fn test_non_positive_duration_is_zero() {
        let mut trip = five_day_trip();
        // corrupt range straight from storage, bypassing validation
        trip.end_date = date(2024, 6, 1);
        assert!(trip.duration() <= 0);

        let txs = vec![charge(&trip, ExpenseCategory::Meals, dec!(900))];
        let result = calculate_tax_exposure(&trip, &txs, Some(&rule(Some(dec!(10)), None)));

        assert_eq!(result.total_tax_exposure, Decimal::ZERO);
        assert_eq!(result.meals_per_day, Decimal::ZERO);
    }

    #[test]
    fn test_missing_rule_is_zero_not_error() {
        let trip = five_day_trip();
        let txs = vec![charge(&trip, ExpenseCategory::Meals, dec!(5000))];

        let result = calculate_tax_exposure(&trip, &txs, None);

        assert_eq!(result.meals_total, dec!(5000));
        assert_eq!(result.total_tax_exposure, Decimal::ZERO);
        assert!(!result.has_meals_issue);
    }

    #[test]
    fn test_split_parent_not_double_counted() {
        let trip = five_day_trip();
        let parent = charge(&trip, ExpenseCategory::Meals, dec!(300));
        let plan = crate::entities::transaction::split_transaction(&parent, &[dec!(100), dec!(200)]).unwrap();

        let mut txs = vec![plan.parent];
        txs.extend(plan.children);

        let result = calculate_tax_exposure(&trip, &txs, None);
        assert_eq!(result.meals_total, dec!(300));
    }

    #[test]
    fn test_repeating_fraction_stays_exact() {
        let trip = Trip::new("Rome", "ana@example.com", "ACME-FR", date(2024, 6, 3), date(2024, 6, 5), "FR", "Rome")
            .unwrap();
        let txs = vec![charge(&trip, ExpenseCategory::Meals, dec!(100))];

        let result = calculate_tax_exposure(&trip, &txs, Some(&rule(Some(dec!(30)), None)));

        assert_eq!(result.meals_per_day, dec!(33.33));
        assert_eq!(result.meals_exposure, dec!(10));
    }

    #[test]
    fn test_huge_amounts_saturate() {
        let trip = five_day_trip();
        let txs = vec![
            charge(&trip, ExpenseCategory::Meals, Decimal::MAX),
            charge(&trip, ExpenseCategory::Meals, Decimal::MAX),
            charge(&trip, ExpenseCategory::Lodging, Decimal::MAX),
        ];

        let result = calculate_tax_exposure(&trip, &txs, Some(&rule(Some(dec!(50)), Some(dec!(100)))));

        assert_eq!(result.meals_total, Decimal::MAX);
        assert!(result.has_meals_issue);
        assert!(result.has_lodging_issue);
        assert_eq!(result.total_tax_exposure, Decimal::MAX);
        assert!(result.estimated_tax_liability > Decimal::ZERO);
    }

    #[test]
    fn test_table_lookup() {
        let mut table = TaxRuleTable::from_rules(vec![rule(Some(dec!(50)), None)]);
        let trip = five_day_trip();

        assert!(table.for_trip(&trip).is_some());
        assert!(table.find(2024, "fr", "acme-fr").is_some());
        assert!(table.find(2023, "FR", "ACME-FR").is_none());

        table.upsert(rule(Some(dec!(70)), None));
        assert_eq!(table.rule_count(), 1);
        assert_eq!(table.for_trip(&trip).unwrap().meals_cap, Some(dec!(70)));
    }

    #[test]
    fn test_table_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"fiscal_year": 2024, "country": "DE", "subsidiary": "ACME-DE", "meals_cap": "28.00"}}]"#
        )
        .unwrap();

        let table = TaxRuleTable::from_file(file.path()).unwrap();
        let found = table.find(2024, "DE", "ACME-DE").unwrap();
        assert_eq!(found.meals_cap, Some(dec!(28.00)));
        assert_eq!(found.lodging_cap, None);
    }
}
