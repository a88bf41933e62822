// 📏 Policy Rules - Thresholds as Data
//
// All thresholds are configurable via JSON file, not hardcoded.
// One PolicyRules value is an immutable snapshot for one evaluation call;
// the only way to change rules is to replace the whole set at once.

use crate::entities::transaction::CabinClass;
use crate::error::{ExpenseError, ExpenseResult};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::{Arc, RwLock};

// ============================================================================
// POLICY RULES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRules {
    /// Meals above this USD amount need approval
    #[serde(default = "default_high_value_meal_threshold")]
    pub high_value_meal_threshold: Decimal,

    /// Lodging BELOW this USD amount is flagged as possibly misclassified
    #[serde(default = "default_low_value_lodging_threshold")]
    pub low_value_lodging_threshold: Decimal,

    /// Cabins that count as premium travel
    #[serde(default = "default_premium_cabin_classes")]
    pub premium_cabin_classes: Vec<CabinClass>,

    #[serde(default = "default_true")]
    pub premium_cabin_requires_approval: bool,

    /// Meals also need a participant list (Client Entertainment always does)
    #[serde(default)]
    pub meals_require_participants: bool,

    /// Charges above this USD amount need a receipt
    #[serde(default = "default_documentation_required_threshold")]
    pub documentation_required_threshold: Decimal,

    /// Days allowed to attach the receipt
    #[serde(default = "default_documentation_grace_period_days")]
    pub documentation_grace_period_days: i64,

    #[serde(default = "default_true")]
    pub uncategorized_requires_review: bool,

    /// Same-day USD total per employee
    #[serde(default = "default_excessive_spending_daily_limit")]
    pub excessive_spending_daily_limit: Decimal,

    #[serde(default = "default_approved_currencies")]
    pub approved_currencies: Vec<String>,
}

// Default value functions for serde
fn default_high_value_meal_threshold() -> Decimal {
    Decimal::new(7_500, 2)
}

fn default_low_value_lodging_threshold() -> Decimal {
    Decimal::new(5_000, 2)
}

fn default_premium_cabin_classes() -> Vec<CabinClass> {
    vec![CabinClass::Business, CabinClass::First]
}

fn default_true() -> bool {
    true
}

fn default_documentation_required_threshold() -> Decimal {
    Decimal::new(7_500, 2)
}

fn default_documentation_grace_period_days() -> i64 {
    30
}

fn default_excessive_spending_daily_limit() -> Decimal {
    Decimal::new(100_000, 2)
}

fn default_approved_currencies() -> Vec<String> {
    ["USD", "EUR", "GBP", "CAD", "MXN", "JPY"]
        .iter()
        .map(|c| c.to_string())
        .collect()
}

impl Default for PolicyRules {
    fn default() -> Self {
        PolicyRules {
            high_value_meal_threshold: default_high_value_meal_threshold(),
            low_value_lodging_threshold: default_low_value_lodging_threshold(),
            premium_cabin_classes: default_premium_cabin_classes(),
            premium_cabin_requires_approval: true,
            meals_require_participants: false,
            documentation_required_threshold: default_documentation_required_threshold(),
            documentation_grace_period_days: default_documentation_grace_period_days(),
            uncategorized_requires_review: true,
            excessive_spending_daily_limit: default_excessive_spending_daily_limit(),
            approved_currencies: default_approved_currencies(),
        }
    }
}

impl PolicyRules {
    /// Load rules from JSON file (missing fields take defaults)
    pub fn from_file<P: AsRef<Path>>(path: P) -> ExpenseResult<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        let rules: PolicyRules = serde_json::from_str(&content).map_err(|e| {
            ExpenseError::Config(format!(
                "Failed to parse policy rules {:?}: {}",
                path.as_ref(),
                e
            ))
        })?;
        rules.validate()?;
        Ok(rules)
    }

    pub fn validate(&self) -> ExpenseResult<()> {
        let thresholds = [
            ("high_value_meal_threshold", self.high_value_meal_threshold),
            ("low_value_lodging_threshold", self.low_value_lodging_threshold),
            ("documentation_required_threshold", self.documentation_required_threshold),
            ("excessive_spending_daily_limit", self.excessive_spending_daily_limit),
        ];
        for (name, value) in thresholds {
            if value < Decimal::ZERO {
                return Err(ExpenseError::Config(format!("{} must not be negative", name)));
            }
        }

        if self.documentation_grace_period_days < 0 {
            return Err(ExpenseError::Config(
                "documentation_grace_period_days must not be negative".to_string(),
            ));
        }

        if self.approved_currencies.is_empty() {
            return Err(ExpenseError::Config(
                "approved_currencies must list at least one currency".to_string(),
            ));
        }
        if let Some(bad) = self
            .approved_currencies
            .iter()
            .find(|c| c.len() != 3 || !c.chars().all(|ch| ch.is_ascii_uppercase()))
        {
            return Err(ExpenseError::Config(format!(
                "'{}' is not an ISO 4217 currency code",
                bad
            )));
        }

        Ok(())
    }

    pub fn is_premium_cabin(&self, cabin: CabinClass) -> bool {
        self.premium_cabin_classes.contains(&cabin)
    }

    pub fn is_approved_currency(&self, currency: &str) -> bool {
        let code = currency.trim().to_uppercase();
        self.approved_currencies.iter().any(|c| *c == code)
    }
}

// ============================================================================
// RULE SET (atomic replacement)
// ============================================================================

/// Current policy configuration, shared across requests.
///
/// Readers take an `Arc` snapshot; `replace` swaps the whole set, so an
/// evaluation never sees half of an update.
#[derive(Debug, Clone)]
pub struct PolicyRuleSet {
    current: Arc<RwLock<Arc<PolicyRules>>>,
}

impl PolicyRuleSet {
    pub fn new(rules: PolicyRules) -> Self {
        PolicyRuleSet {
            current: Arc::new(RwLock::new(Arc::new(rules))),
        }
    }

    /// Snapshot in effect right now
    pub fn current(&self) -> Arc<PolicyRules> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&*guard),
            Err(poisoned) => Arc::clone(&*poisoned.into_inner()),
        }
    }

    /// Validate, then swap in a complete new rule set
    pub fn replace(&self, rules: PolicyRules) -> ExpenseResult<()> {
        rules.validate()?;
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Arc::new(rules);
        tracing::info!("policy rules replaced");
        Ok(())
    }
}

impl Default for PolicyRuleSet {
    fn default() -> Self {
        Self::new(PolicyRules::default())
    }
}

// ============================================================================
// TESTS
// ============================================================================
