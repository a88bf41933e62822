// ⚙️ Runtime configuration from environment variables
//
//   EXPENSE_DB              SQLite file            (default: expenses.db)
//   EXPENSE_POLICY_FILE     policy rules JSON      (default: built-in rules)
//   EXPENSE_TAX_RULES_FILE  tax rules JSON array   (default: no rules)
//   EXPENSE_USER            acting user for audit  (default: System)
//   EXPENSE_SERVER_ADDR     API bind address       (default: 0.0.0.0:3000)

use crate::audit::context::SYSTEM_USER;
use crate::error::ExpenseResult;
use crate::policy::PolicyRules;
use crate::tax::TaxRuleTable;
use std::path::PathBuf;

pub const DEFAULT_DB_PATH: &str = "expenses.db";
pub const DEFAULT_SERVER_ADDR: &str = "0.0.0.0:3000";

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub policy_file: Option<PathBuf>,
    pub tax_rules_file: Option<PathBuf>,
    pub user: String,
    pub server_addr: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            policy_file: None,
            tax_rules_file: None,
            user: SYSTEM_USER.to_string(),
            server_addr: DEFAULT_SERVER_ADDR.to_string(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key → value source; blank values count as unset
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = AppConfig::default();

        AppConfig {
            db_path: get("EXPENSE_DB").map(PathBuf::from).unwrap_or(defaults.db_path),
            policy_file: get("EXPENSE_POLICY_FILE").map(PathBuf::from),
            tax_rules_file: get("EXPENSE_TAX_RULES_FILE").map(PathBuf::from),
            user: get("EXPENSE_USER").unwrap_or(defaults.user),
            server_addr: get("EXPENSE_SERVER_ADDR").unwrap_or(defaults.server_addr),
        }
    }

    pub fn load_policy_rules(&self) -> ExpenseResult<PolicyRules> {
        match &self.policy_file {
            Some(path) => {
                tracing::info!(path = %path.display(), "loading policy rules");
                PolicyRules::from_file(path)
            }
            None => Ok(PolicyRules::default()),
        }
    }

    pub fn load_tax_rules(&self) -> ExpenseResult<TaxRuleTable> {
        match &self.tax_rules_file {
            Some(path) => {
                let table = TaxRuleTable::from_file(path)?;
                tracing::info!(path = %path.display(), rules = table.rule_count(), "loaded tax rules");
                Ok(table)
            }
            None => Ok(TaxRuleTable::new()),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::from_lookup(lookup(&[]));
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.user, "System");
        assert!(config.load_policy_rules().unwrap().validate().is_ok());
        assert_eq!(config.load_tax_rules().unwrap().rule_count(), 0);
    }

    #[test]
    fn test_overrides_and_blank_values() {
        let config = AppConfig::from_lookup(lookup(&[
            ("EXPENSE_DB", "/tmp/x.db"),
            ("EXPENSE_USER", "   "),
            ("EXPENSE_SERVER_ADDR", "127.0.0.1:8080"),
        ]));

        assert_eq!(config.db_path, PathBuf::from("/tmp/x.db"));
        assert_eq!(config.user, "System");
        assert_eq!(config.server_addr, "127.0.0.1:8080");
    }

    #[test]
    fn test_loads_rule_files() {
        let mut policy = tempfile::NamedTempFile::new().unwrap();
        write!(policy, r#"{{"high_value_meal_threshold": "90.00"}}"#).unwrap();
        let mut tax = tempfile::NamedTempFile::new().unwrap();
        write!(
            tax,
            r#"[{{"fiscal_year": 2024, "country": "FR", "subsidiary": "ACME-FR", "meals_cap": "20.00"}}]"#
        )
        .unwrap();

        let policy_path = policy.path().to_string_lossy().to_string();
        let tax_path = tax.path().to_string_lossy().to_string();
        let config = AppConfig::from_lookup(lookup(&[
            ("EXPENSE_POLICY_FILE", policy_path.as_str()),
            ("EXPENSE_TAX_RULES_FILE", tax_path.as_str()),
        ]));

        assert_eq!(
            config.load_policy_rules().unwrap().high_value_meal_threshold,
            rust_decimal_macros::dec!(90.00)
        );
        assert_eq!(config.load_tax_rules().unwrap().rule_count(), 1);
    }
}
