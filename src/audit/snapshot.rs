// 📸 Field Snapshots - stable field-name → value maps for tracked entities
//
// Every trackable entity implements FieldSnapshot. The map comes from the
// entity's serde derive, so there is no runtime property walking and the
// field set is fixed at compile time.

use crate::error::{ExpenseError, ExpenseResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Field name → JSON value. BTreeMap keeps serialized audit rows stable.
pub type FieldMap = BTreeMap<String, Value>;

// ============================================================================
// ENTITY KEY
// ============================================================================

/// Primary key of a tracked entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityKey {
    /// Single-column key, stored raw
    Single(String),

    /// Composite key, stored as a JSON object of property → value
    Composite(BTreeMap<String, Value>),
}

impl EntityKey {
    pub fn single(id: impl Into<String>) -> Self {
        EntityKey::Single(id.into())
    }

    pub fn composite<K, I>(parts: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        EntityKey::Composite(parts.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Value stored in `AuditRecord::record_id`
    pub fn to_record_id(&self) -> String {
        match self {
            EntityKey::Single(id) => id.clone(),
            EntityKey::Composite(parts) => {
                let object: Map<String, Value> =
                    parts.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                Value::Object(object).to_string()
            }
        }
    }
}

// ============================================================================
// FIELD SNAPSHOT CAPABILITY
// ============================================================================

/// Capability of producing (and re-applying) a field-level snapshot
pub trait FieldSnapshot: Serialize + DeserializeOwned {
    /// Table name written to `AuditRecord::table_name`
    const TABLE: &'static str;

    fn entity_key(&self) -> EntityKey;

    /// All fields of the entity
    fn snapshot(&self) -> ExpenseResult<FieldMap> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map.into_iter().collect()),
            _ => Err(ExpenseError::validation(format!(
                "{} does not serialize to a field map",
                Self::TABLE
            ))),
        }
    }

    /// Copy of `self` with `fields` laid over the current values
    fn with_fields(&self, fields: &FieldMap) -> ExpenseResult<Self> {
        let mut merged = self.snapshot()?;
        for (name, value) in fields {
            merged.insert(name.clone(), value.clone());
        }
        Self::from_fields(&merged)
    }

    /// Rebuild an entity from a complete field map
    fn from_fields(fields: &FieldMap) -> ExpenseResult<Self> {
        let object: Map<String, Value> = fields
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(serde_json::from_value(Value::Object(object))?)
    }
}

/// Fields whose value differs between two snapshots.
///
/// Returns `(old, new)` restricted to the changed fields. A field present on
/// only one side is reported with `null` on the other.
pub fn diff_fields(before: &FieldMap, after: &FieldMap) -> (FieldMap, FieldMap) {
    let mut old = FieldMap::new();
    let mut new = FieldMap::new();

    for name in before.keys().chain(after.keys()) {
        if old.contains_key(name) {
            continue;
        }
        let previous = before.get(name).unwrap_or(&Value::Null);
        let current = after.get(name).unwrap_or(&Value::Null);
        if previous != current {
            old.insert(name.clone(), previous.clone());
            new.insert(name.clone(), current.clone());
        }
    }

    (old, new)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Rate {
        currency: String,
        year: i32,
        value: String,
        note: Option<String>,
    }

    impl FieldSnapshot for Rate {
        const TABLE: &'static str = "Rate";

        fn entity_key(&self) -> EntityKey {
            EntityKey::composite([
                ("currency", json!(self.currency)),
                ("year", json!(self.year)),
            ])
        }
    }

    fn rate() -> Rate {
        Rate {
            currency: "EUR".to_string(),
            year: 2024,
            value: "1.08".to_string(),
            note: None,
        }
    }

    #[test]
    fn test_single_key_is_raw() {
        assert_eq!(EntityKey::single("tx-1").to_record_id(), "tx-1");
    }

    #[test]
    fn test_composite_key_is_json_object() {
        let id = rate().entity_key().to_record_id();
        assert_eq!(id, r#"{"currency":"EUR","year":2024}"#);
    }

    #[test]
    fn test_snapshot_contains_every_field() {
        let fields = rate().snapshot().unwrap();
        assert_eq!(fields.len(), 4);
        assert_eq!(fields["note"], Value::Null);
    }

    #[test]
    fn test_diff_only_changed_fields() {
        let before = rate().snapshot().unwrap();
        let mut changed = rate();
        changed.value = "1.10".to_string();
        let after = changed.snapshot().unwrap();

        let (old, new) = diff_fields(&before, &after);

        assert_eq!(old.len(), 1);
        assert_eq!(old["value"], json!("1.08"));
        assert_eq!(new["value"], json!("1.10"));
    }

    #[test]
    fn test_diff_identical_is_empty() {
        let fields = rate().snapshot().unwrap();
        let (old, new) = diff_fields(&fields, &fields);
        assert!(old.is_empty());
        assert!(new.is_empty());
    }

    #[test]
    fn test_with_fields_overlays_values() {
        let mut overlay = FieldMap::new();
        overlay.insert("note".to_string(), json!("corrected"));

        let updated = rate().with_fields(&overlay).unwrap();

        assert_eq!(updated.note.as_deref(), Some("corrected"));
        assert_eq!(updated.value, "1.08");
    }

    #[test]
    fn test_from_fields_rejects_incomplete_map() {
        let mut fields = rate().snapshot().unwrap();
        fields.remove("currency");
        assert!(Rate::from_fields(&fields).is_err());
    }
}
