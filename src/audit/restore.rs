// ⏪ Restore - replay an audit record's prior state
//
// What a restore does depends on which value maps the record carries:
//   old + new  (Modified)  →  lay the old values over the current entity
//   old only   (Deleted)   →  recreate the entity from the old values
//   new only   (Added)     →  delete the entity again
//
// Anything that took part in a split is never restored.

use crate::audit::context::AuditContext;
use crate::audit::log::{get_record, lineage_shows_split};
use crate::audit::record::AuditRecord;
use crate::audit::snapshot::FieldSnapshot;
use crate::db::{ChangeSet, ExpenseStore, SaveOutcome, StoredEntity};
use crate::entities::{Transaction, Trip};
use crate::error::{ExpenseError, ExpenseResult};

impl ExpenseStore {
    /// False when restoring this record's lineage could reapply a
    /// pre-split state, or the table is not restorable at all
    pub fn can_restore(&self, table: &str, record_id: &str) -> ExpenseResult<bool> {
        match table {
            t if t == Trip::TABLE => Ok(true),
            t if t == Transaction::TABLE => {
                if !self.split_children(record_id)?.is_empty() {
                    return Ok(false);
                }
                if let Some(current) = self.get_transaction(record_id)? {
                    if current.in_split_lineage() {
                        return Ok(false);
                    }
                }
                Ok(!lineage_shows_split(self.connection(), table, record_id)?)
            }
            _ => Ok(false),
        }
    }

    /// Apply a prior audit record and log the result as `Restored`
    pub fn restore_from_audit(
        &mut self,
        audit_id: i64,
        user: Option<&str>,
    ) -> ExpenseResult<SaveOutcome> {
        let record = get_record(self.connection(), audit_id)?
            .ok_or_else(|| ExpenseError::not_found("AuditRecord", audit_id.to_string()))?;

        if !self.can_restore(&record.table_name, &record.record_id)? {
            tracing::warn!(
                audit_id,
                table = %record.table_name,
                record_id = %record.record_id,
                "restore blocked"
            );
            return Err(ExpenseError::validation(format!(
                "{} {} cannot be restored: it is part of a split or not restorable",
                record.table_name, record.record_id
            )));
        }

        let changes = match record.table_name.as_str() {
            t if t == Transaction::TABLE => self.restore_changes::<Transaction>(&record)?,
            t if t == Trip::TABLE => self.restore_changes::<Trip>(&record)?,
            other => {
                return Err(ExpenseError::validation(format!(
                    "Table {} is not restorable",
                    other
                )))
            }
        };

        let ctx = AuditContext::new(user)
            .restoring(audit_id)
            .with_comment(format!("Restored from audit record {}", audit_id));
        let outcome = self.save_changes(ctx, changes)?;

        tracing::info!(
            audit_id,
            table = %record.table_name,
            record_id = %record.record_id,
            "restored from audit"
        );
        Ok(outcome)
    }

    fn restore_changes<E: Restorable>(&self, record: &AuditRecord) -> ExpenseResult<ChangeSet> {
        let current = E::load(self.connection(), &record.record_id)?;

        match (&record.old_value, &record.new_value, current) {
            (Some(old), Some(_), Some(current)) => {
                Ok(ChangeSet::new().update(current.with_fields(old)?))
            }
            (Some(old), None, None) => {
                let recreated = E::from_fields(old)?.recreated(self)?;
                Ok(ChangeSet::new().add(recreated))
            }
            (Some(_), None, Some(_)) => Err(ExpenseError::validation(format!(
                "{} {} already exists",
                record.table_name, record.record_id
            ))),
            (None, Some(_), Some(current)) => current.removal(self),
            (_, Some(_), None) => Err(ExpenseError::not_found(E::TABLE, record.record_id.clone())),
            (None, None, _) => Err(ExpenseError::validation(format!(
                "Audit record {} carries no values to restore",
                record.id
            ))),
        }
    }
}

/// Keeps links between entities intact when a restore adds or removes one
trait Restorable: StoredEntity {
    /// Entity about to be recreated from old values
    fn recreated(self, _store: &ExpenseStore) -> ExpenseResult<Self> {
        Ok(self)
    }

    /// Changes that remove this entity
    fn removal(self, _store: &ExpenseStore) -> ExpenseResult<ChangeSet> {
        Ok(ChangeSet::new().delete(self))
    }
}

impl Restorable for Transaction {
    /// A trip deleted since then leaves the transaction unlinked
    fn recreated(mut self, store: &ExpenseStore) -> ExpenseResult<Self> {
        let dangling = match self.trip_id.as_deref() {
            Some(trip_id) => store.get_trip(trip_id)?.is_none(),
            None => false,
        };
        if dangling {
            tracing::info!(transaction_id = %self.id, trip_id = ?self.trip_id, "trip gone, restoring unlinked");
            self.trip_id = None;
        }
        Ok(self)
    }
}

impl Restorable for Trip {
    fn removal(self, store: &ExpenseStore) -> ExpenseResult<ChangeSet> {
        Ok(store.detach_trip_transactions(&self.id)?.delete(self))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use crate::audit::context::AuditContext;
    use crate::audit::log::history;
    use crate::audit::record::AuditAction;
    use crate::compliance::ComplianceEngine;
    use crate::db::ExpenseStore;
    use crate::entities::{ExpenseCategory, Transaction, Trip};
    use crate::error::ExpenseError;
    use crate::tax::TaxRuleTable;
    use chrono::{NaiveDate, TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn lunch() -> Transaction {
        Transaction::new(date(2024, 8, 12), "Trattoria", dec!(60.00), "USD", ExpenseCategory::Meals, "ana@example.com")
            .with_document_url("https://receipts.example.com/l")
    }

    fn ctx() -> AuditContext {
        AuditContext::new(Some("ana@example.com"))
    }

    #[test]
    fn test_restore_modified_is_inverse() {
        let mut store = ExpenseStore::open_in_memory().unwrap();
        let engine = ComplianceEngine::default();
        let rules = TaxRuleTable::new();
        let when = Utc.with_ymd_and_hms(2024, 8, 13, 0, 0, 0).unwrap();

        let tx = lunch();
        store.add_transaction(ctx(), tx.clone()).unwrap();
        let before = store.check_transaction(&engine, &rules, &tx.id, when).unwrap();

        let mut edited = store.require_transaction(&tx.id).unwrap();
        edited.amount = dec!(160.00);
        edited.amount_usd = Some(dec!(160.00));
        let modified = store.update_transaction(ctx(), edited).unwrap();
        let changed = store.check_transaction(&engine, &rules, &tx.id, when).unwrap();
        assert_ne!(before, changed);

        let audit_id = modified.audit_records[0].id;
        let outcome = store.restore_from_audit(audit_id, Some("auditor")).unwrap();

        let after = store.check_transaction(&engine, &rules, &tx.id, when).unwrap();
        assert_eq!(before, after);

        let restored = &outcome.audit_records[0];
        assert_eq!(restored.action, AuditAction::Restored);
        assert_eq!(restored.restored_from, Some(audit_id));
        assert_eq!(restored.user_id, "auditor");
        assert_eq!(history(store.connection(), "Transaction", &tx.id).unwrap().len(), 3);
    }

    #[test]
    fn test_restore_deleted_recreates() {
        let mut store = ExpenseStore::open_in_memory().unwrap();
        let tx = lunch();
        store.add_transaction(ctx(), tx.clone()).unwrap();
        let deleted = store.delete_transaction(ctx(), &tx.id).unwrap();

        store.restore_from_audit(deleted.audit_records[0].id, None).unwrap();

        let back = store.require_transaction(&tx.id).unwrap();
        assert_eq!(back.amount, tx.amount);
        assert_eq!(back.merchant, "Trattoria");

        // second replay finds the row already there
        assert!(matches!(
            store.restore_from_audit(deleted.audit_records[0].id, None),
            Err(ExpenseError::Validation(_))
        ));
    }

    #[test]
    fn test_restore_added_deletes_again() {
        let mut store = ExpenseStore::open_in_memory().unwrap();
        let trip = Trip::new("Oslo", "ana@example.com", "ACME-NO", date(2024, 2, 1), date(2024, 2, 3), "NO", "Oslo")
            .unwrap();
        let added = store.add_trip(ctx(), trip.clone()).unwrap();

        let outcome = store.restore_from_audit(added.audit_records[0].id, None).unwrap();

        assert!(store.get_trip(&trip.id).unwrap().is_none());
        assert_eq!(outcome.audit_records[0].action, AuditAction::Restored);
        assert_eq!(outcome.audit_records[0].user_id, "System");
    }

    #[test]
    fn test_restore_added_trip_detaches_transactions() {
        let mut store = ExpenseStore::open_in_memory().unwrap();
        let trip = Trip::new("Milan", "ana@example.com", "ACME-IT", date(2024, 8, 10), date(2024, 8, 14), "IT", "Milan")
            .unwrap();
        let added = store.add_trip(ctx(), trip.clone()).unwrap();
        let tx = lunch().with_trip(trip.id.clone());
        store.add_transaction(ctx(), tx.clone()).unwrap();

        let outcome = store.restore_from_audit(added.audit_records[0].id, None).unwrap();

        assert!(store.get_trip(&trip.id).unwrap().is_none());
        assert_eq!(store.require_transaction(&tx.id).unwrap().trip_id, None);
        assert!(store.transactions_for_trip(&trip.id).unwrap().is_empty());
        assert_eq!(outcome.audit_records.len(), 2);
        assert!(outcome
            .audit_records
            .iter()
            .all(|r| r.action == AuditAction::Restored));
    }

    #[test]
    fn test_recreated_transaction_drops_link_to_deleted_trip() {
        let mut store = ExpenseStore::open_in_memory().unwrap();
        let trip = Trip::new("Milan", "ana@example.com", "ACME-IT", date(2024, 8, 10), date(2024, 8, 14), "IT", "Milan")
            .unwrap();
        store.add_trip(ctx(), trip.clone()).unwrap();
        let tx = lunch().with_trip(trip.id.clone());
        store.add_transaction(ctx(), tx.clone()).unwrap();

        let deleted = store.delete_transaction(ctx(), &tx.id).unwrap();
        store.delete_trip(ctx(), &trip.id).unwrap();

        store.restore_from_audit(deleted.audit_records[0].id, None).unwrap();

        let back = store.require_transaction(&tx.id).unwrap();
        assert_eq!(back.trip_id, None);
        assert_eq!(back.merchant, "Trattoria");
    }

    #[test]
    fn test_recreated_transaction_keeps_live_trip_link() {
        let mut store = ExpenseStore::open_in_memory().unwrap();
        let trip = Trip::new("Milan", "ana@example.com", "ACME-IT", date(2024, 8, 10), date(2024, 8, 14), "IT", "Milan")
            .unwrap();
        store.add_trip(ctx(), trip.clone()).unwrap();
        let tx = lunch().with_trip(trip.id.clone());
        store.add_transaction(ctx(), tx.clone()).unwrap();

        let deleted = store.delete_transaction(ctx(), &tx.id).unwrap();
        store.restore_from_audit(deleted.audit_records[0].id, None).unwrap();

        assert_eq!(store.require_transaction(&tx.id).unwrap().trip_id, Some(trip.id));
    }

    #[test]
    fn test_split_lineage_blocks_restore() {
        let mut store = ExpenseStore::open_in_memory().unwrap();
        let tx = lunch();
        let added = store.add_transaction(ctx(), tx.clone()).unwrap();
        let split = store.apply_split(ctx(), &tx.id, &[dec!(30.00), dec!(30.00)]).unwrap();

        // parent has children
        assert!(!store.can_restore("Transaction", &tx.id).unwrap());

        // children carry original_transaction_id
        let child = split.transactions().find(|t| t.is_split_child()).unwrap();
        assert!(!store.can_restore("Transaction", &child.id).unwrap());

        let err = store.restore_from_audit(added.audit_records[0].id, None).unwrap_err();
        assert!(matches!(err, ExpenseError::Validation(_)));
        assert!(store.require_transaction(&tx.id).unwrap().is_split);
    }

    #[test]
    fn test_lineage_in_history_blocks_after_children_gone() {
        let mut store = ExpenseStore::open_in_memory().unwrap();
        let tx = lunch();
        store.add_transaction(ctx(), tx.clone()).unwrap();
        let split = store.apply_split(ctx(), &tx.id, &[dec!(20.00), dec!(40.00)]).unwrap();

        for child in split.transactions().filter(|t| t.is_split_child()) {
            store.delete_transaction(ctx(), &child.id).unwrap();
        }
        let mut parent = store.require_transaction(&tx.id).unwrap();
        parent.is_split = false;
        store.update_transaction(ctx(), parent).unwrap();

        assert!(store.split_children(&tx.id).unwrap().is_empty());
        assert!(!store.can_restore("Transaction", &tx.id).unwrap());
    }

    #[test]
    fn test_unknown_audit_id() {
        let mut store = ExpenseStore::open_in_memory().unwrap();
        assert!(matches!(
            store.restore_from_audit(42, None),
            Err(ExpenseError::NotFound { .. })
        ));
        assert!(!store.can_restore("Invoice", "x").unwrap());
    }
}
