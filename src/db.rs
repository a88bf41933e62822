// 🗄️ Expense Store - SQLite persistence with audited units of work
//
// Every mutation goes through `save_changes`:
//   1. open a SQLite transaction
//   2. for each pending change: load the stored row, check its version,
//      capture the audit diff, write the row
//   3. commit
//   4. write the captured AuditRecords in a SECOND transaction
//
// A failure in 4 does NOT undo 3. It comes back in `SaveOutcome::audit_error`
// and is logged at error level.

use crate::audit::context::{AuditContext, EntityChange};
use crate::audit::log::write_records;
use crate::audit::record::AuditRecord;
use crate::audit::snapshot::FieldSnapshot;
use crate::compliance::{ComplianceEngine, ComplianceRequest};
use crate::entities::{
    find_trip_for, split_transaction, Transaction, Trip, TripValidationStatus,
};
use crate::error::{ExpenseError, ExpenseResult};
use crate::tax::{calculate_tax_exposure, TaxExposureResult, TaxRuleTable};
use crate::violation::{PolicyComplianceResult, ViolationType};
use chrono::{DateTime, NaiveDate, SubsecRound, Utc};
use rust_decimal::Decimal;
use rusqlite::{params, Connection, OptionalExtension, Params};
use std::path::Path;

// ============================================================================
// SCHEMA
// ============================================================================

pub fn setup_database(conn: &Connection) -> ExpenseResult<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    // ==========================================================================
    // Transactions: full JSON document + the columns we query on
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS transactions (
            id TEXT PRIMARY KEY,
            version INTEGER NOT NULL,
            email TEXT NOT NULL,
            transaction_date TEXT NOT NULL,
            trip_id TEXT,
            original_transaction_id TEXT,
            import_hash TEXT,
            document TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS trips (
            id TEXT PRIMARY KEY,
            version INTEGER NOT NULL,
            owner_email TEXT NOT NULL,
            document TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Audit trail (append-only)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS audit_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp TEXT NOT NULL,
            user_id TEXT NOT NULL,
            action TEXT NOT NULL,
            table_name TEXT NOT NULL,
            record_id TEXT NOT NULL,
            old_value TEXT,
            new_value TEXT,
            comment TEXT,
            restored_from INTEGER
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_tx_owner_date ON transactions(email, transaction_date)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_tx_trip ON transactions(trip_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_tx_original ON transactions(original_transaction_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_tx_import_hash ON transactions(import_hash)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_trips_owner ON trips(owner_email)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_records(timestamp)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_audit_record ON audit_records(table_name, record_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_audit_user ON audit_records(user_id)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// TRACKED ENTITIES
// ============================================================================

/// Anything the unit of work can write
#[derive(Debug, Clone, PartialEq)]
pub enum TrackedEntity {
    Transaction(Transaction),
    Trip(Trip),
}

impl TrackedEntity {
    pub fn id(&self) -> &str {
        match self {
            TrackedEntity::Transaction(tx) => &tx.id,
            TrackedEntity::Trip(trip) => &trip.id,
        }
    }

    pub fn table(&self) -> &'static str {
        match self {
            TrackedEntity::Transaction(_) => Transaction::TABLE,
            TrackedEntity::Trip(_) => Trip::TABLE,
        }
    }

    pub fn version(&self) -> i64 {
        match self {
            TrackedEntity::Transaction(tx) => tx.version,
            TrackedEntity::Trip(trip) => trip.version,
        }
    }

    fn set_version(&mut self, version: i64) {
        match self {
            TrackedEntity::Transaction(tx) => tx.version = version,
            TrackedEntity::Trip(trip) => trip.version = version,
        }
    }

    fn added_change(&self) -> ExpenseResult<EntityChange> {
        match self {
            TrackedEntity::Transaction(tx) => EntityChange::added(tx),
            TrackedEntity::Trip(trip) => EntityChange::added(trip),
        }
    }

    fn deleted_change(&self) -> ExpenseResult<EntityChange> {
        match self {
            TrackedEntity::Transaction(tx) => EntityChange::deleted(tx),
            TrackedEntity::Trip(trip) => EntityChange::deleted(trip),
        }
    }

    fn modified_change(&self, stored: &TrackedEntity) -> ExpenseResult<EntityChange> {
        match (stored, self) {
            (TrackedEntity::Transaction(before), TrackedEntity::Transaction(after)) => {
                EntityChange::modified(before, after)
            }
            (TrackedEntity::Trip(before), TrackedEntity::Trip(after)) => {
                EntityChange::modified(before, after)
            }
            _ => Err(ExpenseError::validation(format!(
                "{} {} changed entity type",
                stored.table(),
                stored.id()
            ))),
        }
    }
}

impl From<Transaction> for TrackedEntity {
    fn from(tx: Transaction) -> Self {
        TrackedEntity::Transaction(tx)
    }
}

impl From<Trip> for TrackedEntity {
    fn from(trip: Trip) -> Self {
        TrackedEntity::Trip(trip)
    }
}

/// Entities the store can load by id
pub trait StoredEntity: FieldSnapshot + Clone + Into<TrackedEntity> {
    fn load(conn: &Connection, id: &str) -> ExpenseResult<Option<Self>>;
}

impl StoredEntity for Transaction {
    fn load(conn: &Connection, id: &str) -> ExpenseResult<Option<Self>> {
        load_transaction(conn, id)
    }
}

impl StoredEntity for Trip {
    fn load(conn: &Connection, id: &str) -> ExpenseResult<Option<Self>> {
        load_trip(conn, id)
    }
}

// ============================================================================
// UNIT OF WORK
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum PendingChange {
    Add(TrackedEntity),
    /// Carries the version the caller read; a mismatch is a conflict
    Update(TrackedEntity),
    Delete(TrackedEntity),
}

/// Changes committed together, in order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    changes: Vec<PendingChange>,
}

impl ChangeSet {
    pub fn new() -> Self {
        ChangeSet::default()
    }

    pub fn add(mut self, entity: impl Into<TrackedEntity>) -> Self {
        self.changes.push(PendingChange::Add(entity.into()));
        self
    }

    pub fn update(mut self, entity: impl Into<TrackedEntity>) -> Self {
        self.changes.push(PendingChange::Update(entity.into()));
        self
    }

    pub fn delete(mut self, entity: impl Into<TrackedEntity>) -> Self {
        self.changes.push(PendingChange::Delete(entity.into()));
        self
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Result of a committed unit of work
#[derive(Debug)]
pub struct SaveOutcome {
    /// Entities as written (new versions); deleted ones as they were
    pub committed: Vec<TrackedEntity>,

    /// Audit rows for this commit. On audit failure these were NOT stored
    /// and their ids are 0.
    pub audit_records: Vec<AuditRecord>,

    /// Always `ExpenseError::AuditWrite` when set
    pub audit_error: Option<ExpenseError>,
}

impl SaveOutcome {
    fn empty() -> Self {
        SaveOutcome {
            committed: Vec::new(),
            audit_records: Vec::new(),
            audit_error: None,
        }
    }

    pub fn is_fully_audited(&self) -> bool {
        self.audit_error.is_none()
    }

    pub fn transactions(&self) -> impl Iterator<Item = &Transaction> {
        self.committed.iter().filter_map(|e| match e {
            TrackedEntity::Transaction(tx) => Some(tx),
            TrackedEntity::Trip(_) => None,
        })
    }

    pub fn trips(&self) -> impl Iterator<Item = &Trip> {
        self.committed.iter().filter_map(|e| match e {
            TrackedEntity::Trip(trip) => Some(trip),
            TrackedEntity::Transaction(_) => None,
        })
    }
}

// ============================================================================
// EXPENSE STORE
// ============================================================================

pub struct ExpenseStore {
    conn: Connection,
}

impl ExpenseStore {
    pub fn open<P: AsRef<Path>>(path: P) -> ExpenseResult<Self> {
        let conn = Connection::open(path.as_ref())?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> ExpenseResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    pub fn from_connection(conn: Connection) -> ExpenseResult<Self> {
        setup_database(&conn)?;
        Ok(ExpenseStore { conn })
    }

    /// Read access for audit queries
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Commit `changes` and audit them under `ctx`
    pub fn save_changes(
        &mut self,
        mut ctx: AuditContext,
        changes: ChangeSet,
    ) -> ExpenseResult<SaveOutcome> {
        if changes.is_empty() {
            return Ok(SaveOutcome::empty());
        }

        let sql_tx = self.conn.transaction()?;
        let mut committed = Vec::with_capacity(changes.len());

        for change in changes.changes {
            match change {
                PendingChange::Add(entity) => {
                    ctx.capture(&[entity.added_change()?]);
                    insert_entity(&sql_tx, &entity)?;
                    committed.push(entity);
                }
                PendingChange::Update(mut entity) => {
                    let stored = load_current(&sql_tx, &entity)?;
                    ctx.capture(&[entity.modified_change(&stored)?]);
                    update_entity(&sql_tx, &mut entity)?;
                    committed.push(entity);
                }
                PendingChange::Delete(entity) => {
                    let stored = load_current(&sql_tx, &entity)?;
                    ctx.capture(&[stored.deleted_change()?]);
                    delete_entity(&sql_tx, &stored)?;
                    committed.push(stored);
                }
            }
        }

        sql_tx.commit()?;
        tracing::info!(
            user = ctx.user_id(),
            entities = committed.len(),
            "changes committed"
        );

        // Second pass: audit trail
        let mut audit_records = ctx.into_records(Utc::now().trunc_subsecs(6));
        let audit_error = if audit_records.is_empty() {
            None
        } else {
            match write_records(&mut self.conn, &mut audit_records) {
                Ok(()) => None,
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        records = audit_records.len(),
                        "audit write failed after commit"
                    );
                    Some(ExpenseError::AuditWrite(e.to_string()))
                }
            }
        };

        Ok(SaveOutcome {
            committed,
            audit_records,
            audit_error,
        })
    }

    // ========================================================================
    // READS
    // ========================================================================

    pub fn get_transaction(&self, id: &str) -> ExpenseResult<Option<Transaction>> {
        load_transaction(&self.conn, id)
    }

    pub fn require_transaction(&self, id: &str) -> ExpenseResult<Transaction> {
        self.get_transaction(id)?
            .ok_or_else(|| ExpenseError::not_found(Transaction::TABLE, id))
    }

    pub fn get_trip(&self, id: &str) -> ExpenseResult<Option<Trip>> {
        load_trip(&self.conn, id)
    }

    pub fn require_trip(&self, id: &str) -> ExpenseResult<Trip> {
        self.get_trip(id)?
            .ok_or_else(|| ExpenseError::not_found(Trip::TABLE, id))
    }

    pub fn all_transactions(&self) -> ExpenseResult<Vec<Transaction>> {
        query_transactions(
            &self.conn,
            "SELECT document, version FROM transactions ORDER BY transaction_date, id",
            params![],
        )
    }

    pub fn all_trips(&self) -> ExpenseResult<Vec<Trip>> {
        query_trips(
            &self.conn,
            "SELECT document, version FROM trips ORDER BY id",
            params![],
        )
    }

    pub fn trips_for_owner(&self, email: &str) -> ExpenseResult<Vec<Trip>> {
        query_trips(
            &self.conn,
            "SELECT document, version FROM trips WHERE owner_email = ?1 ORDER BY id",
            params![email.to_lowercase()],
        )
    }

    pub fn transactions_for_trip(&self, trip_id: &str) -> ExpenseResult<Vec<Transaction>> {
        query_transactions(
            &self.conn,
            "SELECT document, version FROM transactions WHERE trip_id = ?1 ORDER BY transaction_date, id",
            params![trip_id],
        )
    }

    pub fn transactions_for_user_on(
        &self,
        email: &str,
        date: NaiveDate,
    ) -> ExpenseResult<Vec<Transaction>> {
        transactions_for_user_on(&self.conn, email, date)
    }

    pub fn split_children(&self, parent_id: &str) -> ExpenseResult<Vec<Transaction>> {
        query_transactions(
            &self.conn,
            "SELECT document, version FROM transactions WHERE original_transaction_id = ?1 ORDER BY id",
            params![parent_id],
        )
    }

    pub fn has_import_hash(&self, hash: &str) -> ExpenseResult<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM transactions WHERE import_hash = ?1 LIMIT 1",
                params![hash],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn transaction_count(&self) -> ExpenseResult<i64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM transactions", [], |row| row.get(0))?;
        Ok(count)
    }

    // ========================================================================
    // TRANSACTION OPERATIONS
    // ========================================================================

    pub fn add_transaction(&mut self, ctx: AuditContext, tx: Transaction) -> ExpenseResult<SaveOutcome> {
        self.save_changes(ctx, ChangeSet::new().add(tx))
    }

    /// Save an edited transaction. Approved exceptions are voided when an
    /// amount, the category, or the cabin class changed.
    pub fn update_transaction(
        &mut self,
        ctx: AuditContext,
        mut tx: Transaction,
    ) -> ExpenseResult<SaveOutcome> {
        let stored = self.require_transaction(&tx.id)?;
        if stored.policy_fields_changed(&tx) && !tx.approved_exceptions.is_empty() {
            tracing::info!(
                transaction_id = %tx.id,
                voided = tx.approved_exceptions.len(),
                "policy fields changed, approved exceptions voided"
            );
            tx.void_exceptions();
        }
        self.save_changes(ctx, ChangeSet::new().update(tx))
    }

    pub fn delete_transaction(&mut self, ctx: AuditContext, id: &str) -> ExpenseResult<SaveOutcome> {
        let tx = self.require_transaction(id)?;
        if !self.split_children(id)?.is_empty() {
            return Err(ExpenseError::validation(format!(
                "Transaction {} has split children and cannot be deleted",
                id
            )));
        }
        self.save_changes(ctx, ChangeSet::new().delete(tx))
    }

    /// Attach a transaction to a trip of the same owner covering its date
    pub fn link_transaction_to_trip(
        &mut self,
        ctx: AuditContext,
        transaction_id: &str,
        trip_id: &str,
    ) -> ExpenseResult<SaveOutcome> {
        let mut tx = self.require_transaction(transaction_id)?;
        let trip = self.require_trip(trip_id)?;

        if !trip.owner_email.eq_ignore_ascii_case(&tx.email) {
            return Err(ExpenseError::validation(format!(
                "Trip {} belongs to {}, not {}",
                trip.id, trip.owner_email, tx.email
            )));
        }
        if !trip.contains(tx.transaction_date) {
            return Err(ExpenseError::validation(format!(
                "Transaction date {} is outside trip {} ({} to {})",
                tx.transaction_date, trip.id, trip.start_date, trip.end_date
            )));
        }

        tx.trip_id = Some(trip.id);
        self.save_changes(ctx, ChangeSet::new().update(tx))
    }

    /// Link to the owner's trip covering the date, if there is one
    pub fn auto_link_transaction(
        &mut self,
        ctx: AuditContext,
        transaction_id: &str,
    ) -> ExpenseResult<Option<SaveOutcome>> {
        let tx = self.require_transaction(transaction_id)?;
        let trips = self.trips_for_owner(&tx.email)?;
        let trip_id = match find_trip_for(&tx, &trips) {
            Some(trip) if tx.trip_id.as_deref() != Some(trip.id.as_str()) => trip.id.clone(),
            _ => return Ok(None),
        };
        self.link_transaction_to_trip(ctx, transaction_id, &trip_id)
            .map(Some)
    }

    pub fn unlink_transaction(&mut self, ctx: AuditContext, transaction_id: &str) -> ExpenseResult<SaveOutcome> {
        let mut tx = self.require_transaction(transaction_id)?;
        tx.trip_id = None;
        self.save_changes(ctx, ChangeSet::new().update(tx))
    }

    /// Split a stored transaction; parent update and children commit together
    pub fn apply_split(
        &mut self,
        ctx: AuditContext,
        parent_id: &str,
        parts_usd: &[Decimal],
    ) -> ExpenseResult<SaveOutcome> {
        let parent = self.require_transaction(parent_id)?;
        let plan = split_transaction(&parent, parts_usd)?;

        let changes = plan
            .children
            .into_iter()
            .fold(ChangeSet::new().update(plan.parent), |set, child| set.add(child));

        tracing::info!(parent_id, parts = parts_usd.len(), "splitting transaction");
        self.save_changes(ctx, changes)
    }

    /// Approve an exception as the context's user
    pub fn approve_exception(
        &mut self,
        ctx: AuditContext,
        transaction_id: &str,
        violation_type: ViolationType,
        reason: &str,
        approved_at: DateTime<Utc>,
    ) -> ExpenseResult<SaveOutcome> {
        let mut tx = self.require_transaction(transaction_id)?;
        tx.approve_exception(violation_type, ctx.user_id(), reason, approved_at);
        self.save_changes(ctx, ChangeSet::new().update(tx))
    }

    pub fn flag_transaction(
        &mut self,
        ctx: AuditContext,
        transaction_id: &str,
        violation_type: ViolationType,
        reason: &str,
        flagged_at: DateTime<Utc>,
    ) -> ExpenseResult<SaveOutcome> {
        let mut tx = self.require_transaction(transaction_id)?;
        tx.flag(violation_type, reason, ctx.user_id(), flagged_at);
        self.save_changes(ctx, ChangeSet::new().update(tx))
    }

    // ========================================================================
    // TRIP OPERATIONS
    // ========================================================================

    pub fn add_trip(&mut self, ctx: AuditContext, trip: Trip) -> ExpenseResult<SaveOutcome> {
        self.save_changes(ctx, ChangeSet::new().add(trip))
    }

    /// Save an edited trip. Moving the dates sends it back to NotReadyToValidate.
    pub fn update_trip(&mut self, ctx: AuditContext, mut trip: Trip) -> ExpenseResult<SaveOutcome> {
        let stored = self.require_trip(&trip.id)?;
        if (stored.start_date, stored.end_date) != (trip.start_date, trip.end_date) {
            trip.set_dates(trip.start_date, trip.end_date)?;
        }
        self.save_changes(ctx, ChangeSet::new().update(trip))
    }

    pub fn set_trip_status(
        &mut self,
        ctx: AuditContext,
        trip_id: &str,
        status: TripValidationStatus,
    ) -> ExpenseResult<SaveOutcome> {
        let mut trip = self.require_trip(trip_id)?;
        trip.transition_to(status)?;
        self.save_changes(ctx, ChangeSet::new().update(trip))
    }

    /// Delete a trip and detach its transactions in the same commit
    pub fn delete_trip(&mut self, ctx: AuditContext, trip_id: &str) -> ExpenseResult<SaveOutcome> {
        let trip = self.require_trip(trip_id)?;
        let changes = self.detach_trip_transactions(trip_id)?.delete(trip);
        self.save_changes(ctx, changes)
    }

    /// Updates that unlink every transaction from `trip_id`
    pub(crate) fn detach_trip_transactions(&self, trip_id: &str) -> ExpenseResult<ChangeSet> {
        Ok(self
            .transactions_for_trip(trip_id)?
            .into_iter()
            .fold(ChangeSet::new(), |set, mut tx| {
                tx.trip_id = None;
                set.update(tx)
            }))
    }

    // ========================================================================
    // COMPLIANCE / TAX (one read view per call)
    // ========================================================================

    /// Evaluate one stored transaction against its trip and same-day siblings
    pub fn check_transaction(
        &self,
        engine: &ComplianceEngine,
        tax_rules: &TaxRuleTable,
        transaction_id: &str,
        evaluated_at: DateTime<Utc>,
    ) -> ExpenseResult<PolicyComplianceResult> {
        let view = self.conn.unchecked_transaction()?;

        let tx = load_transaction(&view, transaction_id)?
            .ok_or_else(|| ExpenseError::not_found(Transaction::TABLE, transaction_id))?;
        let trip = match tx.trip_id.as_deref() {
            Some(trip_id) => load_trip(&view, trip_id)?,
            None => None,
        };
        let same_day = transactions_for_user_on(&view, &tx.email, tx.transaction_date)?;
        view.finish()?;

        let tax_rule = trip.as_ref().and_then(|t| tax_rules.for_trip(t));
        let request = ComplianceRequest::new(&tx, evaluated_at)
            .with_trip(trip.as_ref())
            .with_tax_rule(tax_rule)
            .with_same_day(&same_day);

        Ok(engine.check_compliance(&request))
    }

    /// Evaluate every stored transaction
    pub fn check_all_transactions(
        &self,
        engine: &ComplianceEngine,
        tax_rules: &TaxRuleTable,
        evaluated_at: DateTime<Utc>,
    ) -> ExpenseResult<Vec<PolicyComplianceResult>> {
        let view = self.conn.unchecked_transaction()?;
        let transactions = query_transactions(
            &view,
            "SELECT document, version FROM transactions ORDER BY transaction_date, id",
            params![],
        )?;
        let trips = query_trips(&view, "SELECT document, version FROM trips ORDER BY id", params![])?;
        view.finish()?;

        Ok(engine.check_all(&transactions, &trips, tax_rules, evaluated_at))
    }

    pub fn trip_tax_exposure(
        &self,
        tax_rules: &TaxRuleTable,
        trip_id: &str,
    ) -> ExpenseResult<TaxExposureResult> {
        let view = self.conn.unchecked_transaction()?;
        let trip = load_trip(&view, trip_id)?
            .ok_or_else(|| ExpenseError::not_found(Trip::TABLE, trip_id))?;
        let transactions = query_transactions(
            &view,
            "SELECT document, version FROM transactions WHERE trip_id = ?1 ORDER BY transaction_date, id",
            params![trip_id],
        )?;
        view.finish()?;

        Ok(calculate_tax_exposure(
            &trip,
            &transactions,
            tax_rules.for_trip(&trip),
        ))
    }
}

// ============================================================================
// ROW HELPERS
// ============================================================================

fn query_documents<P: Params>(conn: &Connection, sql: &str, params: P) -> ExpenseResult<Vec<(String, i64)>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn query_transactions<P: Params>(conn: &Connection, sql: &str, params: P) -> ExpenseResult<Vec<Transaction>> {
    query_documents(conn, sql, params)?
        .into_iter()
        .map(|(document, version)| {
            let mut tx: Transaction = serde_json::from_str(&document)?;
            tx.version = version;
            Ok(tx)
        })
        .collect()
}

fn query_trips<P: Params>(conn: &Connection, sql: &str, params: P) -> ExpenseResult<Vec<Trip>> {
    query_documents(conn, sql, params)?
        .into_iter()
        .map(|(document, version)| {
            let mut trip: Trip = serde_json::from_str(&document)?;
            trip.version = version;
            Ok(trip)
        })
        .collect()
}

fn load_transaction(conn: &Connection, id: &str) -> ExpenseResult<Option<Transaction>> {
    Ok(query_transactions(
        conn,
        "SELECT document, version FROM transactions WHERE id = ?1",
        params![id],
    )?
    .into_iter()
    .next())
}

fn load_trip(conn: &Connection, id: &str) -> ExpenseResult<Option<Trip>> {
    Ok(query_trips(
        conn,
        "SELECT document, version FROM trips WHERE id = ?1",
        params![id],
    )?
    .into_iter()
    .next())
}

fn transactions_for_user_on(
    conn: &Connection,
    email: &str,
    date: NaiveDate,
) -> ExpenseResult<Vec<Transaction>> {
    query_transactions(
        conn,
        "SELECT document, version FROM transactions
         WHERE email = ?1 AND transaction_date = ?2
         ORDER BY id",
        params![email.to_lowercase(), date.to_string()],
    )
}

/// Stored row for `entity`, which must still be at the version the caller read
fn load_current(conn: &Connection, entity: &TrackedEntity) -> ExpenseResult<TrackedEntity> {
    let stored: Option<TrackedEntity> = match entity {
        TrackedEntity::Transaction(tx) => load_transaction(conn, &tx.id)?.map(Into::into),
        TrackedEntity::Trip(trip) => load_trip(conn, &trip.id)?.map(Into::into),
    };

    match stored {
        Some(stored) if stored.version() == entity.version() => Ok(stored),
        _ => Err(ExpenseError::ConcurrencyConflict {
            entity: entity.table(),
            id: entity.id().to_string(),
        }),
    }
}

fn insert_entity(conn: &Connection, entity: &TrackedEntity) -> ExpenseResult<()> {
    match entity {
        TrackedEntity::Transaction(tx) => {
            conn.execute(
                "INSERT INTO transactions (
                    id, version, email, transaction_date, trip_id,
                    original_transaction_id, import_hash, document
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    tx.id,
                    tx.version,
                    tx.email.to_lowercase(),
                    tx.transaction_date.to_string(),
                    tx.trip_id,
                    tx.original_transaction_id,
                    tx.import_hash,
                    serde_json::to_string(tx)?,
                ],
            )?;
        }
        TrackedEntity::Trip(trip) => {
            conn.execute(
                "INSERT INTO trips (id, version, owner_email, document) VALUES (?1, ?2, ?3, ?4)",
                params![
                    trip.id,
                    trip.version,
                    trip.owner_email.to_lowercase(),
                    serde_json::to_string(trip)?,
                ],
            )?;
        }
    }
    Ok(())
}

/// Write with a version guard, bumping `entity.version`
fn update_entity(conn: &Connection, entity: &mut TrackedEntity) -> ExpenseResult<()> {
    let read_version = entity.version();
    entity.set_version(read_version + 1);

    let affected = match &*entity {
        TrackedEntity::Transaction(tx) => conn.execute(
            "UPDATE transactions
             SET version = ?2, email = ?3, transaction_date = ?4, trip_id = ?5,
                 original_transaction_id = ?6, import_hash = ?7, document = ?8
             WHERE id = ?1 AND version = ?9",
            params![
                tx.id,
                tx.version,
                tx.email.to_lowercase(),
                tx.transaction_date.to_string(),
                tx.trip_id,
                tx.original_transaction_id,
                tx.import_hash,
                serde_json::to_string(tx)?,
                read_version,
            ],
        )?,
        TrackedEntity::Trip(trip) => conn.execute(
            "UPDATE trips SET version = ?2, owner_email = ?3, document = ?4
             WHERE id = ?1 AND version = ?5",
            params![
                trip.id,
                trip.version,
                trip.owner_email.to_lowercase(),
                serde_json::to_string(trip)?,
                read_version,
            ],
        )?,
    };

    if affected == 0 {
        return Err(ExpenseError::ConcurrencyConflict {
            entity: entity.table(),
            id: entity.id().to_string(),
        });
    }
    Ok(())
}

fn delete_entity(conn: &Connection, entity: &TrackedEntity) -> ExpenseResult<()> {
    let sql = match entity {
        TrackedEntity::Transaction(_) => "DELETE FROM transactions WHERE id = ?1 AND version = ?2",
        TrackedEntity::Trip(_) => "DELETE FROM trips WHERE id = ?1 AND version = ?2",
    };
    let affected = conn.execute(sql, params![entity.id(), entity.version()])?;
    if affected == 0 {
        return Err(ExpenseError::ConcurrencyConflict {
            entity: entity.table(),
            id: entity.id().to_string(),
        });
    }
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
