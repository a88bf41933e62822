// 🔎 Audit Log - append-only storage and the read-side query surface
//
// Timestamps are stored as RFC 3339 UTC with microseconds, so text order in
// SQLite is chronological order.

use crate::audit::record::{AuditAction, AuditRecord};
use crate::audit::snapshot::FieldMap;
use crate::error::{ExpenseError, ExpenseResult};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, Params};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const SELECT_RECORDS: &str = "SELECT id, timestamp, user_id, action, table_name, record_id,
        old_value, new_value, comment, restored_from
 FROM audit_records";

fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

// ============================================================================
// WRITE
// ============================================================================

/// Insert all records atomically and fill in their ids
pub fn write_records(conn: &mut Connection, records: &mut [AuditRecord]) -> ExpenseResult<()> {
    let sql_tx = conn.transaction()?;
    let mut ids = Vec::with_capacity(records.len());

    for record in records.iter() {
        let old_value = record.old_value.as_ref().map(serde_json::to_string).transpose()?;
        let new_value = record.new_value.as_ref().map(serde_json::to_string).transpose()?;

        sql_tx.execute(
            "INSERT INTO audit_records (
                timestamp, user_id, action, table_name, record_id,
                old_value, new_value, comment, restored_from
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                format_timestamp(&record.timestamp),
                record.user_id,
                record.action.as_str(),
                record.table_name,
                record.record_id,
                old_value,
                new_value,
                record.comment,
                record.restored_from,
            ],
        )?;
        ids.push(sql_tx.last_insert_rowid());
    }

    sql_tx.commit()?;

    // ids only once the rows are durable
    for (record, id) in records.iter_mut().zip(ids) {
        record.id = id;
    }
    Ok(())
}

// ============================================================================
// READ
// ============================================================================

type RawRecord = (
    i64,
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<i64>,
);

fn decode(raw: RawRecord) -> ExpenseResult<AuditRecord> {
    let (id, timestamp, user_id, action, table_name, record_id, old_value, new_value, comment, restored_from) = raw;

    let timestamp = DateTime::parse_from_rfc3339(&timestamp)
        .map_err(|e| ExpenseError::validation(format!("Audit record {} has bad timestamp: {}", id, e)))?
        .with_timezone(&Utc);
    let parse_map = |value: Option<String>| -> ExpenseResult<Option<FieldMap>> {
        Ok(value.as_deref().map(serde_json::from_str).transpose()?)
    };

    Ok(AuditRecord {
        id,
        timestamp,
        user_id,
        action: AuditAction::parse(&action)?,
        table_name,
        record_id,
        old_value: parse_map(old_value)?,
        new_value: parse_map(new_value)?,
        comment,
        restored_from,
    })
}

fn query_records<P: Params>(conn: &Connection, filter: &str, params: P) -> ExpenseResult<Vec<AuditRecord>> {
    let sql = format!("{} {} ORDER BY timestamp, id", SELECT_RECORDS, filter);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params, |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
                row.get(7)?,
                row.get(8)?,
                row.get(9)?,
            ))
        })?
        .collect::<Result<Vec<RawRecord>, _>>()?;

    rows.into_iter().map(decode).collect()
}

pub fn get_record(conn: &Connection, audit_id: i64) -> ExpenseResult<Option<AuditRecord>> {
    Ok(query_records(conn, "WHERE id = ?1", params![audit_id])?
        .into_iter()
        .next())
}

/// Chronological history of one entity
pub fn history(conn: &Connection, table: &str, record_id: &str) -> ExpenseResult<Vec<AuditRecord>> {
    query_records(
        conn,
        "WHERE table_name = ?1 AND record_id = ?2",
        params![table, record_id],
    )
}

pub fn by_user(conn: &Connection, user_id: &str) -> ExpenseResult<Vec<AuditRecord>> {
    query_records(conn, "WHERE user_id = ?1", params![user_id])
}

/// Records with `from <= timestamp <= to`
pub fn by_date_range(
    conn: &Connection,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> ExpenseResult<Vec<AuditRecord>> {
    query_records(
        conn,
        "WHERE timestamp >= ?1 AND timestamp <= ?2",
        params![format_timestamp(&from), format_timestamp(&to)],
    )
}

/// Case-insensitive substring match over action, table name and comment
pub fn search(conn: &Connection, term: &str) -> ExpenseResult<Vec<AuditRecord>> {
    let escaped = term
        .trim()
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    let pattern = format!("%{}%", escaped);

    query_records(
        conn,
        "WHERE action LIKE ?1 ESCAPE '\\'
            OR table_name LIKE ?1 ESCAPE '\\'
            OR comment LIKE ?1 ESCAPE '\\'",
        params![pattern],
    )
}

/// Any audit row for this transaction id whose values mark it as part of a split
pub fn lineage_shows_split(conn: &Connection, table: &str, record_id: &str) -> ExpenseResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM audit_records
         WHERE table_name = ?1 AND (
             (record_id = ?2 AND (
                 json_extract(old_value, '$.is_split') = 1
                 OR json_extract(new_value, '$.is_split') = 1
                 OR json_extract(old_value, '$.original_transaction_id') IS NOT NULL
                 OR json_extract(new_value, '$.original_transaction_id') IS NOT NULL
             ))
             OR json_extract(old_value, '$.original_transaction_id') = ?2
             OR json_extract(new_value, '$.original_transaction_id') = ?2
         )",
        params![table, record_id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

// ============================================================================
// STATS (dashboard)
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditStats {
    pub total: i64,
    pub by_action: BTreeMap<String, i64>,
    pub by_table: BTreeMap<String, i64>,
    pub by_user: BTreeMap<String, i64>,
}

fn group_counts(conn: &Connection, column: &str) -> ExpenseResult<BTreeMap<String, i64>> {
    let sql = format!(
        "SELECT {column}, COUNT(*) FROM audit_records GROUP BY {column}",
        column = column
    );
    let mut stmt = conn.prepare(&sql)?;
    let counts = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<Result<BTreeMap<_, _>, _>>()?;
    Ok(counts)
}

pub fn stats(conn: &Connection) -> ExpenseResult<AuditStats> {
    let total: i64 = conn.query_row("SELECT COUNT(*) FROM audit_records", [], |row| row.get(0))?;

    Ok(AuditStats {
        total,
        by_action: group_counts(conn, "action")?,
        by_table: group_counts(conn, "table_name")?,
        by_user: group_counts(conn, "user_id")?,
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::setup_database;
    use chrono::TimeZone;
    use serde_json::json;

    fn record(at: DateTime<Utc>, user: &str, action: AuditAction, table: &str, id: &str) -> AuditRecord {
        let mut new = FieldMap::new();
        new.insert("amount".to_string(), json!("10.00"));
        AuditRecord {
            id: 0,
            timestamp: at,
            user_id: user.to_string(),
            action,
            table_name: table.to_string(),
            record_id: id.to_string(),
            old_value: None,
            new_value: Some(new),
            comment: None,
            restored_from: None,
        }
    }

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, day, hour, 0, 0).unwrap()
    }

    fn seeded() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        let mut restored = record(at(3, 9), "ana", AuditAction::Restored, "Transaction", "t-1");
        restored.comment = Some("Restored from audit record 1".to_string());
        restored.restored_from = Some(1);

        let mut records = vec![
            record(at(1, 9), "ana", AuditAction::Added, "Transaction", "t-1"),
            record(at(2, 9), "bo", AuditAction::Modified, "Transaction", "t-1"),
            record(at(2, 10), "bo", AuditAction::Added, "Trip", "trip-1"),
            restored,
        ];
        write_records(&mut conn, &mut records).unwrap();
        assert!(records.iter().all(|r| r.id > 0));
        conn
    }

    #[test]
    fn test_history_is_chronological() {
        let conn = seeded();
        let entries = history(&conn, "Transaction", "t-1").unwrap();

        let actions: Vec<AuditAction> = entries.iter().map(|r| r.action).collect();
        assert_eq!(
            actions,
            vec![AuditAction::Added, AuditAction::Modified, AuditAction::Restored]
        );
        assert_eq!(entries[2].restored_from, Some(1));
        assert_eq!(entries[0].new_value.as_ref().unwrap()["amount"], json!("10.00"));
    }

    #[test]
    fn test_round_trip_preserves_record() {
        let mut conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        let mut records = vec![record(at(5, 12), "ana", AuditAction::Deleted, "Trip", "trip-9")];
        write_records(&mut conn, &mut records).unwrap();

        let loaded = get_record(&conn, records[0].id).unwrap().unwrap();
        assert_eq!(loaded, records[0]);
        assert!(get_record(&conn, 999).unwrap().is_none());
    }

    #[test]
    fn test_by_user_and_date_range() {
        let conn = seeded();

        assert_eq!(by_user(&conn, "bo").unwrap().len(), 2);
        assert_eq!(by_user(&conn, "nobody").unwrap().len(), 0);

        let day_two = by_date_range(&conn, at(2, 0), at(2, 23)).unwrap();
        assert_eq!(day_two.len(), 2);

        // bounds are inclusive
        assert_eq!(by_date_range(&conn, at(1, 9), at(1, 9)).unwrap().len(), 1);
    }

    #[test]
    fn test_search_action_table_comment() {
        let conn = seeded();

        assert_eq!(search(&conn, "trip").unwrap().len(), 1);
        assert_eq!(search(&conn, "modified").unwrap().len(), 1);
        assert_eq!(search(&conn, "audit record 1").unwrap().len(), 1);
        assert_eq!(search(&conn, "100%").unwrap().len(), 0);
    }

    #[test]
    fn test_stats() {
        let conn = seeded();
        let stats = stats(&conn).unwrap();

        assert_eq!(stats.total, 4);
        assert_eq!(stats.by_action["Added"], 2);
        assert_eq!(stats.by_table["Transaction"], 3);
        assert_eq!(stats.by_user["bo"], 2);
    }

    #[test]
    fn test_write_is_all_or_nothing() {
        let mut conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn.execute("DROP TABLE audit_records", []).unwrap();

        let mut records = vec![record(at(1, 9), "ana", AuditAction::Added, "Transaction", "t-1")];
        assert!(write_records(&mut conn, &mut records).is_err());
        assert_eq!(records[0].id, 0);
    }
}
