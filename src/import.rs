// 📥 CSV Import - card feed → audited Transactions
//
// Idempotent: each row gets a SHA-256 import hash; rows whose hash is already
// stored (or repeated in the same file) are skipped. Bad rows are reported
// and skipped, they never abort the batch.
//
// Expected header:
//   Date,Description,Merchant,Amount,Currency,ExchangeRate,Category,Email,
//   CabinClass,Participants,DocumentUrl

use crate::audit::context::AuditContext;
use crate::db::{ChangeSet, ExpenseStore};
use crate::entities::{find_trip_for, CabinClass, ExpenseCategory, Transaction};
use crate::error::{ExpenseError, ExpenseResult};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashSet;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

/// Audit user for imported rows
pub const IMPORT_USER: &str = "csv_importer";

#[derive(Debug, Deserialize)]
struct CsvRow {
    #[serde(rename = "Date")]
    date: String,

    #[serde(rename = "Description", default)]
    description: String,

    #[serde(rename = "Merchant")]
    merchant: String,

    #[serde(rename = "Amount")]
    amount: String,

    #[serde(rename = "Currency")]
    currency: String,

    #[serde(rename = "ExchangeRate", default)]
    exchange_rate: Option<String>,

    #[serde(rename = "Category", default)]
    category: String,

    #[serde(rename = "Email")]
    email: String,

    #[serde(rename = "CabinClass", default)]
    cabin_class: Option<String>,

    #[serde(rename = "Participants", default)]
    participants: Option<String>,

    #[serde(rename = "DocumentUrl", default)]
    document_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRow {
    /// 1-based line in the file (header is line 1)
    pub line: usize,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct LoadedCsv {
    pub transactions: Vec<Transaction>,
    pub rejected: Vec<RejectedRow>,
}

#[derive(Debug, Default)]
pub struct ImportSummary {
    pub rows_read: usize,
    pub imported: usize,
    pub duplicates: usize,
    pub linked_to_trips: usize,
    pub rejected: Vec<RejectedRow>,

    /// Set when the rows were stored but their audit trail was not
    pub audit_error: Option<String>,
}

// ============================================================================
// PARSING
// ============================================================================

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_date(value: &str) -> ExpenseResult<NaiveDate> {
    let value = value.trim();
    ["%Y-%m-%d", "%m/%d/%Y"]
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(value, format).ok())
        .ok_or_else(|| ExpenseError::validation(format!("Unrecognized date '{}'", value)))
}

/// "$1,234.50" → 1234.50
fn parse_amount(value: &str) -> ExpenseResult<Decimal> {
    let cleaned: String = value
        .trim()
        .chars()
        .filter(|c| !matches!(c, '$' | ',' | ' '))
        .collect();
    Decimal::from_str(&cleaned)
        .map_err(|e| ExpenseError::validation(format!("Invalid amount '{}': {}", value, e)))
}

fn row_to_transaction(row: CsvRow) -> ExpenseResult<Transaction> {
    let date = parse_date(&row.date)?;
    let amount = parse_amount(&row.amount)?;

    if row.merchant.trim().is_empty() {
        return Err(ExpenseError::validation("Merchant is empty"));
    }
    if row.email.trim().is_empty() {
        return Err(ExpenseError::validation("Email is empty"));
    }
    if row.currency.trim().is_empty() {
        return Err(ExpenseError::validation("Currency is empty"));
    }

    let mut tx = Transaction::new(
        date,
        row.merchant.trim(),
        amount,
        row.currency.as_str(),
        ExpenseCategory::from_label(&row.category),
        row.email.trim(),
    );

    if !row.description.trim().is_empty() {
        tx.description = row.description.trim().to_string();
    }

    if let Some(rate) = non_empty(row.exchange_rate) {
        tx.convert_to_usd(parse_amount(&rate)?)?;
    }

    if let Some(label) = non_empty(row.cabin_class) {
        let cabin = CabinClass::parse(&label)
            .ok_or_else(|| ExpenseError::validation(format!("Unknown cabin class '{}'", label)))?;
        tx.cabin_class = Some(cabin);
    }

    tx.participants = non_empty(row.participants);
    tx.document_url = non_empty(row.document_url);
    tx.import_hash = Some(tx.compute_import_hash());

    Ok(tx)
}

/// Parse CSV rows; rejected rows are collected, not fatal
pub fn load_csv_from_reader<R: Read>(reader: R) -> ExpenseResult<LoadedCsv> {
    let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let mut loaded = LoadedCsv::default();

    for (index, result) in rdr.deserialize::<CsvRow>().enumerate() {
        let line = index + 2;
        let parsed = result
            .map_err(ExpenseError::from)
            .and_then(row_to_transaction);

        match parsed {
            Ok(tx) => loaded.transactions.push(tx),
            Err(e) => {
                tracing::warn!(line, error = %e, "skipping CSV row");
                loaded.rejected.push(RejectedRow {
                    line,
                    reason: e.to_string(),
                });
            }
        }
    }

    Ok(loaded)
}

pub fn load_csv<P: AsRef<Path>>(path: P) -> ExpenseResult<LoadedCsv> {
    let file = std::fs::File::open(path.as_ref())?;
    load_csv_from_reader(file)
}

// ============================================================================
// IMPORT
// ============================================================================

/// Store new transactions in one audited commit, skipping duplicates and
/// linking each one to its owner's trip when a trip covers the date
pub fn import_transactions(
    store: &mut ExpenseStore,
    loaded: LoadedCsv,
) -> ExpenseResult<ImportSummary> {
    let trips = store.all_trips()?;
    let mut summary = ImportSummary {
        rows_read: loaded.transactions.len() + loaded.rejected.len(),
        rejected: loaded.rejected,
        ..ImportSummary::default()
    };

    let mut seen: HashSet<String> = HashSet::new();
    let mut changes = ChangeSet::new();

    for mut tx in loaded.transactions {
        let hash = tx.import_hash.clone().unwrap_or_else(|| tx.compute_import_hash());
        if !seen.insert(hash.clone()) || store.has_import_hash(&hash)? {
            summary.duplicates += 1;
            continue;
        }

        if let Some(trip) = find_trip_for(&tx, &trips) {
            tx.trip_id = Some(trip.id.clone());
            summary.linked_to_trips += 1;
        }

        changes = changes.add(tx);
        summary.imported += 1;
    }

    let outcome = store.save_changes(AuditContext::new(Some(IMPORT_USER)), changes)?;
    summary.audit_error = outcome.audit_error.map(|e| e.to_string());

    tracing::info!(
        imported = summary.imported,
        duplicates = summary.duplicates,
        rejected = summary.rejected.len(),
        "CSV import finished"
    );
    Ok(summary)
}

pub fn import_csv<P: AsRef<Path>>(store: &mut ExpenseStore, path: P) -> ExpenseResult<ImportSummary> {
    let loaded = load_csv(path)?;
    import_transactions(store, loaded)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::log::by_user;
    use crate::entities::Trip;
    use rust_decimal_macros::dec;
    use std::io::Write;

    const HEADER: &str = "Date,Description,Merchant,Amount,Currency,ExchangeRate,Category,Email,CabinClass,Participants,DocumentUrl\n";

    fn csv_text(rows: &[&str]) -> String {
        let mut text = HEADER.to_string();
        for row in rows {
            text.push_str(row);
            text.push('\n');
        }
        text
    }

    #[test]
    fn test_parse_rows() {
        let text = csv_text(&[
            "2024-03-04,Dinner with client,Le Bistro,\"$1,200.00\",EUR,1.08,Client Entertainment,ana@example.com,,bo@corp.com,https://r/1",
            "03/05/2024,,Delta,450,USD,,Airfare,ana@example.com,Business,,",
        ]);

        let loaded = load_csv_from_reader(text.as_bytes()).unwrap();

        assert!(loaded.rejected.is_empty());
        let dinner = &loaded.transactions[0];
        assert_eq!(dinner.amount, dec!(1200.00));
        assert_eq!(dinner.amount_usd, Some(dec!(1296.00)));
        assert_eq!(dinner.category, ExpenseCategory::ClientEntertainment);
        assert_eq!(dinner.description, "Dinner with client");
        assert!(dinner.has_participants());
        assert!(dinner.import_hash.is_some());

        let flight = &loaded.transactions[1];
        assert_eq!(flight.transaction_date, NaiveDate::from_ymd_opt(2024, 3, 5).unwrap());
        assert_eq!(flight.cabin_class, Some(CabinClass::Business));
        assert_eq!(flight.description, "Delta");
        assert_eq!(flight.document_url, None);
    }

    #[test]
    fn test_bad_rows_are_rejected_not_fatal() {
        let text = csv_text(&[
            "not-a-date,,Cafe,10,USD,,Meals,ana@example.com,,,",
            "2024-03-04,,Cafe,ten,USD,,Meals,ana@example.com,,,",
            "2024-03-04,,Cafe,10,USD,,Meals,ana@example.com,Rocket,,",
            "2024-03-04,,Cafe,10,USD,,Meals,ana@example.com,,,",
        ]);

        let loaded = load_csv_from_reader(text.as_bytes()).unwrap();

        assert_eq!(loaded.transactions.len(), 1);
        let lines: Vec<usize> = loaded.rejected.iter().map(|r| r.line).collect();
        assert_eq!(lines, vec![2, 3, 4]);
    }

    #[test]
    fn test_import_twice_is_idempotent() {
        let mut store = ExpenseStore::open_in_memory().unwrap();
        let text = csv_text(&[
            "2024-03-04,,Cafe,10,USD,,Meals,ana@example.com,,,",
            "2024-03-04,,Cafe,10,USD,,Meals,ANA@example.com,,,",
            "2024-03-05,,Taxi,25,USD,,Ground Transportation,ana@example.com,,,",
        ]);

        let first = import_transactions(&mut store, load_csv_from_reader(text.as_bytes()).unwrap()).unwrap();
        assert_eq!(first.rows_read, 3);
        assert_eq!(first.imported, 2);
        assert_eq!(first.duplicates, 1);
        assert!(first.audit_error.is_none());

        let second = import_transactions(&mut store, load_csv_from_reader(text.as_bytes()).unwrap()).unwrap();
        assert_eq!(second.imported, 0);
        assert_eq!(second.duplicates, 3);

        assert_eq!(store.transaction_count().unwrap(), 2);
        assert_eq!(by_user(store.connection(), IMPORT_USER).unwrap().len(), 2);
    }

    #[test]
    fn test_same_amount_different_scale_is_duplicate() {
        let mut store = ExpenseStore::open_in_memory().unwrap();
        let text = csv_text(&[
            "2024-03-04,,Cafe,10,USD,,Meals,ana@example.com,,,",
            "2024-03-04,,Cafe,$10.00,USD,,Meals,ana@example.com,,,",
        ]);

        let summary = import_transactions(&mut store, load_csv_from_reader(text.as_bytes()).unwrap()).unwrap();

        assert_eq!(summary.imported, 1);
        assert_eq!(summary.duplicates, 1);
        assert_eq!(store.transaction_count().unwrap(), 1);
    }

    #[test]
    fn test_import_links_trips() {
        let mut store = ExpenseStore::open_in_memory().unwrap();
        let trip = Trip::new(
            "Berlin",
            "ana@example.com",
            "ACME-DE",
            NaiveDate::from_ymd_opt(2024, 3, 3).unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, 6).unwrap(),
            "DE",
            "Berlin",
        )
        .unwrap();
        store.add_trip(AuditContext::system(), trip.clone()).unwrap();

        let text = csv_text(&[
            "2024-03-04,,Hotel Adlon,300,EUR,1.1,Lodging,ana@example.com,,,",
            "2024-04-04,,Cafe,10,USD,,Meals,ana@example.com,,,",
        ]);
        let summary = import_transactions(&mut store, load_csv_from_reader(text.as_bytes()).unwrap()).unwrap();

        assert_eq!(summary.linked_to_trips, 1);
        assert_eq!(store.transactions_for_trip(&trip.id).unwrap().len(), 1);
    }

    #[test]
    fn test_import_csv_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", csv_text(&["2024-03-04,,Cafe,10,USD,,Meals,ana@example.com,,,"])).unwrap();

        let mut store = ExpenseStore::open_in_memory().unwrap();
        let summary = import_csv(&mut store, file.path()).unwrap();

        assert_eq!(summary.imported, 1);
    }
}
