use anyhow::{bail, Context, Result};
use chrono::Utc;
use std::env;
use tracing_subscriber::EnvFilter;

use expense_compliance::audit::log::{history, stats};
use expense_compliance::{
    import_csv, AppConfig, ComplianceEngine, ComplianceReport, ExpenseStore,
};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = env::args().collect();
    let config = AppConfig::from_env();

    match args.get(1).map(String::as_str) {
        Some("import") => {
            let csv_path = args.get(2).context("usage: expense-compliance import <csv>")?;
            run_import(&config, csv_path)
        }
        Some("check") => run_check(&config),
        Some("tax") => {
            let trip_id = args.get(2).context("usage: expense-compliance tax <trip-id>")?;
            run_tax(&config, trip_id)
        }
        Some("history") => match (args.get(2), args.get(3)) {
            (Some(table), Some(record_id)) => run_history(&config, table, record_id),
            _ => bail!("usage: expense-compliance history <table> <record-id>"),
        },
        Some("restore") => {
            let audit_id: i64 = args
                .get(2)
                .context("usage: expense-compliance restore <audit-id>")?
                .parse()
                .context("audit id must be a number")?;
            run_restore(&config, audit_id)
        }
        Some("stats") => run_stats(&config),
        _ => {
            print_usage();
            Ok(())
        }
    }
}

fn print_usage() {
    println!("expense-compliance {}", expense_compliance::VERSION);
    println!();
    println!("Commands:");
    println!("  import <csv>                   Import card transactions");
    println!("  check                          Compliance report for every transaction");
    println!("  tax <trip-id>                  Tax exposure for one trip");
    println!("  history <table> <record-id>    Audit history (table: Transaction | Trip)");
    println!("  restore <audit-id>             Restore the state before an audit record");
    println!("  stats                          Audit counts by action, table, user");
    println!();
    println!("Environment: EXPENSE_DB, EXPENSE_POLICY_FILE, EXPENSE_TAX_RULES_FILE, EXPENSE_USER");
}

fn open_store(config: &AppConfig) -> Result<ExpenseStore> {
    ExpenseStore::open(&config.db_path)
        .with_context(|| format!("Failed to open database {}", config.db_path.display()))
}

fn run_import(config: &AppConfig, csv_path: &str) -> Result<()> {
    println!("📥 Importing {}", csv_path);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let mut store = open_store(config)?;
    let summary = import_csv(&mut store, csv_path)?;

    println!("✓ Rows read:         {}", summary.rows_read);
    println!("✓ Imported:          {}", summary.imported);
    println!("✓ Skipped duplicates: {}", summary.duplicates);
    println!("✓ Linked to trips:   {}", summary.linked_to_trips);

    if !summary.rejected.is_empty() {
        println!("\n⚠️  Rejected rows:");
        for row in &summary.rejected {
            println!("   line {}: {}", row.line, row.reason);
        }
    }

    if let Some(err) = &summary.audit_error {
        eprintln!("\n❌ Rows were stored but the audit trail was not: {}", err);
    }

    println!("\n✓ Database contains {} transactions", store.transaction_count()?);
    Ok(())
}

fn run_check(config: &AppConfig) -> Result<()> {
    let store = open_store(config)?;
    let engine = ComplianceEngine::new(std::sync::Arc::new(config.load_policy_rules()?));
    let tax_rules = config.load_tax_rules()?;

    let results = store.check_all_transactions(&engine, &tax_rules, Utc::now())?;
    ComplianceReport::from_results(&results).print_summary();
    Ok(())
}

fn run_tax(config: &AppConfig, trip_id: &str) -> Result<()> {
    let store = open_store(config)?;
    let tax_rules = config.load_tax_rules()?;
    let exposure = store.trip_tax_exposure(&tax_rules, trip_id)?;

    println!("{}", serde_json::to_string_pretty(&exposure)?);
    Ok(())
}

fn run_history(config: &AppConfig, table: &str, record_id: &str) -> Result<()> {
    let store = open_store(config)?;
    let records = history(store.connection(), table, record_id)?;

    if records.is_empty() {
        println!("No audit history for {} {}", table, record_id);
        return Ok(());
    }

    println!("📜 {} {}", table, record_id);
    for record in &records {
        println!(
            "  #{:<5} {}  {:<9} by {}  fields: {}",
            record.id,
            record.timestamp.format("%Y-%m-%d %H:%M:%S"),
            record.action.as_str(),
            record.user_id,
            record.changed_fields().join(", ")
        );
        if let Some(comment) = &record.comment {
            println!("         {}", comment);
        }
    }
    Ok(())
}

fn run_restore(config: &AppConfig, audit_id: i64) -> Result<()> {
    let mut store = open_store(config)?;
    let outcome = store.restore_from_audit(audit_id, Some(&config.user))?;

    println!("✅ Restored from audit record {}", audit_id);
    for entity in &outcome.committed {
        println!("   {} {}", entity.table(), entity.id());
    }
    if let Some(err) = &outcome.audit_error {
        eprintln!("❌ {}", err);
    }
    Ok(())
}

fn run_stats(config: &AppConfig) -> Result<()> {
    let store = open_store(config)?;
    let stats = stats(store.connection())?;

    println!("📊 Audit records: {}", stats.total);
    for (label, counts) in [
        ("By action", &stats.by_action),
        ("By table", &stats.by_table),
        ("By user", &stats.by_user),
    ] {
        println!("\n{}:", label);
        for (key, count) in counts {
            println!("  {:<24} {}", key, count);
        }
    }
    Ok(())
}
