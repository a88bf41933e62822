// Expense Compliance - Web Server
// REST API over the compliance engine, tax exposure, and audit trail

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tower_http::cors::CorsLayer;
use tracing_subscriber::EnvFilter;

use expense_compliance::audit::log::{by_date_range, by_user, history, search, stats};
use expense_compliance::{
    AppConfig, ComplianceEngine, ComplianceReport, ExpenseError, ExpenseStore, PolicyRuleSet,
    TaxRuleTable,
};

/// Shared application state
#[derive(Clone)]
struct AppState {
    store: Arc<Mutex<ExpenseStore>>,
    rules: PolicyRuleSet,
    tax_rules: Arc<TaxRuleTable>,
}

impl AppState {
    fn store(&self) -> Result<MutexGuard<'_, ExpenseStore>, ApiError> {
        self.store
            .lock()
            .map_err(|_| ApiError::internal("store lock poisoned"))
    }

    /// Engine bound to the rules in effect for this request
    fn engine(&self) -> ComplianceEngine {
        ComplianceEngine::from_rule_set(&self.rules)
    }
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

/// Error → HTTP status
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn internal(message: &str) -> Self {
        ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.to_string(),
        }
    }
}

impl From<ExpenseError> for ApiError {
    fn from(err: ExpenseError) -> Self {
        let status = match &err {
            ExpenseError::NotFound { .. } => StatusCode::NOT_FOUND,
            ExpenseError::Validation(_) => StatusCode::BAD_REQUEST,
            ExpenseError::ConcurrencyConflict { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %err, "request failed");
        }
        ApiError {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(self.message),
        };
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    ApiResponse::ok("OK")
}

#[derive(Deserialize)]
struct EvaluationQuery {
    /// Evaluation instant; defaults to now
    at: Option<DateTime<Utc>>,
}

/// GET /api/transactions/:id/compliance
async fn transaction_compliance(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<EvaluationQuery>,
) -> ApiResult<expense_compliance::PolicyComplianceResult> {
    let engine = state.engine();
    let store = state.store()?;
    let result = store.check_transaction(
        &engine,
        &state.tax_rules,
        &id,
        query.at.unwrap_or_else(Utc::now),
    )?;
    Ok(ApiResponse::ok(result))
}

/// GET /api/compliance - Report over every transaction
async fn compliance_report(
    State(state): State<AppState>,
    Query(query): Query<EvaluationQuery>,
) -> ApiResult<ComplianceReport> {
    let engine = state.engine();
    let store = state.store()?;
    let results = store.check_all_transactions(
        &engine,
        &state.tax_rules,
        query.at.unwrap_or_else(Utc::now),
    )?;
    Ok(ApiResponse::ok(ComplianceReport::from_results(&results)))
}

/// GET /api/trips/:id/tax-exposure
async fn trip_tax_exposure(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<expense_compliance::TaxExposureResult> {
    let store = state.store()?;
    Ok(ApiResponse::ok(store.trip_tax_exposure(&state.tax_rules, &id)?))
}

/// GET /api/audit/history/:table/:record_id
async fn audit_history(
    State(state): State<AppState>,
    Path((table, record_id)): Path<(String, String)>,
) -> ApiResult<Vec<expense_compliance::AuditRecord>> {
    let store = state.store()?;
    let records = history(store.connection(), &table, &record_id)?;
    Ok(ApiResponse::ok(records))
}

/// GET /api/audit/user/:user_id
async fn audit_by_user(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<Vec<expense_compliance::AuditRecord>> {
    let store = state.store()?;
    Ok(ApiResponse::ok(by_user(store.connection(), &user_id)?))
}

#[derive(Deserialize)]
struct RangeQuery {
    from: DateTime<Utc>,
    to: DateTime<Utc>,
}

/// GET /api/audit/range?from=...&to=...
async fn audit_by_range(
    State(state): State<AppState>,
    Query(range): Query<RangeQuery>,
) -> ApiResult<Vec<expense_compliance::AuditRecord>> {
    let store = state.store()?;
    Ok(ApiResponse::ok(by_date_range(store.connection(), range.from, range.to)?))
}

#[derive(Deserialize)]
struct SearchQuery {
    q: String,
}

/// GET /api/audit/search?q=...
async fn audit_search(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> ApiResult<Vec<expense_compliance::AuditRecord>> {
    let store = state.store()?;
    Ok(ApiResponse::ok(search(store.connection(), &query.q)?))
}

/// GET /api/audit/stats - Dashboard counts
async fn audit_stats(State(state): State<AppState>) -> ApiResult<expense_compliance::AuditStats> {
    let store = state.store()?;
    Ok(ApiResponse::ok(stats(store.connection())?))
}

/// GET /api/audit/can-restore/:table/:record_id
async fn can_restore(
    State(state): State<AppState>,
    Path((table, record_id)): Path<(String, String)>,
) -> ApiResult<bool> {
    let store = state.store()?;
    Ok(ApiResponse::ok(store.can_restore(&table, &record_id)?))
}

#[derive(Deserialize)]
struct RestoreQuery {
    user: Option<String>,
}

#[derive(Serialize)]
struct RestoreResponse {
    restored: Vec<String>,
    audit_ids: Vec<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    audit_error: Option<String>,
}

/// POST /api/audit/restore/:id?user=...
async fn restore(
    State(state): State<AppState>,
    Path(audit_id): Path<i64>,
    Query(query): Query<RestoreQuery>,
) -> ApiResult<RestoreResponse> {
    let mut store = state.store()?;
    let outcome = store.restore_from_audit(audit_id, query.user.as_deref())?;

    Ok(ApiResponse::ok(RestoreResponse {
        restored: outcome.committed.iter().map(|e| e.id().to_string()).collect(),
        audit_ids: outcome.audit_records.iter().map(|r| r.id).collect(),
        audit_error: outcome.audit_error.map(|e| e.to_string()),
    }))
}

/// API routes under /api
fn build_app(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/compliance", get(compliance_report))
        .route("/transactions/:id/compliance", get(transaction_compliance))
        .route("/trips/:id/tax-exposure", get(trip_tax_exposure))
        .route("/audit/history/:table/:record_id", get(audit_history))
        .route("/audit/user/:user_id", get(audit_by_user))
        .route("/audit/range", get(audit_by_range))
        .route("/audit/search", get(audit_search))
        .route("/audit/stats", get(audit_stats))
        .route("/audit/can-restore/:table/:record_id", get(can_restore))
        .route("/audit/restore/:id", post(restore))
        .with_state(state);

    Router::new()
        .nest("/api", api_routes)
        .layer(CorsLayer::permissive())
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    println!("🌐 Expense Compliance - Web Server");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let config = AppConfig::from_env();
    let store = ExpenseStore::open(&config.db_path)?;
    println!("✓ Database opened: {:?}", config.db_path);

    let state = AppState {
        store: Arc::new(Mutex::new(store)),
        rules: PolicyRuleSet::new(config.load_policy_rules()?),
        tax_rules: Arc::new(config.load_tax_rules()?),
    };

    let app = build_app(state);

    let listener = tokio::net::TcpListener::bind(&config.server_addr).await?;

    println!("\n🚀 Server running on http://{}", config.server_addr);
    println!("   API: http://{}/api/compliance", config.server_addr);
    println!("\n   Press Ctrl+C to stop\n");

    axum::serve(listener, app).await?;
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use expense_compliance::{AuditContext, Trip};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn state_with_trip(trip_id: &str) -> AppState {
        let mut store = ExpenseStore::open_in_memory().unwrap();
        let mut trip = Trip::new(
            "Lyon",
            "ana@example.com",
            "ACME-FR",
            NaiveDate::from_ymd_opt(2024, 5, 6).unwrap(),
            NaiveDate::from_ymd_opt(2024, 5, 8).unwrap(),
            "FR",
            "Lyon",
        )
        .unwrap();
        trip.id = trip_id.to_string();
        store.add_trip(AuditContext::system(), trip).unwrap();

        AppState {
            store: Arc::new(Mutex::new(store)),
            rules: PolicyRuleSet::new(Default::default()),
            tax_rules: Arc::new(TaxRuleTable::new()),
        }
    }

    async fn get_body(app: Router, path: &str) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n", path);
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_history_path_is_decoded_once() {
        let app = build_app(state_with_trip("trip%41"));

        let response = get_body(app, "/api/audit/history/Trip/trip%2541").await;

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains(r#""record_id":"trip%41""#));
        assert!(response.contains(r#""action":"Added""#));
    }
}
