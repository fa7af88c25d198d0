use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use usage_reports_api::ReportsApi;
use usage_reports_core::{DomainLookup, QueryCache, RawReportQuery, ReportKind};
use usage_reports_store_sqlite::{PoolConfig, StoreError, UsageStore};

#[derive(Debug, Parser)]
#[command(name = "usage-reports-service")]
#[command(about = "HTTP service for the usage-reports dashboard")]
struct Args {
    #[arg(long, default_value = "./usage_reports.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    /// Sanctioned-domain watchlist; a missing or malformed file degrades
    /// to an empty lookup with a warning.
    #[arg(long, default_value = "./sanction-domains.json")]
    domains: PathBuf,
    #[arg(long, default_value_t = 4)]
    workers: usize,
    #[arg(long, default_value_t = 64)]
    queue_limit: usize,
}

#[derive(Clone)]
struct ServiceState {
    api: Arc<ReportsApi>,
}

/// Failed request: the detail goes to the log, the client gets a generic
/// message so query text never leaks into responses.
struct ApiFailure(StoreError);

impl From<StoreError> for ApiFailure {
    fn from(err: StoreError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        let status = match self.0 {
            StoreError::PoolExhausted => StatusCode::SERVICE_UNAVAILABLE,
            StoreError::WorkerGone | StoreError::Sqlite(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        tracing::error!(error = %self.0, "request failed");
        let body = serde_json::json!({ "error": "failed to build the report" });
        (status, Json(body)).into_response()
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/user-summary", get(user_summary))
        .route("/api/logs", get(logs))
        .route("/api/cap-resets", get(cap_resets))
        .route("/api/sanction-domains", get(sanction_domains))
        .route("/api/cap-resets-jira", get(cap_resets_jira))
        .route("/api/levels", get(levels))
        .route("/api/stats", get(stats))
        .route("/api/sanction-domains-config", get(sanction_domains_config))
        .route("/api/setup", post(setup))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let domains = match DomainLookup::load(&args.domains) {
        Ok(lookup) => {
            tracing::info!(path = %args.domains.display(), domains = lookup.len(), "domain watchlist loaded");
            lookup
        }
        Err(err) => {
            tracing::warn!(
                path = %args.domains.display(),
                error = %err,
                "domain watchlist unavailable; sanctioned-domains report will be empty"
            );
            DomainLookup::default()
        }
    };

    let store = UsageStore::open_with(
        &args.db,
        PoolConfig { workers: args.workers, queue_limit: args.queue_limit },
    )?;
    let state = ServiceState {
        api: Arc::new(ReportsApi::new(store, QueryCache::default(), domains)),
    };

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, db = %args.db.display(), "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn report_response(
    state: &ServiceState,
    kind: ReportKind,
    raw: &RawReportQuery,
) -> Result<Json<serde_json::Value>, ApiFailure> {
    let page = state.api.report(kind, raw).await?;

    let mut body = serde_json::Map::new();
    body.insert(
        page.kind.rows_key().to_string(),
        serde_json::Value::from(page.rows),
    );
    body.insert(
        "pagination".to_string(),
        serde_json::to_value(page.pagination).unwrap_or(serde_json::Value::Null),
    );
    Ok(Json(serde_json::Value::Object(body)))
}

async fn user_summary(
    State(state): State<ServiceState>,
    Query(raw): Query<RawReportQuery>,
) -> Result<Json<serde_json::Value>, ApiFailure> {
    report_response(&state, ReportKind::UserSummary, &raw).await
}

async fn logs(
    State(state): State<ServiceState>,
    Query(raw): Query<RawReportQuery>,
) -> Result<Json<serde_json::Value>, ApiFailure> {
    report_response(&state, ReportKind::DetailedLogs, &raw).await
}

async fn cap_resets(
    State(state): State<ServiceState>,
    Query(raw): Query<RawReportQuery>,
) -> Result<Json<serde_json::Value>, ApiFailure> {
    report_response(&state, ReportKind::CapResets, &raw).await
}

async fn sanction_domains(
    State(state): State<ServiceState>,
    Query(raw): Query<RawReportQuery>,
) -> Result<Json<serde_json::Value>, ApiFailure> {
    report_response(&state, ReportKind::SanctionedDomains, &raw).await
}

async fn cap_resets_jira(
    State(state): State<ServiceState>,
    Query(raw): Query<RawReportQuery>,
) -> Result<Json<serde_json::Value>, ApiFailure> {
    report_response(&state, ReportKind::JiraCapRequests, &raw).await
}

async fn levels(State(state): State<ServiceState>) -> Result<Json<Vec<String>>, ApiFailure> {
    Ok(Json(state.api.levels().await?))
}

async fn stats(
    State(state): State<ServiceState>,
) -> Result<Json<serde_json::Value>, ApiFailure> {
    let stats = state.api.stats().await?;
    Ok(Json(
        serde_json::to_value(stats).unwrap_or(serde_json::Value::Null),
    ))
}

async fn sanction_domains_config(
    State(state): State<ServiceState>,
) -> Result<Json<serde_json::Value>, ApiFailure> {
    Ok(Json(
        serde_json::to_value(state.api.domains()).unwrap_or(serde_json::Value::Null),
    ))
}

async fn setup(State(state): State<ServiceState>) -> Result<Json<serde_json::Value>, ApiFailure> {
    let info = state.api.setup().await?;
    Ok(Json(
        serde_json::to_value(info).unwrap_or(serde_json::Value::Null),
    ))
}
