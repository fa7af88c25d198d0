//! Report assembly on top of the store: normalizes raw parameters, builds
//! the count and data plans, runs them concurrently through the TTL cache,
//! and packages rows with pagination metadata. The aux endpoints (levels,
//! stats, setup, domain config) live here too.

use std::sync::Arc;

use serde::Serialize;
use usage_reports_core::{
    build_report_query, normalize, CacheKey, DomainLookup, Pagination, QueryCache, QueryPlan,
    RawReportQuery, ReportKind, Row,
};
use usage_reports_store_sqlite::{ColumnInfo, StoreError, UsageStore};

/// Distinct roles seen in current, successful usage rows.
const LEVELS_SQL: &str = "SELECT DISTINCT role FROM user_info \
     WHERE tool_year = 2023 \
     AND (date_reset IS NULL OR date_reset > '2025-10-15 00:00:00') \
     AND outcome = 'Success' \
     AND email NOT LIKE 'collabtest+%' \
     AND role IS NOT NULL AND role != '' \
     ORDER BY role";

const STATS_OVERALL_SQL: &str = "SELECT COUNT(*) AS total, \
     COALESCE(SUM(rows_returned), 0) AS total_rows \
     FROM user_info \
     WHERE tool_year = 2023 AND date_reset IS NULL \
     AND outcome = 'Success' AND email NOT LIKE 'collabtest+%'";

const STATS_BY_LEVEL_SQL: &str = "SELECT role, \
     COUNT(DISTINCT email) AS user_count, \
     COUNT(*) AS query_count, \
     COALESCE(SUM(rows_returned), 0) AS total_rows \
     FROM user_info \
     WHERE tool_year = 2023 AND date_reset IS NULL \
     AND outcome = 'Success' AND email NOT LIKE 'collabtest+%' \
     GROUP BY role ORDER BY total_rows DESC LIMIT 10";

const STATS_LAST_7_DAYS_SQL: &str = "SELECT date(date_inserted) AS day, \
     COUNT(*) AS query_count, \
     COALESCE(SUM(rows_returned), 0) AS total_rows \
     FROM user_info \
     WHERE tool_year = 2023 AND date_reset IS NULL \
     AND outcome = 'Success' AND email NOT LIKE 'collabtest+%' \
     AND date_inserted >= date('now', '-7 day') \
     GROUP BY day ORDER BY day";

/// One assembled report page: the rows exactly as fetched (annotated for
/// the sanctioned-domains kind) plus the pagination echo.
#[derive(Debug, Clone)]
pub struct ReportPage {
    pub kind: ReportKind,
    pub rows: Vec<Row>,
    pub pagination: Pagination,
}

/// Aggregate dashboard statistics, shaped for direct serialization.
#[derive(Debug, Clone, Serialize)]
pub struct UsageStats {
    pub total: i64,
    #[serde(rename = "totalRows")]
    pub total_rows: i64,
    #[serde(rename = "byLevel")]
    pub by_level: Vec<Row>,
    #[serde(rename = "last7Days")]
    pub last_seven_days: Vec<Row>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ColumnSummary {
    pub field: String,
    #[serde(rename = "type")]
    pub column_type: String,
    pub key: String,
}

/// Diagnostic snapshot of the log table, for the setup endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SetupInfo {
    pub message: String,
    pub columns: usize,
    pub structure: Vec<ColumnSummary>,
}

/// The one object the service routes against: store pool, query cache,
/// and the sanctioned-domain watchlist loaded at startup.
pub struct ReportsApi {
    store: UsageStore,
    cache: QueryCache,
    domains: DomainLookup,
}

impl ReportsApi {
    #[must_use]
    pub fn new(store: UsageStore, cache: QueryCache, domains: DomainLookup) -> Self {
        Self { store, cache, domains }
    }

    #[must_use]
    pub fn domains(&self) -> &DomainLookup {
        &self.domains
    }

    /// Assemble one report page from raw query-string parameters.
    ///
    /// The count and data plans run concurrently; each resolves through
    /// the cache independently, so a repeated request within the TTL does
    /// not touch the pool at all.
    ///
    /// # Errors
    /// Returns an error when the pool is exhausted or either query fails.
    pub async fn report(
        &self,
        kind: ReportKind,
        raw: &RawReportQuery,
    ) -> Result<ReportPage, StoreError> {
        let request = normalize(kind, raw);
        let query = build_report_query(kind, &request, &self.domains);

        let (count_rows, data_rows) =
            tokio::join!(self.run_cached(&query.count), self.run_cached(&query.data));
        let count_rows = count_rows?;
        let data_rows = data_rows?;

        let total = count_rows
            .first()
            .and_then(|row| row.get("total"))
            .and_then(serde_json::Value::as_i64)
            .unwrap_or(0);
        let total = u64::try_from(total).unwrap_or(0);

        // Annotation happens on a copy so cached rows stay as fetched.
        let mut rows = data_rows.as_ref().clone();
        if kind == ReportKind::SanctionedDomains {
            self.domains.annotate(&mut rows);
        }

        Ok(ReportPage {
            kind,
            rows,
            pagination: Pagination::new(request.page, request.limit, total),
        })
    }

    /// Distinct role values for the dashboard's filter dropdown.
    ///
    /// # Errors
    /// Returns an error when the pool is exhausted or the query fails.
    pub async fn levels(&self) -> Result<Vec<String>, StoreError> {
        let plan = QueryPlan::new(LEVELS_SQL.to_string(), vec![]);
        let rows = self.run_cached(&plan).await?;
        Ok(rows
            .iter()
            .filter_map(|row| row.get("role"))
            .filter_map(serde_json::Value::as_str)
            .map(ToString::to_string)
            .collect())
    }

    /// # Errors
    /// Returns an error when the pool is exhausted or any query fails.
    pub async fn stats(&self) -> Result<UsageStats, StoreError> {
        let overall = self
            .run_cached(&QueryPlan::new(STATS_OVERALL_SQL.to_string(), vec![]))
            .await?;
        let by_level = self
            .run_cached(&QueryPlan::new(STATS_BY_LEVEL_SQL.to_string(), vec![]))
            .await?;
        let last_seven_days = self
            .run_cached(&QueryPlan::new(STATS_LAST_7_DAYS_SQL.to_string(), vec![]))
            .await?;

        let overall = overall.first().cloned().unwrap_or_default();
        let field = |name: &str| {
            overall
                .get(name)
                .and_then(serde_json::Value::as_i64)
                .unwrap_or(0)
        };

        Ok(UsageStats {
            total: field("total"),
            total_rows: field("total_rows"),
            by_level: by_level.as_ref().clone(),
            last_seven_days: last_seven_days.as_ref().clone(),
        })
    }

    /// # Errors
    /// Returns an error when the pool is exhausted or the pragma fails.
    pub async fn setup(&self) -> Result<SetupInfo, StoreError> {
        let columns = self.store.log_table_structure().await?;
        let structure: Vec<ColumnSummary> = columns.into_iter().map(column_summary).collect();
        Ok(SetupInfo {
            message: format!("user_info table has {} columns", structure.len()),
            columns: structure.len(),
            structure,
        })
    }

    async fn run_cached(&self, plan: &QueryPlan) -> Result<Arc<Vec<Row>>, StoreError> {
        if !plan.is_cacheable() {
            return Ok(Arc::new(self.store.select(plan).await?));
        }

        let key = CacheKey::from_plan(plan);
        if let Some(rows) = self.cache.get(&key) {
            return Ok(rows);
        }
        let rows = Arc::new(self.store.select(plan).await?);
        self.cache.put(key, Arc::clone(&rows));
        Ok(rows)
    }
}

fn column_summary(column: ColumnInfo) -> ColumnSummary {
    ColumnSummary {
        field: column.name,
        column_type: column.column_type,
        key: if column.primary_key { "PRI" } else { "" }.to_string(),
    }
}
