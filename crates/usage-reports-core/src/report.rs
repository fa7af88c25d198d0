use serde::{Deserialize, Serialize};

use crate::domains::DomainLookup;
use crate::request::{ReportRequest, SearchTerm, SortSpec};

/// Fixed business predicates shared by every "current" report: the tool
/// year under report, successful outcomes only, synthetic test accounts
/// excluded, and records invalidated by a reset after the cutoff hidden.
const CURRENT_BASE_WHERE: &str = "tool_year = 2023 \
     AND (date_reset IS NULL OR date_reset > '2025-10-15 00:00:00') \
     AND outcome = 'Success' \
     AND email NOT LIKE 'collabtest+%'";

/// The cap-resets report inverts the reset predicate: it selects exactly
/// the rows the current reports exclude.
const CAP_RESETS_BASE_WHERE: &str = "tool_year = 2023 \
     AND tool_id = 1 \
     AND date_reset > '2025-10-13' \
     AND email NOT LIKE 'collabtest+%'";

/// The five aggregation shapes exposed by the dashboard.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ReportKind {
    UserSummary,
    DetailedLogs,
    CapResets,
    SanctionedDomains,
    JiraCapRequests,
}

impl ReportKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserSummary => "user-summary",
            Self::DetailedLogs => "detailed-logs",
            Self::CapResets => "cap-resets",
            Self::SanctionedDomains => "sanctioned-domains",
            Self::JiraCapRequests => "jira-cap-requests",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user-summary" => Some(Self::UserSummary),
            "detailed-logs" => Some(Self::DetailedLogs),
            "cap-resets" => Some(Self::CapResets),
            "sanctioned-domains" => Some(Self::SanctionedDomains),
            "jira-cap-requests" => Some(Self::JiraCapRequests),
            _ => None,
        }
    }

    /// Key under which this report's rows appear in the response body.
    #[must_use]
    pub fn rows_key(self) -> &'static str {
        match self {
            Self::UserSummary | Self::SanctionedDomains => "users",
            Self::DetailedLogs => "logs",
            Self::CapResets => "capResets",
            Self::JiraCapRequests => "jiraRequests",
        }
    }

    /// Whether the kind honors the `level` (role) filter.
    #[must_use]
    pub fn has_role_filter(self) -> bool {
        !matches!(self, Self::JiraCapRequests)
    }

    /// Columns accepted for ORDER BY. Identifiers outside this list are
    /// never concatenated into a query.
    #[must_use]
    pub fn sort_columns(self) -> &'static [&'static str] {
        match self {
            Self::UserSummary | Self::SanctionedDomains => &[
                "email",
                "role",
                "total_downloads",
                "total_rows",
                "latest_ip_address",
                "first_download",
                "last_download",
            ],
            Self::DetailedLogs => &[
                "date_inserted",
                "email",
                "ip_address",
                "queue_name",
                "rows_returned",
                "role",
            ],
            Self::CapResets => &["email", "role", "total_rows", "reset_count", "latest_reset"],
            Self::JiraCapRequests => &[
                "requestor_email",
                "approved_count",
                "denied_count",
                "todo_count",
                "total_count",
                "latest_request",
                "first_request",
            ],
        }
    }

    /// Fixed fallback order; keeps LIMIT/OFFSET pagination deterministic
    /// when no explicit sort was accepted.
    #[must_use]
    pub fn default_order(self) -> &'static str {
        match self {
            Self::UserSummary => "total_rows DESC",
            Self::DetailedLogs => "date_inserted DESC",
            Self::CapResets => "latest_reset DESC",
            Self::SanctionedDomains => "last_download DESC",
            Self::JiraCapRequests => "total_count DESC",
        }
    }

    fn data_select(self) -> &'static str {
        match self {
            Self::UserSummary | Self::SanctionedDomains => {
                "SELECT email, role, COUNT(*) AS total_downloads, \
                 SUM(rows_returned) AS total_rows, \
                 MIN(date_inserted) AS first_download, \
                 MAX(date_inserted) AS last_download, \
                 MAX(ip_address) AS latest_ip_address \
                 FROM user_info"
            }
            Self::DetailedLogs => {
                "SELECT email, role, ip_address, queue_name, rows_returned, \
                 date_inserted, permalink \
                 FROM user_info"
            }
            Self::CapResets => {
                "SELECT email, COUNT(DISTINCT date_reset) AS reset_count, \
                 SUM(rows_returned) AS total_rows, role, \
                 date(MAX(date_reset)) AS latest_reset \
                 FROM user_info"
            }
            Self::JiraCapRequests => {
                "SELECT requestor_email, \
                 COUNT(CASE WHEN status = 'Approved' THEN 1 END) AS approved_count, \
                 COUNT(CASE WHEN status = 'Denied' THEN 1 END) AS denied_count, \
                 COUNT(CASE WHEN status = 'To Do' THEN 1 END) AS todo_count, \
                 COUNT(*) AS total_count, \
                 MAX(created) AS latest_request, \
                 MIN(created) AS first_request, \
                 group_concat(CASE WHEN status = 'Denied' AND labels IS NOT NULL \
                 AND labels != '' THEN strftime('%Y-%m-%d', created) || '|' || labels END, \
                 ';;;') AS denied_details \
                 FROM jira_issues"
            }
        }
    }

    fn count_select(self) -> &'static str {
        match self {
            Self::UserSummary | Self::CapResets | Self::SanctionedDomains => {
                "SELECT COUNT(DISTINCT email) AS total FROM user_info"
            }
            Self::DetailedLogs => "SELECT COUNT(*) AS total FROM user_info",
            Self::JiraCapRequests => {
                "SELECT COUNT(DISTINCT requestor_email) AS total FROM jira_issues"
            }
        }
    }

    fn base_where(self) -> &'static str {
        match self {
            Self::UserSummary | Self::DetailedLogs | Self::SanctionedDomains => CURRENT_BASE_WHERE,
            Self::CapResets => CAP_RESETS_BASE_WHERE,
            Self::JiraCapRequests => "1 = 1",
        }
    }

    fn group_by(self) -> Option<&'static str> {
        match self {
            Self::UserSummary | Self::SanctionedDomains => Some("email, role"),
            Self::CapResets => Some("email"),
            Self::JiraCapRequests => Some("requestor_email"),
            Self::DetailedLogs => None,
        }
    }

    /// Column holding the email address, for search predicates.
    fn email_column(self) -> &'static str {
        match self {
            Self::JiraCapRequests => "requestor_email",
            _ => "email",
        }
    }

    /// Column the start/end date filters apply to.
    fn date_column(self) -> &'static str {
        match self {
            Self::CapResets => "date_reset",
            Self::JiraCapRequests => "created",
            _ => "date_inserted",
        }
    }
}

/// A bindable query parameter. Report queries only ever bind text and
/// integers, which keeps the type hashable for use in cache keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SqlParam {
    Text(String),
    Int(i64),
}

/// One parameterized statement. User-controlled values are always bound
/// through `params`; the only concatenated identifiers are the
/// allow-list-validated ORDER BY column and direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryPlan {
    pub sql: String,
    pub params: Vec<SqlParam>,
    cacheable: bool,
}

impl QueryPlan {
    /// A plan eligible for the read cache when it is a pure SELECT.
    #[must_use]
    pub fn new(sql: String, params: Vec<SqlParam>) -> Self {
        let cacheable = sql.trim_start().get(..6).is_some_and(|head| {
            head.eq_ignore_ascii_case("select")
        });
        Self { sql, params, cacheable }
    }

    /// A plan that always bypasses the cache.
    #[must_use]
    pub fn uncached(sql: String, params: Vec<SqlParam>) -> Self {
        Self { sql, params, cacheable: false }
    }

    #[must_use]
    pub fn is_cacheable(&self) -> bool {
        self.cacheable
    }
}

/// The two plans a report resolves to: a total count over the distinct
/// grouping key, and the paginated, sorted, aggregated data page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportQuery {
    pub count: QueryPlan,
    pub data: QueryPlan,
}

/// Build the count and data plans for a report kind from a normalized
/// request. The sanctioned-domains kind additionally restricts rows to
/// the configured watchlist; an empty lookup yields an empty report
/// (constant-false predicate) rather than malformed SQL.
#[must_use]
pub fn build_report_query(
    kind: ReportKind,
    request: &ReportRequest,
    domains: &DomainLookup,
) -> ReportQuery {
    let mut where_sql = String::from(kind.base_where());
    let mut params: Vec<SqlParam> = Vec::new();

    if kind == ReportKind::SanctionedDomains {
        push_watchlist_filter(&mut where_sql, &mut params, domains);
    }

    if let Some(role) = &request.role {
        if kind == ReportKind::CapResets {
            where_sql.push_str(" AND LOWER(role) = LOWER(?)");
        } else {
            where_sql.push_str(" AND role = ?");
        }
        params.push(SqlParam::Text(role.clone()));
    }

    if let Some(search) = &request.search {
        push_search_filter(kind, &mut where_sql, &mut params, search);
    }

    if let Some(start) = &request.start {
        where_sql.push_str(" AND ");
        where_sql.push_str(kind.date_column());
        where_sql.push_str(" >= ?");
        params.push(SqlParam::Text(start.clone()));
    }

    if let Some(end) = &request.end {
        where_sql.push_str(" AND ");
        where_sql.push_str(kind.date_column());
        where_sql.push_str(" <= ?");
        params.push(SqlParam::Text(end.clone()));
    }

    let count_sql = format!("{} WHERE {}", kind.count_select(), where_sql);
    let count = QueryPlan::new(count_sql, params.clone());

    let mut data_sql = format!("{} WHERE {}", kind.data_select(), where_sql);
    if let Some(group_by) = kind.group_by() {
        data_sql.push_str(" GROUP BY ");
        data_sql.push_str(group_by);
    }
    data_sql.push_str(" ORDER BY ");
    data_sql.push_str(&order_clause(kind, request.sort.as_ref()));
    data_sql.push_str(" LIMIT ? OFFSET ?");

    let mut data_params = params;
    data_params.push(SqlParam::Int(i64::from(request.limit)));
    data_params.push(SqlParam::Int(
        i64::try_from(request.offset()).unwrap_or(i64::MAX),
    ));

    ReportQuery { count, data: QueryPlan::new(data_sql, data_params) }
}

/// ORDER BY from a validated sort, or the kind's default. Membership is
/// re-checked here so a hand-built [`SortSpec`] cannot smuggle an
/// identifier past the allow-list.
fn order_clause(kind: ReportKind, sort: Option<&SortSpec>) -> String {
    match sort {
        Some(sort) if kind.sort_columns().contains(&sort.column.as_str()) => {
            format!("{} {}", sort.column, sort.direction.as_sql())
        }
        _ => kind.default_order().to_string(),
    }
}

fn push_search_filter(
    kind: ReportKind,
    where_sql: &mut String,
    params: &mut Vec<SqlParam>,
    search: &SearchTerm,
) {
    let email = kind.email_column();
    match search {
        SearchTerm::Domain(domain) => {
            // Case-insensitive suffix match on the domain part; both the
            // `@d` and `*.d` spellings resolve to the same pattern.
            where_sql.push_str(" AND LOWER(");
            where_sql.push_str(email);
            where_sql.push_str(") LIKE ?");
            params.push(SqlParam::Text(format!("%@{domain}")));
        }
        SearchTerm::Substring(term) => {
            if kind == ReportKind::CapResets {
                // This endpoint has always matched case-insensitively,
                // unlike its siblings; preserved as observed.
                where_sql.push_str(" AND LOWER(");
                where_sql.push_str(email);
                where_sql.push_str(") LIKE ?");
                params.push(SqlParam::Text(format!("%{}%", term.to_lowercase())));
            } else {
                // Case-sensitive substring; SQLite LIKE folds ASCII case,
                // so use instr instead.
                where_sql.push_str(" AND instr(");
                where_sql.push_str(email);
                where_sql.push_str(", ?) > 0");
                params.push(SqlParam::Text(term.clone()));
            }
        }
    }
}

fn push_watchlist_filter(
    where_sql: &mut String,
    params: &mut Vec<SqlParam>,
    domains: &DomainLookup,
) {
    if domains.is_empty() {
        where_sql.push_str(" AND 0 = 1");
        return;
    }

    let conditions = domains
        .domains()
        .map(|_| "LOWER(email) LIKE ?")
        .collect::<Vec<_>>()
        .join(" OR ");
    where_sql.push_str(" AND (");
    where_sql.push_str(&conditions);
    where_sql.push(')');
    for domain in domains.domains() {
        params.push(SqlParam::Text(format!("%{}", domain.to_ascii_lowercase())));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{normalize, RawReportQuery, SortDirection};

    fn request_with(pairs: &[(&str, &str)], kind: ReportKind) -> ReportRequest {
        let mut query = RawReportQuery::default();
        for (key, value) in pairs {
            let value = Some((*value).to_string());
            match *key {
                "page" => query.page = value,
                "limit" => query.limit = value,
                "level" => query.level = value,
                "search" => query.search = value,
                "startDate" => query.start_date = value,
                "endDate" => query.end_date = value,
                "sortBy" => query.sort_by = value,
                "sortOrder" => query.sort_order = value,
                other => panic!("unknown raw parameter: {other}"),
            }
        }
        normalize(kind, &query)
    }

    #[test]
    fn report_kind_round_trips_through_parse() {
        for kind in [
            ReportKind::UserSummary,
            ReportKind::DetailedLogs,
            ReportKind::CapResets,
            ReportKind::SanctionedDomains,
            ReportKind::JiraCapRequests,
        ] {
            assert_eq!(ReportKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ReportKind::parse("passwords"), None);
    }

    #[test]
    fn default_query_has_fixed_predicates_and_default_order() {
        let request = request_with(&[], ReportKind::UserSummary);
        let query = build_report_query(ReportKind::UserSummary, &request, &DomainLookup::default());

        assert!(query.count.sql.contains("COUNT(DISTINCT email)"));
        assert!(query.count.sql.contains("outcome = 'Success'"));
        assert!(query.count.sql.contains("NOT LIKE 'collabtest+%'"));
        assert!(query.data.sql.contains("GROUP BY email, role"));
        assert!(query.data.sql.ends_with("ORDER BY total_rows DESC LIMIT ? OFFSET ?"));
        assert_eq!(query.count.params, vec![]);
        assert_eq!(
            query.data.params,
            vec![SqlParam::Int(50), SqlParam::Int(0)]
        );
    }

    #[test]
    fn role_and_date_filters_bind_parameters() {
        let request = request_with(
            &[("level", "admin"), ("startDate", "2023-05-01"), ("endDate", "2023-05-31")],
            ReportKind::DetailedLogs,
        );
        let query =
            build_report_query(ReportKind::DetailedLogs, &request, &DomainLookup::default());

        assert!(query.count.sql.contains("role = ?"));
        assert!(query.count.sql.contains("date_inserted >= ?"));
        assert!(query.count.sql.contains("date_inserted <= ?"));
        assert_eq!(
            query.count.params,
            vec![
                SqlParam::Text("admin".to_string()),
                SqlParam::Text("2023-05-01 00:00:00".to_string()),
                SqlParam::Text("2023-05-31 23:59:59".to_string()),
            ]
        );
    }

    #[test]
    fn domain_search_spellings_build_identical_plans() {
        for kind in [
            ReportKind::UserSummary,
            ReportKind::DetailedLogs,
            ReportKind::CapResets,
            ReportKind::JiraCapRequests,
        ] {
            let at_form = request_with(&[("search", "@example.org")], kind);
            let star_form = request_with(&[("search", "*.example.org")], kind);
            let lookup = DomainLookup::default();
            assert_eq!(
                build_report_query(kind, &at_form, &lookup),
                build_report_query(kind, &star_form, &lookup),
                "spellings diverge for {}",
                kind.as_str()
            );
        }
    }

    #[test]
    fn substring_search_is_case_sensitive_except_cap_resets() {
        let request = request_with(&[("search", "Alice")], ReportKind::UserSummary);
        let query = build_report_query(ReportKind::UserSummary, &request, &DomainLookup::default());
        assert!(query.data.sql.contains("instr(email, ?) > 0"));
        assert!(query
            .data
            .params
            .contains(&SqlParam::Text("Alice".to_string())));

        let request = request_with(&[("search", "Alice")], ReportKind::CapResets);
        let query = build_report_query(ReportKind::CapResets, &request, &DomainLookup::default());
        assert!(query.data.sql.contains("LOWER(email) LIKE ?"));
        assert!(query
            .data
            .params
            .contains(&SqlParam::Text("%alice%".to_string())));
    }

    #[test]
    fn accepted_sort_is_concatenated_only_after_validation() {
        let request = request_with(
            &[("sortBy", "email"), ("sortOrder", "asc")],
            ReportKind::DetailedLogs,
        );
        let query =
            build_report_query(ReportKind::DetailedLogs, &request, &DomainLookup::default());
        assert!(query.data.sql.contains("ORDER BY email ASC"));
    }

    #[test]
    fn hand_built_sort_outside_allow_list_falls_back_to_default() {
        let mut request = request_with(&[], ReportKind::DetailedLogs);
        request.sort = Some(SortSpec {
            column: "password; DROP TABLE user_info".to_string(),
            direction: SortDirection::Asc,
        });
        let query =
            build_report_query(ReportKind::DetailedLogs, &request, &DomainLookup::default());
        assert!(query.data.sql.contains("ORDER BY date_inserted DESC"));
        assert!(!query.data.sql.contains("DROP TABLE"));
    }

    #[test]
    fn cap_resets_selects_exactly_the_reset_rows() {
        let request = request_with(&[], ReportKind::CapResets);
        let query = build_report_query(ReportKind::CapResets, &request, &DomainLookup::default());
        assert!(query.data.sql.contains("date_reset > '2025-10-13'"));
        assert!(query.data.sql.contains("COUNT(DISTINCT date_reset) AS reset_count"));
        assert!(query.data.sql.contains("GROUP BY email"));
        assert!(query.data.sql.contains("ORDER BY latest_reset DESC"));
    }

    #[test]
    fn cap_resets_dates_filter_on_reset_timestamps() {
        let request = request_with(&[("startDate", "2025-10-20")], ReportKind::CapResets);
        let query = build_report_query(ReportKind::CapResets, &request, &DomainLookup::default());
        assert!(query.data.sql.contains("date_reset >= ?"));
    }

    #[test]
    fn sanctioned_domains_watchlist_binds_one_pattern_per_domain() {
        let lookup = DomainLookup::from_json(
            r#"{"domains": {
                "univ-a.example": {"institution": "University A", "country": "AA"},
                "univ-b.example": {"institution": "University B", "country": "BB"}
            }}"#,
        )
        .unwrap_or_default();
        let request = request_with(&[], ReportKind::SanctionedDomains);
        let query = build_report_query(ReportKind::SanctionedDomains, &request, &lookup);

        assert!(query
            .data
            .sql
            .contains("(LOWER(email) LIKE ? OR LOWER(email) LIKE ?)"));
        assert!(query
            .data
            .params
            .contains(&SqlParam::Text("%univ-a.example".to_string())));
        assert!(query
            .data
            .params
            .contains(&SqlParam::Text("%univ-b.example".to_string())));
    }

    #[test]
    fn empty_watchlist_degrades_to_constant_false() {
        let request = request_with(&[], ReportKind::SanctionedDomains);
        let query =
            build_report_query(ReportKind::SanctionedDomains, &request, &DomainLookup::default());
        assert!(query.data.sql.contains("AND 0 = 1"));
        assert!(query.count.sql.contains("AND 0 = 1"));
    }

    #[test]
    fn jira_rollup_counts_statuses_and_concatenates_denials() {
        let request = request_with(&[], ReportKind::JiraCapRequests);
        let query =
            build_report_query(ReportKind::JiraCapRequests, &request, &DomainLookup::default());
        assert!(query.data.sql.contains("status = 'Approved'"));
        assert!(query.data.sql.contains("status = 'Denied'"));
        assert!(query.data.sql.contains("status = 'To Do'"));
        assert!(query.data.sql.contains("';;;'"));
        assert!(query.data.sql.contains("GROUP BY requestor_email"));
        assert!(query.data.sql.contains("ORDER BY total_count DESC"));
    }

    #[test]
    fn pagination_parameters_land_last() {
        let request = request_with(&[("page", "3"), ("limit", "20")], ReportKind::DetailedLogs);
        let query =
            build_report_query(ReportKind::DetailedLogs, &request, &DomainLookup::default());
        let tail = &query.data.params[query.data.params.len() - 2..];
        assert_eq!(tail, [SqlParam::Int(20), SqlParam::Int(40)]);
    }

    #[test]
    fn select_plans_are_cacheable_and_writes_are_not() {
        let plan = QueryPlan::new("SELECT 1".to_string(), vec![]);
        assert!(plan.is_cacheable());
        let plan = QueryPlan::new("  select 1".to_string(), vec![]);
        assert!(plan.is_cacheable());
        let plan = QueryPlan::new("INSERT INTO t VALUES (1)".to_string(), vec![]);
        assert!(!plan.is_cacheable());
        let plan = QueryPlan::uncached("SELECT 1".to_string(), vec![]);
        assert!(!plan.is_cacheable());
    }
}
