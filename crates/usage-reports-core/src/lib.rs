//! Core logic for the usage-reports dashboard: request normalization,
//! table-driven query construction, pagination math, the TTL query cache,
//! and the sanctioned-domain lookup.
//!
//! This crate is deliberately free of database and HTTP dependencies; the
//! store and service crates consume the plans and types defined here.

mod cache;
mod domains;
mod page;
mod record;
mod report;
mod request;

pub use cache::{CacheKey, QueryCache};
pub use domains::{ConfigError, DomainInfo, DomainLookup};
pub use page::Pagination;
pub use record::{JiraIssueRecord, LogRecord};
pub use report::{build_report_query, QueryPlan, ReportKind, ReportQuery, SqlParam};
pub use request::{
    normalize, RawReportQuery, ReportRequest, SearchTerm, SortDirection, SortSpec,
};

/// A single result row, keyed by the column aliases of the report query.
///
/// Rows stay schemaless because every report kind projects a different
/// shape; the service serializes them straight into the response body.
pub type Row = serde_json::Map<String, serde_json::Value>;
