use serde::{Deserialize, Serialize};

/// One row of the append-only usage log.
///
/// Records are immutable once the outcome is finalized; `date_reset` is the
/// only field mutated after insertion, by the external reset process.
/// Timestamps are canonical `YYYY-MM-DD HH:MM:SS` text so lexicographic
/// comparison in the store matches chronological order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogRecord {
    pub email: String,
    pub role: Option<String>,
    pub ip_address: String,
    pub queue_name: String,
    pub rows_returned: i64,
    pub date_inserted: String,
    pub date_reset: Option<String>,
    pub outcome: String,
    pub tool_year: i64,
    pub tool_id: i64,
    pub permalink: Option<String>,
}

/// A cap-override ticket synced from the issue tracker.
///
/// Upserted idempotently keyed by `issue_key`; the sync process may replay
/// the same batch without changing the stored state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JiraIssueRecord {
    pub issue_id: i64,
    pub issue_key: String,
    pub requestor_email: String,
    pub status: Option<String>,
    pub resolution: Option<String>,
    pub labels: Option<String>,
    pub ai_result: Option<String>,
    pub created: Option<String>,
    pub updated: Option<String>,
    pub resolved: Option<String>,
    pub summary: String,
}
