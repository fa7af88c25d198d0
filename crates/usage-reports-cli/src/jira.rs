//! JIRA sync client: pages through the cap-override search, with retry on
//! rate limiting, and maps raw issues into store records.

use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use usage_reports_core::JiraIssueRecord;

/// Requestor emails are parsed out of the ticket summary; tickets whose
/// summary does not carry one get this placeholder so the rollup still
/// counts them.
pub const FALLBACK_EMAIL: &str = "unknown@unknown.com";

#[must_use]
pub fn search_jql(project_key: &str) -> String {
    format!("project = {project_key} AND summary ~ \"New Cap Override Request\" ORDER BY created ASC")
}

const SEARCH_FIELDS: &str =
    "id,key,status,labels,created,summary,updated,resolution,resolutiondate,customfield_14500";
const PAGE_SIZE: u32 = 100;
const MAX_RETRIES: u32 = 3;

const SUMMARY_MARKER: &str = "new cap override request for ";

pub struct JiraClient {
    agent: ureq::Agent,
    base_url: String,
    token: String,
}

impl JiraClient {
    #[must_use]
    pub fn new(base_url: String, token: String) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(30))
            .build();
        Self {
            agent,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    /// Fetch every issue matching the JQL, one page at a time.
    ///
    /// # Errors
    /// Returns an error when a page request fails after retries or the
    /// response body is not the expected JSON shape.
    pub fn fetch_all(&self, jql: &str) -> Result<Vec<Value>> {
        let mut issues: Vec<Value> = Vec::new();
        loop {
            let page = self.search_page(jql, issues.len())?;
            let total = page
                .get("total")
                .and_then(Value::as_u64)
                .and_then(|total| usize::try_from(total).ok())
                .unwrap_or(0);
            let batch = page
                .get("issues")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            if batch.is_empty() {
                break;
            }
            issues.extend(batch);
            if issues.len() >= total {
                break;
            }
        }
        Ok(issues)
    }

    /// One search page, retried with doubling backoff on rate limiting
    /// and transport failures.
    fn search_page(&self, jql: &str, start_at: usize) -> Result<Value> {
        let url = format!("{}/rest/api/2/search", self.base_url);
        let mut delay = Duration::from_secs(1);
        let mut attempt = 0;
        loop {
            let result = self
                .agent
                .get(&url)
                .set("Authorization", &format!("Bearer {}", self.token))
                .query("jql", jql)
                .query("startAt", &start_at.to_string())
                .query("maxResults", &PAGE_SIZE.to_string())
                .query("fields", SEARCH_FIELDS)
                .call();
            match result {
                Ok(response) => {
                    return response
                        .into_json()
                        .context("failed to decode search response")
                }
                Err(ureq::Error::Status(429, _)) if attempt < MAX_RETRIES => {
                    attempt += 1;
                    thread::sleep(delay);
                    delay *= 2;
                }
                Err(ureq::Error::Transport(_)) if attempt < MAX_RETRIES => {
                    attempt += 1;
                    thread::sleep(delay);
                    delay *= 2;
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("search request failed at {url}"))
                }
            }
        }
    }
}

/// Map one raw search issue into a store record. Issues without a key or
/// numeric id are skipped; every other field degrades to `None`.
#[must_use]
pub fn issue_record(issue: &Value) -> Option<JiraIssueRecord> {
    let issue_key = issue.get("key")?.as_str()?.to_string();
    let issue_id = issue.get("id").and_then(id_number)?;
    let fields = issue.get("fields")?;

    let summary = fields
        .get("summary")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let labels = fields
        .get("labels")
        .and_then(Value::as_array)
        .map(|labels| {
            labels
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        })
        .filter(|joined| !joined.is_empty());

    Some(JiraIssueRecord {
        issue_id,
        requestor_email: requestor_email(&summary),
        status: nested_name(fields.get("status")),
        resolution: nested_name(fields.get("resolution")),
        labels,
        ai_result: fields
            .get("customfield_14500")
            .and_then(Value::as_str)
            .map(ToString::to_string),
        created: timestamp_field(fields, "created"),
        updated: timestamp_field(fields, "updated"),
        resolved: timestamp_field(fields, "resolutiondate"),
        summary,
        issue_key,
    })
}

/// Issue ids arrive as strings in search responses.
fn id_number(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|text| text.parse().ok()))
}

fn nested_name(value: Option<&Value>) -> Option<String> {
    value?
        .get("name")
        .and_then(Value::as_str)
        .map(ToString::to_string)
}

fn timestamp_field(fields: &Value, key: &str) -> Option<String> {
    fields
        .get(key)
        .and_then(Value::as_str)
        .and_then(canonical_timestamp)
}

/// JIRA timestamps look like `2024-01-10T09:00:00.000+0000`; the store
/// keeps the canonical `YYYY-MM-DD HH:MM:SS` prefix.
fn canonical_timestamp(value: &str) -> Option<String> {
    let head = value.get(..19)?;
    Some(head.replace('T', " "))
}

/// Extract the requestor email from a ticket summary shaped
/// `New Cap Override Request for user@host ...` (case-insensitive).
#[must_use]
pub fn requestor_email(summary: &str) -> String {
    let lower = summary.to_lowercase();
    if let Some(position) = lower.find(SUMMARY_MARKER) {
        let tail = &lower[position + SUMMARY_MARKER.len()..];
        if let Some(token) = tail.split_whitespace().next() {
            let token = token.trim_matches(|c: char| matches!(c, '(' | ')' | ',' | ';'));
            if token.contains('@') {
                return token.to_string();
            }
        }
    }
    FALLBACK_EMAIL.to_string()
}
