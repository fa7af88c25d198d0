use serde::Deserialize;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{Date, PrimitiveDateTime, Time};

use crate::report::ReportKind;

const DATE_FORMAT: &[FormatItem<'_>] = format_description!("[year]-[month]-[day]");
const DATETIME_FORMAT: &[FormatItem<'_>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
const DATETIME_MINUTES_FORMAT: &[FormatItem<'_>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]");

/// Role filter value meaning "no filter".
const ROLE_SENTINEL: &str = "all";

const DEFAULT_LIMIT: u32 = 50;
const MAX_LIMIT: u32 = 100;

/// Raw query-string parameters, exactly as they arrive on the wire.
///
/// Every field is optional text; [`normalize`] turns this into a typed
/// [`ReportRequest`], substituting safe defaults for anything absent or
/// malformed. Parameter names mirror the dashboard's existing frontend.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawReportQuery {
    pub page: Option<String>,
    pub limit: Option<String>,
    pub level: Option<String>,
    pub search: Option<String>,
    #[serde(rename = "startDate")]
    pub start_date: Option<String>,
    #[serde(rename = "endDate")]
    pub end_date: Option<String>,
    #[serde(rename = "sortBy")]
    pub sort_by: Option<String>,
    #[serde(rename = "sortOrder")]
    pub sort_order: Option<String>,
}

/// Email search term, split by mode at normalization time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchTerm {
    /// `*.domain` or `@domain` input: match the bare domain (stored
    /// lowercased) as a case-insensitive suffix of the email.
    Domain(String),
    /// Anything else: substring match inside the email.
    Substring(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    #[must_use]
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "asc" => Some(Self::Asc),
            "desc" => Some(Self::Desc),
            _ => None,
        }
    }
}

/// A sort accepted against the report kind's allow-list.
///
/// Never constructed from unchecked input: [`normalize`] only builds one
/// when the column is a member of the kind's allow-list and the direction
/// parsed cleanly, which is the sole injection defense for ORDER BY.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortSpec {
    pub column: String,
    pub direction: SortDirection,
}

/// Validated, typed report parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportRequest {
    pub page: u32,
    pub limit: u32,
    pub role: Option<String>,
    pub search: Option<SearchTerm>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub sort: Option<SortSpec>,
}

impl ReportRequest {
    #[must_use]
    pub fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.limit)
    }
}

/// Coerce raw parameters into a [`ReportRequest`] for the given kind.
///
/// Malformed or out-of-range values are recovered locally: page falls back
/// to 1, limit to 50 (clamped to 1..=100), unparseable dates and
/// out-of-allow-list sorts are dropped. Normalization never fails.
#[must_use]
pub fn normalize(kind: ReportKind, raw: &RawReportQuery) -> ReportRequest {
    let page = raw
        .page
        .as_deref()
        .and_then(|value| value.trim().parse::<i64>().ok())
        .map_or(1, |value| u32::try_from(value.max(1)).unwrap_or(u32::MAX));

    let limit = raw
        .limit
        .as_deref()
        .and_then(|value| value.trim().parse::<i64>().ok())
        .map_or(DEFAULT_LIMIT, |value| {
            u32::try_from(value.clamp(1, i64::from(MAX_LIMIT))).unwrap_or(MAX_LIMIT)
        });

    let role = if kind.has_role_filter() {
        raw.level
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty() && !value.eq_ignore_ascii_case(ROLE_SENTINEL))
            .map(ToString::to_string)
    } else {
        None
    };

    let search = raw.search.as_deref().and_then(parse_search);

    let start = raw
        .start_date
        .as_deref()
        .and_then(|value| normalize_date(value, false));
    let end = raw
        .end_date
        .as_deref()
        .and_then(|value| normalize_date(value, true));

    let sort = normalize_sort(kind, raw.sort_by.as_deref(), raw.sort_order.as_deref());

    ReportRequest { page, limit, role, search, start, end, sort }
}

fn parse_search(value: &str) -> Option<SearchTerm> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    let domain = value
        .strip_prefix("*.")
        .or_else(|| value.strip_prefix('@'));
    match domain {
        Some(domain) if !domain.is_empty() => {
            Some(SearchTerm::Domain(domain.to_ascii_lowercase()))
        }
        Some(_) => None,
        None => Some(SearchTerm::Substring(value.to_string())),
    }
}

/// Widen a bare date to the start or end of its day, and canonicalize
/// date-with-time inputs (either `T` or space separated, seconds optional)
/// to `YYYY-MM-DD HH:MM:SS`. Returns `None` for unparseable input.
fn normalize_date(value: &str, end_of_day: bool) -> Option<String> {
    let value = value.trim().replace('T', " ");
    if value.is_empty() {
        return None;
    }

    if let Ok(date) = Date::parse(&value, DATE_FORMAT) {
        let time = if end_of_day {
            Time::from_hms(23, 59, 59).ok()?
        } else {
            Time::MIDNIGHT
        };
        return PrimitiveDateTime::new(date, time)
            .format(DATETIME_FORMAT)
            .ok();
    }

    if let Ok(datetime) = PrimitiveDateTime::parse(&value, DATETIME_FORMAT) {
        return datetime.format(DATETIME_FORMAT).ok();
    }

    // datetime-local inputs omit seconds
    if let Ok(datetime) = PrimitiveDateTime::parse(&value, DATETIME_MINUTES_FORMAT) {
        return datetime.format(DATETIME_FORMAT).ok();
    }

    None
}

fn normalize_sort(
    kind: ReportKind,
    sort_by: Option<&str>,
    sort_order: Option<&str>,
) -> Option<SortSpec> {
    let column = sort_by?.trim();
    let direction = SortDirection::parse(sort_order?.trim())?;
    if kind.sort_columns().contains(&column) {
        Some(SortSpec { column: column.to_string(), direction })
    } else {
        None
    }
}
