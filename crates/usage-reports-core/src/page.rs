use serde::{Deserialize, Serialize};

/// Page metadata echoed back with every report response.
///
/// `page` and `limit` are exactly the values the rows were fetched with;
/// the assembler never silently substitutes a corrected page.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
    pub total: u64,
    #[serde(rename = "totalPages")]
    pub total_pages: u64,
}

impl Pagination {
    #[must_use]
    pub fn new(page: u32, limit: u32, total: u64) -> Self {
        let total_pages = total.div_ceil(u64::from(limit.max(1)));
        Self { page, limit, total, total_pages }
    }

    /// Inclusive 1-based display range for the current page. A start
    /// greater than the end means the page lies past the data.
    #[must_use]
    pub fn item_range(&self) -> (u64, u64) {
        let start = u64::from(self.page - 1) * u64::from(self.limit) + 1;
        let end = self.total.min(u64::from(self.page) * u64::from(self.limit));
        (start, end)
    }
}
