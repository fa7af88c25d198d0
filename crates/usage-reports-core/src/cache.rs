use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::report::{QueryPlan, SqlParam};
use crate::Row;

/// Key for a memoized read: the exact query text plus its ordered
/// parameter list. Two requests share an entry only when both match.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    sql: String,
    params: Vec<SqlParam>,
}

impl CacheKey {
    #[must_use]
    pub fn from_plan(plan: &QueryPlan) -> Self {
        Self { sql: plan.sql.clone(), params: plan.params.clone() }
    }
}

struct CacheEntry {
    rows: Arc<Vec<Row>>,
    stored_at: Instant,
}

/// Time-bounded memoization of read-only query results.
///
/// Constructed once at startup and handed to the executor; never a
/// module-level global, so tests can build one with a throwaway TTL.
/// Eviction is opportunistic: a `put` that grows the map past the
/// high-water mark sweeps every expired entry in the same call. There is
/// no background timer and no LRU.
pub struct QueryCache {
    ttl: Duration,
    high_water: usize,
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
}

impl QueryCache {
    pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);
    pub const DEFAULT_HIGH_WATER: usize = 100;

    #[must_use]
    pub fn new(ttl: Duration, high_water: usize) -> Self {
        Self { ttl, high_water, entries: Mutex::new(HashMap::new()) }
    }

    /// Return the cached row set when present and younger than the TTL.
    /// Expired entries are treated as misses and left for the sweep.
    #[must_use]
    pub fn get(&self, key: &CacheKey) -> Option<Arc<Vec<Row>>> {
        let entries = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let entry = entries.get(key)?;
        if entry.stored_at.elapsed() < self.ttl {
            Some(Arc::clone(&entry.rows))
        } else {
            None
        }
    }

    pub fn put(&self, key: CacheKey, rows: Arc<Vec<Row>>) {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        entries.insert(key, CacheEntry { rows, stored_at: Instant::now() });
        if entries.len() > self.high_water {
            let ttl = self.ttl;
            entries.retain(|_, entry| entry.stored_at.elapsed() < ttl);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_TTL, Self::DEFAULT_HIGH_WATER)
    }
}
