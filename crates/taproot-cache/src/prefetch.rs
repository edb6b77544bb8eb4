//! Access-frequency tracking for popularity-driven prefetch.
//!
//! The cache records a counter per question; once a question has been
//! asked often enough, the counter fires (and resets) so the owner can
//! schedule a background re-resolution. The actual resolution is the
//! coordinator's job; this module only decides *when*.

use hickory_proto::op::Query;
use parking_lot::Mutex;
use std::collections::HashMap;

use super::key::CacheKey;

/// Default number of accesses before a prefetch fires.
pub const DEFAULT_PREFETCH_THRESHOLD: u32 = 3;

/// Per-question access counters with a firing threshold.
pub struct PrefetchCounters {
    counters: Mutex<HashMap<CacheKey, u32>>,
    threshold: u32,
}

impl PrefetchCounters {
    /// Creates counters with the given firing threshold.
    pub fn new(threshold: u32) -> Self {
        Self {
            counters: Mutex::new(HashMap::new()),
            threshold: threshold.max(1),
        }
    }

    /// Records an access to the question.
    ///
    /// Returns true when the counter reaches the threshold; the counter
    /// resets so the next firing needs another full round of accesses.
    pub fn record_access(&self, query: &Query) -> bool {
        let key = CacheKey::from_query(query);
        let mut counters = self.counters.lock();

        let count = counters.entry(key.clone()).or_insert(0);
        *count += 1;

        if *count >= self.threshold {
            counters.remove(&key);
            true
        } else {
            false
        }
    }

    /// Drops every counter. Used by the periodic sweep so popularity is
    /// measured per window rather than over the process lifetime.
    pub fn reset(&self) {
        self.counters.lock().clear();
    }

    /// Number of questions currently being tracked.
    pub fn tracked(&self) -> usize {
        self.counters.lock().len()
    }
}

impl Default for PrefetchCounters {
    fn default() -> Self {
        Self::new(DEFAULT_PREFETCH_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::{Name, RecordType};
    use std::str::FromStr;

    fn query(name: &str) -> Query {
        Query::query(Name::from_str(name).unwrap(), RecordType::A)
    }

    #[test]
    fn fires_at_threshold_and_resets() {
        let counters = PrefetchCounters::new(3);
        let q = query("popular.example.");

        assert!(!counters.record_access(&q));
        assert!(!counters.record_access(&q));
        assert!(counters.record_access(&q));

        // Counter was reset; another full round is needed.
        assert!(!counters.record_access(&q));
        assert!(!counters.record_access(&q));
        assert!(counters.record_access(&q));
    }

    #[test]
    fn case_variants_share_a_counter() {
        let counters = PrefetchCounters::new(2);

        assert!(!counters.record_access(&query("host.example.")));
        assert!(counters.record_access(&query("HOST.EXAMPLE.")));
    }

    #[test]
    fn reset_clears_tracking() {
        let counters = PrefetchCounters::new(5);
        counters.record_access(&query("a.example."));
        counters.record_access(&query("b.example."));
        assert_eq!(counters.tracked(), 2);

        counters.reset();
        assert_eq!(counters.tracked(), 0);
    }
}
