//! # Taproot DNS Cache
//!
//! Sharded, TTL-bounded LRU cache for whole DNS messages.
//!
//! ## Architecture
//!
//! - **32 independent shards**, each a hashmap plus an arena-backed LRU
//!   list under its own mutex; the shard for a key is chosen by FNV-32a
//!   over `"{name}-{type}-{class}"`.
//! - **Positive entries** carry an effective TTL collapsed from the
//!   minimum record TTL across all sections, clamped to [60 s, 24 h] and
//!   capped by the configured maximum.
//! - **Negative entries** (NXDOMAIN / NODATA / SERVFAIL) are synthesized
//!   minimal responses stored in a separate key namespace with a short
//!   fixed TTL.
//! - **Access telemetry**: hit/miss/eviction/expiration/negative counters
//!   plus per-entry access frequencies that feed the prefetch manager.
//!
//! Expired entries are pruned on touch; a background cleaner task sweeps
//! every shard periodically as an optimization, not a correctness
//! requirement.

use hickory_proto::op::{Message, MessageType, Query, ResponseCode};
use hickory_proto::rr::RecordType;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

pub mod entry;
pub mod key;
pub mod prefetch;
mod shard;

pub use entry::CacheEntry;
pub use key::CacheKey;
pub use prefetch::PrefetchCounters;

use shard::{Lookup, Shard};

/// Number of independent cache shards.
pub const NUM_SHARDS: usize = 32;

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum entries across all shards.
    pub max_entries: usize,

    /// Hard ceiling on any entry's effective TTL, in seconds.
    pub max_allowed_ttl: u32,

    /// Floor for positive entry TTLs, in seconds.
    pub min_positive_ttl: u32,

    /// Ceiling for positive entry TTLs, in seconds.
    pub max_positive_ttl: u32,

    /// TTL for negative entries, in seconds.
    pub negative_ttl: u32,

    /// How often the background cleaner sweeps for expired entries.
    pub cleaner_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 100_000,
            max_allowed_ttl: 172_800,
            min_positive_ttl: 60,
            max_positive_ttl: 86_400,
            negative_ttl: 300,
            cleaner_interval: Duration::from_secs(30),
        }
    }
}

/// Sharded DNS message cache.
pub struct MessageCache {
    config: CacheConfig,
    shards: Vec<Shard>,
    stats: CacheStats,
}

impl MessageCache {
    /// Creates a new cache.
    pub fn new(config: CacheConfig) -> Self {
        let shards = (0..NUM_SHARDS).map(|_| Shard::default()).collect();
        Self {
            config,
            shards,
            stats: CacheStats::default(),
        }
    }

    /// Looks up the cached response for a question.
    ///
    /// On a hit the entry moves to its shard's LRU front, its access
    /// frequency is bumped, and a copy of the message with its id set to
    /// `request_id` is returned. A stored entry found expired is evicted
    /// and the lookup counts as a miss. The positive namespace is
    /// consulted before the negative one.
    pub fn get(&self, query: &Query, request_id: u16) -> Option<Message> {
        let now = Instant::now();

        for key in [CacheKey::from_query(query), CacheKey::negative_from_query(query)] {
            match self.shards[key.shard()].get(&key, request_id, now) {
                Lookup::Hit(message) => {
                    self.stats.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(message);
                }
                Lookup::Expired => {
                    self.stats.expirations.fetch_add(1, Ordering::Relaxed);
                }
                Lookup::Miss => {}
            }
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Caches a positive response under the question's key.
    ///
    /// Replaces any existing entry for the key and evicts from the LRU
    /// tail if the shard is at capacity.
    pub fn put(&self, query: &Query, message: &Message) {
        self.put_with_ttl_cap(query, message, None);
    }

    /// Caches a positive response with an additional TTL ceiling.
    ///
    /// `ttl_cap` is the validated TTL produced by DNSSEC processing; when
    /// present the effective TTL never exceeds it.
    pub fn put_with_ttl_cap(&self, query: &Query, message: &Message, ttl_cap: Option<u32>) {
        let mut ttl = self.effective_ttl(message);
        if let Some(cap) = ttl_cap {
            ttl = ttl.min(cap);
        }

        let key = CacheKey::from_query(query);
        let entry = CacheEntry::new(message.clone(), ttl, false);
        let evicted = self.shards[key.shard()].insert(key, entry, self.shard_capacity());
        if evicted > 0 {
            self.stats.evictions.fetch_add(evicted, Ordering::Relaxed);
        }
    }

    /// Caches a negative result for the question.
    ///
    /// A minimal response message carrying `rcode` is synthesized and
    /// stored under the negative namespace with the configured negative
    /// TTL. Any positive entry for the same question is dropped so stale
    /// answers can never resurface alongside the negative result.
    pub fn put_negative(&self, query: &Query, rcode: ResponseCode) {
        let positive = CacheKey::from_query(query);
        self.shards[positive.shard()].remove(&positive);

        let key = CacheKey::negative_from_query(query);
        let message = synthesize_negative(query, rcode);
        let entry = CacheEntry::new(message, self.config.negative_ttl, true);

        let evicted = self.shards[key.shard()].insert(key, entry, self.shard_capacity());
        if evicted > 0 {
            self.stats.evictions.fetch_add(evicted, Ordering::Relaxed);
        }
        self.stats.negatives.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a snapshot of the access counters.
    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    /// Returns the total number of live entries across all shards.
    pub fn size(&self) -> usize {
        self.shards.iter().map(Shard::len).sum()
    }

    /// Returns true if the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Drops every entry.
    pub fn clear(&self) {
        for shard in &self.shards {
            shard.clear();
        }
    }

    /// Returns the questions of every unexpired positive entry.
    pub fn all_keys(&self) -> Vec<Query> {
        let now = Instant::now();
        self.shards
            .iter()
            .flat_map(|shard| shard.collect_keys(now, |key, _| !key.is_negative()))
            .map(|key| key.to_query())
            .collect()
    }

    /// Returns the questions of positive entries with less than `percent`
    /// of their original TTL remaining.
    pub fn keys_near_expiry(&self, percent: u8) -> Vec<Query> {
        let now = Instant::now();
        self.shards
            .iter()
            .flat_map(|shard| {
                shard.collect_keys(now, |key, entry| {
                    !key.is_negative() && entry.is_near_expiry(now, percent)
                })
            })
            .map(|key| key.to_query())
            .collect()
    }

    /// Sweeps every shard for expired entries. Returns how many were
    /// removed.
    pub fn remove_expired(&self) -> u64 {
        let now = Instant::now();
        let removed: u64 = self.shards.iter().map(|s| s.remove_expired(now)).sum();
        if removed > 0 {
            self.stats.expirations.fetch_add(removed, Ordering::Relaxed);
        }
        removed
    }

    /// Spawns the periodic expired-entry cleaner.
    ///
    /// The task holds only a weak reference, so it stops on its own once
    /// the cache is dropped; abort the returned handle for a prompt stop
    /// at shutdown.
    pub fn spawn_cleaner(cache: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let weak = Arc::downgrade(cache);
        let period = cache.config.cleaner_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // first tick completes immediately

            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else { break };
                let removed = cache.remove_expired();
                if removed > 0 {
                    trace!(removed, "cache cleaner removed expired entries");
                }
            }
        })
    }

    fn shard_capacity(&self) -> usize {
        (self.config.max_entries / NUM_SHARDS).max(1)
    }

    /// Collapses a message to its effective TTL: the minimum record TTL
    /// across answer, authority, and additional sections (EDNS OPT
    /// pseudo-records excluded), clamped to the configured positive
    /// bounds and capped by the allowed maximum.
    fn effective_ttl(&self, message: &Message) -> u32 {
        let ttl = message
            .answers()
            .iter()
            .chain(message.name_servers())
            .chain(message.additionals())
            .filter(|rr| rr.record_type() != RecordType::OPT)
            .map(|rr| rr.ttl())
            .min()
            .unwrap_or(3600);

        ttl.clamp(self.config.min_positive_ttl, self.config.max_positive_ttl)
            .min(self.config.max_allowed_ttl)
    }
}

/// Builds the minimal response message stored for a negative result.
fn synthesize_negative(query: &Query, rcode: ResponseCode) -> Message {
    let mut message = Message::new();
    message.set_message_type(MessageType::Response);
    message.set_recursion_desired(true);
    message.set_recursion_available(true);
    message.set_response_code(rcode);
    message.add_query(query.clone());
    message
}

/// Internal atomic counters.
#[derive(Debug, Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    negatives: AtomicU64,
}

impl CacheStats {
    fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            negatives: self.negatives.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of the cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    /// Lookups served from cache.
    pub hits: u64,
    /// Lookups that found nothing usable.
    pub misses: u64,
    /// Entries evicted for capacity.
    pub evictions: u64,
    /// Entries dropped because their TTL had elapsed.
    pub expirations: u64,
    /// Negative entries stored.
    pub negatives: u64,
}

impl CacheStatsSnapshot {
    /// Hit rate over all lookups, in [0, 1].
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData, Record};
    use std::str::FromStr;

    fn query(name: &str) -> Query {
        Query::query(Name::from_str(name).unwrap(), RecordType::A)
    }

    fn answer(name: &str, ttl: u32) -> Message {
        let mut message = Message::new();
        message.set_message_type(MessageType::Response);
        message.add_query(query(name));
        message.add_answer(Record::from_rdata(
            Name::from_str(name).unwrap(),
            ttl,
            RData::A(A::new(192, 0, 2, 1)),
        ));
        message
    }

    #[test]
    fn put_get_round_trip_sets_request_id() {
        let cache = MessageCache::new(CacheConfig::default());
        let q = query("example.com.");

        cache.put(&q, &answer("example.com.", 300));

        let hit = cache.get(&q, 0x1234).expect("cache hit");
        assert_eq!(hit.id(), 0x1234);
        assert_eq!(hit.answers().len(), 1);

        // Repeated lookups return the identical payload with fresh ids.
        let again = cache.get(&q, 0x4321).expect("cache hit");
        assert_eq!(again.id(), 0x4321);
        assert_eq!(again.answers(), hit.answers());
    }

    #[test]
    fn miss_and_hit_counters() {
        let cache = MessageCache::new(CacheConfig::default());
        let q = query("example.com.");

        assert!(cache.get(&q, 0).is_none());
        cache.put(&q, &answer("example.com.", 300));
        assert!(cache.get(&q, 0).is_some());

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
    }

    #[test]
    fn negative_entry_returns_rcode_and_displaces_positive() {
        let cache = MessageCache::new(CacheConfig::default());
        let q = query("gone.example.com.");

        cache.put(&q, &answer("gone.example.com.", 300));
        cache.put_negative(&q, ResponseCode::NXDomain);

        let hit = cache.get(&q, 9).expect("negative hit");
        assert_eq!(hit.response_code(), ResponseCode::NXDomain);
        assert!(hit.answers().is_empty());
        assert_eq!(cache.stats().negatives, 1);
    }

    #[test]
    fn zero_ttl_clamps_to_floor() {
        let cache = MessageCache::new(CacheConfig::default());
        let q = query("short.example.");

        cache.put(&q, &answer("short.example.", 0));

        // Still retrievable: the TTL floor of 60s applies.
        assert!(cache.get(&q, 0).is_some());
    }

    #[test]
    fn huge_ttl_clamps_to_max_allowed() {
        let config = CacheConfig::default();
        let cache = MessageCache::new(config.clone());
        let ttl = cache.effective_ttl(&answer("long.example.", 1_000_000_000));

        assert!(ttl <= config.max_positive_ttl);
        assert!(ttl <= config.max_allowed_ttl);
    }

    #[test]
    fn validated_ttl_cap_applies() {
        let cache = MessageCache::new(CacheConfig::default());
        let ttl = cache.effective_ttl(&answer("capped.example.", 3600));
        assert_eq!(ttl, 3600);

        let q = query("capped.example.");
        cache.put_with_ttl_cap(&q, &answer("capped.example.", 3600), Some(120));
        // The entry exists; its TTL was capped at insert time, which we
        // can observe through the near-expiry sweep threshold.
        assert!(cache.get(&q, 0).is_some());
        assert!(cache.keys_near_expiry(1).is_empty());
    }

    #[test]
    fn size_never_exceeds_max_entries() {
        let config = CacheConfig {
            max_entries: 64,
            ..CacheConfig::default()
        };
        let cache = MessageCache::new(config);

        for i in 0..1_000 {
            let name = format!("host{i}.example.");
            cache.put(&query(&name), &answer(&name, 300));
        }

        assert!(cache.size() <= 64);
        assert!(cache.stats().evictions >= 64);
    }

    #[test]
    fn clear_empties_every_shard() {
        let cache = MessageCache::new(CacheConfig::default());
        for i in 0..100 {
            let name = format!("host{i}.example.");
            cache.put(&query(&name), &answer(&name, 300));
        }

        cache.clear();
        assert_eq!(cache.size(), 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn all_keys_excludes_negative_entries() {
        let cache = MessageCache::new(CacheConfig::default());
        cache.put(&query("pos.example."), &answer("pos.example.", 300));
        cache.put_negative(&query("neg.example."), ResponseCode::NXDomain);

        let keys = cache.all_keys();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].name().to_string(), "pos.example.");
    }

    #[tokio::test]
    async fn cleaner_stops_when_cache_dropped() {
        let cache = Arc::new(MessageCache::new(CacheConfig {
            cleaner_interval: Duration::from_millis(10),
            ..CacheConfig::default()
        }));

        let handle = MessageCache::spawn_cleaner(&cache);
        drop(cache);

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("cleaner exits after cache drop")
            .expect("cleaner task does not panic");
    }

    #[tokio::test]
    async fn concurrent_distinct_names_respect_capacity() {
        let cache = Arc::new(MessageCache::new(CacheConfig {
            max_entries: 500,
            ..CacheConfig::default()
        }));

        let mut handles = Vec::new();
        for i in 0..1_000 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                let name = format!("w{i}.example.");
                cache.put(&query(&name), &answer(&name, 300));
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(cache.size() <= 500);
        assert!(cache.stats().evictions >= 500);
    }
}
