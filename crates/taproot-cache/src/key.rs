//! Cache key implementation.

use hickory_proto::op::Query;
use hickory_proto::rr::{DNSClass, Name, RecordType};
use std::hash::{Hash, Hasher};

use super::NUM_SHARDS;

/// Cache key for DNS messages.
///
/// Keys are derived from a question: the owner name in canonical form
/// (lowercase, fully qualified), the record type, and the record class.
/// Negative entries live in their own namespace so a cached NXDOMAIN can
/// never shadow or merge with a positive entry for the same question.
#[derive(Debug, Clone, Eq)]
pub struct CacheKey {
    /// Canonical owner name (lowercased, FQDN).
    name: Name,

    /// Record type.
    rtype: RecordType,

    /// Record class.
    rclass: DNSClass,

    /// Whether this key addresses the negative namespace.
    negative: bool,
}

impl CacheKey {
    /// Creates a positive cache key from a question.
    pub fn from_query(query: &Query) -> Self {
        Self::new(query.name().clone(), query.query_type(), query.query_class(), false)
    }

    /// Creates a negative cache key from a question.
    pub fn negative_from_query(query: &Query) -> Self {
        Self::new(query.name().clone(), query.query_type(), query.query_class(), true)
    }

    fn new(name: Name, rtype: RecordType, rclass: DNSClass, negative: bool) -> Self {
        let mut name = name.to_lowercase();
        name.set_fqdn(true);
        Self {
            name,
            rtype,
            rclass,
            negative,
        }
    }

    /// Returns the canonical owner name.
    pub fn name(&self) -> &Name {
        &self.name
    }

    /// Returns the record type.
    pub fn rtype(&self) -> RecordType {
        self.rtype
    }

    /// Returns true if this key addresses the negative namespace.
    pub fn is_negative(&self) -> bool {
        self.negative
    }

    /// Rebuilds the question this key was derived from.
    pub fn to_query(&self) -> Query {
        let mut query = Query::query(self.name.clone(), self.rtype);
        query.set_query_class(self.rclass);
        query
    }

    /// Returns the shard index for this key.
    ///
    /// The index is the FNV-32a hash of `"{name}-{type}-{class}"` (with a
    /// `-negative` suffix for negative keys) modulo the shard count, so
    /// unrelated domains contend on different locks.
    pub fn shard(&self) -> usize {
        (fnv32a(&self.key_string()) as usize) % NUM_SHARDS
    }

    fn key_string(&self) -> String {
        if self.negative {
            format!("{}-{}-{}-negative", self.name, u16::from(self.rtype), u16::from(self.rclass))
        } else {
            format!("{}-{}-{}", self.name, u16::from(self.rtype), u16::from(self.rclass))
        }
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.rtype == other.rtype
            && self.rclass == other.rclass
            && self.negative == other.negative
    }
}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        u16::from(self.rtype).hash(state);
        u16::from(self.rclass).hash(state);
        self.negative.hash(state);
    }
}

/// 32-bit FNV-1a over the key string.
fn fnv32a(s: &str) -> u32 {
    const FNV_OFFSET: u32 = 0x811c_9dc5;
    const FNV_PRIME: u32 = 0x0100_0193;

    let mut hash = FNV_OFFSET;
    for byte in s.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}
