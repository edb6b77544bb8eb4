//! Cache entry implementation.

use hickory_proto::op::Message;
use std::time::{Duration, Instant};

/// A cached DNS message.
///
/// The TTL has already been collapsed to a single effective value at
/// insertion time; the entry stores an absolute expiry instant instead of
/// counting seconds down. Entries are immutable once stored; readers get
/// a deep copy of the message with a fresh transaction id.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// The cached message.
    message: Message,

    /// When this entry was created.
    created_at: Instant,

    /// When this entry expires.
    expires_at: Instant,

    /// Effective TTL at insertion time, in seconds.
    original_ttl: u32,

    /// Whether this is a negative cache entry.
    negative: bool,

    /// How many times this entry has been served.
    frequency: u32,
}

impl CacheEntry {
    /// Creates a new entry expiring `ttl` seconds from now.
    pub fn new(message: Message, ttl: u32, negative: bool) -> Self {
        let now = Instant::now();
        Self {
            message,
            created_at: now,
            expires_at: now + Duration::from_secs(u64::from(ttl)),
            original_ttl: ttl,
            negative,
            frequency: 1,
        }
    }

    /// Returns a copy of the cached message with the given transaction id.
    pub fn message_with_id(&self, id: u16) -> Message {
        let mut copy = self.message.clone();
        copy.set_id(id);
        copy
    }

    /// Returns the effective TTL assigned at insertion time.
    pub fn original_ttl(&self) -> u32 {
        self.original_ttl
    }

    /// Returns true if this is a negative cache entry.
    pub fn is_negative(&self) -> bool {
        self.negative
    }

    /// Returns true if this entry has expired.
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Returns the remaining TTL.
    pub fn remaining_ttl(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }

    /// Returns true if less than `percent` of the original TTL remains.
    pub fn is_near_expiry(&self, now: Instant, percent: u8) -> bool {
        let threshold =
            Duration::from_secs(u64::from(self.original_ttl)) * u32::from(percent) / 100;
        self.remaining_ttl(now) < threshold
    }

    /// Records an access and returns the new frequency.
    pub fn touch(&mut self) -> u32 {
        self.frequency = self.frequency.saturating_add(1);
        self.frequency
    }

    /// Returns how many times this entry has been served.
    pub fn frequency(&self) -> u32 {
        self.frequency
    }

    #[cfg(test)]
    pub(crate) fn force_expired(&mut self) {
        self.expires_at = self.created_at;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_expires_after_ttl() {
        let entry = CacheEntry::new(Message::new(), 10, false);
        let now = Instant::now();

        assert!(!entry.is_expired(now));
        assert!(entry.is_expired(now + Duration::from_secs(11)));
    }

    #[test]
    fn near_expiry_threshold() {
        let entry = CacheEntry::new(Message::new(), 100, false);
        let now = Instant::now();

        // Freshly inserted: well above 10% remaining.
        assert!(!entry.is_near_expiry(now, 10));
        // 95 seconds in: 5 seconds left, below the 10-second threshold.
        assert!(entry.is_near_expiry(now + Duration::from_secs(95), 10));
    }

    #[test]
    fn message_copy_carries_requested_id() {
        let mut message = Message::new();
        message.set_id(1);
        let entry = CacheEntry::new(message, 60, false);

        let copy = entry.message_with_id(0xBEEF);
        assert_eq!(copy.id(), 0xBEEF);
    }

    #[test]
    fn touch_increments_frequency() {
        let mut entry = CacheEntry::new(Message::new(), 60, false);
        assert_eq!(entry.frequency(), 1);
        assert_eq!(entry.touch(), 2);
        assert_eq!(entry.touch(), 3);
    }
}
