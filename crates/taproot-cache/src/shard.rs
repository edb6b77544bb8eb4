//! A single cache shard: hashmap plus arena-backed LRU list.
//!
//! The LRU list is a doubly-linked list whose links are indices into an
//! arena of slots rather than pointers, which sidesteps the ownership
//! cycles an intrusive list would create. The map and the list always
//! contain exactly the same set of keys while the shard mutex is held.

use super::entry::CacheEntry;
use super::key::CacheKey;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Instant;

/// Outcome of a shard lookup.
pub(crate) enum Lookup {
    /// Live entry; message copy with the requested id.
    Hit(hickory_proto::op::Message),
    /// An entry existed but had expired; it has been evicted.
    Expired,
    /// No entry for the key.
    Miss,
}

/// One of the independent cache shards.
#[derive(Default)]
pub(crate) struct Shard {
    inner: Mutex<ShardInner>,
}

#[derive(Default)]
struct ShardInner {
    /// Key to arena-slot index.
    map: HashMap<CacheKey, usize>,
    /// Slot arena; freed indices are recycled.
    slots: Vec<Option<Node>>,
    free: Vec<usize>,
    /// Most recently used slot.
    head: Option<usize>,
    /// Least recently used slot.
    tail: Option<usize>,
}

struct Node {
    key: CacheKey,
    entry: CacheEntry,
    prev: Option<usize>,
    next: Option<usize>,
}

impl Shard {
    /// Looks up `key`, refreshing its LRU position and access frequency.
    ///
    /// Finding an expired entry evicts it and reports [`Lookup::Expired`]
    /// so the caller can count it separately from a plain miss.
    pub(crate) fn get(&self, key: &CacheKey, request_id: u16, now: Instant) -> Lookup {
        let mut inner = self.inner.lock();

        let Some(&idx) = inner.map.get(key) else {
            return Lookup::Miss;
        };

        let expired = inner.slots[idx]
            .as_ref()
            .map(|node| node.entry.is_expired(now))
            .unwrap_or(true);

        if expired {
            inner.remove_index(idx);
            return Lookup::Expired;
        }

        inner.move_to_front(idx);
        let node = inner.slots[idx].as_mut().expect("linked slot is occupied");
        node.entry.touch();
        Lookup::Hit(node.entry.message_with_id(request_id))
    }

    /// Inserts `entry`, replacing any existing entry for the key and
    /// evicting from the LRU tail while the shard is at capacity.
    ///
    /// Returns the number of entries evicted for capacity.
    pub(crate) fn insert(&self, key: CacheKey, entry: CacheEntry, capacity: usize) -> u64 {
        let mut inner = self.inner.lock();

        if let Some(&idx) = inner.map.get(&key) {
            inner.remove_index(idx);
        }

        let mut evicted = 0;
        while inner.map.len() >= capacity {
            let Some(tail) = inner.tail else { break };
            inner.remove_index(tail);
            evicted += 1;
        }

        inner.push_front(key, entry);
        evicted
    }

    /// Removes the entry for `key` if present.
    pub(crate) fn remove(&self, key: &CacheKey) -> bool {
        let mut inner = self.inner.lock();
        if let Some(&idx) = inner.map.get(key) {
            inner.remove_index(idx);
            true
        } else {
            false
        }
    }

    /// Removes every expired entry, returning how many were dropped.
    pub(crate) fn remove_expired(&self, now: Instant) -> u64 {
        let mut inner = self.inner.lock();

        let expired: Vec<usize> = inner
            .map
            .values()
            .copied()
            .filter(|&idx| {
                inner.slots[idx]
                    .as_ref()
                    .map(|node| node.entry.is_expired(now))
                    .unwrap_or(true)
            })
            .collect();

        let count = expired.len() as u64;
        for idx in expired {
            inner.remove_index(idx);
        }
        count
    }

    /// Returns the number of live entries.
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    /// Drops every entry.
    pub(crate) fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.map.clear();
        inner.slots.clear();
        inner.free.clear();
        inner.head = None;
        inner.tail = None;
    }

    /// Collects keys of unexpired entries matching `filter`.
    pub(crate) fn collect_keys<F>(&self, now: Instant, filter: F) -> Vec<CacheKey>
    where
        F: Fn(&CacheKey, &CacheEntry) -> bool,
    {
        let inner = self.inner.lock();
        inner
            .map
            .iter()
            .filter_map(|(key, &idx)| {
                let node = inner.slots[idx].as_ref()?;
                if !node.entry.is_expired(now) && filter(key, &node.entry) {
                    Some(key.clone())
                } else {
                    None
                }
            })
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn force_expire(&self, key: &CacheKey) {
        let mut inner = self.inner.lock();
        if let Some(&idx) = inner.map.get(key) {
            if let Some(node) = inner.slots[idx].as_mut() {
                node.entry.force_expired();
            }
        }
    }
}

impl ShardInner {
    fn push_front(&mut self, key: CacheKey, entry: CacheEntry) {
        let node = Node {
            key: key.clone(),
            entry,
            prev: None,
            next: self.head,
        };

        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(node);
                idx
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };

        if let Some(old_head) = self.head {
            if let Some(head_node) = self.slots[old_head].as_mut() {
                head_node.prev = Some(idx);
            }
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }

        self.map.insert(key, idx);
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = match self.slots[idx].as_ref() {
            Some(node) => (node.prev, node.next),
            None => return,
        };

        match prev {
            Some(p) => {
                if let Some(node) = self.slots[p].as_mut() {
                    node.next = next;
                }
            }
            None => self.head = next,
        }

        match next {
            Some(n) => {
                if let Some(node) = self.slots[n].as_mut() {
                    node.prev = prev;
                }
            }
            None => self.tail = prev,
        }
    }

    fn move_to_front(&mut self, idx: usize) {
        if self.head == Some(idx) {
            return;
        }

        self.unlink(idx);

        if let Some(node) = self.slots[idx].as_mut() {
            node.prev = None;
            node.next = self.head;
        }
        if let Some(old_head) = self.head {
            if let Some(node) = self.slots[old_head].as_mut() {
                node.prev = Some(idx);
            }
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn remove_index(&mut self, idx: usize) {
        self.unlink(idx);
        if let Some(node) = self.slots[idx].take() {
            self.map.remove(&node.key);
        }
        self.free.push(idx);
    }
}
