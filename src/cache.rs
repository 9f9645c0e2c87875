//! TTL-bounded LRU cache of answer record sets.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use hickory_proto::rr::{Record, RecordType};
use lru::LruCache;

/// Default cache capacity in keys.
pub const DEFAULT_CAPACITY: usize = 1_000_000;

/// Question fingerprint: lowercased FQDN plus record type.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct CacheKey {
    pub name: String,
    pub record_type: RecordType,
}

impl CacheKey {
    pub fn new(name: String, record_type: RecordType) -> Self {
        Self { name, record_type }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.record_type)
    }
}

/// Counters describing cache effectiveness and churn.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStat {
    pub hits: u64,
    pub misses: u64,
    pub added: u64,
    pub evicted: u64,
}

struct Entry {
    records: Vec<Record>,
    valid_until: Instant,
}

struct Inner {
    entries: LruCache<CacheKey, Entry>,
    stat: CacheStat,
}

/// LRU cache of resource-record sets with per-entry expiry.
///
/// An entry is visible only while its expiry is in the future; an expired
/// entry may keep occupying capacity until the reaper (or a lookup that
/// trips over it) removes it.
pub struct TtlCache {
    inner: Mutex<Inner>,
}

impl TtlCache {
    /// Create a cache bounded to `capacity` keys.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::new(capacity),
                stat: CacheStat::default(),
            }),
        }
    }

    /// Look up a record set; an expired entry reads as absent and counts
    /// as a miss.
    pub fn get(&self, key: &CacheKey) -> Option<Vec<Record>> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();

        if let Some(entry) = inner.entries.get(key) {
            if now < entry.valid_until {
                let records = entry.records.clone();
                inner.stat.hits += 1;
                return Some(records);
            }
            inner.entries.pop(key);
        }
        inner.stat.misses += 1;
        None
    }

    /// Insert a record set, evicting the least-recently-used entry at
    /// capacity.
    pub fn set(&self, key: CacheKey, records: Vec<Record>, ttl: Duration) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let entry = Entry {
            records,
            valid_until: Instant::now() + ttl,
        };

        let displaced = inner.entries.push(key.clone(), entry);
        inner.stat.added += 1;
        if let Some((old_key, _)) = displaced {
            // push returns the same key when replacing; only a different
            // key means an LRU eviction.
            if old_key != key {
                inner.stat.evicted += 1;
            }
        }
    }

    /// Remove every expired entry. Returns the removed count and the
    /// number of entries remaining.
    pub fn delete_expired(&self) -> (usize, usize) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();

        let expired: Vec<CacheKey> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.valid_until <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            inner.entries.pop(key);
        }
        (expired.len(), inner.entries.len())
    }

    /// Number of entries currently held, expired ones included.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entries.len()
    }

    /// True when the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the hit/miss/added/evicted counters.
    pub fn stat(&self) -> CacheStat {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.stat
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData};
    use std::net::Ipv4Addr;

    fn a_record(name: &str, ttl: u32, ip: [u8; 4]) -> Record {
        let name = Name::from_ascii(name).unwrap();
        Record::from_rdata(name, ttl, RData::A(A(Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3]))))
    }

    fn key(name: &str) -> CacheKey {
        CacheKey::new(name.to_owned(), RecordType::A)
    }

    #[test]
    fn get_returns_what_was_set() {
        let cache = TtlCache::new(16);
        let records = vec![a_record("example.com.", 300, [93, 184, 216, 34])];

        cache.set(key("example.com."), records.clone(), Duration::from_secs(300));

        assert_eq!(cache.get(&key("example.com.")), Some(records));
        assert_eq!(cache.stat(), CacheStat { hits: 1, misses: 0, added: 1, evicted: 0 });
    }

    #[test]
    fn expired_entry_reads_as_miss() {
        let cache = TtlCache::new(16);
        cache.set(
            key("example.com."),
            vec![a_record("example.com.", 0, [1, 2, 3, 4])],
            Duration::ZERO,
        );

        assert_eq!(cache.get(&key("example.com.")), None);
        assert_eq!(cache.stat().misses, 1);
        // The expired entry was removed lazily.
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn miss_on_absent_key() {
        let cache = TtlCache::new(16);
        assert_eq!(cache.get(&key("absent.example.com.")), None);
        assert_eq!(cache.stat(), CacheStat { hits: 0, misses: 1, added: 0, evicted: 0 });
    }

    #[test]
    fn lru_eviction_at_capacity() {
        let cache = TtlCache::new(2);
        let ttl = Duration::from_secs(300);
        cache.set(key("a.example.com."), vec![a_record("a.example.com.", 300, [1, 1, 1, 1])], ttl);
        cache.set(key("b.example.com."), vec![a_record("b.example.com.", 300, [2, 2, 2, 2])], ttl);

        // Touch `a` so `b` becomes the least recently used.
        assert!(cache.get(&key("a.example.com.")).is_some());

        cache.set(key("c.example.com."), vec![a_record("c.example.com.", 300, [3, 3, 3, 3])], ttl);

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&key("b.example.com.")).is_none());
        assert!(cache.get(&key("a.example.com.")).is_some());
        assert!(cache.get(&key("c.example.com.")).is_some());
        assert_eq!(cache.stat().evicted, 1);
    }

    #[test]
    fn replacing_a_key_is_not_an_eviction() {
        let cache = TtlCache::new(2);
        let ttl = Duration::from_secs(300);
        cache.set(key("a.example.com."), vec![a_record("a.example.com.", 300, [1, 1, 1, 1])], ttl);
        cache.set(key("a.example.com."), vec![a_record("a.example.com.", 300, [5, 5, 5, 5])], ttl);

        let stat = cache.stat();
        assert_eq!(stat.added, 2);
        assert_eq!(stat.evicted, 0);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn delete_expired_reports_removed_and_remaining() {
        let cache = TtlCache::new(16);
        cache.set(
            key("stale.example.com."),
            vec![a_record("stale.example.com.", 0, [1, 1, 1, 1])],
            Duration::ZERO,
        );
        cache.set(
            key("fresh.example.com."),
            vec![a_record("fresh.example.com.", 300, [2, 2, 2, 2])],
            Duration::from_secs(300),
        );

        let (removed, remaining) = cache.delete_expired();
        assert_eq!((removed, remaining), (1, 1));

        // A second pass finds nothing left to reap.
        assert_eq!(cache.delete_expired(), (0, 1));
    }

    #[test]
    fn key_renders_as_fingerprint() {
        assert_eq!(key("example.com.").to_string(), "example.com.:A");
    }
}
