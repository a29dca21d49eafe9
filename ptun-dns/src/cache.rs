//! DNS response caching with TTL expiration
//!
//! Stores raw response bytes keyed by (lowercased name, type, class). On a
//! hit the caller patches the first two bytes with the live transaction id
//! before replying, so one cached body serves every client.

use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use hickory_proto::op::{Message, Query};
use lru::LruCache;

/// Maximum number of cache entries
pub const MAX_ENTRIES: usize = 1000;

/// Minimum TTL applied to cached responses
pub const MIN_TTL_SECS: u64 = 60;

/// Maximum TTL applied to cached responses
pub const MAX_TTL_SECS: u64 = 3600;

/// TTL used when the response cannot be parsed
pub const DEFAULT_TTL_SECS: u64 = 300;

/// How many least-recently-used entries to drop when the cache is still full
/// after expired entries have been purged
const LRU_EVICTION_BATCH: usize = 100;

/// Cache key for DNS queries
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CacheKey {
    /// Query name, lowercased
    name: String,
    /// Record type code
    qtype: u16,
    /// Record class code
    qclass: u16,
}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.qtype.hash(state);
        self.qclass.hash(state);
    }
}

impl CacheKey {
    /// Build a cache key from a parsed DNS query
    pub fn from_query(query: &Query) -> Self {
        Self {
            name: query.name().to_string().to_lowercase(),
            qtype: u16::from(query.query_type()),
            qclass: u16::from(query.query_class()),
        }
    }
}

/// Cached DNS response
#[derive(Debug, Clone)]
struct CacheEntry {
    /// Raw response bytes (transaction id of the original responder)
    response: Vec<u8>,
    /// When this entry expires
    expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Cache statistics exposed for diagnostics
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    /// Number of cache hits
    pub hits: u64,
    /// Number of cache misses
    pub misses: u64,
    /// Number of expired entries removed
    pub expired: u64,
    /// Current number of entries
    pub entries: usize,
}

/// DNS response cache with TTL expiration and bounded capacity
#[derive(Debug)]
pub struct DnsCache {
    cache: LruCache<CacheKey, CacheEntry>,
    stats: CacheStats,
}

impl DnsCache {
    /// Create a cache with the given maximum capacity
    pub fn new(max_entries: usize) -> Self {
        Self {
            cache: LruCache::new(
                NonZeroUsize::new(max_entries)
                    .unwrap_or_else(|| NonZeroUsize::new(MAX_ENTRIES).unwrap()),
            ),
            stats: CacheStats::default(),
        }
    }

    /// Look up a cached response body
    ///
    /// Returns `None` when absent or expired. The returned bytes still carry
    /// the original transaction id; see [`patch_transaction_id`].
    pub fn get(&mut self, key: &CacheKey) -> Option<Vec<u8>> {
        match self.cache.get(key) {
            Some(entry) if !entry.is_expired() => {
                self.stats.hits += 1;
                Some(entry.response.clone())
            }
            Some(_) => {
                self.cache.pop(key);
                self.stats.expired += 1;
                self.stats.misses += 1;
                self.stats.entries = self.cache.len();
                None
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Insert a response, deriving its TTL from the message body
    pub fn insert(&mut self, key: CacheKey, response: &[u8]) {
        let ttl = extract_min_ttl(response)
            .unwrap_or(DEFAULT_TTL_SECS)
            .clamp(MIN_TTL_SECS, MAX_TTL_SECS);

        if self.cache.len() >= self.cache.cap().get() {
            self.evict_for_insert();
        }

        self.cache.put(
            key,
            CacheEntry {
                response: response.to_vec(),
                expires_at: Instant::now() + Duration::from_secs(ttl),
            },
        );
        self.stats.entries = self.cache.len();
    }

    /// Make room at capacity: drop expired entries first, then a batch of
    /// the least-recently-used ones.
    fn evict_for_insert(&mut self) {
        let expired_keys: Vec<CacheKey> = self
            .cache
            .iter()
            .filter(|(_, entry)| entry.is_expired())
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired_keys {
            self.cache.pop(key);
        }
        self.stats.expired += expired_keys.len() as u64;

        if self.cache.len() >= self.cache.cap().get() {
            for _ in 0..LRU_EVICTION_BATCH {
                if self.cache.pop_lru().is_none() {
                    break;
                }
            }
        }
        self.stats.entries = self.cache.len();
    }

    /// Current statistics
    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        self.cache.clear();
        self.stats.entries = 0;
    }
}

impl Default for DnsCache {
    fn default() -> Self {
        Self::new(MAX_ENTRIES)
    }
}

/// Overwrite the transaction id (bytes 0-1) of a raw DNS message
pub fn patch_transaction_id(response: &mut [u8], id: u16) {
    if response.len() >= 2 {
        response[0..2].copy_from_slice(&id.to_be_bytes());
    }
}

/// Extract the minimum non-zero TTL across the answer, authority, and
/// additional sections.
///
/// Returns `None` when the message cannot be parsed or carries no non-zero
/// TTL, in which case the caller falls back to [`DEFAULT_TTL_SECS`].
fn extract_min_ttl(response: &[u8]) -> Option<u64> {
    let message = Message::from_vec(response).ok()?;

    let mut min_ttl: Option<u64> = None;
    let records = message
        .answers()
        .iter()
        .chain(message.name_servers())
        .chain(message.additionals());

    for record in records {
        let ttl = u64::from(record.ttl());
        if ttl == 0 {
            continue;
        }
        min_ttl = Some(min_ttl.map_or(ttl, |m| m.min(ttl)));
    }

    min_ttl
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, OpCode, ResponseCode};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData, Record, RecordType};
    use std::net::Ipv4Addr;
    use std::str::FromStr;

    fn make_query(name: &str, rtype: RecordType) -> Query {
        Query::query(Name::from_str(name).unwrap(), rtype)
    }

    fn make_response(name: &str, id: u16, ttl: u32) -> Vec<u8> {
        let mut message = Message::new();
        message.set_id(id);
        message.set_message_type(MessageType::Response);
        message.set_op_code(OpCode::Query);
        message.set_response_code(ResponseCode::NoError);

        let qname = Name::from_str(name).unwrap();
        message.add_query(Query::query(qname.clone(), RecordType::A));
        message.add_answer(Record::from_rdata(
            qname,
            ttl,
            RData::A(A(Ipv4Addr::new(93, 184, 216, 34))),
        ));
        message.to_vec().unwrap()
    }

    #[test]
    fn test_cache_key_case_insensitive() {
        let k1 = CacheKey::from_query(&make_query("Example.COM.", RecordType::A));
        let k2 = CacheKey::from_query(&make_query("example.com.", RecordType::A));
        assert_eq!(k1, k2);
    }

    #[test]
    fn test_cache_key_distinguishes_type() {
        let k1 = CacheKey::from_query(&make_query("example.com.", RecordType::A));
        let k2 = CacheKey::from_query(&make_query("example.com.", RecordType::AAAA));
        assert_ne!(k1, k2);
    }

    #[test]
    fn test_hit_returns_body_and_counts() {
        let mut cache = DnsCache::new(10);
        let key = CacheKey::from_query(&make_query("example.com.", RecordType::A));
        let response = make_response("example.com.", 0x1111, 120);

        assert!(cache.get(&key).is_none());
        cache.insert(key.clone(), &response);

        let hit = cache.get(&key).unwrap();
        assert_eq!(hit, response);
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_patch_transaction_id() {
        let mut body = make_response("example.com.", 0x1111, 120);
        patch_transaction_id(&mut body, 0xBEEF);
        assert_eq!(&body[0..2], &[0xBE, 0xEF]);
        // Rest of the body untouched
        let original = make_response("example.com.", 0x1111, 120);
        assert_eq!(&body[2..], &original[2..]);
    }

    #[test]
    fn test_unparseable_response_gets_default_ttl() {
        let mut cache = DnsCache::new(10);
        let key = CacheKey::from_query(&make_query("example.com.", RecordType::A));
        // Garbage body: still cached, with the default TTL
        cache.insert(key.clone(), &[0u8; 16]);
        assert!(cache.get(&key).is_some());
    }

    #[test]
    fn test_ttl_clamped_to_minimum() {
        // TTL 1 is below the floor; the entry must survive well past 1 second
        let mut cache = DnsCache::new(10);
        let key = CacheKey::from_query(&make_query("example.com.", RecordType::A));
        cache.insert(key.clone(), &make_response("example.com.", 1, 1));
        std::thread::sleep(Duration::from_millis(1100));
        assert!(cache.get(&key).is_some());
    }

    #[test]
    fn test_eviction_drops_lru_batch() {
        let mut cache = DnsCache::new(MAX_ENTRIES);
        for i in 0..MAX_ENTRIES {
            let key = CacheKey::from_query(&make_query(
                &format!("host{}.example.com.", i),
                RecordType::A,
            ));
            cache.insert(key, &make_response("example.com.", i as u16, 600));
        }
        assert_eq!(cache.len(), MAX_ENTRIES);

        // Nothing expired, so a batch of LRU entries makes room
        let key = CacheKey::from_query(&make_query("fresh.example.com.", RecordType::A));
        cache.insert(key.clone(), &make_response("fresh.example.com.", 7, 600));

        assert_eq!(cache.len(), MAX_ENTRIES - LRU_EVICTION_BATCH + 1);
        assert!(cache.get(&key).is_some());
        // The oldest entry is gone
        let oldest = CacheKey::from_query(&make_query("host0.example.com.", RecordType::A));
        assert!(cache.get(&oldest).is_none());
    }

    #[test]
    fn test_min_ttl_ignores_zero() {
        let mut message = Message::new();
        message.set_id(1);
        message.set_message_type(MessageType::Response);
        let qname = Name::from_str("example.com.").unwrap();
        message.add_query(Query::query(qname.clone(), RecordType::A));
        message.add_answer(Record::from_rdata(
            qname.clone(),
            0,
            RData::A(A(Ipv4Addr::new(1, 1, 1, 1))),
        ));
        message.add_answer(Record::from_rdata(
            qname,
            90,
            RData::A(A(Ipv4Addr::new(2, 2, 2, 2))),
        ));
        let bytes = message.to_vec().unwrap();
        assert_eq!(extract_min_ttl(&bytes), Some(90));
    }
}
