//! Query cache collaborator
//!
//! Minimal positive-answer cache: the core only ever inserts successful
//! answers, so this is trimmed of negative caching and CNAME-chasing —
//! neither applies to a stub resolver's "did the upstream answer
//! successfully" question. TTL bookkeeping (the minimum TTL across the
//! answer section, expiry by wall-clock-free deadline) is kept.

use crate::dns::clock::Timeval;
use crate::dns::errors::Status;
use crate::dns::protocol::{DnsPacket, QueryType};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    qname: String,
    qtype: QueryType,
}

struct CacheEntry {
    packet: DnsPacket,
    expires: Timeval,
}

/// `insert(now, qname, qtype, parsed)`; success transfers conceptual
/// ownership of `parsed` to the cache (the core must not mutate it
/// further once insertion succeeds).
pub trait QueryCache: Send + Sync {
    fn insert(&self, now: Timeval, qname: &str, qtype: QueryType, parsed: DnsPacket) -> Status;
    fn lookup(&self, now: Timeval, qname: &str, qtype: QueryType) -> Option<DnsPacket>;
}

pub struct TtlQueryCache {
    entries: parking_lot::Mutex<std::collections::HashMap<CacheKey, CacheEntry>>,
}

impl Default for TtlQueryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl TtlQueryCache {
    pub fn new() -> TtlQueryCache {
        TtlQueryCache {
            entries: parking_lot::Mutex::new(std::collections::HashMap::new()),
        }
    }

    fn min_ttl_secs(packet: &DnsPacket) -> u32 {
        packet
            .answers
            .iter()
            .map(|rec| rec.get_ttl())
            .min()
            .unwrap_or(0)
    }
}

impl QueryCache for TtlQueryCache {
    fn insert(&self, now: Timeval, qname: &str, qtype: QueryType, parsed: DnsPacket) -> Status {
        let ttl = Self::min_ttl_secs(&parsed);
        let key = CacheKey {
            qname: qname.to_ascii_lowercase(),
            qtype,
        };
        let entry = CacheEntry {
            packet: parsed,
            expires: crate::dns::clock::timeadd(now, ttl as u64 * 1000),
        };
        self.entries.lock().insert(key, entry);
        Status::Success
    }

    fn lookup(&self, now: Timeval, qname: &str, qtype: QueryType) -> Option<DnsPacket> {
        let key = CacheKey {
            qname: qname.to_ascii_lowercase(),
            qtype,
        };
        let mut entries = self.entries.lock();
        match entries.get(&key) {
            Some(entry) if !crate::dns::clock::timedout(now, entry.expires) => {
                Some(entry.packet.clone())
            }
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }
}
