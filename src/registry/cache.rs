//! Local tunnel-lookup cache for the distributed registry.
//!
//! The cache is advisory: an unexpired hit bypasses the shared store, a
//! miss proceeds to it, and there is no negative caching. Entries are
//! dropped eagerly on local mutations and on pub/sub invalidations; a
//! janitor sweeps out anything the invalidations missed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::registry::{CacheStats, TunnelRecord};

/// Janitor scan period.
pub const JANITOR_INTERVAL: Duration = Duration::from_secs(5);

struct CacheEntry {
    record: TunnelRecord,
    expires_at: Instant,
}

/// Subdomain-keyed cache of tunnel records with per-entry expiry.
pub struct TunnelCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl TunnelCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up a subdomain; an expired entry counts as a miss.
    pub fn get(&self, subdomain: &str) -> Option<TunnelRecord> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let hit = entries
            .get(subdomain)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.record.clone());

        if hit.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            crate::observability::metrics::record_cache_hit();
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            crate::observability::metrics::record_cache_miss();
        }
        hit
    }

    /// Store a record with the configured TTL.
    pub fn insert(&self, record: TunnelRecord) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            record.subdomain.clone(),
            CacheEntry {
                record,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Drop one subdomain's entry.
    pub fn invalidate(&self, subdomain: &str) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.remove(subdomain);
    }

    /// Drop every expired entry. Called by the janitor.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.retain(|_, entry| entry.expires_at > now);
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(subdomain: &str) -> TunnelRecord {
        TunnelRecord {
            subdomain: subdomain.into(),
            server_id: "s1".into(),
            server_host: "127.0.0.1".into(),
            client_id: "c1".into(),
            created_at: 1,
            last_seen_at: 1,
            proxy_port: 8080,
            control_port: 5000,
            password_hash: None,
        }
    }

    #[test]
    fn hit_then_invalidate() {
        let cache = TunnelCache::new(Duration::from_secs(2));
        assert!(cache.get("demo").is_none());

        cache.insert(record("demo"));
        assert!(cache.get("demo").is_some());

        cache.invalidate("demo");
        assert!(cache.get("demo").is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
    }

    #[test]
    fn expired_entry_equals_absence() {
        let cache = TunnelCache::new(Duration::from_millis(0));
        cache.insert(record("demo"));
        assert!(cache.get("demo").is_none());

        // Still physically present until the janitor runs.
        assert_eq!(cache.len(), 1);
        cache.purge_expired();
        assert!(cache.is_empty());
    }
}
