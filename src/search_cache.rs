// Pass-through TTL cache in front of the read model
//
// Entries live in a DashMap; an expiry index ordered by deadline lets inserts sweep
// out everything that has already expired without scanning the whole map.

use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::debug;

use crate::model::EventRecord;
use crate::read_model::{search, SearchFilter};
use crate::store::{EventStore, StoreError};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub items_count: usize,
    pub hit_count: usize,
    pub miss_count: usize,
    pub expired_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SearchKey {
    starts_at: DateTime<Utc>,
    ends_at: DateTime<Utc>,
    filter: SearchFilter,
}

struct CacheEntry {
    value: Arc<Vec<EventRecord>>,
    expires_at: Instant,
}

pub struct SearchCache {
    store: EventStore,
    ttl: Duration,
    entries: DashMap<SearchKey, CacheEntry>,
    expiry_index: RwLock<BTreeMap<Instant, HashSet<SearchKey>>>,
    stats: RwLock<CacheStats>,
}

impl SearchCache {
    pub fn new(store: EventStore, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            entries: DashMap::new(),
            expiry_index: RwLock::new(BTreeMap::new()),
            stats: RwLock::new(CacheStats::default()),
        }
    }

    /// Returns the cached result for this exact query, or runs the search and caches it.
    pub fn get_or_load(
        &self,
        starts_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
        filter: SearchFilter,
    ) -> Result<Arc<Vec<EventRecord>>, StoreError> {
        let key = SearchKey {
            starts_at,
            ends_at,
            filter,
        };
        let now = Instant::now();

        if let Some(value) = self.lookup(&key, now) {
            self.stats.write().hit_count += 1;
            return Ok(value);
        }
        self.stats.write().miss_count += 1;

        let value = Arc::new(search(&self.store, starts_at, ends_at, &filter)?);
        self.insert(key, Arc::clone(&value), now);
        Ok(value)
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = self.stats.read().clone();
        stats.items_count = self.entries.len();
        stats
    }

    /// Drops every cached result.
    pub fn clear(&self) {
        self.entries.clear();
        self.expiry_index.write().clear();
        debug!("search cache cleared");
    }

    fn lookup(&self, key: &SearchKey, now: Instant) -> Option<Arc<Vec<EventRecord>>> {
        let expired = {
            let entry = self.entries.get(key)?;
            if now < entry.expires_at {
                return Some(Arc::clone(&entry.value));
            }
            entry.expires_at
        };

        // The map guard must be released before removing.
        self.entries.remove(key);
        self.forget_deadline(expired, key);
        self.stats.write().expired_count += 1;
        None
    }

    fn insert(&self, key: SearchKey, value: Arc<Vec<EventRecord>>, now: Instant) {
        self.purge_expired(now);

        let expires_at = now + self.ttl;
        if let Some(previous) = self.entries.insert(key, CacheEntry { value, expires_at }) {
            self.forget_deadline(previous.expires_at, &key);
        }
        self.expiry_index
            .write()
            .entry(expires_at)
            .or_default()
            .insert(key);
    }

    fn forget_deadline(&self, deadline: Instant, key: &SearchKey) {
        let mut index = self.expiry_index.write();
        if let Some(keys) = index.get_mut(&deadline) {
            keys.remove(key);
            if keys.is_empty() {
                index.remove(&deadline);
            }
        }
    }

    fn purge_expired(&self, now: Instant) {
        let mut purged = 0;
        let mut index = self.expiry_index.write();
        while let Some(entry) = index.first_entry() {
            if *entry.key() > now {
                break;
            }
            for key in entry.remove() {
                if self.entries.remove(&key).is_some() {
                    purged += 1;
                }
            }
        }
        drop(index);

        if purged > 0 {
            self.stats.write().expired_count += purged;
            debug!(purged, "expired search results dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ParsedEvent, ParsedPlan, SellMode};
    use crate::reconcile::ReconciliationEngine;
    use crate::store::test_support::temp_store;
    use chrono::{NaiveDate, TimeZone};

    fn seed(engine: &ReconciliationEngine, id: &str) {
        let starts_at = NaiveDate::from_ymd_opt(2024, 7, 4)
            .unwrap()
            .and_hms_opt(20, 0, 0)
            .unwrap();
        let events = vec![ParsedEvent {
            base_event_id: id.to_string(),
            title: id.to_string(),
            organizer_company_id: None,
            plans: vec![ParsedPlan {
                base_plan_id: "p".to_string(),
                sell_mode: SellMode::Online,
                starts_at,
                ends_at: starts_at,
                sell_from: None,
                sell_to: None,
                sold_out: false,
                capacity: None,
                zones: vec![],
            }],
        }];
        engine
            .upsert("primary", &events, Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap())
            .unwrap();
    }

    fn july() -> (DateTime<Utc>, DateTime<Utc>) {
        (
            Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 7, 31, 0, 0, 0).unwrap(),
        )
    }

    #[test]
    fn test_repeated_query_is_served_from_cache() {
        let temp = temp_store();
        let engine = ReconciliationEngine::new(temp.store.clone(), 100);
        seed(&engine, "first");

        let cache = SearchCache::new(temp.store.clone(), Duration::from_secs(60));
        let (from, to) = july();

        let first = cache.get_or_load(from, to, SearchFilter::default()).unwrap();
        assert_eq!(first.len(), 1);

        seed(&engine, "second");
        let second = cache.get_or_load(from, to, SearchFilter::default()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let stats = cache.stats();
        assert_eq!(stats.hit_count, 1);
        assert_eq!(stats.miss_count, 1);
        assert_eq!(stats.items_count, 1);

        // A different filter is a different key.
        let audit = SearchFilter {
            include_stale: true,
            ..SearchFilter::default()
        };
        assert_eq!(cache.get_or_load(from, to, audit).unwrap().len(), 2);

        cache.clear();
        assert_eq!(cache.get_or_load(from, to, SearchFilter::default()).unwrap().len(), 2);
        assert_eq!(cache.stats().miss_count, 3);
    }

    #[test]
    fn test_entries_expire_after_ttl() {
        let temp = temp_store();
        let engine = ReconciliationEngine::new(temp.store.clone(), 100);
        seed(&engine, "first");

        let cache = SearchCache::new(temp.store.clone(), Duration::from_millis(20));
        let (from, to) = july();

        assert_eq!(cache.get_or_load(from, to, SearchFilter::default()).unwrap().len(), 1);
        seed(&engine, "second");
        std::thread::sleep(Duration::from_millis(40));

        assert_eq!(cache.get_or_load(from, to, SearchFilter::default()).unwrap().len(), 2);
        let stats = cache.stats();
        assert_eq!(stats.expired_count, 1);
        assert_eq!(stats.miss_count, 2);
        assert_eq!(stats.hit_count, 0);
    }
}
