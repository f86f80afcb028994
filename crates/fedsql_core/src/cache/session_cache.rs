use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::Determinism;
use super::access_info::ModificationTracker;
use super::cachable::Cachable;
use super::cache_id::{CacheId, ScopedKey};
use super::results_store::ResultsStore;
use crate::buffer::buffer_manager::BufferManager;

struct CacheEntry<T> {
    value: Arc<T>,
    expires_at: Option<Instant>,
}

impl<T> CacheEntry<T> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// LRU cache where the effective key of an entry depends on the determinism
/// of the cached value.
///
/// Session scoped entries are only visible to the session that created them.
/// Broader scopes are shared across sessions and go through the value's
/// prepare/restore hooks.
pub struct SessionAwareCache<T> {
    name: &'static str,
    /// None if caching is disabled.
    entries: Option<Mutex<LruCache<ScopedKey, CacheEntry<T>>>>,
    hits: AtomicU64,
    requests: AtomicU64,
    store: Arc<dyn ResultsStore>,
    buffers: Arc<BufferManager>,
    tracker: Arc<ModificationTracker>,
}

impl<T> fmt::Debug for SessionAwareCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionAwareCache")
            .field("name", &self.name)
            .field("hits", &self.hits)
            .field("requests", &self.requests)
            .finish_non_exhaustive()
    }
}

impl<T: Cachable> SessionAwareCache<T> {
    /// Create a new cache.
    ///
    /// A `max_entries` of zero disables caching, a negative value means
    /// unbounded.
    pub fn new(
        name: &'static str,
        max_entries: i64,
        store: Arc<dyn ResultsStore>,
        buffers: Arc<BufferManager>,
        tracker: Arc<ModificationTracker>,
    ) -> Self {
        let entries = match max_entries {
            0 => None,
            n if n < 0 => Some(Mutex::new(LruCache::unbounded())),
            n => {
                let cap = usize::try_from(n)
                    .ok()
                    .and_then(NonZeroUsize::new)
                    .unwrap_or(NonZeroUsize::MAX);
                Some(Mutex::new(LruCache::new(cap)))
            }
        };

        SessionAwareCache {
            name,
            entries,
            hits: AtomicU64::new(0),
            requests: AtomicU64::new(0),
            store,
            buffers,
            tracker,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.entries.is_some()
    }

    /// Look up a value, probing from the narrowest scope to the broadest.
    pub fn get(&self, id: &CacheId) -> Option<Arc<T>> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let entries = self.entries.as_ref()?;
        let now = Instant::now();

        for scope in Determinism::PROBE_ORDER {
            let key = id.scoped_key(scope);

            let value = {
                let mut entries = entries.lock();
                let (value, stale) = match entries.get(&key) {
                    Some(entry) => (
                        entry.value.clone(),
                        entry.is_expired(now)
                            || !self
                                .tracker
                                .is_valid(entry.value.access_info(), entry.value.data_dependent()),
                    ),
                    None => continue,
                };

                if stale {
                    trace!(cache = self.name, %scope, "evicting stale entry");
                    if let Some(entry) = entries.pop(&key) {
                        entry.value.on_evict(self.store.as_ref());
                    }
                    continue;
                }

                value
            };

            if scope.is_shared() {
                if let Err(e) = value.restore(self.store.as_ref(), &self.buffers) {
                    warn!(%e, cache = self.name, %scope, "failed to restore cache entry, evicting");
                    self.remove_if_same(&key, &value);
                    continue;
                }
            }

            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(value);
        }

        None
    }

    /// Put a value into the cache at the scope for the given determinism.
    ///
    /// No-op if caching is disabled, or if the value couldn't be prepared for
    /// the shared tier.
    pub fn put(&self, id: &CacheId, determinism: Determinism, value: Arc<T>, ttl: Option<Duration>) {
        let Some(entries) = &self.entries else {
            return;
        };

        if determinism.is_shared() {
            if let Err(e) = value.prepare(self.store.as_ref(), &self.buffers) {
                debug!(%e, cache = self.name, "value not prepared for shared tier, skipping");
                return;
            }
        }

        let key = id.scoped_key(determinism);
        let entry = CacheEntry {
            value: value.clone(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };

        let mut entries = entries.lock();
        if let Some((_, evicted)) = entries.push(key, entry) {
            if !Arc::ptr_eq(&evicted.value, &value) {
                evicted.value.on_evict(self.store.as_ref());
            }
        }
        trace!(cache = self.name, %determinism, entries = entries.len(), "put cache entry");
    }

    pub fn clear_all(&self) {
        let Some(entries) = &self.entries else {
            return;
        };
        let mut entries = entries.lock();
        let count = entries.len();
        while let Some((_, entry)) = entries.pop_lru() {
            entry.value.on_evict(self.store.as_ref());
        }
        debug!(cache = self.name, %count, "cleared cache");
    }

    /// Remove every entry for the given VDB.
    ///
    /// Entries shared across VDB versions are removed for any version of the
    /// VDB.
    pub fn clear_for_vdb(&self, name: &str, version: u32) {
        let Some(entries) = &self.entries else {
            return;
        };
        let mut entries = entries.lock();
        let keys: Vec<_> = entries
            .iter()
            .filter(|(key, _)| key.matches_vdb(name, version))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &keys {
            if let Some(entry) = entries.pop(key) {
                entry.value.on_evict(self.store.as_ref());
            }
        }
        debug!(cache = self.name, vdb = %name, %version, removed = keys.len(), "cleared cache for vdb");
    }

    fn remove_if_same(&self, key: &ScopedKey, value: &Arc<T>) {
        if let Some(entries) = &self.entries {
            let mut entries = entries.lock();
            let same = entries
                .peek(key)
                .is_some_and(|entry| Arc::ptr_eq(&entry.value, value));
            if same {
                if let Some(entry) = entries.pop(key) {
                    entry.value.on_evict(self.store.as_ref());
                }
            }
        }
    }

    /// Number of successful gets.
    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Number of gets.
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn total_entries(&self) -> usize {
        self.entries.as_ref().map(|e| e.lock().len()).unwrap_or(0)
    }

    pub fn modification_tracker(&self) -> &Arc<ModificationTracker> {
        &self.tracker
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    use fedsql_error::{DbError, Result};

    use super::*;
    use crate::buffer::storage::MemoryStorageManager;
    use crate::cache::access_info::AccessInfo;
    use crate::cache::cache_id::ParseInfo;
    use crate::cache::results_store::MemoryResultsStore;
    use crate::metadata::VdbKey;

    #[derive(Debug, Default)]
    struct TestValue {
        info: AccessInfo,
        fail_prepare: bool,
        fail_restore: AtomicBool,
        restores: AtomicUsize,
    }

    impl TestValue {
        fn accessing(object: &str) -> Self {
            TestValue {
                info: AccessInfo::new([object], 0),
                ..Default::default()
            }
        }
    }

    impl Cachable for TestValue {
        fn prepare(&self, _store: &dyn ResultsStore, _buffers: &Arc<BufferManager>) -> Result<()> {
            if self.fail_prepare {
                return Err(DbError::component("prepare failed"));
            }
            Ok(())
        }

        fn restore(&self, _store: &dyn ResultsStore, _buffers: &Arc<BufferManager>) -> Result<()> {
            self.restores.fetch_add(1, Ordering::SeqCst);
            if self.fail_restore.load(Ordering::SeqCst) {
                return Err(DbError::component("restore failed"));
            }
            Ok(())
        }

        fn access_info(&self) -> &AccessInfo {
            &self.info
        }

        fn data_dependent(&self) -> bool {
            false
        }
    }

    fn cache(max_entries: i64) -> SessionAwareCache<TestValue> {
        SessionAwareCache::new(
            "test",
            max_entries,
            Arc::new(MemoryResultsStore::new()),
            Arc::new(BufferManager::new(
                16,
                16,
                Arc::new(MemoryStorageManager::new()),
            )),
            Arc::new(ModificationTracker::new()),
        )
    }

    fn id(sql: &str, session: &str, user: &str, vdb: (&str, u32)) -> CacheId {
        CacheId::new(
            sql,
            ParseInfo::default(),
            session,
            user,
            VdbKey::new(vdb.0, vdb.1),
        )
    }

    fn sid(sql: &str) -> CacheId {
        id(sql, "s1", "u1", ("vdb", 1))
    }

    #[test]
    fn session_get_returns_same_instance() {
        let cache = cache(10);
        let value = Arc::new(TestValue::default());
        cache.put(&sid("select 1"), Determinism::Session, value.clone(), None);

        let got = cache.get(&sid("select 1")).unwrap();
        assert!(Arc::ptr_eq(&value, &got));
        assert_eq!(1, cache.hit_count());
        // Session entries are never restored.
        assert_eq!(0, got.restores.load(Ordering::SeqCst));

        cache.get(&sid("select 1")).unwrap();
        assert_eq!(2, cache.hit_count());
        assert_eq!(2, cache.request_count());
    }

    #[test]
    fn miss_does_not_count_hit() {
        let cache = cache(10);
        assert!(cache.get(&sid("select 1")).is_none());
        assert_eq!(0, cache.hit_count());
        assert_eq!(1, cache.request_count());
    }

    #[test]
    fn session_scope_not_shared() {
        let cache = cache(10);
        cache.put(
            &id("select 1", "s1", "u1", ("vdb", 1)),
            Determinism::Session,
            Arc::new(TestValue::default()),
            None,
        );
        assert!(cache.get(&id("select 1", "s2", "u1", ("vdb", 1))).is_none());
    }

    #[test]
    fn user_scope_shared_across_sessions_with_restore() {
        let cache = cache(10);
        let value = Arc::new(TestValue::default());
        cache.put(
            &id("select 1", "s1", "u1", ("vdb", 1)),
            Determinism::User,
            value.clone(),
            None,
        );

        let got = cache.get(&id("select 1", "s2", "u1", ("vdb", 1))).unwrap();
        assert!(Arc::ptr_eq(&value, &got));
        assert_eq!(1, value.restores.load(Ordering::SeqCst));
        assert_eq!(1, cache.hit_count());

        // Different user.
        assert!(cache.get(&id("select 1", "s2", "u2", ("vdb", 1))).is_none());
    }

    #[test]
    fn restore_failure_evicts() {
        let cache = cache(10);
        let value = Arc::new(TestValue::default());
        value.fail_restore.store(true, Ordering::SeqCst);
        cache.put(&sid("select 1"), Determinism::Vdb, value.clone(), None);
        assert_eq!(1, cache.total_entries());

        assert!(cache.get(&sid("select 1")).is_none());
        assert_eq!(0, cache.total_entries());
        assert_eq!(0, cache.hit_count());
    }

    #[test]
    fn prepare_failure_skips_put() {
        let cache = cache(10);
        let value = Arc::new(TestValue {
            fail_prepare: true,
            ..Default::default()
        });
        cache.put(&sid("select 1"), Determinism::Vdb, value, None);
        assert_eq!(0, cache.total_entries());
    }

    #[test]
    fn lru_eviction() {
        let cache = cache(100);
        for i in 0..101 {
            cache.put(
                &sid(&format!("select {i}")),
                Determinism::Session,
                Arc::new(TestValue::default()),
                None,
            );
        }

        assert_eq!(100, cache.total_entries());
        assert!(cache.get(&sid("select 0")).is_none());
        assert!(cache.get(&sid("select 100")).is_some());
    }

    #[test]
    fn lru_eviction_respects_reads() {
        let cache = cache(2);
        for sql in ["a", "b"] {
            cache.put(&sid(sql), Determinism::Session, Arc::new(TestValue::default()), None);
        }
        cache.get(&sid("a")).unwrap();
        cache.put(&sid("c"), Determinism::Session, Arc::new(TestValue::default()), None);

        assert!(cache.get(&sid("a")).is_some());
        assert!(cache.get(&sid("b")).is_none());
        assert!(cache.get(&sid("c")).is_some());
    }

    #[test]
    fn zero_size_disabled() {
        let cache = cache(0);
        cache.put(&sid("select 1"), Determinism::Session, Arc::new(TestValue::default()), None);
        assert!(cache.get(&sid("select 1")).is_none());
        assert_eq!(0, cache.total_entries());
        assert!(!cache.is_enabled());
    }

    #[test]
    fn negative_size_unbounded() {
        let cache = cache(-1);
        for i in 0..2000 {
            cache.put(
                &sid(&format!("select {i}")),
                Determinism::Session,
                Arc::new(TestValue::default()),
                None,
            );
        }
        assert_eq!(2000, cache.total_entries());
        assert!(cache.get(&sid("select 0")).is_some());
    }

    #[test]
    fn clear_for_vdb_only_matching() {
        let cache = cache(10);
        let a = id("select 1", "s1", "u1", ("a", 1));
        let a2 = id("select 1", "s1", "u1", ("a", 2));
        let b = id("select 1", "s1", "u1", ("b", 1));
        for id in [&a, &a2, &b] {
            cache.put(id, Determinism::Vdb, Arc::new(TestValue::default()), None);
        }

        cache.clear_for_vdb("a", 1);
        assert!(cache.get(&a).is_none());
        assert!(cache.get(&a2).is_some());
        assert!(cache.get(&b).is_some());
    }

    #[test]
    fn clear_all() {
        let cache = cache(10);
        cache.put(&sid("a"), Determinism::Session, Arc::new(TestValue::default()), None);
        cache.put(&sid("b"), Determinism::Deterministic, Arc::new(TestValue::default()), None);
        cache.clear_all();
        assert_eq!(0, cache.total_entries());
    }

    #[test]
    fn expired_entry_misses() {
        let cache = cache(10);
        cache.put(
            &sid("select 1"),
            Determinism::Session,
            Arc::new(TestValue::default()),
            Some(Duration::ZERO),
        );
        assert!(cache.get(&sid("select 1")).is_none());
        assert_eq!(0, cache.total_entries());
    }

    #[test]
    fn invalidated_by_major_modification() {
        let cache = cache(10);
        cache.put(
            &sid("select * from pm1.g1"),
            Determinism::Session,
            Arc::new(TestValue::accessing("pm1.g1")),
            None,
        );

        cache.modification_tracker().record_modification("pm1.g1", false);
        assert!(cache.get(&sid("select * from pm1.g1")).is_some());

        cache.modification_tracker().record_modification("pm1.g1", true);
        assert!(cache.get(&sid("select * from pm1.g1")).is_none());
        assert_eq!(1, cache.hit_count());
    }
}
