//! Read-through record cache with single-flight fills.
//!
//! This module provides [`RecordCache`], the process-local cache each
//! [`ConfigStore`](crate::config_store::ConfigStore) owns. Entries are keyed
//! by config id, bounded by entry count, and expired by TTL; concurrent
//! readers of an uncached id coalesce onto one backing-store fetch.
//!
//! # Staleness Window
//!
//! The cache is process-local. Invalidation is push-based on successful local
//! updates only, so a record updated by another process stays visible here
//! until its TTL expires or this process performs an update itself. That
//! window is an accepted part of the design and is bounded by
//! [`CacheConfig::ttl`].

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use moka::future::Cache;
use serde::{Deserialize, Serialize};

use crate::{
    error::{RegistryError, RegistryResult},
    types::ConfigRecord,
};

/// Default maximum number of cached records.
pub const DEFAULT_CACHE_MAX_ENTRIES: u64 = 1_000;

/// Default per-entry time-to-live (5 minutes).
///
/// This bounds how long an update made by *another* process can remain
/// invisible to this one.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

/// Tuning for a store's record cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, bon::Builder, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CacheConfig {
    /// Maximum number of records held before LRU eviction.
    #[builder(default = DEFAULT_CACHE_MAX_ENTRIES)]
    pub max_entries: u64,

    /// Per-entry time-to-live.
    #[builder(default = DEFAULT_CACHE_TTL)]
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_entries: DEFAULT_CACHE_MAX_ENTRIES, ttl: DEFAULT_CACHE_TTL }
    }
}

/// LRU + TTL cache of config records with memoized fills.
///
/// Wraps [`moka::future::Cache`]; `try_get_with` provides the single-flight
/// property (one fetch shared by all concurrent callers for the same id).
/// Every entry is stamped with the invalidation generation observed before
/// its backing read, and every reader compares that stamp against the
/// current generation. An entry filled from a read that predates an
/// invalidation is dropped on sight, whether the reader started the fill,
/// joined it mid-flight, or hit the entry after it landed.
pub(crate) struct RecordCache {
    /// Record plus the invalidation generation its fill observed.
    cache: Cache<String, (Arc<ConfigRecord>, u64)>,
    /// Monotonic counter bumped on every invalidation. Process-wide, not
    /// per-id: any invalidation re-reads other ids once on their next hit.
    invalidation_gen: Arc<AtomicU64>,
}

impl RecordCache {
    pub(crate) fn new(config: CacheConfig) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(config.max_entries)
                .time_to_live(config.ttl)
                .build(),
            invalidation_gen: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Returns the cached record for `id`, filling it via `fetch` on a miss.
    ///
    /// Concurrent callers for the same uncached id share one `fetch`; its
    /// error is observed by every coalesced caller. If an invalidation lands
    /// while a fill is in flight, the stamped entry is discarded by whichever
    /// reader sees it first — including readers that joined the fill after
    /// the invalidation — and the record is fetched again, so a `memoize`
    /// that begins after an invalidation never returns the pre-invalidation
    /// snapshot.
    pub(crate) async fn memoize<F, Fut>(
        &self,
        id: &str,
        fetch: F,
    ) -> RegistryResult<Arc<ConfigRecord>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = RegistryResult<ConfigRecord>>,
    {
        loop {
            let (record, fill_gen) = self
                .cache
                .try_get_with(id.to_owned(), async {
                    // Stamp before the backing read: an invalidation landing
                    // anywhere after this point marks the fill stale.
                    let fill_gen = self.invalidation_gen.load(Ordering::Acquire);
                    fetch().await.map(|record| (Arc::new(record), fill_gen))
                })
                .await
                .map_err(|err: Arc<RegistryError>| (*err).clone())?;

            if self.invalidation_gen.load(Ordering::Acquire) == fill_gen {
                return Ok(record);
            }

            // The entry's fill predates an invalidation; its snapshot may be
            // older than the update that bumped the generation. Drop it and
            // fetch again.
            self.cache.invalidate(id).await;
        }
    }

    /// Drops the entry for `id` and bumps the invalidation generation so any
    /// in-flight fill for it is discarded on completion.
    pub(crate) async fn invalidate(&self, id: &str) {
        self.invalidation_gen.fetch_add(1, Ordering::Release);
        self.cache.invalidate(id).await;
    }

    /// Number of cached entries. Eventually consistent; call
    /// [`sync`](Self::sync) first for exact counts in tests.
    #[cfg(test)]
    pub(crate) fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Flushes pending cache maintenance so entry counts are exact.
    #[cfg(test)]
    pub(crate) async fn sync(&self) {
        self.cache.run_pending_tasks().await;
    }
}

impl std::fmt::Debug for RecordCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordCache").field("entries", &self.cache.entry_count()).finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use chrono::Utc;

    use super::*;
    use crate::types::{RecordMeta, ServiceConfig};

    fn record(id: &str, controller: &str) -> ConfigRecord {
        let config = ServiceConfig::builder()
            .id(id)
            .controller(controller)
            .sequence(0)
            .meter_id("https://meters.example.com/m1")
            .build();
        ConfigRecord { config, meta: RecordMeta::new(Utc::now()) }
    }

    #[tokio::test]
    async fn memoize_fills_once_and_serves_from_cache() {
        let cache = RecordCache::new(CacheConfig::default());
        let fetches = AtomicUsize::new(0);

        for _ in 0..3 {
            let found = cache
                .memoize("a", || async {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    Ok(record("a", "c1"))
                })
                .await
                .unwrap();
            assert_eq!(found.config.id, "a");
        }

        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn memoize_does_not_cache_errors() {
        let cache = RecordCache::new(CacheConfig::default());

        let err = cache
            .memoize("a", || async { Err(RegistryError::not_found("a")) })
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::NotFound { .. }));

        // A later fill must run again and can succeed.
        let found = cache.memoize("a", || async { Ok(record("a", "c1")) }).await.unwrap();
        assert_eq!(found.config.controller, "c1");
    }

    #[tokio::test]
    async fn invalidate_forces_refetch() {
        let cache = RecordCache::new(CacheConfig::default());

        let first = cache.memoize("a", || async { Ok(record("a", "c1")) }).await.unwrap();
        assert_eq!(first.config.controller, "c1");

        cache.invalidate("a").await;

        let second = cache.memoize("a", || async { Ok(record("a", "c2")) }).await.unwrap();
        assert_eq!(second.config.controller, "c2");
    }

    /// A fetch that parks its first call until released and answers "stale";
    /// every later call answers "fresh" immediately.
    struct StallingFetch {
        release: tokio::sync::Mutex<Option<tokio::sync::oneshot::Receiver<()>>>,
        calls: AtomicUsize,
    }

    impl StallingFetch {
        fn new(release: tokio::sync::oneshot::Receiver<()>) -> Self {
            Self { release: tokio::sync::Mutex::new(Some(release)), calls: AtomicUsize::new(0) }
        }

        async fn fetch(&self) -> RegistryResult<ConfigRecord> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(rx) = self.release.lock().await.take() {
                let _ = rx.await;
                return Ok(record("a", "stale"));
            }
            Ok(record("a", "fresh"))
        }
    }

    #[tokio::test]
    async fn racing_invalidation_discards_in_flight_fill() {
        let cache = Arc::new(RecordCache::new(CacheConfig::default()));
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let fetch = Arc::new(StallingFetch::new(release_rx));

        // Park a fill mid-flight, then invalidate before it lands.
        let cache2 = Arc::clone(&cache);
        let fetch2 = Arc::clone(&fetch);
        let fill =
            tokio::spawn(async move { cache2.memoize("a", || fetch2.fetch()).await });

        tokio::task::yield_now().await;
        cache.invalidate("a").await;
        release_tx.send(()).unwrap();

        // The filler itself discards its raced entry and re-reads.
        let filled = fill.await.unwrap().unwrap();
        assert_eq!(filled.config.controller, "fresh");
        assert_eq!(fetch.calls.load(Ordering::SeqCst), 2);

        // The re-read entry is cached; later readers do not fetch again.
        let found = cache.memoize("a", || fetch.fetch()).await.unwrap();
        assert_eq!(found.config.controller, "fresh");
        assert_eq!(fetch.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn reader_joining_a_stale_fill_rereads() {
        let cache = Arc::new(RecordCache::new(CacheConfig::default()));
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let fetch = Arc::new(StallingFetch::new(release_rx));

        let cache2 = Arc::clone(&cache);
        let fetch2 = Arc::clone(&fetch);
        let filler =
            tokio::spawn(async move { cache2.memoize("a", || fetch2.fetch()).await });
        tokio::task::yield_now().await;

        // The invalidation lands while the fill is parked; a reader that
        // starts strictly afterwards coalesces onto that same fill.
        cache.invalidate("a").await;
        let cache3 = Arc::clone(&cache);
        let fetch3 = Arc::clone(&fetch);
        let late_reader =
            tokio::spawn(async move { cache3.memoize("a", || fetch3.fetch()).await });
        tokio::task::yield_now().await;
        release_tx.send(()).unwrap();

        // Neither caller may observe the pre-invalidation snapshot.
        let filled = filler.await.unwrap().unwrap();
        let late = late_reader.await.unwrap().unwrap();
        assert_eq!(filled.config.controller, "fresh");
        assert_eq!(late.config.controller, "fresh");
    }

    #[tokio::test]
    async fn capacity_is_bounded() {
        let cache =
            RecordCache::new(CacheConfig::builder().max_entries(2).build());
        for i in 0..10 {
            let id = format!("record-{i}");
            cache
                .memoize(&id, || {
                    let id = id.clone();
                    async move { Ok(record(&id, "c1")) }
                })
                .await
                .unwrap();
        }
        cache.sync().await;
        assert!(cache.entry_count() <= 2);
    }
}
