//! Configuration record CRUD with optimistic concurrency and usage totals.
//!
//! This module provides [`ConfigStore`], the control-plane API over a
//! [`RecordStore`] backend. Each instance owns its read-through
//! [`RecordCache`](crate::cache) — caches are dependency-injected state, not
//! process globals — and every write goes through the backing store's
//! compare-and-swap so concurrent worker processes stay linearized per
//! config id.
//!
//! # Concurrency
//!
//! Updates are accepted only when the submitted `sequence` is exactly one
//! greater than the stored value. A losing writer receives
//! [`RegistryError::Conflict`] and must re-read and retry; the store never
//! retries on the caller's behalf.

use std::sync::Arc;

use fail::fail_point;
use tokio_util::sync::CancellationToken;

use crate::{
    cache::{CacheConfig, RecordCache},
    error::{RegistryError, RegistryResult},
    revocation::RevocationStore,
    store::RecordStore,
    types::{ConfigRecord, RefreshLease, RequesterContext, ServiceConfig, StorageCost, Usage},
};

/// Maximum outstanding per-record revocation lookups during usage
/// aggregation. Each batch drains fully before the next is issued.
pub const USAGE_MAX_CONCURRENCY: usize = 100;

/// CRUD over configuration records for one service type.
///
/// Owns a process-local record cache; see the module docs for the staleness
/// window that implies. Cheap to share via [`Arc`].
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use servicekit_registry::{
///     CacheConfig, ConfigStore, MemoryRecordStore, MemoryRevocationStore, ServiceConfig,
///     StorageCost,
/// };
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let store = ConfigStore::new(
///     "example-service",
///     Arc::new(MemoryRecordStore::new()),
///     Arc::new(MemoryRevocationStore::new()),
///     StorageCost::default(),
///     CacheConfig::default(),
/// );
///
/// let config = ServiceConfig::builder()
///     .id("https://registry.example.com/objects/z1")
///     .controller("did:example:alice")
///     .sequence(0)
///     .meter_id("https://meters.example.com/m1")
///     .build();
/// let record = store.insert(config).await.unwrap();
/// assert_eq!(record.config.sequence, 0);
/// # });
/// ```
pub struct ConfigStore {
    service_type: String,
    store: Arc<dyn RecordStore>,
    revocations: Arc<dyn RevocationStore>,
    storage_cost: StorageCost,
    cache: RecordCache,
}

impl ConfigStore {
    /// Creates a store for `service_type` over the given backend.
    #[must_use]
    pub fn new(
        service_type: impl Into<String>,
        store: Arc<dyn RecordStore>,
        revocations: Arc<dyn RevocationStore>,
        storage_cost: StorageCost,
        cache_config: CacheConfig,
    ) -> Self {
        Self {
            service_type: service_type.into(),
            store,
            revocations,
            storage_cost,
            cache: RecordCache::new(cache_config),
        }
    }

    /// The service type this store was created for.
    #[must_use]
    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    /// The backing record store.
    #[must_use]
    pub fn record_store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Establishes a new service object by inserting its configuration.
    ///
    /// The configuration must carry `sequence == 0` and non-empty `id`,
    /// `controller`, and `meter_id`. Writes `meta.created = meta.updated =
    /// now` and the default, immediately eligible refresh lease.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Validation`] for malformed input and
    /// [`RegistryError::Duplicate`] when the id already exists.
    #[tracing::instrument(skip_all, fields(service_type = %self.service_type, id = %config.id))]
    pub async fn insert(&self, config: ServiceConfig) -> RegistryResult<ConfigRecord> {
        config.validate()?;
        if config.sequence != 0 {
            return Err(RegistryError::validation("Configuration sequence must be \"0\"."));
        }

        let now = chrono::Utc::now();
        let record = ConfigRecord { config, meta: crate::types::RecordMeta::new(now) };
        self.store.insert(&record).await?;
        tracing::debug!("configuration inserted");
        Ok(record)
    }

    /// Gets a configuration record, served through the owned cache.
    ///
    /// Concurrent callers for the same uncached id share one backing-store
    /// read. When `requester` is given and the record carries an IP
    /// allow-list, the requester's source addresses are checked against it.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] when no record exists and
    /// [`RegistryError::Permission`] when the requester fails the IP
    /// allow-list check.
    #[tracing::instrument(skip_all, fields(service_type = %self.service_type, id))]
    pub async fn get(
        &self,
        id: &str,
        requester: Option<&RequesterContext>,
    ) -> RegistryResult<Arc<ConfigRecord>> {
        let record = self
            .cache
            .memoize(id, || async {
                fail_point!("config-store-before-read", |_| {
                    Err(RegistryError::store("injected failure before record read"))
                });
                self.store.get(id).await?.ok_or_else(|| RegistryError::not_found(id))
            })
            .await?;

        if let Some(requester) = requester
            && !record.config.ip_allowed(requester)
        {
            return Err(RegistryError::ip_not_allowed());
        }

        Ok(record)
    }

    /// Updates a configuration if its sequence number is next.
    ///
    /// The stored sequence must equal `config.sequence - 1`; the check and
    /// the write are one compare-and-swap in the backing store. On success
    /// the cache entry for the id is invalidated, `meta.updated` is set to
    /// now, and `lease` is persisted when supplied — otherwise the default
    /// eligible lease is restored. Returns the stored record.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Conflict`] when the sequence is stale *or*
    /// the record does not exist — one error for both cases, so callers
    /// cannot probe for record existence through the update path.
    #[tracing::instrument(
        skip_all,
        fields(service_type = %self.service_type, id = %config.id, sequence = config.sequence)
    )]
    pub async fn update(
        &self,
        config: ServiceConfig,
        lease: Option<RefreshLease>,
    ) -> RegistryResult<ConfigRecord> {
        config.validate()?;

        let now = chrono::Utc::now();
        let refresh = lease.unwrap_or_default();
        let record = self.store.update(&config, refresh, now).await?;

        self.cache.invalidate(&config.id).await;
        tracing::debug!("configuration updated");
        Ok(record)
    }

    /// Lists the configuration records for a controller.
    ///
    /// When `requester` is given, records failing the IP allow-list check are
    /// silently filtered out — the caller cannot distinguish "filtered" from
    /// "absent", so the list path never leaks allow-list contents. (The
    /// single-record [`get`](Self::get) path denies outright instead; the
    /// asymmetry is deliberate.)
    #[tracing::instrument(skip_all, fields(service_type = %self.service_type, controller))]
    pub async fn find(
        &self,
        controller: &str,
        requester: Option<&RequesterContext>,
    ) -> RegistryResult<Vec<ConfigRecord>> {
        let records = self.store.find_by_controller(controller).await?;
        let Some(requester) = requester else {
            return Ok(records);
        };
        Ok(records.into_iter().filter(|record| record.config.ip_allowed(requester)).collect())
    }

    /// Computes storage usage for a metering account.
    ///
    /// Sums a fixed cost per configuration record plus the revocation count
    /// stored under each record times the revocation cost. At most
    /// [`USAGE_MAX_CONCURRENCY`] revocation lookups are outstanding at once;
    /// each batch drains before the next is issued.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Aborted`] if `cancel` fires between batches.
    #[tracing::instrument(skip_all, fields(service_type = %self.service_type, meter_id))]
    pub async fn get_usage(
        &self,
        meter_id: &str,
        cancel: Option<&CancellationToken>,
    ) -> RegistryResult<Usage> {
        let records = self.store.find_by_meter(meter_id).await?;

        let mut usage = Usage::default();
        for chunk in records.chunks(USAGE_MAX_CONCURRENCY) {
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                tracing::debug!(meter_id, "usage aggregation aborted");
                return Err(RegistryError::aborted());
            }

            let counts = futures::future::try_join_all(
                chunk.iter().map(|record| self.revocations.count(&record.config.id)),
            )
            .await?;

            usage.storage += chunk.len() as u64 * self.storage_cost.config;
            usage.storage +=
                counts.iter().sum::<u64>() * self.storage_cost.revocation;
        }

        Ok(usage)
    }
}

impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore")
            .field("service_type", &self.service_type)
            .field("storage_cost", &self.storage_cost)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::{memory::MemoryRecordStore, revocation::MemoryRevocationStore};

    fn store() -> ConfigStore {
        ConfigStore::new(
            "test-service",
            Arc::new(MemoryRecordStore::new()),
            Arc::new(MemoryRevocationStore::new()),
            StorageCost::default(),
            CacheConfig::default(),
        )
    }

    fn config(id: &str, sequence: u64) -> ServiceConfig {
        ServiceConfig::builder()
            .id(id)
            .controller("did:example:alice")
            .sequence(sequence)
            .meter_id("https://meters.example.com/m1")
            .build()
    }

    #[tokio::test]
    async fn insert_requires_sequence_zero() {
        let store = store();
        let err = store.insert(config("a", 1)).await.unwrap_err();
        assert!(matches!(err, RegistryError::Validation { .. }));
        assert_eq!(err.to_string(), "Configuration sequence must be \"0\".");
    }

    #[tokio::test]
    async fn insert_sets_default_lease() {
        let store = store();
        let record = store.insert(config("a", 0)).await.unwrap();
        assert!(record.meta.refresh.enabled);
        assert_eq!(record.meta.created, record.meta.updated);
        assert!(record.meta.refresh.is_due(chrono::Utc::now()));
    }

    #[tokio::test]
    async fn get_unknown_id_is_not_found() {
        let store = store();
        let err = store.get("ghost", None).await.unwrap_err();
        assert!(matches!(err, RegistryError::NotFound { .. }));
    }

    #[tokio::test]
    async fn update_resets_lease_unless_given() {
        let store = store();
        store.insert(config("a", 0)).await.unwrap();

        let updated = store.update(config("a", 1), None).await.unwrap();
        assert!(updated.meta.refresh.is_due(chrono::Utc::now()));

        let lease = RefreshLease::disabled();
        let updated = store.update(config("a", 2), Some(lease)).await.unwrap();
        assert_eq!(updated.meta.refresh, lease);
    }

    #[tokio::test]
    async fn usage_sums_config_and_revocation_costs() {
        let record_store = Arc::new(MemoryRecordStore::new());
        let revocations = Arc::new(MemoryRevocationStore::new());
        let store = ConfigStore::new(
            "test-service",
            record_store,
            Arc::clone(&revocations) as Arc<dyn RevocationStore>,
            StorageCost { config: 2, revocation: 3 },
            CacheConfig::default(),
        );

        store.insert(config("a", 0)).await.unwrap();
        store.insert(config("b", 0)).await.unwrap();

        revocations
            .insert(&crate::revocation::Revocation {
                capability_id: "urn:zcap:z1".into(),
                delegator: "did:example:bob".into(),
                root_target: "a".into(),
            })
            .await
            .unwrap();

        let usage = store.get_usage("https://meters.example.com/m1", None).await.unwrap();
        // 2 configs * 2 units + 1 revocation * 3 units
        assert_eq!(usage.storage, 7);
    }

    #[tokio::test]
    async fn usage_aborts_when_cancelled() {
        let store = store();
        store.insert(config("a", 0)).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = store
            .get_usage("https://meters.example.com/m1", Some(&cancel))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Aborted));
    }

    #[tokio::test]
    async fn usage_for_unknown_meter_is_zero() {
        let store = store();
        let usage = store.get_usage("nobody", None).await.unwrap();
        assert_eq!(usage.storage, 0);
    }
}
