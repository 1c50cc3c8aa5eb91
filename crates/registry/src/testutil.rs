//! Shared test utilities for registry testing.
//!
//! Record builders and instrumented [`RecordStore`] wrappers used across
//! unit and integration tests. Feature-gated behind `testutil` to prevent
//! leaking into production builds.
//!
//! # Usage
//!
//! In integration tests, enable the feature in `Cargo.toml`:
//!
//! ```toml
//! [dev-dependencies]
//! servicekit-registry = { path = "../registry", features = ["testutil"] }
//! ```

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::{
    error::{RegistryError, RegistryResult},
    memory::MemoryRecordStore,
    store::RecordStore,
    types::{ConfigRecord, LeaseClaim, RecordMeta, RefreshLease, ServiceConfig},
};

/// Builds a minimal valid configuration with the given id.
///
/// Controller and meter id are fixed test values; sequence is 0.
#[must_use]
pub fn sample_config(id: &str) -> ServiceConfig {
    ServiceConfig::builder()
        .id(id)
        .controller("did:example:alice")
        .sequence(0)
        .meter_id("https://meters.example.com/m1")
        .build()
}

/// Builds a record around [`sample_config`] with freshly stamped metadata.
#[must_use]
pub fn sample_record(id: &str) -> ConfigRecord {
    ConfigRecord { config: sample_config(id), meta: RecordMeta::new(Utc::now()) }
}

/// [`RecordStore`] wrapper that counts backing reads.
///
/// Used to assert the single-flight property: N coalesced `get` calls must
/// produce exactly one backing read.
pub struct CountingRecordStore {
    inner: MemoryRecordStore,
    gets: AtomicU64,
}

impl CountingRecordStore {
    /// Wraps a fresh in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self { inner: MemoryRecordStore::new(), gets: AtomicU64::new(0) }
    }

    /// Number of `get` calls that reached the backing store.
    #[must_use]
    pub fn get_count(&self) -> u64 {
        self.gets.load(Ordering::SeqCst)
    }

    /// The wrapped in-memory store, for direct seeding and out-of-band
    /// writes.
    #[must_use]
    pub fn inner(&self) -> &MemoryRecordStore {
        &self.inner
    }
}

impl Default for CountingRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for CountingRecordStore {
    async fn insert(&self, record: &ConfigRecord) -> RegistryResult<()> {
        self.inner.insert(record).await
    }

    async fn get(&self, id: &str) -> RegistryResult<Option<ConfigRecord>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get(id).await
    }

    async fn find_by_controller(&self, controller: &str) -> RegistryResult<Vec<ConfigRecord>> {
        self.inner.find_by_controller(controller).await
    }

    async fn find_by_meter(&self, meter_id: &str) -> RegistryResult<Vec<ConfigRecord>> {
        self.inner.find_by_meter(meter_id).await
    }

    async fn update(
        &self,
        config: &ServiceConfig,
        refresh: RefreshLease,
        updated: DateTime<Utc>,
    ) -> RegistryResult<ConfigRecord> {
        self.inner.update(config, refresh, updated).await
    }

    async fn find_refreshable(&self, now: DateTime<Utc>) -> RegistryResult<Option<ConfigRecord>> {
        self.inner.find_refreshable(now).await
    }

    async fn claim_refresh(&self, claim: &LeaseClaim, now: DateTime<Utc>) -> RegistryResult<bool> {
        self.inner.claim_refresh(claim, now).await
    }
}

/// [`RecordStore`] wrapper with switchable error injection.
///
/// While a failure is armed, every operation returns a clone of it; the
/// wrapped store is untouched. Used to exercise the "store errors are
/// benign no-ops" paths in the refresher and usage aggregation.
pub struct FlakyRecordStore {
    inner: Arc<MemoryRecordStore>,
    fail_with: Mutex<Option<RegistryError>>,
}

impl FlakyRecordStore {
    /// Wraps a fresh in-memory store with no failure armed.
    #[must_use]
    pub fn new() -> Self {
        Self { inner: Arc::new(MemoryRecordStore::new()), fail_with: Mutex::new(None) }
    }

    /// Arms (`Some`) or disarms (`None`) the injected failure.
    pub fn set_failure(&self, error: Option<RegistryError>) {
        *self.fail_with.lock() = error;
    }

    /// The wrapped in-memory store, for seeding while a failure is armed.
    #[must_use]
    pub fn inner(&self) -> &Arc<MemoryRecordStore> {
        &self.inner
    }

    fn check(&self) -> RegistryResult<()> {
        if let Some(error) = self.fail_with.lock().clone() {
            return Err(error);
        }
        Ok(())
    }
}

impl Default for FlakyRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for FlakyRecordStore {
    async fn insert(&self, record: &ConfigRecord) -> RegistryResult<()> {
        self.check()?;
        self.inner.insert(record).await
    }

    async fn get(&self, id: &str) -> RegistryResult<Option<ConfigRecord>> {
        self.check()?;
        self.inner.get(id).await
    }

    async fn find_by_controller(&self, controller: &str) -> RegistryResult<Vec<ConfigRecord>> {
        self.check()?;
        self.inner.find_by_controller(controller).await
    }

    async fn find_by_meter(&self, meter_id: &str) -> RegistryResult<Vec<ConfigRecord>> {
        self.check()?;
        self.inner.find_by_meter(meter_id).await
    }

    async fn update(
        &self,
        config: &ServiceConfig,
        refresh: RefreshLease,
        updated: DateTime<Utc>,
    ) -> RegistryResult<ConfigRecord> {
        self.check()?;
        self.inner.update(config, refresh, updated).await
    }

    async fn find_refreshable(&self, now: DateTime<Utc>) -> RegistryResult<Option<ConfigRecord>> {
        self.check()?;
        self.inner.find_refreshable(now).await
    }

    async fn claim_refresh(&self, claim: &LeaseClaim, now: DateTime<Utc>) -> RegistryResult<bool> {
        self.check()?;
        self.inner.claim_refresh(claim, now).await
    }
}

/// Asserts that a result is an `Err` matching the given [`RegistryError`]
/// variant.
///
/// # Examples
///
/// ```no_run
/// // Requires the `testutil` feature to be enabled.
/// use servicekit_registry::{RegistryError, assert_registry_error};
///
/// let result: Result<(), RegistryError> = Err(RegistryError::conflict());
/// assert_registry_error!(result, Conflict);
/// ```
#[macro_export]
macro_rules! assert_registry_error {
    ($result:expr, $variant:ident) => {
        assert!(
            matches!(&$result, Err($crate::RegistryError::$variant { .. })),
            "expected RegistryError::{}, got: {:?}",
            stringify!($variant),
            $result,
        );
    };
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counting_store_counts_backing_reads() {
        let store = CountingRecordStore::new();
        store.insert(&sample_record("a")).await.unwrap();

        let _ = store.get("a").await.unwrap();
        let _ = store.get("a").await.unwrap();
        assert_eq!(store.get_count(), 2);
    }

    #[tokio::test]
    async fn flaky_store_injects_and_recovers() {
        let store = FlakyRecordStore::new();
        store.insert(&sample_record("a")).await.unwrap();

        store.set_failure(Some(RegistryError::store("injected")));
        let result = store.get("a").await;
        assert_registry_error!(result, Store);

        store.set_failure(None);
        assert!(store.get("a").await.unwrap().is_some());
    }
}
