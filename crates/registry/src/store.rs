//! Backing-store trait definition.
//!
//! This module defines [`RecordStore`], the abstraction over the shared
//! document store that holds configuration records. All implementations
//! (in-memory, production database bindings) implement this trait; the
//! [`ConfigStore`](crate::config_store::ConfigStore) and
//! [`Refresher`](crate::refresher::Refresher) are written against it.
//!
//! # Design Philosophy
//!
//! The trait is a domain seam, not a byte-level key-value interface: every
//! conditional write the registry performs is expressed as one atomic store
//! operation, because the optimistic concurrency rules (sequence
//! compare-and-swap, lease claims) must hold across independent worker
//! processes sharing one backing store.
//!
//! # Index Expectations
//!
//! A production implementation needs:
//!
//! - a unique index on `config.id` (drives [`insert`](RecordStore::insert)
//!   duplicate detection),
//! - secondary lookups on `config.controller` and `config.meterId`,
//! - a compound index over `(meta.refresh.enabled, meta.refresh.after)` for
//!   the refresher's due-record scan.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    error::RegistryResult,
    types::{ConfigRecord, LeaseClaim, RefreshLease, ServiceConfig},
};

/// Abstract store for configuration records.
///
/// Implementations must be thread-safe (`Send + Sync`) and provide atomic
/// single-record conditional updates; both CAS operations below must observe
/// and mutate the record in one step. Multiple worker processes may share one
/// backing store, so in-process locking alone is not sufficient for a
/// production implementation.
///
/// # Example
///
/// ```
/// use servicekit_registry::{MemoryRecordStore, RecordStore, RecordMeta, ServiceConfig, ConfigRecord};
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let store = MemoryRecordStore::new();
/// let config = ServiceConfig::builder()
///     .id("https://registry.example.com/objects/z1")
///     .controller("did:example:alice")
///     .sequence(0)
///     .meter_id("https://meters.example.com/m1")
///     .build();
/// let record = ConfigRecord { config, meta: RecordMeta::new(chrono::Utc::now()) };
///
/// store.insert(&record).await.unwrap();
/// let found = store.get(&record.config.id).await.unwrap();
/// assert_eq!(found, Some(record));
/// # });
/// ```
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Inserts a new record.
    ///
    /// # Errors
    ///
    /// Returns [`Duplicate`](crate::RegistryError::Duplicate) if a record
    /// with the same `config.id` already exists, or
    /// [`Store`](crate::RegistryError::Store) on backend failure.
    #[must_use = "store operations may fail and errors must be handled"]
    async fn insert(&self, record: &ConfigRecord) -> RegistryResult<()>;

    /// Retrieves a record by config id.
    ///
    /// Returns `Ok(None)` when no record exists; absence is not an error at
    /// this layer.
    #[must_use = "store operations may fail and errors must be handled"]
    async fn get(&self, id: &str) -> RegistryResult<Option<ConfigRecord>>;

    /// Lists all records whose `config.controller` matches.
    #[must_use = "store operations may fail and errors must be handled"]
    async fn find_by_controller(&self, controller: &str) -> RegistryResult<Vec<ConfigRecord>>;

    /// Lists all records whose `config.meterId` matches.
    ///
    /// Implementations may page internally; callers receive the full set.
    #[must_use = "store operations may fail and errors must be handled"]
    async fn find_by_meter(&self, meter_id: &str) -> RegistryResult<Vec<ConfigRecord>>;

    /// Replaces a record's configuration, conditioned on the stored sequence
    /// being exactly `config.sequence - 1`.
    ///
    /// On success the stored record carries the new `config`, the given
    /// `refresh` lease, and `meta.updated = updated`; `meta.created` is
    /// preserved. The condition and the write are one atomic step. Returns
    /// the record as stored after the write.
    ///
    /// # Errors
    ///
    /// Returns [`Conflict`](crate::RegistryError::Conflict) when no record
    /// matches the id + previous-sequence condition — deliberately the same
    /// error for "record missing" and "sequence stale."
    #[must_use = "store operations may fail and errors must be handled"]
    async fn update(
        &self,
        config: &ServiceConfig,
        refresh: RefreshLease,
        updated: DateTime<Utc>,
    ) -> RegistryResult<ConfigRecord>;

    /// Finds one record due for refresh: `refresh.enabled == true` and
    /// `refresh.after < now`.
    ///
    /// Which due record is returned is unspecified; competing processes
    /// resolve contention through [`claim_refresh`](Self::claim_refresh).
    #[must_use = "store operations may fail and errors must be handled"]
    async fn find_refreshable(&self, now: DateTime<Utc>) -> RegistryResult<Option<ConfigRecord>>;

    /// Attempts to claim a record's refresh lease.
    ///
    /// Atomically sets `meta.refresh.after = claim.next_after` and
    /// `meta.updated = now`, conditioned on the record still holding
    /// `claim.sequence` and `claim.previous_after`. Returns `true` only if
    /// the record was updated; a `false` return means another process won
    /// the race or the record changed, which callers treat as a no-op.
    #[must_use = "a lost claim must be treated as a no-op, not an error"]
    async fn claim_refresh(&self, claim: &LeaseClaim, now: DateTime<Utc>) -> RegistryResult<bool>;
}
