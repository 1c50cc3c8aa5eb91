//! In-memory record store implementation.
//!
//! This module provides [`MemoryRecordStore`], an in-memory implementation of
//! [`RecordStore`] suitable for testing and development.
//!
//! # Features
//!
//! - **Thread-safe**: Uses [`parking_lot::RwLock`] for concurrent access
//! - **Ordered storage**: Records live in a [`BTreeMap`] keyed by config id
//! - **Real CAS semantics**: Both conditional writes check and mutate under
//!   one write lock, matching the atomicity a production store provides
//!
//! # Limitations
//!
//! - Data is not persisted; everything is lost when the process exits
//! - Secondary lookups scan the map rather than using indexes

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::{
    error::{RegistryError, RegistryResult},
    store::RecordStore,
    types::{ConfigRecord, LeaseClaim, RefreshLease, ServiceConfig},
};

/// In-memory record store backed by a [`BTreeMap`].
///
/// Primarily intended for tests; also usable for development deployments
/// where persistence is not required.
///
/// # Cloning
///
/// `MemoryRecordStore` is cheaply cloneable via [`Arc`]. All clones share
/// the same underlying map, so a clone handed to a background task observes
/// the same records.
#[derive(Clone, Default)]
pub struct MemoryRecordStore {
    records: Arc<RwLock<BTreeMap<String, ConfigRecord>>>,
}

impl MemoryRecordStore {
    /// Creates a new, empty in-memory record store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether the store holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl std::fmt::Debug for MemoryRecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRecordStore").field("records", &self.len()).finish()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn insert(&self, record: &ConfigRecord) -> RegistryResult<()> {
        let mut records = self.records.write();
        if records.contains_key(&record.config.id) {
            return Err(RegistryError::duplicate(&record.config.id));
        }
        records.insert(record.config.id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> RegistryResult<Option<ConfigRecord>> {
        Ok(self.records.read().get(id).cloned())
    }

    async fn find_by_controller(&self, controller: &str) -> RegistryResult<Vec<ConfigRecord>> {
        Ok(self
            .records
            .read()
            .values()
            .filter(|record| record.config.controller == controller)
            .cloned()
            .collect())
    }

    async fn find_by_meter(&self, meter_id: &str) -> RegistryResult<Vec<ConfigRecord>> {
        Ok(self
            .records
            .read()
            .values()
            .filter(|record| record.config.meter_id == meter_id)
            .cloned()
            .collect())
    }

    async fn update(
        &self,
        config: &ServiceConfig,
        refresh: RefreshLease,
        updated: DateTime<Utc>,
    ) -> RegistryResult<ConfigRecord> {
        // A submitted sequence of 0 can never match a stored sequence of -1,
        // so it conflicts rather than underflowing.
        let Some(expected_sequence) = config.sequence.checked_sub(1) else {
            return Err(RegistryError::conflict());
        };

        let mut records = self.records.write();
        match records.get_mut(&config.id) {
            Some(record) if record.config.sequence == expected_sequence => {
                record.config = config.clone();
                record.meta.updated = updated;
                record.meta.refresh = refresh;
                Ok(record.clone())
            }
            _ => Err(RegistryError::conflict()),
        }
    }

    async fn find_refreshable(&self, now: DateTime<Utc>) -> RegistryResult<Option<ConfigRecord>> {
        Ok(self
            .records
            .read()
            .values()
            .find(|record| record.meta.refresh.is_due(now))
            .cloned())
    }

    async fn claim_refresh(&self, claim: &LeaseClaim, now: DateTime<Utc>) -> RegistryResult<bool> {
        let mut records = self.records.write();
        match records.get_mut(&claim.id) {
            Some(record)
                if record.config.sequence == claim.sequence
                    && record.meta.refresh.after == claim.previous_after =>
            {
                record.meta.refresh.after = claim.next_after;
                record.meta.updated = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
