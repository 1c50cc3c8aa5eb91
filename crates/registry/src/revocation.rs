//! Capability revocation storage.
//!
//! Revocations are stored per root target (the config id whose delegation
//! tree they belong to) and looked up in two ways: the authorization path
//! asks whether any `{capabilityId, delegator}` pair from a verified
//! delegation chain has been revoked, and the usage path counts the
//! revocations billed against a record.

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::RegistryResult;

/// One link of a verified delegation chain, used only as a revocation
/// lookup key. The root capability never appears here — roots cannot be
/// revoked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainPair {
    /// Id of the delegated capability.
    pub capability_id: String,

    /// Entity that delegated it.
    pub delegator: String,
}

/// A stored revocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Revocation {
    /// Id of the revoked capability.
    pub capability_id: String,

    /// Entity that delegated the revoked capability.
    pub delegator: String,

    /// Root invocation target (config id) the capability descends from;
    /// revocation storage bills against this record.
    pub root_target: String,
}

/// Abstract store for capability revocations.
///
/// Implementations must be thread-safe; multiple worker processes may share
/// one backing store.
#[async_trait]
pub trait RevocationStore: Send + Sync {
    /// Whether any of the given chain pairs has been revoked. An empty
    /// slice is never revoked.
    #[must_use = "store operations may fail and errors must be handled"]
    async fn is_revoked(&self, capabilities: &[ChainPair]) -> RegistryResult<bool>;

    /// Stores a revocation. Idempotent by capability id: re-revoking an
    /// already-revoked capability succeeds without duplicating storage.
    #[must_use = "store operations may fail and errors must be handled"]
    async fn insert(&self, revocation: &Revocation) -> RegistryResult<()>;

    /// Number of revocations stored under the given root target.
    #[must_use = "store operations may fail and errors must be handled"]
    async fn count(&self, root_target: &str) -> RegistryResult<u64>;
}

/// In-memory revocation store backed by a [`BTreeMap`] keyed by capability
/// id. Intended for tests and development.
#[derive(Clone, Default)]
pub struct MemoryRevocationStore {
    revocations: Arc<RwLock<BTreeMap<String, Revocation>>>,
}

impl MemoryRevocationStore {
    /// Creates a new, empty in-memory revocation store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored revocations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.revocations.read().len()
    }

    /// Whether the store holds no revocations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.revocations.read().is_empty()
    }
}

impl std::fmt::Debug for MemoryRevocationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRevocationStore").field("revocations", &self.len()).finish()
    }
}

#[async_trait]
impl RevocationStore for MemoryRevocationStore {
    async fn is_revoked(&self, capabilities: &[ChainPair]) -> RegistryResult<bool> {
        let revocations = self.revocations.read();
        Ok(capabilities.iter().any(|pair| {
            revocations
                .get(&pair.capability_id)
                .is_some_and(|revocation| revocation.delegator == pair.delegator)
        }))
    }

    async fn insert(&self, revocation: &Revocation) -> RegistryResult<()> {
        self.revocations.write().insert(revocation.capability_id.clone(), revocation.clone());
        Ok(())
    }

    async fn count(&self, root_target: &str) -> RegistryResult<u64> {
        Ok(self
            .revocations
            .read()
            .values()
            .filter(|revocation| revocation.root_target == root_target)
            .count() as u64)
    }
}
