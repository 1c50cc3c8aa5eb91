//! # Servicekit Registry
//!
//! Control-plane storage for multi-tenant service object registries.
//!
//! This crate provides:
//! - **Config store**: CRUD over per-object configuration records with
//!   optimistic concurrency and an owned read-through cache
//! - **Refresher**: background loop claiming and refreshing eligible
//!   records, coordinated across processes through an on-record lease
//! - **Revocation and metering seams**: the collaborator traits the
//!   authorization and billing paths are written against
//!
//! ## Concurrency Model
//!
//! Every record carries a monotonic `sequence`; updates are accepted only
//! through a compare-and-swap keyed on `id + sequence - 1`, linearizing
//! writes per config id across any number of worker processes sharing one
//! backing store. The refresh lease reuses the same discipline, so no
//! external lock service is needed anywhere.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use servicekit_registry::{
//!     CacheConfig, ConfigStore, MemoryRecordStore, MemoryRevocationStore, ServiceConfig,
//!     StorageCost,
//! };
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let store = ConfigStore::new(
//!     "example-service",
//!     Arc::new(MemoryRecordStore::new()),
//!     Arc::new(MemoryRevocationStore::new()),
//!     StorageCost::default(),
//!     CacheConfig::default(),
//! );
//!
//! let config = ServiceConfig::builder()
//!     .id("https://registry.example.com/objects/z1")
//!     .controller("did:example:alice")
//!     .sequence(0)
//!     .meter_id("https://meters.example.com/m1")
//!     .build();
//! store.insert(config).await.unwrap();
//!
//! let record = store.get("https://registry.example.com/objects/z1", None).await.unwrap();
//! assert_eq!(record.config.controller, "did:example:alice");
//! # });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Read-through record cache.
pub mod cache;
/// Configuration record CRUD and usage totals.
pub mod config_store;
/// Registry error types.
pub mod error;
/// Local id generation.
pub mod ids;
/// In-memory record store.
pub mod memory;
/// Metering collaborator seam.
pub mod meter;
/// Background record refresher.
pub mod refresher;
/// Capability revocation storage.
pub mod revocation;
/// Backing-store trait.
pub mod store;
/// Record and lease types.
pub mod types;

/// Shared test utilities (feature `testutil`).
#[cfg(feature = "testutil")]
pub mod testutil;

// Re-export key types for convenience
pub use cache::{CacheConfig, DEFAULT_CACHE_MAX_ENTRIES, DEFAULT_CACHE_TTL};
pub use config_store::{ConfigStore, USAGE_MAX_CONCURRENCY};
pub use error::{BoxError, RegistryError, RegistryResult};
pub use ids::generate_local_id;
pub use memory::MemoryRecordStore;
pub use meter::{Meter, MeterReporter, MeterResources, report_operation_usage};
pub use refresher::{RefreshHandler, Refresher, RefresherConfig};
pub use revocation::{ChainPair, MemoryRevocationStore, Revocation, RevocationStore};
pub use store::RecordStore;
pub use types::{
    AuthorizationOptions, ConfigRecord, LeaseClaim, OAuth2Options, RecordMeta, RefreshLease,
    RequesterContext, ServiceConfig, StorageCost, Usage,
};
