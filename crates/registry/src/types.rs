//! Configuration record types.
//!
//! This module defines the unit of storage — [`ConfigRecord`] — and the
//! supporting types shared by the store, cache, and refresher. Wire casing
//! follows the service JSON contract (`meterId`, `ipAllowList`,
//! `issuerConfigUrl`; timestamps as milliseconds since the Unix epoch), so
//! collaborator HTTP layers can serialize records directly.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{RegistryError, RegistryResult};

/// The configuration for one service object instance.
///
/// `id` is globally unique and immutable after creation. `sequence` starts at
/// 0 and increments by exactly 1 on every accepted update; it is the key of
/// the optimistic concurrency check. Service-specific properties round-trip
/// through [`extra`](Self::extra).
///
/// # Examples
///
/// ```
/// use servicekit_registry::ServiceConfig;
///
/// let config = ServiceConfig::builder()
///     .id("https://registry.example.com/objects/z123")
///     .controller("did:example:controller")
///     .sequence(0)
///     .meter_id("https://meters.example.com/m1")
///     .build();
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, bon::Builder, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    /// Globally unique record id (typically the object's URL).
    #[builder(into)]
    pub id: String,

    /// Entity that controls this object (the capability root controller).
    #[builder(into)]
    pub controller: String,

    /// Monotonic version counter; 0 on insert, +1 per accepted update.
    pub sequence: u64,

    /// Metering account this object bills against.
    #[builder(into)]
    pub meter_id: String,

    /// CIDR blocks permitted to read this object. Absent or empty means
    /// unrestricted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_allow_list: Option<Vec<IpNet>>,

    /// Optional per-object authorization settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization: Option<AuthorizationOptions>,

    /// Service-specific configuration properties, preserved verbatim.
    #[builder(default)]
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ServiceConfig {
    /// Validates the fields every configuration must carry.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Validation`] if `id`, `controller`, or
    /// `meter_id` is empty.
    pub fn validate(&self) -> RegistryResult<()> {
        if self.id.is_empty() {
            return Err(RegistryError::validation("Configuration \"id\" is required."));
        }
        if self.controller.is_empty() {
            return Err(RegistryError::validation("Configuration \"controller\" is required."));
        }
        if self.meter_id.is_empty() {
            return Err(RegistryError::validation("Configuration \"meterId\" is required."));
        }
        Ok(())
    }

    /// Whether the requester passes this configuration's IP allow-list.
    ///
    /// An absent or empty allow-list always passes; otherwise at least one of
    /// the requester's source addresses must fall inside one of the allowed
    /// CIDR blocks.
    #[must_use]
    pub fn ip_allowed(&self, requester: &RequesterContext) -> bool {
        let Some(allow_list) = self.ip_allow_list.as_deref() else {
            return true;
        };
        if allow_list.is_empty() {
            return true;
        }
        requester
            .source_addresses
            .iter()
            .any(|addr| allow_list.iter().any(|net| net.contains(addr)))
    }
}

/// Per-object authorization settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationOptions {
    /// OAuth2 access-token settings; absent means bearer tokens are not
    /// accepted for this object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth2: Option<OAuth2Options>,
}

/// OAuth2 settings for one service object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuth2Options {
    /// RFC 8414 authorization-server metadata URL for the trusted issuer.
    pub issuer_config_url: Url,
}

/// Refresh lease stored on the record itself.
///
/// `enabled == true` with `after` in the past marks the record due for
/// refresh. Claiming a due record pushes `after` forward by the isolate
/// timeout through the same compare-and-swap discipline config updates use,
/// so competing refresher processes need no external lock service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshLease {
    /// Whether this record participates in background refresh.
    pub enabled: bool,

    /// Earliest time the record is eligible for the next refresh.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub after: DateTime<Utc>,
}

impl RefreshLease {
    /// Lease eligible for immediate refresh.
    #[must_use]
    pub fn eligible_now() -> Self {
        Self { enabled: true, after: DateTime::<Utc>::UNIX_EPOCH }
    }

    /// Lease excluded from background refresh.
    #[must_use]
    pub fn disabled() -> Self {
        Self { enabled: false, after: DateTime::<Utc>::UNIX_EPOCH }
    }

    /// Lease eligible once `after` has passed.
    #[must_use]
    pub fn after(after: DateTime<Utc>) -> Self {
        Self { enabled: true, after }
    }

    /// Whether the record is due for refresh at `now`.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.after < now
    }
}

impl Default for RefreshLease {
    fn default() -> Self {
        Self::eligible_now()
    }
}

/// System-managed record metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMeta {
    /// Creation time, set once on insert.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created: DateTime<Utc>,

    /// Last successful write (insert, update, or lease claim).
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated: DateTime<Utc>,

    /// Background refresh lease.
    #[serde(default)]
    pub refresh: RefreshLease,
}

impl RecordMeta {
    /// Metadata for a freshly inserted record.
    #[must_use]
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { created: now, updated: now, refresh: RefreshLease::eligible_now() }
    }
}

/// The unit of storage: a configuration and its metadata.
///
/// Boundary layers serialize `config` alone in responses; `meta` stays
/// internal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigRecord {
    /// The service object configuration.
    pub config: ServiceConfig,

    /// System-managed metadata.
    pub meta: RecordMeta,
}

/// Request attributes the store needs for allow-list enforcement.
///
/// Carries every source address the transport attributes to the requester
/// (the client address plus any trusted proxy hops).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequesterContext {
    /// Source addresses, client first.
    pub source_addresses: Vec<IpAddr>,
}

impl RequesterContext {
    /// Creates a context from the given source addresses.
    #[must_use]
    pub fn from_addresses(source_addresses: impl IntoIterator<Item = IpAddr>) -> Self {
        Self { source_addresses: source_addresses.into_iter().collect() }
    }
}

/// Billable storage units per stored artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageCost {
    /// Units per configuration record.
    pub config: u64,

    /// Units per revocation stored under the record.
    pub revocation: u64,
}

impl Default for StorageCost {
    fn default() -> Self {
        Self { config: 1, revocation: 1 }
    }
}

/// Aggregated usage for one metering account.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Total storage units across the meter's records.
    pub storage: u64,
}

/// Compare-and-swap claim of a record's refresh lease.
///
/// The claim succeeds only if the stored record still carries this exact
/// `sequence` and `previous_after`; any concurrent config update or competing
/// claim makes it a no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseClaim {
    /// Target record id.
    pub id: String,

    /// Sequence the record must still hold.
    pub sequence: u64,

    /// Lease `after` value the record must still hold.
    pub previous_after: DateTime<Utc>,

    /// New `after` value establishing the isolation window.
    pub next_after: DateTime<Utc>,
}
