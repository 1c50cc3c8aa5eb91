//! Metering collaborator seam.
//!
//! The registry itself never talks a metering wire protocol; it reports
//! through [`MeterReporter`], which the host binds to its metering
//! collector. [`report_operation_usage`] is the fire-and-forget helper
//! request handlers call after an authorized operation — it must never fail
//! or slow down the request path, so failures are logged and dropped.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RegistryResult;

/// A metering account as known to the metering collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meter {
    /// Meter id (typically a URL).
    pub id: String,

    /// Entity that controls the meter. Object-creation endpoints resolve
    /// this as the capability root controller.
    pub controller: String,

    /// Service type the meter is provisioned for.
    pub service_type: String,
}

/// Resources a prospective operation would consume, for availability
/// checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct MeterResources {
    /// Storage units the operation would add.
    pub storage: u64,

    /// Operation units the operation would consume.
    pub operations: u64,
}

/// Reporting and availability interface to the metering collaborator.
#[async_trait]
pub trait MeterReporter: Send + Sync {
    /// Reports consumed operation units against a meter.
    #[must_use = "metering operations may fail and errors must be handled"]
    async fn report_use(&self, id: &str, operations: u64) -> RegistryResult<()>;

    /// Creates or updates a meter registration.
    #[must_use = "metering operations may fail and errors must be handled"]
    async fn upsert(&self, meter: &Meter) -> RegistryResult<()>;

    /// Whether the meter has capacity for the given resources. Returns the
    /// meter record alongside the availability flag so callers can check the
    /// meter's controller without a second round-trip.
    #[must_use = "metering operations may fail and errors must be handled"]
    async fn has_available(
        &self,
        id: &str,
        service_type: &str,
        resources: MeterResources,
    ) -> RegistryResult<(Meter, bool)>;
}

/// Reports one or more operations against a meter without awaiting the
/// result.
///
/// Spawned onto the runtime; a reporting failure is logged with the meter
/// and config ids and otherwise ignored. Request handlers call this after
/// the operation has already been authorized and performed, so metering lag
/// must never surface to the client.
pub fn report_operation_usage(
    reporter: Arc<dyn MeterReporter>,
    meter_id: impl Into<String>,
    config_id: impl Into<String>,
    operations: u64,
) {
    let meter_id = meter_id.into();
    let config_id = config_id.into();
    tokio::spawn(async move {
        if let Err(err) = reporter.report_use(&meter_id, operations).await {
            tracing::error!(
                meter_id,
                config_id,
                error = %err,
                "meter usage reporting failed"
            );
        }
    });
}
