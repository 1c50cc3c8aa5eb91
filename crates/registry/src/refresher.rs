//! Background config record refresher.
//!
//! This module provides [`Refresher`], the per-process loop that lets
//! external owners periodically re-derive a config record. Competing
//! processes coordinate purely through the lease stored on the record
//! itself: claiming a due record is a compare-and-swap on the record's
//! `sequence` and previous `after` value, so no external lock service is
//! involved and a lost claim is an expected no-op.
//!
//! # Why claim-then-refresh
//!
//! The backing collection may be sharded by config id. A multi-record "mark
//! everything due" update cannot be issued efficiently without the shard
//! key, so the only efficient pattern under sharding is to grab one due
//! record and then try to mark it.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{
    error::RegistryResult,
    store::RecordStore,
    types::{ConfigRecord, LeaseClaim},
};

/// Default poll interval when no due record was found (5 minutes).
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(300);

/// Default upper bound on the random jitter added to the poll interval
/// (5 minutes). Jitter desynchronizes competing processes so they do not
/// race for the same record on every tick.
pub const DEFAULT_MAX_JITTER: Duration = Duration::from_secs(300);

/// Default isolation window a claim establishes (1 minute).
///
/// If a refresh handler crashes after its claim but before persisting an
/// update, the record stays isolated until this window elapses — an
/// accepted staleness bound.
pub const DEFAULT_ISOLATE_TIMEOUT: Duration = Duration::from_secs(60);

/// Tuning for a [`Refresher`] loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, bon::Builder, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RefresherConfig {
    /// Sleep between polls when nothing was refreshable.
    #[builder(default = DEFAULT_REFRESH_INTERVAL)]
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Upper bound on the random jitter added to each sleep.
    #[builder(default = DEFAULT_MAX_JITTER)]
    #[serde(with = "humantime_serde")]
    pub max_jitter: Duration,

    /// How far a successful claim pushes the record's `after` value.
    #[builder(default = DEFAULT_ISOLATE_TIMEOUT)]
    #[serde(with = "humantime_serde")]
    pub isolate_timeout: Duration,
}

impl Default for RefresherConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_REFRESH_INTERVAL,
            max_jitter: DEFAULT_MAX_JITTER,
            isolate_timeout: DEFAULT_ISOLATE_TIMEOUT,
        }
    }
}

/// Callback invoked with a successfully claimed record.
///
/// The handler alone is responsible for persisting any resulting update,
/// including re-arming or disabling the record's lease via
/// [`ConfigStore::update`](crate::config_store::ConfigStore::update) with an
/// explicit lease. The refresher never retries a failed handler; failures
/// are logged and scheduled like "nothing found this round".
#[async_trait]
pub trait RefreshHandler: Send + Sync {
    /// Refreshes one claimed record. The record carries the post-claim
    /// lease (`after` already pushed forward by the isolation window).
    async fn refresh(&self, record: ConfigRecord) -> RegistryResult<()>;
}

/// Continuously running claim-and-refresh loop. One instance per process.
///
/// Lifecycle is explicit: [`start`](Self::start) spawns the loop task and
/// [`shutdown`](Self::shutdown) cancels it and awaits clean termination.
pub struct Refresher {
    service_type: String,
    store: Arc<dyn RecordStore>,
    handler: Arc<dyn RefreshHandler>,
    config: RefresherConfig,
    cancel_token: CancellationToken,
    /// Wrapped in `Mutex` so `shutdown()` can take ownership via `&self`.
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Refresher {
    /// Creates a refresher over the given record store.
    #[must_use]
    pub fn new(
        service_type: impl Into<String>,
        store: Arc<dyn RecordStore>,
        handler: Arc<dyn RefreshHandler>,
        config: RefresherConfig,
    ) -> Self {
        Self {
            service_type: service_type.into(),
            store,
            handler,
            config,
            cancel_token: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Spawns the refresh loop. Calling `start` again while the loop is
    /// running is a no-op.
    ///
    /// # Panics
    ///
    /// Must be called within a Tokio runtime context.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }

        let service_type = self.service_type.clone();
        let store = Arc::clone(&self.store);
        let handler = Arc::clone(&self.handler);
        let config = self.config;
        let token = self.cancel_token.clone();

        *task = Some(tokio::spawn(async move {
            tracing::debug!(service_type, "config record refresher started");
            run_loop(&service_type, &store, &handler, config, &token).await;
            tracing::debug!(service_type, "config record refresher stopped");
        }));
    }

    /// Signals the loop to stop and awaits its termination.
    ///
    /// The cancellation is observed at sleep and iteration boundaries; an
    /// in-flight handler invocation completes first.
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task
            && let Err(err) = task.await
        {
            tracing::warn!(
                service_type = %self.service_type,
                error = %err,
                "refresher task panicked"
            );
        }
    }

    /// The cancellation token the loop observes, for wiring external
    /// shutdown signals.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }
}

impl std::fmt::Debug for Refresher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Refresher")
            .field("service_type", &self.service_type)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

async fn run_loop(
    service_type: &str,
    store: &Arc<dyn RecordStore>,
    handler: &Arc<dyn RefreshHandler>,
    config: RefresherConfig,
    token: &CancellationToken,
) {
    while !token.is_cancelled() {
        let refreshed = refresh_one(service_type, store, handler, config).await;
        if refreshed {
            // At least one due record existed; look for more immediately.
            continue;
        }

        let jitter_ms = if config.max_jitter.is_zero() {
            0
        } else {
            rand::thread_rng().gen_range(0..=config.max_jitter.as_millis() as u64)
        };
        let delay = config.interval + Duration::from_millis(jitter_ms);

        tokio::select! {
            () = token.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }
}

/// Attempts one claim-and-refresh round.
///
/// Returns `true` only when a record was claimed and its handler succeeded.
/// Lost claims, store errors, and handler failures all return `false` so
/// the loop sleeps before retrying — a store outage must not hard-loop.
async fn refresh_one(
    service_type: &str,
    store: &Arc<dyn RecordStore>,
    handler: &Arc<dyn RefreshHandler>,
    config: RefresherConfig,
) -> bool {
    let now = chrono::Utc::now();

    let record = match store.find_refreshable(now).await {
        Ok(Some(record)) => record,
        Ok(None) => return false,
        Err(err) => {
            tracing::error!(service_type, error = %err, "refreshable record scan failed");
            return false;
        }
    };

    let isolate = chrono::Duration::from_std(config.isolate_timeout)
        .unwrap_or(chrono::Duration::MAX);
    let claim = LeaseClaim {
        id: record.config.id.clone(),
        sequence: record.config.sequence,
        previous_after: record.meta.refresh.after,
        next_after: now + isolate,
    };

    match store.claim_refresh(&claim, now).await {
        Ok(true) => {}
        Ok(false) => {
            // Another process won the race or the record changed; expected.
            tracing::debug!(service_type, id = %claim.id, "lost refresh claim");
            return false;
        }
        Err(err) => {
            tracing::error!(service_type, id = %claim.id, error = %err, "refresh claim failed");
            return false;
        }
    }

    // Hand the handler the record as claimed: lease pushed forward, updated
    // stamp refreshed. The handler persists any resulting update itself.
    let mut claimed = record;
    claimed.meta.refresh.after = claim.next_after;
    claimed.meta.updated = now;
    let id = claimed.config.id.clone();

    if let Err(err) = handler.refresh(claimed).await {
        tracing::error!(service_type, id = %id, error = %err, "refresh handler failed");
        return false;
    }

    true
}
