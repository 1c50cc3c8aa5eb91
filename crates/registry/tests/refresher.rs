//! Integration tests for the background refresher: lease exclusivity under
//! contention, full loop operation, and shutdown.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use servicekit_registry::{
    ConfigRecord, LeaseClaim, MemoryRecordStore, RecordStore, RefreshHandler, RefreshLease,
    Refresher, RefresherConfig, RegistryResult,
    testutil::{FlakyRecordStore, sample_record},
};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter("debug").with_test_writer().try_init();
}

fn due_record(id: &str) -> ConfigRecord {
    let mut record = sample_record(id);
    record.meta.refresh = RefreshLease::after(Utc::now() - chrono::Duration::minutes(1));
    record
}

/// Handler that records which ids it was invoked for and signals the first
/// invocation.
struct RecordingHandler {
    seen: Mutex<Vec<ConfigRecord>>,
    first: CancellationToken,
}

impl RecordingHandler {
    fn new() -> Self {
        Self { seen: Mutex::new(Vec::new()), first: CancellationToken::new() }
    }
}

#[async_trait]
impl RefreshHandler for RecordingHandler {
    async fn refresh(&self, record: ConfigRecord) -> RegistryResult<()> {
        self.seen.lock().push(record);
        self.first.cancel();
        Ok(())
    }
}

/// Handler that persists the refresh by bumping the sequence and disabling
/// further refresh, the way a real owner would re-derive and store state.
struct DisablingHandler {
    store: Arc<MemoryRecordStore>,
}

#[async_trait]
impl RefreshHandler for DisablingHandler {
    async fn refresh(&self, record: ConfigRecord) -> RegistryResult<()> {
        let mut config = record.config;
        config.sequence += 1;
        self.store.update(&config, RefreshLease::disabled(), Utc::now()).await?;
        Ok(())
    }
}

fn fast_config() -> RefresherConfig {
    RefresherConfig::builder()
        .interval(Duration::from_millis(5))
        .max_jitter(Duration::ZERO)
        .isolate_timeout(Duration::from_secs(60))
        .build()
}

#[tokio::test]
async fn loop_claims_due_record_and_invokes_handler() {
    init_tracing();
    let store = Arc::new(MemoryRecordStore::new());
    store.insert(&due_record("a")).await.unwrap();

    let handler = Arc::new(RecordingHandler::new());
    let refresher = Refresher::new(
        "test-service",
        Arc::clone(&store) as Arc<dyn RecordStore>,
        Arc::clone(&handler) as Arc<dyn RefreshHandler>,
        fast_config(),
    );

    refresher.start();
    tokio::time::timeout(Duration::from_secs(5), handler.first.cancelled())
        .await
        .expect("handler was never invoked");
    refresher.shutdown().await;

    let seen = handler.seen.lock();
    assert!(!seen.is_empty());
    assert_eq!(seen[0].config.id, "a");
    // The handler saw the post-claim lease, not the due one.
    assert!(seen[0].meta.refresh.after > Utc::now() - chrono::Duration::seconds(5));

    // The stored record is isolated until the window elapses.
    let stored = store.get("a").await.unwrap().unwrap();
    assert!(stored.meta.refresh.after > Utc::now());
}

#[tokio::test]
async fn handler_persisted_update_ends_the_refresh_cycle() {
    let store = Arc::new(MemoryRecordStore::new());
    store.insert(&due_record("a")).await.unwrap();

    let handler = Arc::new(DisablingHandler { store: Arc::clone(&store) });
    let refresher = Refresher::new(
        "test-service",
        Arc::clone(&store) as Arc<dyn RecordStore>,
        handler as Arc<dyn RefreshHandler>,
        fast_config(),
    );

    refresher.start();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let stored = store.get("a").await.unwrap().unwrap();
        if !stored.meta.refresh.enabled {
            assert_eq!(stored.config.sequence, 1);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "record was never refreshed");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    refresher.shutdown().await;
}

#[tokio::test]
async fn concurrent_claims_admit_exactly_one_winner() {
    let store = Arc::new(MemoryRecordStore::new());
    let record = due_record("a");
    store.insert(&record).await.unwrap();

    let now = Utc::now();
    let claim = LeaseClaim {
        id: record.config.id.clone(),
        sequence: record.config.sequence,
        previous_after: record.meta.refresh.after,
        next_after: now + chrono::Duration::minutes(1),
    };

    let mut tasks = JoinSet::new();
    for _ in 0..8 {
        let store = Arc::clone(&store);
        let claim = claim.clone();
        tasks.spawn(async move { store.claim_refresh(&claim, now).await });
    }

    let mut winners = 0;
    while let Some(result) = tasks.join_next().await {
        if result.unwrap().unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1, "exactly one claimant may win the lease");
}

#[tokio::test]
async fn store_errors_do_not_stop_the_loop() {
    init_tracing();
    let flaky = Arc::new(FlakyRecordStore::new());
    flaky.inner().insert(&due_record("a")).await.unwrap();
    flaky.set_failure(Some(servicekit_registry::RegistryError::store("outage")));

    let handler = Arc::new(RecordingHandler::new());
    let refresher = Refresher::new(
        "test-service",
        Arc::clone(&flaky) as Arc<dyn RecordStore>,
        Arc::clone(&handler) as Arc<dyn RefreshHandler>,
        fast_config(),
    );

    refresher.start();
    // While the store fails, the loop keeps polling without invoking the
    // handler. Once it recovers, the due record gets refreshed.
    tokio::time::sleep(Duration::from_millis(25)).await;
    assert!(handler.seen.lock().is_empty());

    flaky.set_failure(None);
    tokio::time::timeout(Duration::from_secs(5), handler.first.cancelled())
        .await
        .expect("loop did not recover after the store came back");
    refresher.shutdown().await;
}

#[tokio::test]
async fn shutdown_terminates_an_idle_loop() {
    let store = Arc::new(MemoryRecordStore::new());
    let handler = Arc::new(RecordingHandler::new());
    let refresher = Refresher::new(
        "test-service",
        Arc::clone(&store) as Arc<dyn RecordStore>,
        Arc::clone(&handler) as Arc<dyn RefreshHandler>,
        RefresherConfig::default(),
    );

    refresher.start();
    // Second start is a no-op.
    refresher.start();

    tokio::time::timeout(Duration::from_secs(5), refresher.shutdown())
        .await
        .expect("shutdown did not complete");
    assert!(handler.seen.lock().is_empty());
}
