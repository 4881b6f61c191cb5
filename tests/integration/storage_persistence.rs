//! Integration tests for the SQLite store
//!
//! These tests verify that:
//! - Resource state survives reopening the database
//! - A restarted source resumes from its persisted checkpoint
//! - Rollups emitted by the pipeline can be queried back by range

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rollwatch::actors::messenger::LogMessageSink;
use rollwatch::config::PipelineConfig;
use rollwatch::pipeline::{Pipeline, admin_channel};
use rollwatch::rollup::{Granularity, Observation};
use rollwatch::sources::{
    AckHandle, Disposition, ItemHandler, PollOutcome, PollSource, SlidingWindowFetcher,
};
use rollwatch::storage::sqlite::SqliteStore;
use rollwatch::storage::{
    CheckpointStore, ResourceStore, ResourceUpdate, RollupQuery, RollupSink, StoreError,
};
use rollwatch::util::ManualClock;
use rollwatch::{ManagedResource, MetricKey, MetricSample, WorkItem};
use tempfile::tempdir;

use crate::helpers::*;

struct AckEverything;

#[async_trait]
impl ItemHandler for AckEverything {
    async fn handle(&self, _item: WorkItem, _acker: &AckHandle, _now: DateTime<Utc>) -> Disposition {
        Disposition::Acked
    }
}

async fn open_source(store: &Arc<SqliteStore>) -> PollSource<SlidingWindowFetcher, AckEverything> {
    let fetcher = SlidingWindowFetcher::load(
        "events",
        "events",
        store.clone(),
        store.clone(),
        Duration::hours(1),
        Duration::minutes(1),
    )
    .await
    .unwrap();
    PollSource::open(
        "events",
        fetcher,
        AckEverything,
        Duration::milliseconds(100),
        std::time::Duration::from_secs(30),
    )
}

async fn drain(source: &mut PollSource<SlidingWindowFetcher, AckEverything>, now: DateTime<Utc>) -> usize {
    assert_eq!(source.poll(now).await, PollOutcome::EnteredQuiet);
    let refill_at = now + Duration::milliseconds(101);
    let PollOutcome::Refilled(count) = source.poll(refill_at).await else {
        panic!("expected a refill");
    };
    while let PollOutcome::Handled(_) = source.poll(refill_at).await {}
    count
}

#[tokio::test]
async fn test_resource_state_survives_reopen() {
    let temp_dir = tempdir().unwrap();
    let db_path = temp_dir.path().join("rollwatch.db");

    let store = SqliteStore::new(&db_path).await.unwrap();
    store.insert_resource(&ManagedResource::new("m1", "mail")).await.unwrap();
    store
        .update_resource("m1", &ResourceUpdate::polling_started(t0()))
        .await
        .unwrap();
    store
        .update_resource("m1", &ResourceUpdate::polling_unauthorized("token revoked"))
        .await
        .unwrap();

    let missing = store
        .update_resource("nope", &ResourceUpdate::polling_succeeded())
        .await;
    assert!(matches!(missing, Err(StoreError::NotFound(_))));
    store.close().await;

    let reopened = SqliteStore::new(&db_path).await.unwrap();
    let resource = reopened.get_resource("m1").await.unwrap().unwrap();
    assert!(resource.broken);
    assert!(!resource.polling_in_progress);
    assert_eq!(resource.last_poll_time, Some(t0()));
    assert_eq!(resource.last_error.as_deref(), Some("token revoked"));
    assert_eq!(reopened.list_resources().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_restarted_source_resumes_from_checkpoint() {
    let temp_dir = tempdir().unwrap();
    let db_path = temp_dir.path().join("rollwatch.db");

    let store = Arc::new(SqliteStore::new(&db_path).await.unwrap());
    store
        .insert_work_items(&[
            event("e1", t0(), "usage", "acct"),
            event("e2", t0() + Duration::seconds(5), "usage", "acct"),
        ])
        .await
        .unwrap();

    let mut source = open_source(&store).await;
    assert_eq!(drain(&mut source, t0() + Duration::seconds(10)).await, 2);
    assert_eq!(source.stats().acked, 2);
    drop(source);
    store.close().await;
    drop(store);

    let store = Arc::new(SqliteStore::new(&db_path).await.unwrap());
    assert_eq!(
        store.read_checkpoint("events").await.unwrap(),
        Some(t0() + Duration::seconds(5))
    );
    store
        .insert_work_items(&[event("e3", t0() + Duration::seconds(8), "usage", "acct")])
        .await
        .unwrap();

    // items at or before the checkpoint are not fetched again
    let mut source = open_source(&store).await;
    assert_eq!(drain(&mut source, t0() + Duration::seconds(20)).await, 1);
    assert_eq!(
        store.read_checkpoint("events").await.unwrap(),
        Some(t0() + Duration::seconds(8))
    );
}

#[tokio::test]
async fn test_pipeline_rollups_are_queryable() {
    let temp_dir = tempdir().unwrap();
    let store = Arc::new(SqliteStore::new(temp_dir.path().join("rollwatch.db")).await.unwrap());
    let clock = Arc::new(ManualClock::new(t0()));
    let (admin, admin_rx) = admin_channel(8);
    let config = PipelineConfig {
        partitions: 2,
        flush_interval_ms: 3_600_000,
        persistence_flush_secs: 3600,
        ..PipelineConfig::default()
    };
    let pipeline = Pipeline::spawn(
        &config,
        clock.clone(),
        store.clone(),
        Arc::new(LogMessageSink),
        admin_rx,
    );

    let key = MetricKey::new("acct", "usage.bytes");
    let seconds = pipeline.router(Granularity::Second).unwrap().clone();
    for (offset, value) in [(0, 10.0), (1, 20.0), (1, 30.0), (2, 40.0)] {
        seconds
            .observe(Observation::from(MetricSample {
                key: key.clone(),
                timestamp: t0() + Duration::seconds(offset),
                value,
            }))
            .await
            .unwrap();
    }

    clock.advance(Duration::minutes(5));
    admin.flush().await.unwrap();
    pipeline.persistence().flush().await.unwrap();

    let query = RollupQuery {
        key: key.clone(),
        granularity: Granularity::Second,
        start: t0(),
        end: t0() + Duration::seconds(1),
        limit: None,
    };
    let records = pipeline.persistence().query_range(query.clone()).await.unwrap();
    let sums: Vec<f64> = records.iter().map(|record| record.stats.sum).collect();
    assert_eq!(sums, vec![10.0, 50.0]);

    let minutes = store
        .query_range(&RollupQuery {
            granularity: Granularity::Minute,
            ..query
        })
        .await
        .unwrap();
    assert_eq!(minutes.len(), 1);
    assert_eq!(minutes[0].stats.count, 4);
    assert_eq!(minutes[0].stats.min, 10.0);
    assert_eq!(minutes[0].stats.max, 40.0);

    let stats = pipeline.persistence().stats().await.unwrap();
    assert_eq!(stats.failed, 0);

    pipeline.shutdown().await.unwrap();
}
