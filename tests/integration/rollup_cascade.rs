//! Keyed routing and cascading of the rollup pipeline

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use rollwatch::actors::messenger::LogMessageSink;
use rollwatch::config::PipelineConfig;
use rollwatch::pipeline::{AdminHandle, Pipeline, PipelineHandle, admin_channel};
use rollwatch::rollup::{BucketPhase, Granularity, Observation, SetStateError, partition_for};
use rollwatch::sources::{PollOutcome, PollSource, SnapshotForwarder, StoreFetcher};
use rollwatch::storage::MemoryStore;
use rollwatch::util::ManualClock;
use rollwatch::{MetricKey, MetricSample, RollupRecord, WorkItem};
use serde_json::json;

use crate::helpers::*;

struct Harness {
    pipeline: PipelineHandle,
    admin: AdminHandle,
    clock: Arc<ManualClock>,
    store: Arc<MemoryStore>,
}

fn harness(partitions: usize) -> Harness {
    harness_with(PipelineConfig {
        partitions,
        flush_interval_ms: 3_600_000,
        persistence_flush_secs: 3600,
        ..PipelineConfig::default()
    })
}

fn harness_with(config: PipelineConfig) -> Harness {
    let clock = Arc::new(ManualClock::new(t0()));
    let store = Arc::new(MemoryStore::new());
    let (admin, admin_rx) = admin_channel(16);
    let pipeline = Pipeline::spawn(
        &config,
        clock.clone(),
        store.clone(),
        Arc::new(LogMessageSink),
        admin_rx,
    );
    Harness {
        pipeline,
        admin,
        clock,
        store,
    }
}

fn sample(key: &MetricKey, at: chrono::DateTime<chrono::Utc>, value: f64) -> Observation {
    Observation::from(MetricSample {
        key: key.clone(),
        timestamp: at,
        value,
    })
}

#[test]
fn test_thousand_keys_keep_their_partition() {
    let keys: Vec<MetricKey> = (0..1000)
        .map(|i| MetricKey::new(format!("acct-{}", i % 37), format!("usage.metric-{i}")))
        .collect();

    let first: HashMap<&MetricKey, usize> =
        keys.iter().map(|key| (key, partition_for(key, 4))).collect();

    // any arrival order maps every key to the same instance
    for key in keys.iter().rev() {
        assert_eq!(partition_for(key, 4), first[key]);
    }

    let mut per_partition = [0usize; 4];
    for partition in first.values() {
        per_partition[*partition] += 1;
    }
    assert!(per_partition.iter().all(|count| *count > 150), "{per_partition:?}");
}

#[tokio::test]
async fn test_thousand_keys_through_four_partitions() {
    let h = harness(4);
    let seconds = h.pipeline.router(Granularity::Second).unwrap().clone();
    let keys: Vec<MetricKey> = (0..1000)
        .map(|i| MetricKey::new("acct", format!("usage.metric-{i}")))
        .collect();

    for round in 0..3 {
        let order: Box<dyn Iterator<Item = &MetricKey>> = if round % 2 == 0 {
            Box::new(keys.iter())
        } else {
            Box::new(keys.iter().rev())
        };
        for key in order {
            seconds
                .observe(sample(key, t0() + Duration::milliseconds(round * 100), 1.0))
                .await
                .unwrap();
        }
    }

    // one state per key means no key was split across partitions
    let counts = h.admin.count_states().await.unwrap();
    assert_eq!(counts.per_granularity[&Granularity::Second], 1000);

    let view = h.admin.dump_state(keys[421].clone()).await.unwrap();
    assert_eq!(view.len(), 1);
    assert_eq!(view[0].stats.count, 3);

    h.pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_late_observations_are_dropped_and_counted() {
    let h = harness(2);
    let seconds = h.pipeline.router(Granularity::Second).unwrap().clone();
    let key = MetricKey::new("acct", "usage.events");

    seconds.observe(sample(&key, t0() + Duration::seconds(5), 1.0)).await.unwrap();
    seconds.observe(sample(&key, t0(), 1.0)).await.unwrap();

    let views = h.admin.dump_state(key.clone()).await.unwrap();
    assert_eq!(views[0].stats.count, 1);
    assert_eq!(h.pipeline.stats().late, 1);

    h.pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_every_granularity_reaches_the_sink() {
    let h = harness(2);
    let mut rollups = h.pipeline.subscribe();
    let seconds = h.pipeline.router(Granularity::Second).unwrap().clone();
    let key = MetricKey::new("acct", "usage.events");

    seconds.observe(sample(&key, t0(), 4.0)).await.unwrap();
    seconds.observe(sample(&key, t0(), 6.0)).await.unwrap();

    // far enough for every window including the month to close
    h.clock.advance(Duration::days(70));
    assert_eq!(h.admin.flush().await.unwrap(), Granularity::ALL.len());

    let mut seen = Vec::new();
    for _ in Granularity::ALL {
        let record: RollupRecord = rollups.recv().await.unwrap();
        assert_eq!(record.stats.count, 2);
        assert_eq!(record.stats.sum, 10.0);
        seen.push(record.granularity);
    }
    assert_eq!(seen, Granularity::ALL.to_vec());

    h.pipeline.persistence().flush().await.unwrap();
    assert_eq!(h.store.rollups().await.len(), Granularity::ALL.len());
    h.pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_set_state_changes_the_emitted_bucket() {
    let h = harness(1);
    let seconds = h.pipeline.router(Granularity::Second).unwrap().clone();
    let key = MetricKey::new("acct", "usage.events");
    seconds.observe(sample(&key, t0(), 1.0)).await.unwrap();

    h.admin
        .set_state(key.clone(), Granularity::Second, "max", 42.0)
        .await
        .unwrap();
    let err = h
        .admin
        .set_state(key.clone(), Granularity::Second, "median", 1.0)
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<SetStateError>(),
        Some(SetStateError::UnknownField(_))
    ));

    let views = h.admin.dump_state(key.clone()).await.unwrap();
    assert_eq!(views[0].phase, BucketPhase::Accumulating);
    assert_eq!(views[0].stats.max, 42.0);

    h.admin.clear(key.clone()).await.unwrap();
    h.pipeline.persistence().flush().await.unwrap();
    let stored = h.store.rollups().await;
    let second = stored
        .iter()
        .find(|record| record.granularity == Granularity::Second)
        .unwrap();
    assert_eq!(second.stats.max, 42.0);

    h.pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_snapshots_are_sampled_at_observation_time() {
    let h = harness(2);
    let store = Arc::new(MemoryStore::new());
    let stale = t0() - Duration::days(3);
    store
        .insert_items(vec![WorkItem {
            stream: "snapshots".to_string(),
            ..event_with_metrics("s1", stale, "snapshot", "acct", json!({ "seats": 12 }))
        }])
        .await;

    let mut source = PollSource::open(
        "snapshots",
        StoreFetcher::new("snapshots", store),
        SnapshotForwarder::new(h.pipeline.routes()),
        Duration::seconds(60),
        std::time::Duration::from_secs(30),
    );
    let now = t0() + Duration::seconds(30);
    assert_eq!(source.poll(now).await, PollOutcome::EnteredQuiet);
    assert_eq!(source.poll(now + Duration::seconds(61)).await, PollOutcome::Refilled(1));
    let later = now + Duration::seconds(61);
    let _ = source.poll(later).await;

    let key = MetricKey::new("acct", "snapshot.seats");
    let admin = &h.admin;
    let wanted = &key;
    eventually(|| async move { !admin.dump_state(wanted.clone()).await.unwrap().is_empty() }).await;

    let views = h.admin.dump_state(key).await.unwrap();
    assert_eq!(views[0].window_start, Some(Granularity::Second.window_start(later)));
    assert_eq!(views[0].stats.sum, 12.0);

    // snapshots carry no event counter
    let counter = h.admin.dump_state(MetricKey::new("acct", "snapshot.events")).await.unwrap();
    assert!(counter.is_empty());

    drop(source);
    h.pipeline.shutdown().await.unwrap();
}

async fn stored(h: &Harness, key: &MetricKey, granularity: Granularity) -> Vec<RollupRecord> {
    let mut records: Vec<RollupRecord> = h
        .store
        .rollups()
        .await
        .into_iter()
        .filter(|record| &record.key == key && record.granularity == granularity)
        .collect();
    records.sort_by_key(|record| record.window_start);
    records
}

#[tokio::test]
async fn test_replayed_history_rolls_up_like_live_data() {
    let h = harness_with(PipelineConfig {
        partitions: 2,
        flush_interval_ms: 5,
        persistence_flush_secs: 3600,
        ..PipelineConfig::default()
    });
    let seconds = h.pipeline.router(Granularity::Second).unwrap().clone();
    let key = MetricKey::new("acct", "usage.events");

    // twenty minutes of samples, delivered two days late while stages keep flushing
    h.clock.set(t0() + Duration::days(2));
    for i in 0..120 {
        seconds
            .observe(sample(&key, t0() + Duration::seconds(10 * i), 1.0))
            .await
            .unwrap();
        if i % 10 == 0 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    h.clock.advance(Duration::hours(2));
    h.admin.flush().await.unwrap();
    h.pipeline.persistence().flush().await.unwrap();

    let minutes = stored(&h, &key, Granularity::Minute).await;
    assert_eq!(minutes.len(), 20);
    assert!(minutes.iter().all(|record| record.stats.count == 6));
    assert_eq!(minutes[0].window_start, t0());

    let hours = stored(&h, &key, Granularity::Hour).await;
    assert_eq!(hours.len(), 1);
    assert_eq!(hours[0].window_start, t0());
    assert_eq!(hours[0].stats.count, 120);
    assert_eq!(h.pipeline.stats().late, 0);

    h.pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_week_straddling_two_months_feeds_both_months() {
    let h = harness(2);
    let seconds = h.pipeline.router(Granularity::Second).unwrap().clone();
    let key = MetricKey::new("acct", "usage.events");
    let day = |d: u32, m: u32| Utc.with_ymd_and_hms(2024, m, d, 12, 0, 0).unwrap();

    h.clock.set(day(2, 5) + Duration::hours(1));
    for at in [day(30, 4), day(1, 5), day(2, 5)] {
        seconds.observe(sample(&key, at, 1.0)).await.unwrap();
    }

    h.clock.set(Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap());
    h.admin.flush().await.unwrap();
    h.pipeline.persistence().flush().await.unwrap();

    let months = stored(&h, &key, Granularity::Month).await;
    let months: Vec<_> = months
        .iter()
        .map(|record| (record.window_start, record.stats.count))
        .collect();
    assert_eq!(
        months,
        vec![
            (Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap(), 1),
            (Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(), 2),
        ]
    );

    let weeks = stored(&h, &key, Granularity::Week).await;
    assert_eq!(weeks.len(), 1);
    assert_eq!(weeks[0].window_start, Utc.with_ymd_and_hms(2024, 4, 29, 0, 0, 0).unwrap());
    assert_eq!(weeks[0].stats.count, 3);
    assert_eq!(h.pipeline.stats().late, 0);

    h.pipeline.shutdown().await.unwrap();
}
