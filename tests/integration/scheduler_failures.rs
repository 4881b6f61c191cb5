//! Refresh failure handling of the connection scheduler
//!
//! - Soft circuit breaker after repeated failures
//! - Hard break on rejected credentials
//! - Recovery of refreshes stuck in progress
//! - No second dispatch while a refresh waits for a worker

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rollwatch::ManagedResource;
use rollwatch::actors::scheduler::SchedulerHandle;
use rollwatch::scheduler::{PollPolicy, RefreshError};
use rollwatch::storage::{MemoryStore, ResourceStore};
use rollwatch::util::ManualClock;

use crate::helpers::*;

fn interval() -> Duration {
    Duration::minutes(MAIL_INTERVAL_MINUTES)
}

fn policy() -> PollPolicy {
    PollPolicy {
        max_failed_count: 3,
        broken_sleep: Duration::hours(1),
        ..PollPolicy::default()
    }
}

async fn resource(store: &MemoryStore, id: &str) -> ManagedResource {
    store.get_resource(id).await.unwrap().unwrap()
}

#[tokio::test]
async fn test_four_failures_sleep_for_exactly_broken_sleep() {
    let store = Arc::new(MemoryStore::with_resources(vec![ManagedResource::new("m1", "mail")]));
    let executor = Arc::new(ScriptedExecutor::failing(4));
    let mut scheduler = build_scheduler(
        store.clone(),
        executor.clone(),
        Arc::new(RecordingNotifier::default()),
        policy(),
    );

    let mut now = t0();
    for attempt in 1..=4u32 {
        assert_eq!(tick_and_wait(&mut scheduler, now).await, vec!["m1"], "attempt {attempt}");
        assert_eq!(resource(&store, "m1").await.failed_count, attempt);
        now += interval() + Duration::seconds(1);
    }
    let last_attempt: DateTime<Utc> = resource(&store, "m1").await.last_poll_time.unwrap();

    // sleeping for the whole cool-down, boundary included
    for offset in [
        interval() + Duration::seconds(1),
        Duration::minutes(30),
        Duration::hours(1),
    ] {
        let at = last_attempt + offset;
        assert!(tick_and_wait(&mut scheduler, at).await.is_empty(), "selected at +{offset}");
    }
    assert_eq!(executor.calls(), 4);

    let recheck = last_attempt + Duration::hours(1) + Duration::seconds(1);
    assert_eq!(tick_and_wait(&mut scheduler, recheck).await, vec!["m1"]);
    assert!(tick_and_wait(&mut scheduler, recheck).await.is_empty());
    assert_eq!(executor.calls(), 5);

    let healed = resource(&store, "m1").await;
    assert_eq!(healed.failed_count, 0);
    assert!(!healed.broken);
    assert_eq!(healed.last_error, None);
}

#[tokio::test]
async fn test_failures_below_threshold_keep_the_interval() {
    let store = Arc::new(MemoryStore::with_resources(vec![ManagedResource::new("m1", "mail")]));
    let executor = Arc::new(ScriptedExecutor::failing(2));
    let mut scheduler = build_scheduler(
        store.clone(),
        executor.clone(),
        Arc::new(RecordingNotifier::default()),
        policy(),
    );

    let mut now = t0();
    for expected in [1, 2, 0] {
        assert_eq!(tick_and_wait(&mut scheduler, now).await, vec!["m1"]);
        assert_eq!(resource(&store, "m1").await.failed_count, expected);

        // not due again within the interval
        assert!(tick_and_wait(&mut scheduler, now + interval()).await.is_empty());
        now += interval() + Duration::seconds(1);
    }

    let stats = scheduler.stats();
    assert_eq!(stats.refresh.failed, 2);
    assert_eq!(stats.refresh.succeeded, 1);
}

#[tokio::test]
async fn test_rejected_credentials_break_the_resource_and_alert() {
    let store = Arc::new(MemoryStore::with_resources(vec![ManagedResource::new("m1", "mail")]));
    let executor = Arc::new(ScriptedExecutor::new([Err(RefreshError::Auth(
        "token revoked".to_string(),
    ))]));
    let notifier = Arc::new(RecordingNotifier::default());
    let mut scheduler = build_scheduler(
        store.clone(),
        executor.clone(),
        notifier.clone(),
        policy(),
    );

    assert_eq!(tick_and_wait(&mut scheduler, t0()).await, vec!["m1"]);

    let broken = resource(&store, "m1").await;
    assert!(broken.broken);
    assert!(!broken.polling_in_progress);
    assert_eq!(broken.last_error.as_deref(), Some("token revoked"));

    let alerts = notifier.broken.lock().unwrap().clone();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].id, "m1");
    assert!(alerts[0].broken);

    // terminal until someone repairs it
    let later = t0() + Duration::days(2);
    assert!(tick_and_wait(&mut scheduler, later).await.is_empty());
    assert_eq!(executor.calls(), 1);
    assert_eq!(scheduler.stats().skipped_broken, 1);
}

#[tokio::test]
async fn test_stuck_refresh_is_picked_up_again() {
    let mut stuck = ManagedResource::new("m1", "mail");
    stuck.polling_in_progress = true;
    stuck.last_poll_time = Some(t0());
    let store = Arc::new(MemoryStore::with_resources(vec![stuck]));
    let executor = Arc::new(ScriptedExecutor::default());
    let mut scheduler = build_scheduler(
        store.clone(),
        executor.clone(),
        Arc::new(RecordingNotifier::default()),
        policy(),
    );

    let five_intervals = t0() + interval() * 5;
    assert!(tick_and_wait(&mut scheduler, five_intervals).await.is_empty());

    let after = five_intervals + Duration::seconds(1);
    assert_eq!(tick_and_wait(&mut scheduler, after).await, vec!["m1"]);

    let recovered = resource(&store, "m1").await;
    assert!(!recovered.polling_in_progress);
    assert_eq!(recovered.last_poll_time, Some(after));
    assert_eq!(executor.calls(), 1);
}

#[tokio::test]
async fn test_refreshes_waiting_for_a_worker_are_not_dispatched_twice() {
    let store = Arc::new(MemoryStore::with_resources(vec![
        ManagedResource::new("a", "mail"),
        ManagedResource::new("b", "mail"),
        ManagedResource::new("c", "mail"),
    ]));
    let executor = Arc::new(SlowExecutor::default());
    let mut scheduler = build_scheduler_with_workers(
        store.clone(),
        executor.clone(),
        Arc::new(RecordingNotifier::default()),
        policy(),
        2,
    );

    // "c" queues behind the two workers
    let first = scheduler.tick(t0()).await;
    assert_eq!(first.selected_ids(), vec!["a", "b", "c"]);
    for id in ["a", "b", "c"] {
        assert!(resource(&store, id).await.polling_in_progress, "{id} not claimed");
    }

    let second = scheduler.tick(t0() + Duration::seconds(30)).await;
    assert!(second.selected.is_empty());

    for handle in first.handles {
        handle.await.unwrap();
    }
    assert_eq!(executor.calls(), 3);
    assert_eq!(executor.max_overlap(), 1);
    assert_eq!(scheduler.stats().dispatched, 3);
    for id in ["a", "b", "c"] {
        let refreshed = resource(&store, id).await;
        assert!(!refreshed.polling_in_progress);
        assert_eq!(refreshed.last_poll_time, Some(t0()));
    }
}

#[tokio::test]
async fn test_scheduler_actor_ticks_and_reports() {
    let store = Arc::new(MemoryStore::with_resources(vec![ManagedResource::new("m1", "mail")]));
    let clock = Arc::new(ManualClock::new(t0()));
    let scheduler = build_scheduler(
        store.clone(),
        Arc::new(ScriptedExecutor::default()),
        Arc::new(RecordingNotifier::default()),
        policy(),
    );
    let handle = SchedulerHandle::spawn(scheduler, clock.clone(), std::time::Duration::from_secs(3600));

    // the first interval tick fires right away
    let store_ref = &store;
    eventually(|| async move {
        let resource = store_ref.get_resource("m1").await.unwrap().unwrap();
        resource.last_poll_time.is_some() && !resource.polling_in_progress
    })
    .await;

    assert!(handle.tick_now().await.unwrap().is_empty());

    clock.advance(interval() + Duration::seconds(1));
    assert_eq!(handle.tick_now().await.unwrap(), vec!["m1"]);

    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.ticks, 3);
    assert_eq!(stats.dispatched, 2);

    handle.shutdown().await.unwrap();
}
