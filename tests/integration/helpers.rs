//! Helper functions for integration tests

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use rollwatch::alerts::AlertNotifier;
use rollwatch::scheduler::{
    ConnectionScheduler, PollPolicy, Provider, ProviderRegistry, RefreshContext, RefreshError,
    RefreshExecutor, RefreshPool,
};
use rollwatch::storage::ResourceStore;
use rollwatch::{ManagedResource, Visibility, WorkItem};
use serde_json::json;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 6, 9, 0, 0).unwrap()
}

pub fn event(id: &str, at: DateTime<Utc>, classification: &str, account: &str) -> WorkItem {
    WorkItem {
        id: id.to_string(),
        stream: "events".to_string(),
        timestamp: at,
        account_id: Some(account.to_string()),
        classification: Some(classification.to_string()),
        visibility: Visibility::Public,
        payload: json!({}),
    }
}

pub fn event_with_metrics(
    id: &str,
    at: DateTime<Utc>,
    classification: &str,
    account: &str,
    metrics: serde_json::Value,
) -> WorkItem {
    WorkItem {
        payload: json!({ "metrics": metrics }),
        ..event(id, at, classification, account)
    }
}

/// Executor answering from a script, then succeeding
#[derive(Default)]
pub struct ScriptedExecutor {
    script: Mutex<VecDeque<Result<(), RefreshError>>>,
    pub calls: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new(script: impl IntoIterator<Item = Result<(), RefreshError>>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(times: usize) -> Self {
        Self::new((0..times).map(|i| Err(RefreshError::Other(format!("timeout #{i}")))))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RefreshExecutor for ScriptedExecutor {
    async fn refresh(&self, _resource: &ManagedResource) -> Result<(), RefreshError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }
}

/// Executor taking its time and recording overlapping refreshes per resource
#[derive(Default)]
pub struct SlowExecutor {
    running: Mutex<HashMap<String, usize>>,
    pub max_overlap: AtomicUsize,
    pub calls: AtomicUsize,
}

impl SlowExecutor {
    pub fn max_overlap(&self) -> usize {
        self.max_overlap.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RefreshExecutor for SlowExecutor {
    async fn refresh(&self, resource: &ManagedResource) -> Result<(), RefreshError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut running = self.running.lock().unwrap();
            let overlap = running.entry(resource.id.clone()).or_default();
            *overlap += 1;
            self.max_overlap.fetch_max(*overlap, Ordering::SeqCst);
        }
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        *self.running.lock().unwrap().entry(resource.id.clone()).or_default() -= 1;
        Ok(())
    }
}

/// Notifier remembering which resources were reported broken
#[derive(Default)]
pub struct RecordingNotifier {
    pub broken: Mutex<Vec<ManagedResource>>,
}

#[async_trait]
impl AlertNotifier for RecordingNotifier {
    async fn notify_broken(&self, resource: &ManagedResource) -> anyhow::Result<()> {
        self.broken.lock().unwrap().push(resource.clone());
        Ok(())
    }
}

pub const MAIL_INTERVAL_MINUTES: i64 = 5;

pub fn build_scheduler(
    store: Arc<dyn ResourceStore>,
    executor: Arc<dyn RefreshExecutor>,
    notifier: Arc<dyn AlertNotifier>,
    policy: PollPolicy,
) -> ConnectionScheduler {
    build_scheduler_with_workers(store, executor, notifier, policy, 4)
}

pub fn build_scheduler_with_workers(
    store: Arc<dyn ResourceStore>,
    executor: Arc<dyn RefreshExecutor>,
    notifier: Arc<dyn AlertNotifier>,
    policy: PollPolicy,
    workers: usize,
) -> ConnectionScheduler {
    let mut registry = ProviderRegistry::new();
    registry.register(
        "mail",
        Provider {
            interval: Duration::minutes(MAIL_INTERVAL_MINUTES),
            push: false,
            executor,
        },
    );
    let registry = Arc::new(registry);

    let context = RefreshContext {
        store: store.clone(),
        registry: registry.clone(),
        notifier,
        max_failed_count: policy.max_failed_count,
        broken_sleep: policy.broken_sleep,
        counters: Default::default(),
    };
    ConnectionScheduler::new(store, registry, policy, RefreshPool::new(context, workers))
}

/// Tick and wait for every dispatched refresh
pub async fn tick_and_wait(scheduler: &mut ConnectionScheduler, now: DateTime<Utc>) -> Vec<String> {
    let report = scheduler.tick(now).await;
    let ids = report
        .selected_ids()
        .into_iter()
        .map(str::to_string)
        .collect();
    for handle in report.handles {
        handle.await.unwrap();
    }
    ids
}

/// Retry `check` until it returns true, for state that settles asynchronously
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    while !check().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within 5s"
        );
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}
