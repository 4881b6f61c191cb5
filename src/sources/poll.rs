//! Checkpointed poll source
//!
//! ## Cycle
//!
//! ```text
//! queue non-empty ──▶ hand one item to the handler
//! queue empty     ──▶ enter quiet period
//! quiet elapsed   ──▶ refill (fresh batch + re-fetched failed ids)
//! ```
//!
//! The source never sleeps itself. A driver (see [`crate::actors::source`])
//! calls [`PollSource::poll`] with the current time and waits a short delay
//! whenever the outcome is idle.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::{debug, instrument, trace, warn};

use crate::WorkItem;
use crate::storage::{BatchFilter, StoreError, StoreResult, WorkItemStore};

/// What the item handler did with one item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Consumed (possibly without emitting anything)
    Acked,

    /// Unusable; never retried
    Dropped,

    /// Re-fetch on the next refill
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Handled(Disposition),
    EnteredQuiet,
    Refilled(usize),
    Idle,
}

/// Ids of items that failed downstream, shared with other tasks
#[derive(Debug, Clone, Default)]
pub struct FailedIds(Arc<Mutex<VecDeque<String>>>);

impl FailedIds {
    /// Queue an id for re-fetching; already queued ids are ignored
    pub fn push(&self, id: impl Into<String>) {
        let id = id.into();
        let mut ids = self.lock();
        if !ids.contains(&id) {
            ids.push_back(id);
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().iter().any(|queued| queued == id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn drain(&self) -> Vec<String> {
        self.lock().drain(..).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<String>> {
        // the queue holds plain ids, a poisoned lock leaves it usable
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug, Default)]
struct AckCounters {
    acked: AtomicU64,
    failed: AtomicU64,
}

/// Acknowledgement callbacks for items handed downstream
#[derive(Debug, Clone)]
pub struct AckHandle {
    failed_ids: FailedIds,
    counters: Arc<AckCounters>,
}

impl AckHandle {
    pub fn ack(&self, id: &str) {
        trace!("acknowledged item {id}");
        self.counters.acked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fail(&self, id: &str) {
        debug!("item {id} failed downstream, re-fetching on next refill");
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        self.failed_ids.push(id);
    }
}

/// Supplies batches to a [`PollSource`]
#[async_trait]
pub trait BatchFetcher: Send + Sync {
    async fn fetch_batch(&self, now: DateTime<Utc>) -> StoreResult<Vec<WorkItem>>;

    async fn fetch_by_id(&self, id: &str) -> StoreResult<Option<WorkItem>>;

    /// Called once a fetch succeeded, before the batch is queued
    async fn batch_fetched(&mut self, _batch: &[WorkItem], _now: DateTime<Utc>) {}

    fn checkpoint(&self) -> Option<DateTime<Utc>> {
        None
    }
}

/// Consumes items dequeued by a [`PollSource`]
#[async_trait]
pub trait ItemHandler: Send + Sync {
    async fn handle(&self, item: WorkItem, acker: &AckHandle, now: DateTime<Utc>) -> Disposition;
}

/// Fetches everything currently in one stream
///
/// With a limit, consecutive refills page through the stream in
/// `(timestamp, id)` order and start over once a page comes back short.
pub struct StoreFetcher {
    stream: String,
    items: Arc<dyn WorkItemStore>,
    limit: Option<usize>,

    /// Last item of the previous full page
    cursor: Option<(DateTime<Utc>, String)>,
}

impl StoreFetcher {
    pub fn new(stream: impl Into<String>, items: Arc<dyn WorkItemStore>) -> Self {
        Self {
            stream: stream.into(),
            items,
            limit: None,
            cursor: None,
        }
    }

    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }
}

#[async_trait]
impl BatchFetcher for StoreFetcher {
    async fn fetch_batch(&self, _now: DateTime<Utc>) -> StoreResult<Vec<WorkItem>> {
        let filter = BatchFilter::stream(&self.stream).limit(self.limit);
        let Some((at, id)) = &self.cursor else {
            return self.items.fetch_batch(&filter).await;
        };

        let page = self
            .items
            .fetch_batch(&filter.clone().resume_after(*at, id.clone()))
            .await?;
        if page.is_empty() {
            trace!("{}: paged through the whole stream, starting over", self.stream);
            return self.items.fetch_batch(&filter).await;
        }
        Ok(page)
    }

    async fn fetch_by_id(&self, id: &str) -> StoreResult<Option<WorkItem>> {
        self.items.fetch_by_id(id).await
    }

    async fn batch_fetched(&mut self, batch: &[WorkItem], _now: DateTime<Utc>) {
        self.cursor = match (self.limit, batch.last()) {
            (Some(limit), Some(last)) if batch.len() >= limit => {
                Some((last.timestamp, last.id.clone()))
            }
            _ => None,
        };
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceStats {
    pub name: String,
    pub queued: usize,
    pub quiet: bool,
    pub refills: u64,
    pub fetch_failures: u64,
    pub handled: u64,
    pub acked: u64,
    pub dropped: u64,
    pub failed: u64,
    pub pending_failed: usize,
    pub checkpoint: Option<DateTime<Utc>>,
}

pub struct PollSource<F, H> {
    name: String,
    fetcher: F,
    handler: H,
    queue: VecDeque<WorkItem>,
    quiet: bool,
    quiet_start: Option<DateTime<Utc>>,
    quiet_duration: chrono::Duration,
    fetch_timeout: Duration,
    failed_ids: FailedIds,
    counters: Arc<AckCounters>,
    refills: u64,
    fetch_failures: u64,
    handled: u64,
    dropped: u64,
}

impl<F: BatchFetcher, H: ItemHandler> PollSource<F, H> {
    /// Open a source with an empty queue, not yet quiet
    pub fn open(
        name: impl Into<String>,
        fetcher: F,
        handler: H,
        quiet_duration: chrono::Duration,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            fetcher,
            handler,
            queue: VecDeque::new(),
            quiet: false,
            quiet_start: None,
            quiet_duration,
            fetch_timeout,
            failed_ids: FailedIds::default(),
            counters: Arc::new(AckCounters::default()),
            refills: 0,
            fetch_failures: 0,
            handled: 0,
            dropped: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn acker(&self) -> AckHandle {
        AckHandle {
            failed_ids: self.failed_ids.clone(),
            counters: self.counters.clone(),
        }
    }

    pub fn failed_ids(&self) -> &FailedIds {
        &self.failed_ids
    }

    pub fn queued_ids(&self) -> Vec<&str> {
        self.queue.iter().map(|item| item.id.as_str()).collect()
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Advance the source by one step
    pub async fn poll(&mut self, now: DateTime<Utc>) -> PollOutcome {
        if let Some(item) = self.queue.pop_front() {
            let id = item.id.clone();
            let acker = self.acker();
            let disposition = self.handler.handle(item, &acker, now).await;
            self.handled += 1;
            match disposition {
                Disposition::Acked => acker.ack(&id),
                Disposition::Failed => acker.fail(&id),
                Disposition::Dropped => self.dropped += 1,
            }
            return PollOutcome::Handled(disposition);
        }

        if !self.quiet {
            trace!("{}: queue exhausted, entering quiet period", self.name);
            self.quiet = true;
            self.quiet_start = Some(now);
            return PollOutcome::EnteredQuiet;
        }

        let quiet_over = self
            .quiet_start
            .is_none_or(|start| now - start > self.quiet_duration);
        if quiet_over {
            let count = self.refill(now).await;
            self.quiet = false;
            self.quiet_start = None;
            return PollOutcome::Refilled(count);
        }

        PollOutcome::Idle
    }

    /// Queue the current batch plus every failed id that still resolves
    #[instrument(skip(self), fields(source = %self.name))]
    async fn refill(&mut self, now: DateTime<Utc>) -> usize {
        self.refills += 1;

        let batch = match timeout(self.fetch_timeout, self.fetcher.fetch_batch(now)).await {
            Ok(Ok(batch)) => {
                self.fetcher.batch_fetched(&batch, now).await;
                batch
            }
            Ok(Err(e)) => {
                warn!("batch fetch failed, continuing with an empty batch: {e}");
                self.fetch_failures += 1;
                vec![]
            }
            Err(_) => {
                warn!(
                    "batch fetch timed out after {:?}, continuing with an empty batch",
                    self.fetch_timeout
                );
                self.fetch_failures += 1;
                vec![]
            }
        };

        let mut seen: HashSet<String> = self.queue.iter().map(|item| item.id.clone()).collect();
        for item in batch {
            if seen.insert(item.id.clone()) {
                self.queue.push_back(item);
            }
        }

        let mut retry_later = vec![];
        for id in self.failed_ids.drain() {
            if seen.contains(&id) {
                continue;
            }
            let lookup = timeout(self.fetch_timeout, self.fetcher.fetch_by_id(&id))
                .await
                .unwrap_or_else(|_| Err(StoreError::Unavailable("fetch by id timed out".into())));
            match lookup {
                Ok(Some(item)) => {
                    seen.insert(id);
                    self.queue.push_back(item);
                }
                Ok(None) => debug!("failed item {id} no longer exists, dropping it"),
                Err(e) => {
                    warn!("could not re-fetch failed item {id}: {e}");
                    retry_later.push(id);
                }
            }
        }
        for id in retry_later {
            self.failed_ids.push(id);
        }

        debug!("refilled with {} items", self.queue.len());
        self.queue.len()
    }

    pub fn stats(&self) -> SourceStats {
        SourceStats {
            name: self.name.clone(),
            queued: self.queue.len(),
            quiet: self.quiet,
            refills: self.refills,
            fetch_failures: self.fetch_failures,
            handled: self.handled,
            acked: self.counters.acked.load(Ordering::Relaxed),
            dropped: self.dropped,
            failed: self.counters.failed.load(Ordering::Relaxed),
            pending_failed: self.failed_ids.len(),
            checkpoint: self.fetcher.checkpoint(),
        }
    }
}
