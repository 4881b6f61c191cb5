//! Store trait definitions
//!
//! The core never owns its data: resources, work items, checkpoints and
//! rollups all live in external stores reached through these traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::StoreResult;
use crate::rollup::Granularity;
use crate::{ManagedResource, MetricKey, RollupRecord, WorkItem};

/// Atomic partial update of a managed resource
///
/// `None` fields are left untouched. `last_error: Some(None)` clears the
/// recorded error. `increment_failed` bumps the stored failure count in the
/// same write and wins over `failed_count`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceUpdate {
    pub polling_in_progress: Option<bool>,
    pub last_poll_time: Option<DateTime<Utc>>,
    pub failed_count: Option<u32>,
    pub increment_failed: bool,
    pub broken: Option<bool>,
    pub last_error: Option<Option<String>>,
}

impl ResourceUpdate {
    /// Marks a refresh as started
    pub fn polling_started(now: DateTime<Utc>) -> Self {
        Self {
            polling_in_progress: Some(true),
            last_poll_time: Some(now),
            ..Default::default()
        }
    }

    pub fn polling_succeeded() -> Self {
        Self {
            polling_in_progress: Some(false),
            failed_count: Some(0),
            last_error: Some(None),
            ..Default::default()
        }
    }

    pub fn polling_unauthorized(message: impl Into<String>) -> Self {
        Self {
            polling_in_progress: Some(false),
            broken: Some(true),
            last_error: Some(Some(message.into())),
            ..Default::default()
        }
    }

    pub fn polling_failed(message: impl Into<String>) -> Self {
        Self {
            polling_in_progress: Some(false),
            increment_failed: true,
            last_error: Some(Some(message.into())),
            ..Default::default()
        }
    }

    /// Gives up a claimed refresh without recording an outcome
    pub fn released() -> Self {
        Self {
            polling_in_progress: Some(false),
            ..Default::default()
        }
    }

    pub fn apply(&self, resource: &mut ManagedResource) {
        if let Some(in_progress) = self.polling_in_progress {
            resource.polling_in_progress = in_progress;
        }
        if let Some(at) = self.last_poll_time {
            resource.last_poll_time = Some(at);
        }
        if self.increment_failed {
            resource.failed_count = resource.failed_count.saturating_add(1);
        } else if let Some(count) = self.failed_count {
            resource.failed_count = count;
        }
        if let Some(broken) = self.broken {
            resource.broken = broken;
        }
        if let Some(error) = &self.last_error {
            resource.last_error = error.clone();
        }
    }
}

/// Conditional start of a refresh
///
/// Succeeds only while the resource still shows the polling state observed
/// when it was selected. Every successful claim moves `last_poll_time`, so
/// two claims made from the same observation cannot both succeed.
#[derive(Debug, Clone, PartialEq)]
pub struct PollingClaim {
    pub observed_in_progress: bool,
    pub observed_last_poll: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
}

impl PollingClaim {
    pub fn new(resource: &ManagedResource, now: DateTime<Utc>) -> Self {
        Self {
            observed_in_progress: resource.polling_in_progress,
            observed_last_poll: resource.last_poll_time,
            now,
        }
    }

    pub fn holds(&self, resource: &ManagedResource) -> bool {
        resource.polling_in_progress == self.observed_in_progress
            && resource.last_poll_time == self.observed_last_poll
    }

    /// The update a successful claim applies
    pub fn update(&self) -> ResourceUpdate {
        ResourceUpdate::polling_started(self.now)
    }
}

/// Selects a batch of work items from one stream
///
/// The time window is half-open: `(after, until]`. A missing bound is
/// unbounded on that side. With `after_id` set, `after` becomes a keyset
/// cursor over `(timestamp, id)`: items at exactly `after` with a larger id
/// are included too.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchFilter {
    pub stream: String,
    pub after: Option<DateTime<Utc>>,
    pub after_id: Option<String>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl BatchFilter {
    pub fn stream(stream: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            after: None,
            after_id: None,
            until: None,
            limit: None,
        }
    }

    /// Continue after the item `(at, id)` of a previous page
    pub fn resume_after(mut self, at: DateTime<Utc>, id: impl Into<String>) -> Self {
        self.after = Some(at);
        self.after_id = Some(id.into());
        self
    }

    pub fn window(mut self, after: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        self.after = Some(after);
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    pub fn matches(&self, item: &WorkItem) -> bool {
        item.stream == self.stream
            && self.after.is_none_or(|after| {
                item.timestamp > after
                    || (item.timestamp == after
                        && self.after_id.as_deref().is_some_and(|id| item.id.as_str() > id))
            })
            && self.until.is_none_or(|until| item.timestamp <= until)
    }
}

/// Query parameters for stored rollups
#[derive(Debug, Clone)]
pub struct RollupQuery {
    pub key: MetricKey,
    pub granularity: Granularity,

    /// Earliest window start (inclusive)
    pub start: DateTime<Utc>,

    /// Latest window start (inclusive)
    pub end: DateTime<Utc>,

    pub limit: Option<usize>,
}

impl RollupQuery {
    pub fn matches(&self, record: &RollupRecord) -> bool {
        record.key == self.key
            && record.granularity == self.granularity
            && record.window_start >= self.start
            && record.window_start <= self.end
    }
}

/// Managed resources ("connections") and their polling state
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// All resources, in a stable order
    async fn list_resources(&self) -> StoreResult<Vec<ManagedResource>>;

    async fn get_resource(&self, id: &str) -> StoreResult<Option<ManagedResource>>;

    /// Apply a partial update atomically and return the stored result
    ///
    /// Returns `StoreError::NotFound` if the resource does not exist.
    async fn update_resource(&self, id: &str, update: &ResourceUpdate)
    -> StoreResult<ManagedResource>;

    /// Mark a refresh as started if the claim still holds
    ///
    /// `Ok(None)` means another refresh got there first.
    async fn claim_resource(
        &self,
        id: &str,
        claim: &PollingClaim,
    ) -> StoreResult<Option<ManagedResource>>;
}

/// Pending events and snapshots
#[async_trait]
pub trait WorkItemStore: Send + Sync {
    /// Items matching the filter, oldest first
    async fn fetch_batch(&self, filter: &BatchFilter) -> StoreResult<Vec<WorkItem>>;

    async fn fetch_by_id(&self, id: &str) -> StoreResult<Option<WorkItem>>;
}

/// One timestamp per source name
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn read_checkpoint(&self, source: &str) -> StoreResult<Option<DateTime<Utc>>>;

    /// Persist a checkpoint; implementations never move a checkpoint backward
    async fn write_checkpoint(&self, source: &str, at: DateTime<Utc>) -> StoreResult<()>;
}

/// Persistence of emitted rollups
#[async_trait]
pub trait RollupSink: Send + Sync {
    /// Insert or replace the record for (key, granularity, window_start)
    async fn save(&self, record: &RollupRecord) -> StoreResult<()>;

    async fn save_batch(&self, records: Vec<RollupRecord>) -> StoreResult<()> {
        for record in &records {
            self.save(record).await?;
        }
        Ok(())
    }

    /// Stored rollups ordered by window start (oldest first)
    async fn query_range(&self, query: &RollupQuery) -> StoreResult<Vec<RollupRecord>>;
}
