//! Sliding-window event fetcher
//!
//! Requests only events newer than a persisted checkpoint, one window at a
//! time, and moves the checkpoint forward as batches are observed.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, instrument, warn};

use super::poll::BatchFetcher;
use crate::WorkItem;
use crate::storage::{BatchFilter, CheckpointStore, StoreResult, WorkItemStore};

/// Checkpoint after a successful query
///
/// - non-empty batch: the newest item timestamp (never below `current`)
/// - empty batch: the window end, once it lies more than `late_buffer` in
///   the past
pub fn next_checkpoint(
    current: Option<DateTime<Utc>>,
    window: Duration,
    batch_max: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    late_buffer: Duration,
) -> Option<DateTime<Utc>> {
    match (current, batch_max) {
        (Some(current), Some(max)) => Some(current.max(max)),
        (None, Some(max)) => Some(max),
        (Some(current), None) => {
            let window_end = current + window;
            if window_end < now - late_buffer {
                Some(window_end)
            } else {
                Some(current)
            }
        }
        (None, None) => None,
    }
}

pub struct SlidingWindowFetcher {
    name: String,
    stream: String,
    items: Arc<dyn WorkItemStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    checkpoint: Option<DateTime<Utc>>,
    window: Duration,
    late_buffer: Duration,

    /// The last advance could not be written
    unsaved: bool,
}

impl SlidingWindowFetcher {
    /// Create a fetcher resuming from the stored checkpoint of `name`
    #[instrument(skip(items, checkpoints))]
    pub async fn load(
        name: &str,
        stream: &str,
        items: Arc<dyn WorkItemStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        window: Duration,
        late_buffer: Duration,
    ) -> StoreResult<Self> {
        let checkpoint = checkpoints.read_checkpoint(name).await?;
        match checkpoint {
            Some(at) => info!("resuming {name} from checkpoint {at}"),
            None => info!("no checkpoint for {name}, starting from the beginning"),
        }

        Ok(Self {
            name: name.to_string(),
            stream: stream.to_string(),
            items,
            checkpoints,
            checkpoint,
            window,
            late_buffer,
            unsaved: false,
        })
    }

    fn filter(&self) -> BatchFilter {
        match self.checkpoint {
            Some(from) => BatchFilter::stream(&self.stream).window(from, from + self.window),
            None => BatchFilter::stream(&self.stream),
        }
    }
}

#[async_trait]
impl BatchFetcher for SlidingWindowFetcher {
    async fn fetch_batch(&self, _now: DateTime<Utc>) -> StoreResult<Vec<WorkItem>> {
        self.items.fetch_batch(&self.filter()).await
    }

    async fn fetch_by_id(&self, id: &str) -> StoreResult<Option<WorkItem>> {
        self.items.fetch_by_id(id).await
    }

    async fn batch_fetched(&mut self, batch: &[WorkItem], now: DateTime<Utc>) {
        let batch_max = batch.iter().map(|item| item.timestamp).max();
        let next = next_checkpoint(self.checkpoint, self.window, batch_max, now, self.late_buffer);

        let advanced = next != self.checkpoint;
        if !advanced && !self.unsaved {
            return;
        }
        self.checkpoint = next;

        let Some(at) = next else {
            return;
        };
        if advanced {
            debug!("{}: checkpoint advanced to {at}", self.name);
        }
        match self.checkpoints.write_checkpoint(&self.name, at).await {
            Ok(()) => self.unsaved = false,
            Err(e) => {
                warn!("{}: failed to persist checkpoint {at}: {e}", self.name);
                self.unsaved = true;
            }
        }
    }

    fn checkpoint(&self) -> Option<DateTime<Utc>> {
        self.checkpoint
    }
}
