//! In-memory store (no persistence)
//!
//! Implements every store trait on top of `RwLock`-guarded collections.
//! It's useful for:
//! - Testing without database dependencies
//! - Running the hub with `"storage": { "backend": "none" }`
//!
//! Faults can be injected per operation family to exercise the error paths
//! of sources, the scheduler and the persistence stage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, trace};

use super::backend::{
    BatchFilter, CheckpointStore, PollingClaim, ResourceStore, ResourceUpdate, RollupQuery,
    RollupSink, WorkItemStore,
};
use super::error::{StoreError, StoreResult};
use crate::{ManagedResource, RollupRecord, WorkItem};

#[derive(Debug, Default)]
struct Faults {
    list: AtomicBool,
    fetch: AtomicBool,
    save: AtomicBool,
}

/// In-memory implementation of all store traits
#[derive(Debug, Default)]
pub struct MemoryStore {
    /// Insertion order is the listing order
    resources: RwLock<Vec<ManagedResource>>,
    items: RwLock<Vec<WorkItem>>,
    checkpoints: RwLock<HashMap<String, DateTime<Utc>>>,
    rollups: RwLock<Vec<RollupRecord>>,
    faults: Faults,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resources(resources: Vec<ManagedResource>) -> Self {
        Self {
            resources: RwLock::new(resources),
            ..Default::default()
        }
    }

    /// Register a resource, replacing one with the same id
    pub async fn insert_resource(&self, resource: ManagedResource) {
        let mut resources = self.resources.write().await;
        match resources.iter_mut().find(|r| r.id == resource.id) {
            Some(existing) => *existing = resource,
            None => resources.push(resource),
        }
    }

    pub async fn insert_items(&self, new_items: impl IntoIterator<Item = WorkItem>) {
        let mut items = self.items.write().await;
        for item in new_items {
            match items.iter_mut().find(|i| i.id == item.id) {
                Some(existing) => *existing = item,
                None => items.push(item),
            }
        }
    }

    pub async fn remove_resource(&self, id: &str) -> bool {
        let mut resources = self.resources.write().await;
        let before = resources.len();
        resources.retain(|r| r.id != id);
        resources.len() != before
    }

    /// Delete an item upstream
    pub async fn remove_item(&self, id: &str) -> bool {
        let mut items = self.items.write().await;
        let before = items.len();
        items.retain(|i| i.id != id);
        items.len() != before
    }

    pub async fn rollups(&self) -> Vec<RollupRecord> {
        self.rollups.read().await.clone()
    }

    pub fn fail_list(&self, fail: bool) {
        self.faults.list.store(fail, Ordering::SeqCst);
    }

    pub fn fail_fetch(&self, fail: bool) {
        self.faults.fetch.store(fail, Ordering::SeqCst);
    }

    pub fn fail_save(&self, fail: bool) {
        self.faults.save.store(fail, Ordering::SeqCst);
    }

    fn check(flag: &AtomicBool, operation: &str) -> StoreResult<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!("injected {operation} failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn list_resources(&self) -> StoreResult<Vec<ManagedResource>> {
        Self::check(&self.faults.list, "list")?;
        Ok(self.resources.read().await.clone())
    }

    async fn get_resource(&self, id: &str) -> StoreResult<Option<ManagedResource>> {
        Ok(self
            .resources
            .read()
            .await
            .iter()
            .find(|r| r.id == id)
            .cloned())
    }

    async fn update_resource(
        &self,
        id: &str,
        update: &ResourceUpdate,
    ) -> StoreResult<ManagedResource> {
        let mut resources = self.resources.write().await;
        let resource = resources
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("resource {id}")))?;
        update.apply(resource);
        trace!("updated resource {id}: {update:?}");
        Ok(resource.clone())
    }

    async fn claim_resource(
        &self,
        id: &str,
        claim: &PollingClaim,
    ) -> StoreResult<Option<ManagedResource>> {
        // check and write under one lock
        let mut resources = self.resources.write().await;
        let resource = resources
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("resource {id}")))?;
        if !claim.holds(resource) {
            trace!("claim on {id} lost");
            return Ok(None);
        }
        claim.update().apply(resource);
        Ok(Some(resource.clone()))
    }
}

#[async_trait]
impl WorkItemStore for MemoryStore {
    async fn fetch_batch(&self, filter: &BatchFilter) -> StoreResult<Vec<WorkItem>> {
        Self::check(&self.faults.fetch, "fetch")?;

        let mut batch: Vec<WorkItem> = self
            .items
            .read()
            .await
            .iter()
            .filter(|item| filter.matches(item))
            .cloned()
            .collect();
        batch.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            batch.truncate(limit);
        }

        debug!("in-memory fetch for {} returned {} items", filter.stream, batch.len());
        Ok(batch)
    }

    async fn fetch_by_id(&self, id: &str) -> StoreResult<Option<WorkItem>> {
        Self::check(&self.faults.fetch, "fetch")?;
        Ok(self.items.read().await.iter().find(|i| i.id == id).cloned())
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn read_checkpoint(&self, source: &str) -> StoreResult<Option<DateTime<Utc>>> {
        Ok(self.checkpoints.read().await.get(source).copied())
    }

    async fn write_checkpoint(&self, source: &str, at: DateTime<Utc>) -> StoreResult<()> {
        let mut checkpoints = self.checkpoints.write().await;
        let entry = checkpoints.entry(source.to_string()).or_insert(at);
        if at > *entry {
            *entry = at;
        }
        Ok(())
    }
}

#[async_trait]
impl RollupSink for MemoryStore {
    async fn save(&self, record: &RollupRecord) -> StoreResult<()> {
        Self::check(&self.faults.save, "save")?;

        let mut rollups = self.rollups.write().await;
        match rollups.iter_mut().find(|r| {
            r.key == record.key
                && r.granularity == record.granularity
                && r.window_start == record.window_start
        }) {
            Some(existing) => *existing = record.clone(),
            None => rollups.push(record.clone()),
        }
        Ok(())
    }

    async fn query_range(&self, query: &RollupQuery) -> StoreResult<Vec<RollupRecord>> {
        let mut records: Vec<RollupRecord> = self
            .rollups
            .read()
            .await
            .iter()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        records.sort_by_key(|r| r.window_start);
        if let Some(limit) = query.limit {
            records.truncate(limit);
        }
        Ok(records)
    }
}
