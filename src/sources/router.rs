//! Item handlers that fan items out to the per-category channels

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{trace, warn};

use super::poll::{AckHandle, Disposition, ItemHandler};
use crate::{Category, Visibility, WorkItem};

/// An item on its way to a category stage
///
/// The stage calls `acker.fail(&item.id)` when it cannot forward the item.
#[derive(Debug)]
pub struct RoutedItem {
    pub category: Category,
    pub item: WorkItem,
    pub acker: AckHandle,
}

/// Lookup table from category to its downstream channel
#[derive(Debug, Clone, Default)]
pub struct CategoryRoutes {
    senders: HashMap<Category, mpsc::Sender<RoutedItem>>,
}

impl CategoryRoutes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, category: Category, sender: mpsc::Sender<RoutedItem>) {
        self.senders.insert(category, sender);
    }

    pub fn contains(&self, category: Category) -> bool {
        self.senders.contains_key(&category)
    }

    /// Hand the item to its category channel
    ///
    /// A missing or closed channel fails the item so it is retried.
    pub async fn route(&self, category: Category, item: WorkItem, acker: &AckHandle) -> Disposition {
        let Some(sender) = self.senders.get(&category) else {
            warn!("no channel for category {category}, failing item {}", item.id);
            return Disposition::Failed;
        };

        let routed = RoutedItem {
            category,
            item,
            acker: acker.clone(),
        };
        match sender.send(routed).await {
            Ok(()) => Disposition::Acked,
            Err(mpsc::error::SendError(routed)) => {
                warn!("{category} channel closed, failing item {}", routed.item.id);
                Disposition::Failed
            }
        }
    }
}

/// Routes events by their classification
pub struct EventRouter {
    routes: CategoryRoutes,
}

impl EventRouter {
    pub fn new(routes: CategoryRoutes) -> Self {
        Self { routes }
    }
}

#[async_trait]
impl ItemHandler for EventRouter {
    async fn handle(&self, item: WorkItem, acker: &AckHandle, _now: DateTime<Utc>) -> Disposition {
        // private items are never rolled up, whatever their classification
        if item.visibility == Visibility::Private {
            trace!("skipping private item {}", item.id);
            return Disposition::Acked;
        }

        let category = item
            .classification
            .as_deref()
            .and_then(|c| c.parse::<Category>().ok());

        let Some(category) = category else {
            warn!(
                "dropping item {} without a known classification ({:?})",
                item.id, item.classification
            );
            return Disposition::Dropped;
        };

        self.routes.route(category, item, acker).await
    }
}

/// Routes resource snapshots, stamped with the time they were observed
pub struct SnapshotForwarder {
    routes: CategoryRoutes,
}

impl SnapshotForwarder {
    pub fn new(routes: CategoryRoutes) -> Self {
        Self { routes }
    }
}

#[async_trait]
impl ItemHandler for SnapshotForwarder {
    async fn handle(&self, mut item: WorkItem, acker: &AckHandle, now: DateTime<Utc>) -> Disposition {
        item.timestamp = now;
        self.routes.route(Category::Snapshot, item, acker).await
    }
}
