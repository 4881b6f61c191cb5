//! Connection polling scheduler
//!
//! Every tick lists the managed resources, decides per resource whether a
//! refresh is needed ([`PollDecision`]), claims the selected ones in the
//! store and hands them to the [`RefreshPool`]. The tick never waits for a
//! refresh to finish. The claim sets `polling_in_progress` before the
//! refresh queues for a worker, which keeps refreshes of one resource
//! exclusive.

pub mod decision;
pub mod providers;
pub mod refresh;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, trace, warn};

pub use decision::{PollDecision, PollPolicy};
pub use providers::{
    HttpRefreshExecutor, NoopRefreshExecutor, Provider, ProviderRegistry, RefreshError,
    RefreshExecutor,
};
pub use refresh::{RefreshContext, RefreshOutcome, RefreshPool, RefreshStats};

use crate::ManagedResource;
use crate::storage::{PollingClaim, ResourceStore, StoreError};

/// Result of one tick
#[derive(Debug, Default)]
pub struct TickReport {
    pub selected: Vec<(String, PollDecision)>,

    /// Dispatched refreshes, for callers that want to wait on them
    pub handles: Vec<JoinHandle<Option<RefreshOutcome>>>,
}

impl TickReport {
    pub fn selected_ids(&self) -> Vec<&str> {
        self.selected.iter().map(|(id, _)| id.as_str()).collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub enabled: bool,
    pub ticks: u64,
    pub dispatched: u64,
    pub list_failures: u64,
    pub skipped_push: u64,
    pub skipped_unknown: u64,
    pub skipped_broken: u64,

    /// Selected, but another refresh claimed the resource first
    pub claims_lost: u64,
    pub claim_failures: u64,
    pub refresh: RefreshStats,
}

pub struct ConnectionScheduler {
    store: Arc<dyn ResourceStore>,
    registry: Arc<ProviderRegistry>,
    policy: PollPolicy,
    pool: RefreshPool,
    stats: SchedulerStats,
}

impl ConnectionScheduler {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        registry: Arc<ProviderRegistry>,
        policy: PollPolicy,
        pool: RefreshPool,
    ) -> Self {
        Self {
            store,
            registry,
            stats: SchedulerStats {
                enabled: policy.enabled,
                ..Default::default()
            },
            policy,
            pool,
        }
    }

    pub fn policy(&self) -> &PollPolicy {
        &self.policy
    }

    /// Pick the resources needing a refresh, in listing order, up to the cap
    pub fn select(
        &mut self,
        resources: &[ManagedResource],
        now: DateTime<Utc>,
    ) -> Vec<(String, PollDecision)> {
        let mut selected = vec![];
        for resource in resources {
            if selected.len() >= self.policy.batch_size {
                trace!("batch size {} reached", self.policy.batch_size);
                break;
            }

            let Some(provider) = self.registry.get(&resource.resource_type) else {
                warn!(
                    "skipping {}: unknown resource type {}",
                    resource.id, resource.resource_type
                );
                self.stats.skipped_unknown += 1;
                continue;
            };
            if provider.push {
                self.stats.skipped_push += 1;
                continue;
            }

            let decision = PollDecision::evaluate(resource, now, provider.interval, &self.policy);
            if decision == PollDecision::Broken {
                self.stats.skipped_broken += 1;
            }
            if decision.needs_refresh() {
                trace!("{} selected: {decision:?}", resource.id);
                selected.push((resource.id.clone(), decision));
            }
        }
        selected
    }

    /// Run one scheduling pass
    #[instrument(skip(self))]
    pub async fn tick(&mut self, now: DateTime<Utc>) -> TickReport {
        if !self.policy.enabled {
            return TickReport::default();
        }
        self.stats.ticks += 1;

        let resources = match self.store.list_resources().await {
            Ok(resources) => resources,
            Err(e) => {
                warn!("failed to list resources, skipping tick: {e}");
                self.stats.list_failures += 1;
                return TickReport::default();
            }
        };

        let mut report = TickReport::default();
        for (id, decision) in self.select(&resources, now) {
            let Some(seen) = resources.iter().find(|r| r.id == id) else {
                continue;
            };
            let claimed = match self.store.claim_resource(&id, &PollingClaim::new(seen, now)).await {
                Ok(Some(claimed)) => claimed,
                Ok(None) => {
                    debug!("{id} was claimed by another refresh");
                    self.stats.claims_lost += 1;
                    continue;
                }
                Err(StoreError::NotFound(_)) => {
                    debug!("{id} was deleted before its refresh");
                    continue;
                }
                Err(e) => {
                    warn!("failed to claim {id}: {e}");
                    self.stats.claim_failures += 1;
                    continue;
                }
            };
            report.handles.push(self.pool.dispatch(claimed));
            report.selected.push((id, decision));
        }
        self.stats.dispatched += report.selected.len() as u64;

        if !report.selected.is_empty() {
            debug!("dispatched {} of {} resources", report.selected.len(), resources.len());
        }
        report
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            refresh: self.pool.context().counters.snapshot(),
            ..self.stats.clone()
        }
    }
}
