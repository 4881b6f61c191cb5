//! Refresh worker and its bounded pool

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Duration;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::providers::{ProviderRegistry, RefreshError};
use crate::ManagedResource;
use crate::alerts::AlertNotifier;
use crate::storage::{ResourceStore, ResourceUpdate, StoreError, StoreResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed,

    /// The resource disappeared before or during the refresh
    Deleted,

    /// No provider registered for the resource type
    Unsupported,

    /// Marked broken, alert sent
    Unauthorized,

    Failed { failed_count: u32, sleeping: bool },
}

#[derive(Debug, Default)]
pub struct RefreshCounters {
    pub started: AtomicU64,
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
    pub unauthorized: AtomicU64,
    pub store_errors: AtomicU64,
    pub alert_failures: AtomicU64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RefreshStats {
    pub started: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub unauthorized: u64,
    pub store_errors: u64,
    pub alert_failures: u64,
}

impl RefreshCounters {
    pub fn snapshot(&self) -> RefreshStats {
        RefreshStats {
            started: self.started.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            unauthorized: self.unauthorized.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
            alert_failures: self.alert_failures.load(Ordering::Relaxed),
        }
    }
}

/// Everything a refresh worker needs, shared by all workers
pub struct RefreshContext {
    pub store: Arc<dyn ResourceStore>,
    pub registry: Arc<ProviderRegistry>,
    pub notifier: Arc<dyn AlertNotifier>,
    pub max_failed_count: u32,
    pub broken_sleep: Duration,
    pub counters: RefreshCounters,
}

impl RefreshContext {
    /// Refresh a resource claimed by the scheduler and record the result
    ///
    /// The resource must already be marked in progress, see
    /// [`crate::storage::ResourceStore::claim_resource`].
    #[instrument(skip(self, resource), fields(id = %resource.id))]
    pub async fn refresh_resource(&self, resource: ManagedResource) -> StoreResult<RefreshOutcome> {
        let id = resource.id.as_str();
        let Some(provider) = self.registry.get(&resource.resource_type) else {
            warn!("no provider for resource type {}", resource.resource_type);
            return match self.store.update_resource(id, &ResourceUpdate::released()).await {
                Ok(_) | Err(StoreError::NotFound(_)) => Ok(RefreshOutcome::Unsupported),
                Err(e) => Err(e),
            };
        };
        self.counters.started.fetch_add(1, Ordering::Relaxed);

        let result = provider.executor.refresh(&resource).await;
        let update = match &result {
            Ok(()) => ResourceUpdate::polling_succeeded(),
            Err(RefreshError::Auth(message)) => ResourceUpdate::polling_unauthorized(message),
            Err(RefreshError::Other(message)) => ResourceUpdate::polling_failed(message),
        };
        let stored = match self.store.update_resource(id, &update).await {
            Ok(stored) => stored,
            Err(StoreError::NotFound(_)) => {
                debug!("resource {id} was deleted during its refresh");
                return Ok(RefreshOutcome::Deleted);
            }
            Err(e) => return Err(e),
        };

        let outcome = match result {
            Ok(()) => {
                self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                debug!("refreshed {id}");
                RefreshOutcome::Refreshed
            }
            Err(RefreshError::Auth(message)) => {
                self.counters.unauthorized.fetch_add(1, Ordering::Relaxed);
                warn!("resource {id} rejected its credentials, marking it broken: {message}");

                if let Err(e) = self.notifier.notify_broken(&stored).await {
                    error!("failed to notify about broken resource {id}: {e:#}");
                    self.counters.alert_failures.fetch_add(1, Ordering::Relaxed);
                }
                RefreshOutcome::Unauthorized
            }
            Err(RefreshError::Other(message)) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);

                let failed_count = stored.failed_count;
                let sleeping = failed_count > self.max_failed_count;
                if sleeping {
                    info!(
                        "resource {id} failed {failed_count} times, sleeping for {}s",
                        self.broken_sleep.num_seconds()
                    );
                } else {
                    warn!("refresh of {id} failed ({failed_count}): {message}");
                }
                RefreshOutcome::Failed {
                    failed_count,
                    sleeping,
                }
            }
        };

        Ok(outcome)
    }
}

/// Runs refreshes as spawned tasks, at most `workers` at a time
#[derive(Clone)]
pub struct RefreshPool {
    context: Arc<RefreshContext>,
    permits: Arc<Semaphore>,
}

impl RefreshPool {
    pub fn new(context: RefreshContext, workers: usize) -> Self {
        Self {
            context: Arc::new(context),
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    pub fn context(&self) -> &RefreshContext {
        &self.context
    }

    /// Start the refresh of a claimed resource without waiting for it
    ///
    /// The claim stays in place while the task waits for a worker, so later
    /// ticks see the resource as in flight.
    pub fn dispatch(&self, resource: ManagedResource) -> JoinHandle<Option<RefreshOutcome>> {
        let context = self.context.clone();
        let permits = self.permits.clone();

        tokio::spawn(async move {
            let id = resource.id.clone();
            let Ok(_permit) = permits.acquire_owned().await else {
                warn!("refresh pool closed, dropping refresh of {id}");
                return None;
            };
            match context.refresh_resource(resource).await {
                Ok(outcome) => Some(outcome),
                Err(e) => {
                    error!("store error while refreshing {id}: {e}");
                    context.counters.store_errors.fetch_add(1, Ordering::Relaxed);
                    None
                }
            }
        })
    }
}
