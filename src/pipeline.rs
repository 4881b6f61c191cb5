//! Wiring of the rollup cascade
//!
//! [`Pipeline::spawn`] starts one [`StageActor`] per (granularity, partition),
//! one [`CategoryActor`] per [`Category`], the persistence and message actors
//! on the rollup broadcast, and the admin dispatcher that serves
//! [`AdminCommand`]s. Records of one [`MetricKey`] always reach the same
//! partition of a granularity, see [`partition_for`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::actors::category::CategoryActor;
use crate::actors::messages::{AdminCommand, StageMessage, StateCounts};
use crate::actors::messenger::{MessageActor, MessageSink};
use crate::actors::stage::StageActor;
use crate::actors::storage::PersistenceHandle;
use crate::config::PipelineConfig;
use crate::rollup::{Granularity, KeyStateView, Observation, RollupStage, SetStateError, partition_for};
use crate::sources::CategoryRoutes;
use crate::storage::RollupSink;
use crate::util::Clock;
use crate::{Category, MetricKey, RollupRecord};

/// How long shutdown waits for the category actors to drain their channels
const CATEGORY_DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Counters shared by every actor of the pipeline
#[derive(Debug, Default)]
pub struct PipelineCounters {
    malformed: AtomicU64,
    late: AtomicU64,
    routing_failures: AtomicU64,
    emitted: [AtomicU64; 6],
    persisted: AtomicU64,
    persistence_failures: AtomicU64,
    messages: AtomicU64,
    message_failures: AtomicU64,
    lagged: AtomicU64,
}

impl PipelineCounters {
    pub fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_late(&self) {
        self.late.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_routing_failure(&self) {
        self.routing_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_emitted(&self, granularity: Granularity) {
        self.emitted[granularity.level() as usize - 1].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_persisted(&self, count: u64) {
        self.persisted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_persistence_failure(&self, count: u64) {
        self.persistence_failures.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_message(&self) {
        self.messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message_failure(&self) {
        self.message_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lagged(&self, skipped: u64) {
        self.lagged.fetch_add(skipped, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            malformed: self.malformed.load(Ordering::Relaxed),
            late: self.late.load(Ordering::Relaxed),
            routing_failures: self.routing_failures.load(Ordering::Relaxed),
            emitted: Granularity::ALL
                .iter()
                .zip(&self.emitted)
                .map(|(granularity, count)| (*granularity, count.load(Ordering::Relaxed)))
                .collect(),
            persisted: self.persisted.load(Ordering::Relaxed),
            persistence_failures: self.persistence_failures.load(Ordering::Relaxed),
            messages: self.messages.load(Ordering::Relaxed),
            message_failures: self.message_failures.load(Ordering::Relaxed),
            lagged: self.lagged.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStats {
    pub malformed: u64,
    pub late: u64,
    pub routing_failures: u64,
    pub emitted: BTreeMap<Granularity, u64>,
    pub persisted: u64,
    pub persistence_failures: u64,
    pub messages: u64,
    pub message_failures: u64,
    pub lagged: u64,
}

/// Sends observations of one granularity to the partition owning their key
#[derive(Debug, Clone)]
pub struct KeyedRouter {
    granularity: Granularity,
    partitions: Vec<mpsc::Sender<StageMessage>>,
}

impl KeyedRouter {
    pub fn new(granularity: Granularity, partitions: Vec<mpsc::Sender<StageMessage>>) -> Self {
        Self {
            granularity,
            partitions,
        }
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    pub fn partitions(&self) -> usize {
        self.partitions.len()
    }

    pub fn partition_of(&self, key: &MetricKey) -> usize {
        partition_for(key, self.partitions.len())
    }

    pub fn sender(&self, key: &MetricKey) -> &mpsc::Sender<StageMessage> {
        &self.partitions[self.partition_of(key)]
    }

    pub async fn observe(&self, obs: Observation) -> Result<()> {
        self.sender(&obs.key)
            .send(StageMessage::Observe(obs))
            .await
            .with_context(|| format!("{} stage is gone", self.granularity))
    }

    /// Pass a watermark to one partition
    ///
    /// Every granularity has the same partition count and keys map to the
    /// same index at each of them, so partition `i` only needs the watermark
    /// of partition `i` of its finer stage.
    pub async fn watermark(&self, partition: usize, at: DateTime<Utc>) -> Result<()> {
        let sender = self
            .partitions
            .get(partition)
            .ok_or_else(|| anyhow!("{} stage has no partition {partition}", self.granularity))?;
        sender
            .send(StageMessage::Watermark(at))
            .await
            .with_context(|| format!("{} stage is gone", self.granularity))
    }

    /// Send a request to the partition owning `key` and wait for the answer
    async fn ask<T>(
        &self,
        key: &MetricKey,
        make: impl FnOnce(oneshot::Sender<T>) -> StageMessage,
    ) -> Result<T> {
        ask(self.sender(key), make).await
    }

    /// Send the same request to every partition and collect the answers
    async fn ask_all<T>(&self, make: impl Fn(oneshot::Sender<T>) -> StageMessage) -> Result<Vec<T>> {
        join_all(self.partitions.iter().map(|sender| ask(sender, &make)))
            .await
            .into_iter()
            .collect()
    }
}

async fn ask<T>(
    sender: &mpsc::Sender<StageMessage>,
    make: impl FnOnce(oneshot::Sender<T>) -> StageMessage,
) -> Result<T> {
    let (tx, rx) = oneshot::channel();
    sender
        .send(make(tx))
        .await
        .context("failed to send stage request")?;
    rx.await.context("stage dropped the request")
}

/// Typed sender of the administrative surface
#[derive(Debug, Clone)]
pub struct AdminHandle {
    sender: mpsc::Sender<AdminCommand>,
}

/// Create the admin channel that is passed to [`Pipeline::spawn`]
pub fn admin_channel(capacity: usize) -> (AdminHandle, mpsc::Receiver<AdminCommand>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (AdminHandle { sender: tx }, rx)
}

impl AdminHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> AdminCommand) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(make(tx))
            .await
            .context("failed to send admin command")?;
        rx.await.context("pipeline dropped the admin command")
    }

    /// Emit and forget `key` at every granularity; returns the emitted bucket count
    pub async fn clear(&self, key: MetricKey) -> Result<usize> {
        self.request(|respond_to| AdminCommand::Clear { key, respond_to })
            .await
    }

    pub async fn clear_all(&self) -> Result<usize> {
        self.request(|respond_to| AdminCommand::ClearAll { respond_to })
            .await
    }

    pub async fn dump_state(&self, key: MetricKey) -> Result<Vec<KeyStateView>> {
        self.request(|respond_to| AdminCommand::DumpState { key, respond_to })
            .await
    }

    pub async fn count_states(&self) -> Result<StateCounts> {
        self.request(|respond_to| AdminCommand::CountStates { respond_to })
            .await
    }

    /// Overwrite one field of an open bucket
    ///
    /// A rejected write surfaces as a [`SetStateError`] inside the
    /// `anyhow::Error`, so callers can downcast it.
    pub async fn set_state(
        &self,
        key: MetricKey,
        granularity: Granularity,
        field: impl Into<String>,
        value: f64,
    ) -> Result<()> {
        let field = field.into();
        self.request(|respond_to| AdminCommand::SetState {
            key,
            granularity,
            field,
            value,
            respond_to,
        })
        .await?
        .map_err(anyhow::Error::from)
    }

    /// Run the timed flush on every stage now
    pub async fn flush(&self) -> Result<usize> {
        self.request(|respond_to| AdminCommand::Flush { respond_to })
            .await
    }
}

/// Serves [`AdminCommand`]s by fanning them out to the stage actors
struct AdminDispatcher {
    routers: Vec<KeyedRouter>,
    admin_rx: mpsc::Receiver<AdminCommand>,
}

impl AdminDispatcher {
    #[instrument(skip(self))]
    async fn run(mut self) {
        debug!("starting admin dispatcher");

        while let Some(cmd) = self.admin_rx.recv().await {
            if let Err(e) = self.handle(cmd).await {
                warn!("admin command failed: {e:#}");
            }
        }

        debug!("admin channel closed, dispatcher stopped");
    }

    fn router(&self, granularity: Granularity) -> Result<&KeyedRouter> {
        self.routers
            .iter()
            .find(|router| router.granularity() == granularity)
            .ok_or_else(|| anyhow!("no stage for granularity {granularity}"))
    }

    async fn handle(&self, cmd: AdminCommand) -> Result<()> {
        match cmd {
            AdminCommand::Clear { key, respond_to } => {
                // finest first, so a cleared bucket lands in the next stage before it is cleared
                let mut emitted = 0;
                for router in &self.routers {
                    let target = key.clone();
                    let cleared = router
                        .ask(&key, |respond_to| StageMessage::Clear {
                            key: target,
                            respond_to,
                        })
                        .await?;
                    if cleared {
                        emitted += 1;
                    }
                }
                info!("cleared {key}, emitted {emitted} buckets");
                let _ = respond_to.send(emitted);
            }
            AdminCommand::ClearAll { respond_to } => {
                let mut emitted = 0;
                for router in &self.routers {
                    let counts = router
                        .ask_all(|respond_to| StageMessage::ClearAll { respond_to })
                        .await?;
                    emitted += counts.iter().sum::<usize>();
                }
                info!("cleared all keys, emitted {emitted} buckets");
                let _ = respond_to.send(emitted);
            }
            AdminCommand::DumpState { key, respond_to } => {
                let mut views = Vec::new();
                for router in &self.routers {
                    let target = key.clone();
                    let view = router
                        .ask(&key, |respond_to| StageMessage::Dump {
                            key: target,
                            respond_to,
                        })
                        .await?;
                    views.extend(view);
                }
                let _ = respond_to.send(views);
            }
            AdminCommand::CountStates { respond_to } => {
                let mut counts = StateCounts::default();
                for router in &self.routers {
                    let per_partition = router
                        .ask_all(|respond_to| StageMessage::Count { respond_to })
                        .await?;
                    let count: usize = per_partition.iter().sum();
                    counts.per_granularity.insert(router.granularity(), count);
                    counts.total += count;
                }
                let _ = respond_to.send(counts);
            }
            AdminCommand::SetState {
                key,
                granularity,
                field,
                value,
                respond_to,
            } => {
                let router = self.router(granularity)?;
                let target = key.clone();
                let result = router
                    .ask(&key, |respond_to| StageMessage::SetField {
                        key: target,
                        field,
                        value,
                        respond_to,
                    })
                    .await?;
                let _ = respond_to.send(result);
            }
            AdminCommand::Flush { respond_to } => {
                let mut emitted = 0;
                for router in &self.routers {
                    let counts = router
                        .ask_all(|respond_to| StageMessage::Flush { respond_to })
                        .await?;
                    emitted += counts.iter().sum::<usize>();
                }
                debug!("admin flush emitted {emitted} buckets");
                let _ = respond_to.send(emitted);
            }
        }
        Ok(())
    }
}

pub struct Pipeline;

impl Pipeline {
    /// Start every actor of the cascade
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        config: &PipelineConfig,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn RollupSink>,
        message_sink: Arc<dyn MessageSink>,
        admin_rx: mpsc::Receiver<AdminCommand>,
    ) -> PipelineHandle {
        let partitions = config.partitions.max(1);
        let counters = Arc::new(PipelineCounters::default());
        let (rollup_tx, _) = broadcast::channel(config.broadcast_capacity.max(1));

        // subscribers must exist before the first record is emitted
        let persistence = PersistenceHandle::spawn(
            sink,
            config.persistence_batch_size,
            config.persistence_flush(),
            rollup_tx.subscribe(),
            counters.clone(),
        );
        let messenger =
            MessageActor::new(message_sink, rollup_tx.subscribe(), counters.clone()).spawn();

        let mut receivers = Vec::with_capacity(Granularity::ALL.len());
        let mut routers = Vec::with_capacity(Granularity::ALL.len());
        for granularity in Granularity::ALL {
            let (senders, rxs): (Vec<_>, Vec<_>) = (0..partitions)
                .map(|_| mpsc::channel(config.channel_capacity.max(1)))
                .unzip();
            routers.push(KeyedRouter::new(granularity, senders));
            receivers.push(rxs);
        }

        let mut stages = Vec::with_capacity(Granularity::ALL.len());
        for (level, rxs) in receivers.into_iter().enumerate() {
            let granularity = routers[level].granularity();
            let next: Vec<KeyedRouter> = routers
                .iter()
                .filter(|router| granularity.coarser().contains(&router.granularity()))
                .cloned()
                .collect();
            let tasks = rxs
                .into_iter()
                .enumerate()
                .map(|(partition, rx)| {
                    let actor = StageActor::new(
                        RollupStage::new(granularity),
                        partition,
                        rx,
                        next.clone(),
                        rollup_tx.clone(),
                        counters.clone(),
                        clock.clone(),
                        config.lateness(),
                        config.flush_interval(),
                    );
                    tokio::spawn(actor.run())
                })
                .collect::<Vec<_>>();
            stages.push(tasks);
        }

        let mut routes = CategoryRoutes::new();
        let mut categories = Vec::with_capacity(Category::ALL.len());
        for category in Category::ALL {
            let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
            routes.insert(category, tx);
            let actor = CategoryActor::new(category, rx, routers[0].clone(), counters.clone());
            categories.push(tokio::spawn(actor.run()));
        }

        let dispatcher = AdminDispatcher {
            routers: routers.clone(),
            admin_rx,
        };
        let admin = tokio::spawn(dispatcher.run());

        info!(
            "rollup pipeline started with {} granularities x {partitions} partitions",
            routers.len()
        );

        PipelineHandle {
            routes,
            routers,
            counters,
            rollup_tx,
            persistence,
            categories,
            stages,
            messenger,
            admin,
        }
    }
}

/// Owner of the running pipeline
pub struct PipelineHandle {
    routes: CategoryRoutes,
    routers: Vec<KeyedRouter>,
    counters: Arc<PipelineCounters>,
    rollup_tx: broadcast::Sender<RollupRecord>,
    persistence: PersistenceHandle,
    categories: Vec<JoinHandle<()>>,
    stages: Vec<Vec<JoinHandle<()>>>,
    messenger: JoinHandle<()>,
    admin: JoinHandle<()>,
}

impl PipelineHandle {
    /// Channels the sources route classified items into
    pub fn routes(&self) -> CategoryRoutes {
        self.routes.clone()
    }

    pub fn router(&self, granularity: Granularity) -> Option<&KeyedRouter> {
        self.routers
            .iter()
            .find(|router| router.granularity() == granularity)
    }

    pub fn counters(&self) -> Arc<PipelineCounters> {
        self.counters.clone()
    }

    pub fn stats(&self) -> PipelineStats {
        self.counters.snapshot()
    }

    /// Receive every rollup emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<RollupRecord> {
        self.rollup_tx.subscribe()
    }

    pub fn persistence(&self) -> PersistenceHandle {
        self.persistence.clone()
    }

    /// Drain the category actors, stop the stages finest first and flush
    /// the persistence buffer
    ///
    /// Items already routed to a category are rolled up before the stages
    /// stop. The category actors only finish once every clone of
    /// [`PipelineHandle::routes`] is gone, so stop the sources first. Buckets
    /// still open at the end are not emitted.
    #[instrument(skip(self))]
    pub async fn shutdown(self) -> Result<()> {
        info!("shutting down rollup pipeline");
        let PipelineHandle {
            routes,
            routers,
            persistence,
            categories,
            stages,
            messenger,
            admin,
            ..
        } = self;

        drop(routes);
        for mut task in categories {
            match timeout(CATEGORY_DRAIN_TIMEOUT, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("category task failed: {e}"),
                Err(_) => {
                    warn!("category actor still has open routes, aborting it");
                    task.abort();
                }
            }
        }

        for (router, tasks) in routers.iter().zip(stages) {
            for sender in &router.partitions {
                let _ = sender.send(StageMessage::Shutdown).await;
            }
            for task in tasks {
                if let Err(e) = task.await {
                    warn!("{} stage task failed: {e}", router.granularity());
                }
            }
        }

        let result = persistence.shutdown().await;
        messenger.abort();
        admin.abort();
        result
    }
}
