use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use rollwatch::{
    actors::{
        messenger::LogMessageSink, scheduler::SchedulerHandle, source::SourceHandle,
    },
    alerts::{AlertNotifier, LogNotifier, WebhookNotifier},
    config::{AlertConfig, Config, StorageConfig, read_config_file},
    pipeline::{Pipeline, admin_channel},
    scheduler::{ConnectionScheduler, ProviderRegistry, RefreshContext, RefreshPool},
    sources::{EventRouter, PollSource, SlidingWindowFetcher, SnapshotForwarder, StoreFetcher},
    storage::{CheckpointStore, MemoryStore, ResourceStore, RollupSink, WorkItemStore},
    util::{Clock, SystemClock, get_api_addr},
};
use tracing::{debug, info, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: String,
}

fn init() {
    let filter = filter::Targets::new().with_targets(vec![
        ("rollwatch", LevelFilter::DEBUG),
        ("rollwatch_hub", LevelFilter::TRACE),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

/// The four store roles, all backed by the same configured store
struct Stores {
    resources: Arc<dyn ResourceStore>,
    items: Arc<dyn WorkItemStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    rollups: Arc<dyn RollupSink>,
}

impl Stores {
    fn from_store<S>(store: Arc<S>) -> Self
    where
        S: ResourceStore + WorkItemStore + CheckpointStore + RollupSink + 'static,
    {
        Self {
            resources: store.clone(),
            items: store.clone(),
            checkpoints: store.clone(),
            rollups: store,
        }
    }
}

async fn open_stores(config: &Config) -> anyhow::Result<Stores> {
    match &config.storage {
        #[cfg(feature = "storage-sqlite")]
        Some(StorageConfig::Sqlite { path }) => {
            let store = rollwatch::storage::sqlite::SqliteStore::new(path)
                .await
                .context("failed to open SQLite store")?;
            for resource in &config.resources {
                store
                    .insert_resource(resource)
                    .await
                    .with_context(|| format!("failed to seed resource {}", resource.id))?;
            }
            Ok(Stores::from_store(Arc::new(store)))
        }
        #[cfg(not(feature = "storage-sqlite"))]
        Some(StorageConfig::Sqlite { .. }) => {
            anyhow::bail!("SQLite storage requested but the storage-sqlite feature is disabled")
        }
        Some(StorageConfig::None) | None => {
            info!("using in-memory storage");
            let store = MemoryStore::with_resources(config.resources.clone());
            Ok(Stores::from_store(Arc::new(store)))
        }
    }
}

fn notifier(config: &Config) -> Arc<dyn AlertNotifier> {
    match &config.alerts {
        Some(AlertConfig::Webhook { url }) => Arc::new(WebhookNotifier::new(url.clone())),
        Some(AlertConfig::Log) | None => Arc::new(LogNotifier),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init();
    dotenv::dotenv().ok();
    let args = Args::parse();
    trace!("started with args: {args:?}");

    let config = read_config_file(&args.file)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let stores = open_stores(&config).await?;

    let (admin, admin_rx) = admin_channel(32);
    let pipeline = Pipeline::spawn(
        &config.pipeline,
        clock.clone(),
        stores.rollups.clone(),
        Arc::new(LogMessageSink),
        admin_rx,
    );

    let mut sources = Vec::new();

    let events = &config.sources.events;
    if events.enabled {
        let fetcher = SlidingWindowFetcher::load(
            &events.name,
            &events.stream,
            stores.items.clone(),
            stores.checkpoints.clone(),
            events.window(),
            events.late_buffer(),
        )
        .await
        .context("failed to load the event source checkpoint")?;
        let source = PollSource::open(
            events.name.clone(),
            fetcher,
            EventRouter::new(pipeline.routes()),
            events.quiet_duration(),
            events.fetch_timeout(),
        );
        sources.push(SourceHandle::spawn(source, clock.clone(), events.poll_delay()));
    }

    let snapshots = &config.sources.snapshots;
    if snapshots.enabled {
        let fetcher = StoreFetcher::new(snapshots.stream.clone(), stores.items.clone())
            .with_limit(snapshots.batch_limit);
        let source = PollSource::open(
            snapshots.name.clone(),
            fetcher,
            SnapshotForwarder::new(pipeline.routes()),
            snapshots.quiet_duration(),
            snapshots.fetch_timeout(),
        );
        sources.push(SourceHandle::spawn(source, clock.clone(), snapshots.poll_delay()));
    }

    let registry = Arc::new(ProviderRegistry::from_config(&config.providers)?);
    let policy = config.scheduler.policy();
    let context = RefreshContext {
        store: stores.resources.clone(),
        registry: registry.clone(),
        notifier: notifier(&config),
        max_failed_count: policy.max_failed_count,
        broken_sleep: policy.broken_sleep,
        counters: Default::default(),
    };
    let pool = RefreshPool::new(context, config.scheduler.workers);
    let scheduler = ConnectionScheduler::new(stores.resources.clone(), registry, policy, pool);
    let scheduler = SchedulerHandle::spawn(scheduler, clock.clone(), config.scheduler.tick_interval());

    #[cfg(feature = "api")]
    if config.api.enabled {
        let state = rollwatch::api::ApiState::new(admin.clone(), pipeline.persistence(), pipeline.counters())
            .with_sources(sources.clone())
            .with_scheduler(scheduler.clone());
        let addr = rollwatch::api::spawn_api_server(
            get_api_addr(config.api.addr),
            config.api.token.clone(),
            state,
        )
        .await
        .context("failed to start API server")?;
        debug!("API bound to {addr}");
    }
    #[cfg(not(feature = "api"))]
    let _ = (&admin, get_api_addr(config.api.addr));

    info!(
        "hub running with {} sources and {} resource providers",
        sources.len(),
        config.providers.len()
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down");

    if let Err(e) = scheduler.shutdown().await {
        warn!("scheduler shutdown failed: {e:#}");
    }
    for source in &sources {
        if let Err(e) = source.shutdown().await {
            warn!("source {} shutdown failed: {e:#}", source.name);
        }
    }
    pipeline.shutdown().await?;

    Ok(())
}
