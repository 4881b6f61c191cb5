//! PersistenceActor - Writes emitted rollups to the rollup sink
//!
//! ## Batching Strategy
//!
//! Rollups of every granularity arrive on the rollup broadcast and are
//! buffered before they are written:
//! - **Size trigger**: Flush after 100 records (configurable)
//! - **Time trigger**: Flush after 5 seconds (configurable)
//! - **Shutdown**: Final flush before the actor stops
//!
//! A failed write is logged and counted, and the batch is dropped. The
//! pipeline never waits on persistence.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time;
use tracing::{debug, error, instrument, trace, warn};

use crate::RollupRecord;
use crate::pipeline::PipelineCounters;
use crate::storage::{RollupQuery, RollupSink};

use super::messages::{PersistenceCommand, PersistenceStats};

pub struct PersistenceActor {
    sink: Arc<dyn RollupSink>,
    buffer: Vec<RollupRecord>,
    batch_size: usize,
    flush_interval: Duration,
    command_rx: mpsc::Receiver<PersistenceCommand>,
    rollup_rx: broadcast::Receiver<RollupRecord>,
    counters: Arc<PipelineCounters>,
    flush_count: u64,
    persisted: u64,
    failed: u64,
}

impl PersistenceActor {
    pub fn new(
        sink: Arc<dyn RollupSink>,
        batch_size: usize,
        flush_interval: Duration,
        command_rx: mpsc::Receiver<PersistenceCommand>,
        rollup_rx: broadcast::Receiver<RollupRecord>,
        counters: Arc<PipelineCounters>,
    ) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            sink,
            buffer: Vec::with_capacity(batch_size),
            batch_size,
            flush_interval,
            command_rx,
            rollup_rx,
            counters,
            flush_count: 0,
            persisted: 0,
            failed: 0,
        }
    }

    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!(
            "starting persistence actor (batch size {}, flush every {:?})",
            self.batch_size, self.flush_interval
        );

        let mut flush_interval = time::interval(self.flush_interval);
        let mut shutdown_ack: Option<oneshot::Sender<()>> = None;

        loop {
            tokio::select! {
                // records already broadcast are buffered before any command
                biased;

                result = self.rollup_rx.recv() => {
                    match result {
                        Ok(record) => self.store(record).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("persistence actor lagged, skipped {skipped} rollups");
                            self.counters.record_lagged(skipped);
                            self.failed += skipped;
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("rollup channel closed, shutting down");
                            break;
                        }
                    }
                }

                _ = flush_interval.tick() => {
                    if !self.buffer.is_empty() {
                        trace!("time-based flush triggered ({} rollups)", self.buffer.len());
                        let _ = self.flush_batch().await;
                    }
                }

                Some(cmd) = self.command_rx.recv() => {
                    if let Some(respond_to) = self.handle_command(cmd).await {
                        shutdown_ack = Some(respond_to);
                        break;
                    }
                }

                else => {
                    warn!("command channel closed, shutting down");
                    break;
                }
            }
        }

        if !self.buffer.is_empty() {
            debug!("final flush before shutdown ({} rollups)", self.buffer.len());
            let _ = self.flush_batch().await;
        }
        if let Some(respond_to) = shutdown_ack {
            let _ = respond_to.send(());
        }

        debug!("persistence actor stopped");
    }

    async fn store(&mut self, record: RollupRecord) {
        trace!(
            "buffering {} rollup for {} at {}",
            record.granularity, record.key, record.window_start
        );
        self.buffer.push(record);

        if self.buffer.len() >= self.batch_size {
            trace!("size-based flush triggered ({} rollups)", self.buffer.len());
            let _ = self.flush_batch().await;
        }
    }

    async fn flush_batch(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let batch: Vec<RollupRecord> = self.buffer.drain(..).collect();
        let batch_size = batch.len() as u64;
        debug!("flushing {batch_size} rollups to the sink");

        match self.sink.save_batch(batch).await {
            Ok(()) => {
                self.flush_count += 1;
                self.persisted += batch_size;
                self.counters.record_persisted(batch_size);
                trace!("flush #{} complete ({batch_size} rollups)", self.flush_count);
                Ok(())
            }
            Err(e) => {
                error!("failed to persist {batch_size} rollups: {e}");
                self.failed += batch_size;
                self.counters.record_persistence_failure(batch_size);
                Err(e).context("failed to persist rollups")
            }
        }
    }

    /// Returns the acknowledgement channel once a shutdown was requested
    async fn handle_command(&mut self, cmd: PersistenceCommand) -> Option<oneshot::Sender<()>> {
        match cmd {
            PersistenceCommand::Flush { respond_to } => {
                debug!("manual flush requested");
                let result = self.flush_batch().await;
                let _ = respond_to.send(result);
            }
            PersistenceCommand::GetStats { respond_to } => {
                let _ = respond_to.send(PersistenceStats {
                    buffered: self.buffer.len(),
                    flush_count: self.flush_count,
                    persisted: self.persisted,
                    failed: self.failed,
                });
            }
            PersistenceCommand::QueryRange { query, respond_to } => {
                let result = self.sink.query_range(&query).await.map_err(Into::into);
                let _ = respond_to.send(result);
            }
            PersistenceCommand::Shutdown { respond_to } => {
                debug!("received shutdown command");
                return Some(respond_to);
            }
        }
        None
    }
}

/// Handle for controlling the PersistenceActor
#[derive(Clone)]
pub struct PersistenceHandle {
    sender: mpsc::Sender<PersistenceCommand>,
}

impl PersistenceHandle {
    pub fn spawn(
        sink: Arc<dyn RollupSink>,
        batch_size: usize,
        flush_interval: Duration,
        rollup_rx: broadcast::Receiver<RollupRecord>,
        counters: Arc<PipelineCounters>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let actor =
            PersistenceActor::new(sink, batch_size, flush_interval, cmd_rx, rollup_rx, counters);
        tokio::spawn(actor.run());
        Self { sender: cmd_tx }
    }

    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PersistenceCommand::Flush { respond_to: tx })
            .await
            .context("failed to send Flush command")?;
        rx.await.context("failed to receive flush result")?
    }

    pub async fn stats(&self) -> Result<PersistenceStats> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PersistenceCommand::GetStats { respond_to: tx })
            .await
            .context("failed to send GetStats command")?;
        rx.await.context("failed to receive stats")
    }

    pub async fn query_range(&self, query: RollupQuery) -> Result<Vec<RollupRecord>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PersistenceCommand::QueryRange {
                query,
                respond_to: tx,
            })
            .await
            .context("failed to send QueryRange command")?;
        rx.await.context("failed to receive query result")?
    }

    /// Flush buffered rollups and stop the actor
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PersistenceCommand::Shutdown { respond_to: tx })
            .await
            .context("failed to send Shutdown command")?;
        rx.await.context("persistence actor stopped without acknowledging")
    }
}
