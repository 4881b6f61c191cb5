//! MessageActor - Hands every emitted rollup to the message sink
//!
//! Subscribes to the rollup broadcast, so it sees all granularities in
//! parallel rather than only the coarsest one.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, trace, warn};

use crate::RollupRecord;
use crate::pipeline::PipelineCounters;

/// Downstream consumer of emitted rollups (message generation)
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn deliver(&self, record: &RollupRecord) -> anyhow::Result<()>;
}

/// Sink that only logs the rollups it receives
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMessageSink;

#[async_trait]
impl MessageSink for LogMessageSink {
    async fn deliver(&self, record: &RollupRecord) -> anyhow::Result<()> {
        info!(
            key = %record.key,
            granularity = %record.granularity,
            window_start = %record.window_start,
            count = record.stats.count,
            mean = ?record.stats.mean(),
            "rollup emitted"
        );
        Ok(())
    }
}

pub struct MessageActor {
    sink: Arc<dyn MessageSink>,
    rollup_rx: broadcast::Receiver<RollupRecord>,
    counters: Arc<PipelineCounters>,
}

impl MessageActor {
    pub fn new(
        sink: Arc<dyn MessageSink>,
        rollup_rx: broadcast::Receiver<RollupRecord>,
        counters: Arc<PipelineCounters>,
    ) -> Self {
        Self {
            sink,
            rollup_rx,
            counters,
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!("starting message actor");

        loop {
            match self.rollup_rx.recv().await {
                Ok(record) => {
                    trace!("delivering {} rollup for {}", record.granularity, record.key);
                    match self.sink.deliver(&record).await {
                        Ok(()) => self.counters.record_message(),
                        Err(e) => {
                            warn!("failed to deliver rollup for {}: {e:#}", record.key);
                            self.counters.record_message_failure();
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("message actor lagged, skipped {skipped} rollups");
                    self.counters.record_lagged(skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }

        debug!("rollup channel closed, message actor stopped");
    }
}
