//! StageActor - Owns one partition of one granularity
//!
//! ## Message Flow
//!
//! ```text
//! Observe ───▶ RollupStage ─▶ closed bucket ─┬─▶ coarser granularities (keyed)
//! flush tick ─────┘  │                       └─▶ rollup broadcast
//!     ↑              └─▶ watermark ──────────────▶ coarser granularities
//!     └─── Admin messages (Clear, ClearAll, Dump, Count, SetField, Flush)
//! ```
//!
//! The seconds stage derives its watermark from the event times it accepts
//! ([`EventClock`]). Every other stage adopts the watermark its finer stage
//! forwards after the records it closed, at its next flush. Partition `i`
//! of a stage only ever talks to partition `i` of the next one, so records
//! always arrive before the watermark that closes their window.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::time::interval;
use tracing::{debug, instrument, trace, warn};

use crate::RollupRecord;
use crate::pipeline::{KeyedRouter, PipelineCounters};
use chrono::{DateTime, Utc};

use crate::rollup::{EventClock, Observation, ObserveError, RollupStage};
use crate::util::Clock;

use super::messages::StageMessage;

pub struct StageActor {
    stage: RollupStage,
    partition: usize,
    message_rx: mpsc::Receiver<StageMessage>,

    /// Routers of the granularities fed by this one
    next: Vec<KeyedRouter>,

    /// Only the head of the cascade keeps one
    event_clock: Option<EventClock>,

    /// Latest watermark forwarded by the finer stage, applied on flush
    pending_watermark: Option<DateTime<Utc>>,

    rollup_tx: broadcast::Sender<RollupRecord>,
    counters: Arc<PipelineCounters>,
    clock: Arc<dyn Clock>,
    flush_interval: Duration,
}

impl StageActor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stage: RollupStage,
        partition: usize,
        message_rx: mpsc::Receiver<StageMessage>,
        next: Vec<KeyedRouter>,
        rollup_tx: broadcast::Sender<RollupRecord>,
        counters: Arc<PipelineCounters>,
        clock: Arc<dyn Clock>,
        lateness: chrono::Duration,
        flush_interval: Duration,
    ) -> Self {
        let event_clock = stage
            .granularity()
            .finer()
            .is_none()
            .then(|| EventClock::new(lateness));
        Self {
            stage,
            partition,
            message_rx,
            next,
            event_clock,
            pending_watermark: None,
            rollup_tx,
            counters,
            clock,
            flush_interval,
        }
    }

    #[instrument(skip(self), fields(granularity = %self.stage.granularity(), partition = self.partition))]
    pub async fn run(mut self) {
        debug!("starting stage actor");

        let mut ticker = interval(self.flush_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.flush().await;
                }

                msg = self.message_rx.recv() => {
                    let Some(msg) = msg else {
                        debug!("stage channel closed, shutting down");
                        break;
                    };
                    if !self.handle(msg).await {
                        break;
                    }
                }
            }
        }

        debug!("stage actor stopped with {} keys", self.stage.len());
    }

    /// Returns false once the actor should stop
    async fn handle(&mut self, msg: StageMessage) -> bool {
        match msg {
            StageMessage::Observe(obs) => self.observe(obs).await,
            StageMessage::Watermark(watermark) => {
                if self.pending_watermark.is_none_or(|pending| pending < watermark) {
                    self.pending_watermark = Some(watermark);
                }
            }
            StageMessage::Clear { key, respond_to } => {
                let record = self.stage.clear(&key);
                let emitted = record.is_some();
                self.emit(record).await;
                let _ = respond_to.send(emitted);
            }
            StageMessage::ClearAll { respond_to } => {
                let records = self.stage.clear_all();
                let count = records.len();
                self.emit(records).await;
                let _ = respond_to.send(count);
            }
            StageMessage::Dump { key, respond_to } => {
                let _ = respond_to.send(self.stage.dump(&key));
            }
            StageMessage::Count { respond_to } => {
                let _ = respond_to.send(self.stage.len());
            }
            StageMessage::SetField {
                key,
                field,
                value,
                respond_to,
            } => {
                let _ = respond_to.send(self.stage.set_field(&key, &field, value));
            }
            StageMessage::Flush { respond_to } => {
                let count = self.flush().await;
                let _ = respond_to.send(count);
            }
            StageMessage::Shutdown => {
                debug!("received shutdown command");
                return false;
            }
        }
        true
    }

    async fn observe(&mut self, obs: Observation) {
        let key = obs.key.clone();
        let timestamp = obs.timestamp;
        let result = self.stage.observe(obs);
        if !matches!(result, Err(ObserveError::Malformed))
            && let Some(event_clock) = &mut self.event_clock
        {
            event_clock.saw(timestamp, self.clock.now());
        }

        match result {
            Ok(record) => self.emit(record).await,
            Err(ObserveError::Malformed) => {
                warn!("dropping malformed observation for {key}");
                self.counters.record_malformed();
            }
            Err(late @ (ObserveError::Late { .. } | ObserveError::Closed { .. })) => {
                debug!("dropping observation for {key}: {late}");
                self.counters.record_late();
            }
        }
    }

    /// Advance the watermark, emit what it closes and pass it on
    async fn flush(&mut self) -> usize {
        let target = match &self.event_clock {
            Some(event_clock) => event_clock.watermark(self.clock.now()),
            None => self.pending_watermark.take(),
        };
        let Some(target) = target else {
            return 0;
        };

        let before = self.stage.watermark();
        let records = self.stage.advance_watermark(target);
        let count = records.len();
        if count > 0 {
            trace!("flush up to {target} emitted {count} records");
        }
        self.emit(records).await;

        if self.stage.watermark() != before {
            for next in &self.next {
                if let Err(e) = next.watermark(self.partition, target).await {
                    warn!("failed to forward watermark: {e:#}");
                    self.counters.record_routing_failure();
                }
            }
        }
        count
    }

    /// Forward closed buckets to the next granularity and the broadcast
    async fn emit(&mut self, records: impl IntoIterator<Item = RollupRecord>) {
        for record in records {
            self.counters.record_emitted(record.granularity);

            // no subscribers is fine
            let _ = self.rollup_tx.send(record.clone());

            for next in &self.next {
                if let Err(e) = next.observe(Observation::from(record.clone())).await {
                    warn!("failed to forward rollup to {}: {e:#}", next.granularity());
                    self.counters.record_routing_failure();
                }
            }
        }
    }
}
