//! CategoryActor - First stage of one category
//!
//! Receives routed items from the sources, extracts their samples and feeds
//! them into the second-level stage. An item whose samples cannot be
//! forwarded is failed back to its source and re-fetched on the next refill.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, instrument, trace, warn};

use crate::Category;
use crate::pipeline::{KeyedRouter, PipelineCounters};
use crate::rollup::{Observation, extract_samples};
use crate::sources::RoutedItem;

pub struct CategoryActor {
    category: Category,
    item_rx: mpsc::Receiver<RoutedItem>,
    seconds: KeyedRouter,
    counters: Arc<PipelineCounters>,
}

impl CategoryActor {
    pub fn new(
        category: Category,
        item_rx: mpsc::Receiver<RoutedItem>,
        seconds: KeyedRouter,
        counters: Arc<PipelineCounters>,
    ) -> Self {
        Self {
            category,
            item_rx,
            seconds,
            counters,
        }
    }

    #[instrument(skip(self), fields(category = %self.category))]
    pub async fn run(mut self) {
        debug!("starting category actor");

        while let Some(routed) = self.item_rx.recv().await {
            self.process(routed).await;
        }

        debug!("category channel closed, category actor stopped");
    }

    async fn process(&self, routed: RoutedItem) {
        let RoutedItem { item, acker, .. } = routed;

        let samples = match extract_samples(self.category, &item) {
            Ok(samples) => samples,
            Err(e) => {
                warn!("dropping malformed item {}: {e}", item.id);
                self.counters.record_malformed();
                return;
            }
        };

        trace!("item {} produced {} samples", item.id, samples.len());
        for sample in samples {
            if let Err(e) = self.seconds.observe(Observation::from(sample)).await {
                warn!("failed to forward item {}: {e:#}", item.id);
                self.counters.record_routing_failure();
                acker.fail(&item.id);
                return;
            }
        }
    }
}
