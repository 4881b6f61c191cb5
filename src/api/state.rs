//! API shared state containing actor handles

use std::sync::Arc;

use crate::actors::{scheduler::SchedulerHandle, source::SourceHandle, storage::PersistenceHandle};
use crate::pipeline::{AdminHandle, PipelineCounters};

/// Shared state passed to all API handlers
#[derive(Clone)]
pub struct ApiState {
    /// Administrative surface of the rollup pipeline
    pub admin: AdminHandle,

    /// Handle to the persistence actor for reading stored rollups
    pub persistence: PersistenceHandle,

    pub counters: Arc<PipelineCounters>,

    pub sources: Vec<SourceHandle>,

    /// Absent when the scheduler is not running
    pub scheduler: Option<SchedulerHandle>,
}

impl ApiState {
    pub fn new(
        admin: AdminHandle,
        persistence: PersistenceHandle,
        counters: Arc<PipelineCounters>,
    ) -> Self {
        Self {
            admin,
            persistence,
            counters,
            sources: Vec::new(),
            scheduler: None,
        }
    }

    pub fn with_sources(mut self, sources: Vec<SourceHandle>) -> Self {
        self.sources = sources;
        self
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerHandle) -> Self {
        self.scheduler = Some(scheduler);
        self
    }
}
