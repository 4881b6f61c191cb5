//! Message types for actor communication
//!
//! ## Design Principles
//!
//! 1. **Commands**: Request/response messages sent to one actor via mpsc,
//!    answered through a oneshot channel
//! 2. **Events**: Emitted rollups are broadcast to every interested actor
//!    (persistence, message generation)

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::rollup::{Granularity, KeyStateView, Observation, SetStateError};
use crate::scheduler::SchedulerStats;
use crate::sources::SourceStats;
use crate::storage::RollupQuery;
use crate::{MetricKey, RollupRecord};

/// Commands that can be sent to a SourceActor
#[derive(Debug)]
pub enum SourceCommand {
    GetStats {
        respond_to: oneshot::Sender<SourceStats>,
    },

    /// Stop after the current poll step, answered once the source is dropped
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

/// Commands that can be sent to the SchedulerActor
#[derive(Debug)]
pub enum SchedulerCommand {
    /// Run a tick immediately and report the selected resource ids
    TickNow {
        respond_to: oneshot::Sender<Vec<String>>,
    },

    GetStats {
        respond_to: oneshot::Sender<SchedulerStats>,
    },

    Shutdown,
}

/// Messages accepted by one rollup stage instance
#[derive(Debug)]
pub enum StageMessage {
    Observe(Observation),

    /// The finer stage will not emit records for windows ending at or
    /// before this event time anymore
    Watermark(DateTime<Utc>),

    /// Emit the open bucket of `key` and forget the key
    Clear {
        key: MetricKey,
        respond_to: oneshot::Sender<bool>,
    },

    ClearAll {
        respond_to: oneshot::Sender<usize>,
    },

    Dump {
        key: MetricKey,
        respond_to: oneshot::Sender<Option<KeyStateView>>,
    },

    Count {
        respond_to: oneshot::Sender<usize>,
    },

    SetField {
        key: MetricKey,
        field: String,
        value: f64,
        respond_to: oneshot::Sender<Result<(), SetStateError>>,
    },

    /// Run the timed flush now and report how many records were emitted
    Flush {
        respond_to: oneshot::Sender<usize>,
    },

    Shutdown,
}

/// Administrative commands accepted by the pipeline
///
/// Sent through an [`crate::pipeline::AdminHandle`].
#[derive(Debug)]
pub enum AdminCommand {
    /// Clear a key at every granularity; reports how many buckets were emitted
    Clear {
        key: MetricKey,
        respond_to: oneshot::Sender<usize>,
    },

    ClearAll {
        respond_to: oneshot::Sender<usize>,
    },

    DumpState {
        key: MetricKey,
        respond_to: oneshot::Sender<Vec<KeyStateView>>,
    },

    CountStates {
        respond_to: oneshot::Sender<StateCounts>,
    },

    SetState {
        key: MetricKey,
        granularity: Granularity,
        field: String,
        value: f64,
        respond_to: oneshot::Sender<Result<(), SetStateError>>,
    },

    /// Run the timed flush on every stage, finest first
    Flush {
        respond_to: oneshot::Sender<usize>,
    },
}

/// Number of keys holding state, per granularity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    pub per_granularity: BTreeMap<Granularity, usize>,
    pub total: usize,
}

/// Commands that can be sent to the PersistenceActor
#[derive(Debug)]
pub enum PersistenceCommand {
    /// Write the buffered records now
    Flush {
        respond_to: oneshot::Sender<anyhow::Result<()>>,
    },

    GetStats {
        respond_to: oneshot::Sender<PersistenceStats>,
    },

    /// Read stored rollups back from the sink
    QueryRange {
        query: RollupQuery,
        respond_to: oneshot::Sender<anyhow::Result<Vec<RollupRecord>>>,
    },

    /// Flush and stop
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistenceStats {
    pub buffered: usize,
    pub flush_count: u64,
    pub persisted: u64,
    pub failed: u64,
}
