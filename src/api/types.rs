//! Request and response bodies of the admin API

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::actors::messages::{PersistenceStats, StateCounts};
use crate::pipeline::PipelineStats;
use crate::rollup::{Granularity, KeyStateView};
use crate::scheduler::SchedulerStats;
use crate::sources::SourceStats;
use crate::{MetricKey, RollupRecord};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsResponse {
    pub timestamp: String,
    pub pipeline: PipelineStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persistence: Option<PersistenceStats>,
    pub sources: Vec<SourceStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduler: Option<SchedulerStats>,
}

/// Body of `POST /api/v1/admin/clear`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearRequest {
    pub account_id: String,
    pub metric: String,
}

impl ClearRequest {
    pub fn key(&self) -> MetricKey {
        MetricKey::new(self.account_id.clone(), self.metric.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearResponse {
    /// Open buckets emitted before their state was removed
    pub emitted: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateResponse {
    pub key: MetricKey,
    pub states: Vec<KeyStateView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountResponse {
    #[serde(flatten)]
    pub counts: StateCounts,
}

/// Body of `PUT /api/v1/admin/state`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetStateRequest {
    pub account_id: String,
    pub metric: String,
    pub granularity: Granularity,
    /// One of `count`, `sum`, `min`, `max`, `m2`
    pub field: String,
    pub value: f64,
}

/// Query parameters of `GET /api/v1/rollups/{account}/{metric}`
#[derive(Debug, Clone, Deserialize)]
pub struct RollupRangeQuery {
    pub granularity: Granularity,

    /// Earliest window start (default: one day before `end`)
    pub start: Option<DateTime<Utc>>,

    /// Latest window start (default: now)
    pub end: Option<DateTime<Utc>>,

    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollupsResponse {
    pub key: MetricKey,
    pub granularity: Granularity,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub count: usize,
    pub rollups: Vec<RollupRecord>,
}
