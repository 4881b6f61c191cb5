pub mod actors;
pub mod alerts;
#[cfg(feature = "api")]
pub mod api;
pub mod config;
pub mod pipeline;
pub mod rollup;
pub mod scheduler;
pub mod sources;
pub mod storage;
pub mod util;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::rollup::{Granularity, RollupStats};

/// An externally-polled account or resource ("connection")
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedResource {
    pub id: String,
    pub resource_type: String,
    #[serde(default)]
    pub last_poll_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub polling_in_progress: bool,
    #[serde(default)]
    pub failed_count: u32,
    #[serde(default)]
    pub broken: bool,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl ManagedResource {
    pub fn new(id: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            resource_type: resource_type.into(),
            last_poll_time: None,
            polling_in_progress: false,
            failed_count: 0,
            broken: false,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Public,
    Private,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Private => "private",
        }
    }
}

/// A unit of pollable data (an event or a resource snapshot)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,

    /// Logical feed the item belongs to ("events", "snapshots", ...)
    pub stream: String,

    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub account_id: Option<String>,

    #[serde(default)]
    pub classification: Option<String>,

    #[serde(default)]
    pub visibility: Visibility,

    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Classification of routed items
///
/// Every category has its own downstream channel and first-stage aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Activity,
    Change,
    Incident,
    Usage,
    Snapshot,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::Activity,
        Category::Change,
        Category::Incident,
        Category::Usage,
        Category::Snapshot,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Activity => "activity",
            Category::Change => "change",
            Category::Incident => "incident",
            Category::Usage => "usage",
            Category::Snapshot => "snapshot",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "activity" => Ok(Category::Activity),
            "change" => Ok(Category::Change),
            "incident" => Ok(Category::Incident),
            "usage" => Ok(Category::Usage),
            "snapshot" => Ok(Category::Snapshot),
            other => Err(format!("unknown category: {other}")),
        }
    }
}

/// Routing and grouping key used at every rollup stage
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MetricKey {
    pub account_id: String,
    pub metric: String,
}

impl MetricKey {
    pub fn new(account_id: impl Into<String>, metric: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            metric: metric.into(),
        }
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.account_id, self.metric)
    }
}

/// A single raw observation fed into the second-level stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub key: MetricKey,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Aggregate for one key over one window of one granularity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollupRecord {
    pub key: MetricKey,
    pub granularity: Granularity,
    pub window_start: DateTime<Utc>,
    pub stats: RollupStats,
}

impl RollupRecord {
    pub fn window_end(&self) -> DateTime<Utc> {
        self.granularity.window_end(self.window_start)
    }
}
