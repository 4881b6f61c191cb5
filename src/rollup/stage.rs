//! Per-key bucket state of one rollup stage instance
//!
//! ## Bucket State Machine
//!
//! ```text
//! Empty ──observe──▶ Accumulating ──window closes──▶ Emitted
//!                        ▲                               │
//!                        └───────────observe─────────────┘
//! ```
//!
//! A window closes when an observation for a later window arrives, when the
//! stage watermark reaches the window end, or when an operator clears the
//! key. Once the watermark passed a window end, observations for that window
//! are late even for keys the stage no longer holds.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{MetricKey, MetricSample, RollupRecord};

use super::{Granularity, RollupStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketPhase {
    Empty,
    Accumulating,
    Emitted,
}

/// Input to a stage: a raw sample or a finer-grained rollup
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub key: MetricKey,
    pub timestamp: DateTime<Utc>,
    pub stats: RollupStats,
}

impl From<MetricSample> for Observation {
    fn from(sample: MetricSample) -> Self {
        Self {
            key: sample.key,
            timestamp: sample.timestamp,
            stats: RollupStats::single(sample.value),
        }
    }
}

impl From<RollupRecord> for Observation {
    fn from(record: RollupRecord) -> Self {
        Self {
            key: record.key,
            timestamp: record.window_start,
            stats: record.stats,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ObserveError {
    /// Non-finite values or an empty aggregate
    Malformed,

    /// The key already moved on to a later window
    Late {
        window_start: DateTime<Utc>,
        open_window: DateTime<Utc>,
    },

    /// The watermark passed the end of the observation's window
    Closed {
        window_start: DateTime<Utc>,
        watermark: DateTime<Utc>,
    },
}

impl fmt::Display for ObserveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObserveError::Malformed => write!(f, "malformed observation"),
            ObserveError::Late {
                window_start,
                open_window,
            } => write!(
                f,
                "late observation for window {window_start} (current window {open_window})"
            ),
            ObserveError::Closed {
                window_start,
                watermark,
            } => write!(
                f,
                "observation for closed window {window_start} (watermark {watermark})"
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SetStateError {
    UnknownKey,
    NotAccumulating,
    UnknownField(String),
    InvalidValue(String),
}

impl fmt::Display for SetStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SetStateError::UnknownKey => write!(f, "no state for key"),
            SetStateError::NotAccumulating => write!(f, "key has no open bucket"),
            SetStateError::UnknownField(field) => write!(f, "unknown field: {field}"),
            SetStateError::InvalidValue(msg) => write!(f, "invalid value: {msg}"),
        }
    }
}

impl std::error::Error for SetStateError {}

/// Snapshot of one key's state, returned by `dump_state`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyStateView {
    pub key: MetricKey,
    pub granularity: Granularity,
    pub phase: BucketPhase,
    pub window_start: Option<DateTime<Utc>>,
    pub last_emitted: Option<DateTime<Utc>>,
    pub stats: RollupStats,
}

#[derive(Debug, Clone)]
struct KeyState {
    phase: BucketPhase,
    window_start: Option<DateTime<Utc>>,
    last_emitted: Option<DateTime<Utc>>,
    stats: RollupStats,
}

impl KeyState {
    fn open(window_start: DateTime<Utc>, stats: RollupStats) -> Self {
        Self {
            phase: BucketPhase::Accumulating,
            window_start: Some(window_start),
            last_emitted: None,
            stats,
        }
    }
}

/// Aggregation state of one stage instance (one granularity, one partition)
#[derive(Debug)]
pub struct RollupStage {
    granularity: Granularity,
    keys: HashMap<MetricKey, KeyState>,

    /// Event time up to which every window of this stage is final
    watermark: Option<DateTime<Utc>>,
}

impl RollupStage {
    pub fn new(granularity: Granularity) -> Self {
        Self {
            granularity,
            keys: HashMap::new(),
            watermark: None,
        }
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        self.watermark
    }

    /// Number of keys currently holding state
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn phase(&self, key: &MetricKey) -> BucketPhase {
        self.keys
            .get(key)
            .map(|state| state.phase)
            .unwrap_or(BucketPhase::Empty)
    }

    /// Fold an observation into its bucket
    ///
    /// Returns the record of the previous bucket when the observation opens a
    /// later window.
    pub fn observe(&mut self, obs: Observation) -> Result<Option<RollupRecord>, ObserveError> {
        if !obs.stats.is_valid() {
            return Err(ObserveError::Malformed);
        }

        let window = self.granularity.window_start(obs.timestamp);
        let granularity = self.granularity;

        if let Some(watermark) = self.watermark
            && granularity.window_end(window) <= watermark
        {
            return Err(ObserveError::Closed {
                window_start: window,
                watermark,
            });
        }

        let Some(state) = self.keys.get_mut(&obs.key) else {
            self.keys.insert(obs.key, KeyState::open(window, obs.stats));
            return Ok(None);
        };

        match (state.phase, state.window_start) {
            (BucketPhase::Accumulating, Some(open_window)) => {
                if window == open_window {
                    state.stats.merge(&obs.stats);
                    Ok(None)
                } else if window < open_window {
                    Err(ObserveError::Late {
                        window_start: window,
                        open_window,
                    })
                } else {
                    let record = close_bucket(granularity, &obs.key, state);
                    state.phase = BucketPhase::Accumulating;
                    state.window_start = Some(window);
                    state.stats = obs.stats;
                    Ok(record)
                }
            }
            _ => {
                if let Some(last) = state.last_emitted
                    && window <= last
                {
                    return Err(ObserveError::Late {
                        window_start: window,
                        open_window: last,
                    });
                }
                state.phase = BucketPhase::Accumulating;
                state.window_start = Some(window);
                state.stats = obs.stats;
                Ok(None)
            }
        }
    }

    /// Move the watermark forward and emit every bucket it closes
    ///
    /// A bucket closes once its window end is not after the watermark.
    /// Emitted keys that stayed idle for a whole further window are evicted;
    /// the watermark keeps rejecting their old windows. A watermark behind
    /// the current one changes nothing.
    pub fn advance_watermark(&mut self, watermark: DateTime<Utc>) -> Vec<RollupRecord> {
        if self.watermark.is_some_and(|current| current >= watermark) {
            return vec![];
        }
        self.watermark = Some(watermark);
        let granularity = self.granularity;

        let mut records = vec![];
        for (key, state) in self.keys.iter_mut() {
            if state.phase != BucketPhase::Accumulating {
                continue;
            }
            let Some(start) = state.window_start else {
                continue;
            };
            if granularity.window_end(start) <= watermark
                && let Some(record) = close_bucket(granularity, key, state)
            {
                records.push(record);
            }
        }

        self.keys.retain(|_, state| match (state.phase, state.last_emitted) {
            (BucketPhase::Emitted, Some(last)) => {
                granularity.window_end(granularity.window_end(last)) > watermark
            }
            _ => true,
        });

        records.sort_by(|a, b| a.key.cmp(&b.key));
        records
    }

    /// Emit the open bucket of `key` (if any) and forget the key
    pub fn clear(&mut self, key: &MetricKey) -> Option<RollupRecord> {
        let mut state = self.keys.remove(key)?;
        close_bucket(self.granularity, key, &mut state)
    }

    pub fn clear_all(&mut self) -> Vec<RollupRecord> {
        let granularity = self.granularity;
        let mut records: Vec<RollupRecord> = self
            .keys
            .drain()
            .filter_map(|(key, mut state)| close_bucket(granularity, &key, &mut state))
            .collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        records
    }

    pub fn dump(&self, key: &MetricKey) -> Option<KeyStateView> {
        self.keys.get(key).map(|state| KeyStateView {
            key: key.clone(),
            granularity: self.granularity,
            phase: state.phase,
            window_start: state.window_start,
            last_emitted: state.last_emitted,
            stats: state.stats,
        })
    }

    /// Overwrite one aggregate field of an open bucket (debugging aid)
    pub fn set_field(
        &mut self,
        key: &MetricKey,
        field: &str,
        value: f64,
    ) -> Result<(), SetStateError> {
        let state = self.keys.get_mut(key).ok_or(SetStateError::UnknownKey)?;
        if state.phase != BucketPhase::Accumulating {
            return Err(SetStateError::NotAccumulating);
        }
        if !value.is_finite() {
            return Err(SetStateError::InvalidValue(format!("{value} is not finite")));
        }

        match field {
            "count" => {
                if value < 1.0 || value.fract() != 0.0 {
                    return Err(SetStateError::InvalidValue(format!(
                        "count must be a positive integer, got {value}"
                    )));
                }
                state.stats.count = value as u64;
            }
            "sum" => state.stats.sum = value,
            "min" => state.stats.min = value,
            "max" => state.stats.max = value,
            "m2" => {
                if value < 0.0 {
                    return Err(SetStateError::InvalidValue(format!(
                        "m2 must not be negative, got {value}"
                    )));
                }
                state.stats.m2 = value;
            }
            other => return Err(SetStateError::UnknownField(other.to_string())),
        }

        Ok(())
    }
}

fn close_bucket(
    granularity: Granularity,
    key: &MetricKey,
    state: &mut KeyState,
) -> Option<RollupRecord> {
    if state.phase != BucketPhase::Accumulating {
        return None;
    }
    let window_start = state.window_start.take()?;
    let stats = std::mem::take(&mut state.stats);

    state.phase = BucketPhase::Emitted;
    state.last_emitted = Some(window_start);

    Some(RollupRecord {
        key: key.clone(),
        granularity,
        window_start,
        stats,
    })
}
