//! Per-resource refresh decision

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::ManagedResource;

/// Limits applied by the scheduler to every resource
#[derive(Debug, Clone, PartialEq)]
pub struct PollPolicy {
    pub enabled: bool,

    /// Maximum resources selected per tick
    pub batch_size: usize,

    /// Failures tolerated before the resource sleeps
    pub max_failed_count: u32,

    /// Cool-down of a resource above `max_failed_count`
    pub broken_sleep: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: 100,
            max_failed_count: 3,
            broken_sleep: Duration::hours(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollDecision {
    /// The polling interval elapsed
    Due,

    /// In progress for more than five intervals; the worker is presumed dead
    Stuck,

    /// Sleeping resource whose cool-down elapsed
    CircuitRecheck,

    NotDue,

    /// Too many failures, cool-down still running
    Sleeping,

    InFlight,

    /// Hard-broken; needs external action
    Broken,
}

impl PollDecision {
    pub fn evaluate(
        resource: &ManagedResource,
        now: DateTime<Utc>,
        interval: Duration,
        policy: &PollPolicy,
    ) -> Self {
        if resource.broken {
            return PollDecision::Broken;
        }

        // never polled counts as infinitely stale
        let elapsed = resource.last_poll_time.map(|at| now - at);
        let exceeds = |limit: Duration| elapsed.is_none_or(|elapsed| elapsed > limit);

        if resource.polling_in_progress {
            if exceeds(interval * 5) {
                PollDecision::Stuck
            } else {
                PollDecision::InFlight
            }
        } else if resource.failed_count > policy.max_failed_count {
            if exceeds(policy.broken_sleep) {
                PollDecision::CircuitRecheck
            } else {
                PollDecision::Sleeping
            }
        } else if exceeds(interval) {
            PollDecision::Due
        } else {
            PollDecision::NotDue
        }
    }

    pub fn needs_refresh(&self) -> bool {
        matches!(
            self,
            PollDecision::Due | PollDecision::Stuck | PollDecision::CircuitRecheck
        )
    }
}
