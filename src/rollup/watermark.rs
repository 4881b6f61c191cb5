//! Event-time progress of the head of the cascade
//!
//! Windows close on event time, not on the wall clock, so replaying an old
//! stream produces the same rollups as receiving it live. The head stage
//! remembers the latest event time it accepted and the wall time it saw it
//! at. While no newer event arrives, event time advances with the wall
//! clock but never past it.
//!
//! The watermark trails event time by the lateness allowance. Every window
//! ending at or before the watermark is final.

use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone)]
pub struct EventClock {
    lateness: Duration,

    /// Latest event time and the wall time it arrived at
    latest: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

impl EventClock {
    pub fn new(lateness: Duration) -> Self {
        Self {
            lateness: lateness.max(Duration::zero()),
            latest: None,
        }
    }

    pub fn saw(&mut self, event: DateTime<Utc>, now: DateTime<Utc>) {
        match self.latest {
            Some((latest, _)) if latest >= event => {}
            _ => self.latest = Some((event, now)),
        }
    }

    pub fn event_now(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let (latest, seen) = self.latest?;
        let idle = (now - seen).max(Duration::zero());
        Some((latest + idle).min(now))
    }

    pub fn watermark(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.event_now(now).map(|at| at - self.lateness)
    }
}
