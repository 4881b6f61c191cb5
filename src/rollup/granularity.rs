//! Time-bucket widths of the rollup cascade
//!
//! All windows are aligned in UTC. Second, minute, hour and day windows
//! truncate the timestamp; weeks start on Monday 00:00 and months on the
//! first day of the month.
//!
//! The cascade is a tree: days feed both weeks and months, because a week
//! can straddle two months.
//!
//! ```text
//! second ─▶ minute ─▶ hour ─▶ day ─┬─▶ week
//!                                  └─▶ month
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
}

impl Granularity {
    /// All granularities, finest first
    pub const ALL: [Granularity; 6] = [
        Granularity::Second,
        Granularity::Minute,
        Granularity::Hour,
        Granularity::Day,
        Granularity::Week,
        Granularity::Month,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Second => "second",
            Granularity::Minute => "minute",
            Granularity::Hour => "hour",
            Granularity::Day => "day",
            Granularity::Week => "week",
            Granularity::Month => "month",
        }
    }

    /// Position in the cascade, starting at 1 for seconds
    pub fn level(&self) -> u32 {
        match self {
            Granularity::Second => 1,
            Granularity::Minute => 2,
            Granularity::Hour => 3,
            Granularity::Day => 4,
            Granularity::Week => 5,
            Granularity::Month => 6,
        }
    }

    /// Stages fed by this one; every window of this granularity lies
    /// inside exactly one window of each
    pub fn coarser(&self) -> &'static [Granularity] {
        match self {
            Granularity::Second => &[Granularity::Minute],
            Granularity::Minute => &[Granularity::Hour],
            Granularity::Hour => &[Granularity::Day],
            Granularity::Day => &[Granularity::Week, Granularity::Month],
            Granularity::Week | Granularity::Month => &[],
        }
    }

    /// The stage feeding this one, `None` for the head of the cascade
    pub fn finer(&self) -> Option<Granularity> {
        match self {
            Granularity::Second => None,
            Granularity::Minute => Some(Granularity::Second),
            Granularity::Hour => Some(Granularity::Minute),
            Granularity::Day => Some(Granularity::Hour),
            Granularity::Week | Granularity::Month => Some(Granularity::Day),
        }
    }

    /// Start of the window containing `ts`
    pub fn window_start(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Granularity::Second => truncate(ts, 1),
            Granularity::Minute => truncate(ts, 60),
            Granularity::Hour => truncate(ts, 3_600),
            Granularity::Day => truncate(ts, 86_400),
            Granularity::Week => {
                let day = truncate(ts, 86_400);
                day - Duration::days(day.weekday().num_days_from_monday() as i64)
            }
            Granularity::Month => Utc
                .with_ymd_and_hms(ts.year(), ts.month(), 1, 0, 0, 0)
                .single()
                .unwrap_or_else(|| truncate(ts, 86_400)),
        }
    }

    /// Exclusive end of the window starting at `start`
    pub fn window_end(&self, start: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Granularity::Second => start + Duration::seconds(1),
            Granularity::Minute => start + Duration::minutes(1),
            Granularity::Hour => start + Duration::hours(1),
            Granularity::Day => start + Duration::days(1),
            Granularity::Week => start + Duration::weeks(1),
            Granularity::Month => {
                let (year, month) = if start.month() == 12 {
                    (start.year() + 1, 1)
                } else {
                    (start.year(), start.month() + 1)
                };
                Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
                    .single()
                    .unwrap_or_else(|| start + Duration::days(31))
            }
        }
    }
}

fn truncate(ts: DateTime<Utc>, unit_secs: i64) -> DateTime<Utc> {
    let secs = ts.timestamp();
    DateTime::from_timestamp(secs - secs.rem_euclid(unit_secs), 0).unwrap_or(ts)
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Granularity::ALL
            .into_iter()
            .find(|g| g.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown granularity: {s}"))
    }
}
