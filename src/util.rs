use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

const API_ADDR: &str = "ROLLWATCH_API_ADDR";

const DEFAULT_API_ADDR: &str = "127.0.0.1:8080";

pub fn get_default_api_addr() -> SocketAddr {
    DEFAULT_API_ADDR
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 8080)))
}

/// Bind address for the admin API, overridable via `ROLLWATCH_API_ADDR`
pub fn get_api_addr(configured: Option<SocketAddr>) -> SocketAddr {
    let addr_from_env = std::env::var(API_ADDR);
    addr_from_env
        .ok()
        .and_then(|res| res.parse().ok())
        .or(configured)
        .unwrap_or_else(get_default_api_addr)
}

/// Source of "now" for every time-based decision
///
/// Sources, the scheduler and the rollup stages never read the wall clock
/// directly, so tests can drive them with a [`ManualClock`].
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now = to;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Converts a whole number of seconds from the config into a chrono duration
pub fn secs(value: u64) -> chrono::Duration {
    i64::try_from(value)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}

pub fn millis(value: u64) -> chrono::Duration {
    i64::try_from(value)
        .ok()
        .and_then(chrono::Duration::try_milliseconds)
        .unwrap_or(chrono::Duration::MAX)
}
