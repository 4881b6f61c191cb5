//! Turning routed items into metric samples
//!
//! An item yields one sample per entry of `payload.metrics`, named
//! `<category>.<name>`. Items of every category but `snapshot` also count
//! as one occurrence in `<category>.events`.

use std::fmt;

use crate::{Category, MetricKey, MetricSample, WorkItem};

#[derive(Debug, Clone, PartialEq)]
pub enum ExtractError {
    MissingAccount,

    /// `payload.metrics` is present but not an object
    MetricsNotAnObject,

    /// A metric value is not a finite number
    InvalidValue(String),
}

impl fmt::Display for ExtractError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractError::MissingAccount => write!(f, "item has no account id"),
            ExtractError::MetricsNotAnObject => write!(f, "payload.metrics is not an object"),
            ExtractError::InvalidValue(name) => {
                write!(f, "metric {name} is not a finite number")
            }
        }
    }
}

impl std::error::Error for ExtractError {}

pub fn extract_samples(category: Category, item: &WorkItem) -> Result<Vec<MetricSample>, ExtractError> {
    let account_id = item
        .account_id
        .as_deref()
        .filter(|account| !account.is_empty())
        .ok_or(ExtractError::MissingAccount)?;

    let sample = |name: &str, value: f64| MetricSample {
        key: MetricKey::new(account_id, format!("{category}.{name}")),
        timestamp: item.timestamp,
        value,
    };

    let mut samples = vec![];
    if category != Category::Snapshot {
        samples.push(sample("events", 1.0));
    }

    match item.payload.get("metrics") {
        None | Some(serde_json::Value::Null) => {}
        Some(serde_json::Value::Object(metrics)) => {
            for (name, value) in metrics {
                let value = value
                    .as_f64()
                    .filter(|v| v.is_finite())
                    .ok_or_else(|| ExtractError::InvalidValue(name.clone()))?;
                samples.push(sample(name, value));
            }
        }
        Some(_) => return Err(ExtractError::MetricsNotAnObject),
    }

    Ok(samples)
}
