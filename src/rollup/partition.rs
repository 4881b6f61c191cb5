//! Keyed routing between stage instances
//!
//! Every record of a [`MetricKey`] must reach the same stage instance of a
//! granularity, in every run of the process. The std `Hasher` is not stable
//! across releases, so the key is hashed with xxh3 instead.

use xxhash_rust::xxh3::xxh3_64;

use crate::MetricKey;

/// Separates account and metric so ("ab", "c") and ("a", "bc") differ
const KEY_SEPARATOR: u8 = 0x1f;

pub fn key_hash(key: &MetricKey) -> u64 {
    let mut bytes = Vec::with_capacity(key.account_id.len() + key.metric.len() + 1);
    bytes.extend_from_slice(key.account_id.as_bytes());
    bytes.push(KEY_SEPARATOR);
    bytes.extend_from_slice(key.metric.as_bytes());
    xxh3_64(&bytes)
}

/// Index of the stage instance that owns `key` among `partitions` instances
pub fn partition_for(key: &MetricKey, partitions: usize) -> usize {
    let partitions = partitions.max(1) as u64;
    (key_hash(key) % partitions) as usize
}
