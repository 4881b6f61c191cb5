//! Time-bucketed rollup logic
//!
//! Pure, synchronous building blocks of the cascade. The actors in
//! [`crate::actors::stage`] own one [`RollupStage`] each and the wiring in
//! [`crate::pipeline`] connects them.

pub mod extract;
pub mod granularity;
pub mod partition;
pub mod stage;
pub mod stats;
pub mod watermark;

pub use extract::{ExtractError, extract_samples};
pub use granularity::Granularity;
pub use partition::partition_for;
pub use stage::{BucketPhase, KeyStateView, Observation, ObserveError, RollupStage, SetStateError};
pub use stats::RollupStats;
pub use watermark::EventClock;
