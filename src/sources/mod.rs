//! Poll sources feeding the rollup pipeline
//!
//! - [`poll`]: the generic queue / quiet period / refill cycle
//! - [`window`]: checkpointed sliding-window fetching for events
//! - [`router`]: handlers routing items to the category channels

pub mod poll;
pub mod router;
pub mod window;

pub use poll::{
    AckHandle, BatchFetcher, Disposition, FailedIds, ItemHandler, PollOutcome, PollSource,
    SourceStats, StoreFetcher,
};
pub use router::{CategoryRoutes, EventRouter, RoutedItem, SnapshotForwarder};
pub use window::{SlidingWindowFetcher, next_checkpoint};

/// Source reading the `events` stream through a sliding window
pub type EventSource = PollSource<SlidingWindowFetcher, EventRouter>;

/// Source re-reading the `snapshots` stream every cycle
pub type SnapshotSource = PollSource<StoreFetcher, SnapshotForwarder>;
