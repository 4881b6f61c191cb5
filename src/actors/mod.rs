//! Actor-based runtime of the hub
//!
//! Each actor runs as an independent async task communicating via Tokio
//! channels. The pure logic lives elsewhere ([`crate::sources`],
//! [`crate::scheduler`], [`crate::rollup`]); actors only own it and drive it
//! from the clock.
//!
//! ## Architecture Overview
//!
//! ```text
//!   SourceActor(events)   SourceActor(snapshots)      SchedulerActor
//!          │                      │                          │
//!          └──── category routes ─┘                   RefreshPool workers
//!                      │
//!               CategoryActor (one per category)
//!                      │ keyed by (account, metric)
//!               StageActor  second × N partitions
//!                      │
//!               StageActor  minute × N ... month × N
//!                      │
//!            ┌─────────▼──────────┐
//!            │ Broadcast Channel  │ (emitted rollups)
//!            └─────────┬──────────┘
//!              ┌───────┴────────┐
//!      PersistenceActor    MessageActor
//! ```
//!
//! ## Communication Patterns
//!
//! 1. **Commands**: Each actor has an mpsc command channel for control messages
//! 2. **Events**: Emitted rollups go to a broadcast channel for fan-out
//! 3. **Request/Response**: oneshot channels for synchronous queries

pub mod category;
pub mod messages;
pub mod messenger;
pub mod scheduler;
pub mod source;
pub mod stage;
pub mod storage;
