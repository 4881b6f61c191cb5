//! External stores
//!
//! Everything the core reads or writes lives behind the traits in
//! [`backend`]. Two implementations ship with the crate:
//!
//! - **In-memory** ([`memory::MemoryStore`]): tests and `"backend": "none"`
//! - **SQLite** ([`sqlite::SqliteStore`], feature `storage-sqlite`)

pub mod backend;
pub mod error;
pub mod memory;
#[cfg(feature = "storage-sqlite")]
pub mod sqlite;

pub use backend::{
    BatchFilter, CheckpointStore, PollingClaim, ResourceStore, ResourceUpdate, RollupQuery,
    RollupSink, WorkItemStore,
};
pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
