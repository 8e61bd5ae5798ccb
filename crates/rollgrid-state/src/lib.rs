//! rollgrid-state — embedded object store for rollgrid.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for rollout records, revisions, and workloads.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns
//! under `{namespace}/{name}` keys. Rollout records carry a version token
//! that every write bumps; status writes are conditional on it.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
