//! redb table definitions for the rollgrid state store.
//!
//! Each table uses `&str` keys of the form `{namespace}/{name}` and `&[u8]`
//! values (JSON-serialized domain types).

use redb::TableDefinition;

/// Rollout records (spec + status + version).
pub const ROLLOUTS: TableDefinition<&str, &[u8]> = TableDefinition::new("rollouts");

/// Revisions of deployable units.
pub const REVISIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("revisions");

/// Scalable workloads the revisions render to.
pub const WORKLOADS: TableDefinition<&str, &[u8]> = TableDefinition::new("workloads");
