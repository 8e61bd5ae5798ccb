//! rollgrid-rollout — batch-based rollout engine.
//!
//! Moves a scalable workload from a source revision to a target revision in
//! user-defined batches. The pieces, from the bottom up:
//!
//! - `planner`: resolves a plan's batches into cumulative replica targets.
//! - `machine`: the pure rollout state machine.
//! - `ownership`: hands a workload between its natural controller and a rollout.
//! - `accessor` / `backend`: the collaborator traits and their store-backed
//!   implementation.
//! - `reconciler`: runs the machine against the collaborators, persists the
//!   status, and schedules re-invocations.

pub mod accessor;
pub mod backend;
pub mod error;
pub mod machine;
pub mod ownership;
pub mod planner;
pub mod reconciler;

pub use accessor::{
    RevisionMark, RevisionStore, StatusStore, WorkloadAccessor, WorkloadHandle, WorkloadSnapshot,
};
pub use backend::StoreBackend;
pub use error::{AccessError, AccessResult, RolloutError, RolloutResult};
pub use machine::{Action, Decision, Observation, Observed, Requeue, RolloutMachine};
pub use ownership::OwnershipManager;
pub use planner::{batch_targets, compute_batch_target, validate_plan};
pub use reconciler::{Clock, Reconciler};
