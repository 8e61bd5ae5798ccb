//! Collaborator interfaces the engine is built against.
//!
//! The engine never talks to a store directly: it is handed a
//! [`WorkloadAccessor`], a [`RevisionStore`], and a [`StatusStore`] at
//! construction. `crate::backend` implements all three over
//! `rollgrid_state::StateStore`.

use async_trait::async_trait;
use rollgrid_state::{ControlledBy, RolloutRecord, RolloutStatus, Revision, Workload};

use crate::error::AccessResult;

/// A resolved reference to a scalable workload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkloadHandle {
    pub namespace: String,
    pub name: String,
}

impl WorkloadHandle {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn key(&self) -> String {
        rollgrid_state::object_key(&self.namespace, &self.name)
    }
}

/// Point-in-time view of a workload. Read fresh on every invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadSnapshot {
    pub desired_replicas: u32,
    pub updated_replicas: u32,
    pub updated_ready_replicas: u32,
    pub total_replicas: u32,
    /// Target count last written by the engine, if any.
    pub target_replicas: Option<u32>,
    pub pause_flag: bool,
    pub controlled_by: ControlledBy,
    pub native_owner: String,
}

impl From<&Workload> for WorkloadSnapshot {
    fn from(w: &Workload) -> Self {
        Self {
            desired_replicas: w.replicas,
            updated_replicas: w.status.updated_replicas,
            updated_ready_replicas: w.status.updated_ready_replicas,
            total_replicas: w.status.total_replicas,
            target_replicas: w.target_replicas,
            pause_flag: w.paused,
            controlled_by: w.controlled_by.clone(),
            native_owner: w.native_owner.clone(),
        }
    }
}

/// Resolves workloads and applies the engine's mutations to them.
///
/// Every mutation must be idempotent and must re-read the workload
/// immediately before writing it.
#[async_trait]
pub trait WorkloadAccessor: Send + Sync {
    /// `Ok(None)` when no such workload exists.
    async fn resolve(&self, namespace: &str, name: &str) -> AccessResult<Option<WorkloadHandle>>;

    /// `Ok(None)` when the workload disappeared since it was resolved.
    async fn snapshot(&self, handle: &WorkloadHandle) -> AccessResult<Option<WorkloadSnapshot>>;

    async fn set_pause_flag(&self, handle: &WorkloadHandle, paused: bool) -> AccessResult<()>;

    /// Compare-and-set of the controlling owner. Fails with
    /// `AccessError::Precondition` if the current owner is not `expected`.
    async fn set_controlled_by(
        &self,
        handle: &WorkloadHandle,
        expected: &ControlledBy,
        next: ControlledBy,
    ) -> AccessResult<()>;

    async fn set_target_replica_count(
        &self,
        handle: &WorkloadHandle,
        replicas: u32,
    ) -> AccessResult<()>;
}

/// Marker transitions the engine applies to revisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevisionMark {
    /// The revision's workload is now under rollout control.
    UnderRollout,
    /// The target finished rolling; its controller takes over again.
    RollingCompleted,
    /// The source was replaced and becomes inactive.
    Superseded,
    /// The rollout failed; hand control back without completing.
    RolloutEnded,
}

/// Read access to revisions plus the marker writes above.
#[async_trait]
pub trait RevisionStore: Send + Sync {
    async fn get_revision(&self, namespace: &str, name: &str) -> AccessResult<Option<Revision>>;

    async fn mark_revision(&self, namespace: &str, name: &str, mark: RevisionMark)
        -> AccessResult<()>;
}

/// Persistence of rollout records with optimistic concurrency.
#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn load(&self, id: &str) -> AccessResult<Option<RolloutRecord>>;

    async fn list(&self) -> AccessResult<Vec<RolloutRecord>>;

    /// Write `status` if the record's version still equals
    /// `expected_version`; otherwise `AccessError::VersionConflict`.
    /// Returns the new version.
    async fn update_status(
        &self,
        id: &str,
        status: &RolloutStatus,
        expected_version: u64,
    ) -> AccessResult<u64>;

    /// Delete the record if its version still equals `expected_version`.
    /// `Ok(false)` when it is already gone.
    async fn remove(&self, id: &str, expected_version: u64) -> AccessResult<bool>;
}
