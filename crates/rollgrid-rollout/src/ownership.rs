//! Ownership transfer between a workload's natural controller and a rollout.
//!
//! A workload is *held* by a rollout when its `controlled_by` names the
//! rollout and its pause flag is set. Claim and release are idempotent and
//! each step re-reads the workload first, so re-running a claim that was
//! interrupted half way completes it.

use std::sync::Arc;

use rollgrid_state::ControlledBy;
use tracing::{debug, info};

use crate::accessor::{WorkloadAccessor, WorkloadHandle, WorkloadSnapshot};
use crate::error::{AccessError, RolloutError, RolloutResult};

fn engine(rollout: &str) -> ControlledBy {
    ControlledBy::RolloutEngine {
        rollout: rollout.to_string(),
    }
}

/// Whether `snapshot` is fully held by `rollout`.
pub fn is_held_by(snapshot: &WorkloadSnapshot, rollout: &str) -> bool {
    snapshot.controlled_by == engine(rollout) && snapshot.pause_flag
}

/// The rollout holding the workload, if it is not `rollout`.
fn foreign_holder(snapshot: &WorkloadSnapshot, rollout: &str) -> Option<String> {
    match &snapshot.controlled_by {
        ControlledBy::RolloutEngine { rollout: holder } if holder != rollout => Some(holder.clone()),
        _ => None,
    }
}

/// Claims and releases workloads on behalf of rollouts.
#[derive(Clone)]
pub struct OwnershipManager {
    accessor: Arc<dyn WorkloadAccessor>,
}

impl OwnershipManager {
    pub fn new(accessor: Arc<dyn WorkloadAccessor>) -> Self {
        Self { accessor }
    }

    async fn fresh(&self, handle: &WorkloadHandle) -> RolloutResult<WorkloadSnapshot> {
        self.accessor
            .snapshot(handle)
            .await?
            .ok_or_else(|| RolloutError::WorkloadNotFound(handle.key()))
    }

    /// Take the workload away from its natural controller.
    ///
    /// Fails with `OwnershipConflict` if another rollout holds it; the
    /// ownership marker is a compare-and-set, so two rollouts racing for
    /// the same workload cannot both win.
    pub async fn claim(&self, handle: &WorkloadHandle, rollout: &str) -> RolloutResult<()> {
        let snapshot = self.fresh(handle).await?;
        if let Some(holder) = foreign_holder(&snapshot, rollout) {
            return Err(RolloutError::OwnershipConflict {
                workload: handle.key(),
                holder,
            });
        }
        if is_held_by(&snapshot, rollout) {
            debug!(workload = %handle.key(), %rollout, "workload already claimed");
            return Ok(());
        }

        let ours = engine(rollout);
        if snapshot.controlled_by != ours {
            match self
                .accessor
                .set_controlled_by(handle, &snapshot.controlled_by, ours)
                .await
            {
                Ok(()) => {}
                Err(AccessError::Precondition { .. }) => {
                    // Lost a race; report whoever holds it now.
                    let current = self.fresh(handle).await?;
                    let holder = foreign_holder(&current, rollout)
                        .unwrap_or_else(|| format!("{:?}", current.controlled_by));
                    return Err(RolloutError::OwnershipConflict {
                        workload: handle.key(),
                        holder,
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }

        // Freeze the natural controller only once the marker is ours.
        let snapshot = self.fresh(handle).await?;
        if !snapshot.pause_flag {
            self.accessor.set_pause_flag(handle, true).await?;
        }
        info!(workload = %handle.key(), %rollout, "workload claimed");
        Ok(())
    }

    /// Hand the workload back to its natural controller.
    ///
    /// A workload that no longer exists counts as released.
    pub async fn release(&self, handle: &WorkloadHandle, rollout: &str) -> RolloutResult<()> {
        let Some(snapshot) = self.accessor.snapshot(handle).await? else {
            debug!(workload = %handle.key(), "workload gone, nothing to release");
            return Ok(());
        };
        if let Some(holder) = foreign_holder(&snapshot, rollout) {
            return Err(RolloutError::OwnershipConflict {
                workload: handle.key(),
                holder,
            });
        }

        let ours = engine(rollout);
        if snapshot.pause_flag {
            self.accessor.set_pause_flag(handle, false).await?;
        }
        if snapshot.controlled_by == ours {
            let native = ControlledBy::NativeController {
                owner: snapshot.native_owner.clone(),
            };
            self.accessor
                .set_controlled_by(handle, &ours, native)
                .await?;
        }
        info!(workload = %handle.key(), %rollout, "workload released");
        Ok(())
    }

    /// Release the workload only if `rollout` still has its marker on it.
    ///
    /// Used when cleaning up after a rollout: a workload that was never
    /// claimed, or is held by someone else, is left untouched. Returns
    /// whether anything was released.
    pub async fn release_claim(
        &self,
        handle: &WorkloadHandle,
        rollout: &str,
    ) -> RolloutResult<bool> {
        let Some(snapshot) = self.accessor.snapshot(handle).await? else {
            return Ok(false);
        };
        if snapshot.controlled_by != engine(rollout) {
            debug!(workload = %handle.key(), %rollout, "no claim to release");
            return Ok(false);
        }
        self.release(handle, rollout).await?;
        Ok(true)
    }
}
