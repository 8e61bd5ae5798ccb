//! Rollout state machine — decides the next status of a rollout.
//!
//! [`RolloutMachine::reconcile`] is a pure function of the user's plan, a
//! fresh observation of the workloads, the prior persisted status, and the
//! current time. It returns the next status, the side effects needed to
//! realize it, and when it wants to be invoked again. It performs no I/O;
//! `crate::reconciler` executes the actions and persists the status.
//!
//! Phases: `Initial → RollingInBatches → {RolloutSucceeded | RolloutFailed}`,
//! and back to `Initial` when the source/target revision pair of a
//! terminated rollout changes. Within `RollingInBatches` every batch walks
//! `BatchInitial → BatchInRolling → BatchVerifying → BatchReady`, with a
//! detour through `BatchPausing → BatchPaused` while the plan is paused.
//!
//! Each invocation makes at most one sub-phase step, so re-running it with
//! an unchanged plan and snapshot in a holding phase reproduces the same
//! status, condition timestamps included.

use std::time::Duration;

use rollgrid_core::RolloutConfig;
use rollgrid_state::{
    BatchRollingState, Condition, ConditionStatus, ConditionType, ControlledBy, RollingState,
    RolloutPlan, RolloutStatus,
};
use tracing::{debug, info, warn};

use crate::accessor::WorkloadSnapshot;
use crate::error::RolloutError;
use crate::ownership::is_held_by;
use crate::planner::{compute_batch_target, validate_plan};

/// What the driver found when it looked up a revision's workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observed {
    Found(WorkloadSnapshot),
    /// The revision or its workload does not exist.
    Missing,
    /// The revision exists but has not been rendered for rolling yet.
    NotReady,
}

/// Inputs of one invocation, read fresh by the driver.
#[derive(Debug, Clone)]
pub struct Observation<'a> {
    /// Identity of the rollout, used as the owner when claiming.
    pub rollout: &'a str,
    pub plan: &'a RolloutPlan,
    pub target_revision: &'a str,
    pub source_revision: Option<&'a str>,
    pub target: Observed,
    /// `None` when the rollout has no source revision.
    pub source: Option<Observed>,
}

/// Side effects the driver must apply before persisting the status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Mark source and target revisions as under rollout control.
    MarkRevisionsRolling,
    /// Take the target workload from its natural controller.
    ClaimOwnership,
    /// Ask for this many replicas on the target version.
    SetTargetReplicas(u32),
    /// Hand the target workload back to its natural controller.
    ReleaseOwnership,
    /// Hand back the workload of the previously recorded target, if this
    /// rollout still holds it.
    ReleasePreviousTarget,
    MarkSourceInactive,
    MarkTargetCompleted,
    /// Clear the under-rollout markers after a failure.
    ClearRolloutMarkers,
}

/// When the machine wants to run again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    Immediately,
    After(Duration),
    /// Only a plan change (or a revision change) can make progress.
    Never,
}

/// Output of one invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub status: RolloutStatus,
    pub actions: Vec<Action>,
    pub requeue: Requeue,
}

/// The rollout state machine. Holds only policy configuration.
#[derive(Debug, Clone, Default)]
pub struct RolloutMachine {
    config: RolloutConfig,
}

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

fn revisions_changed(obs: &Observation<'_>, prior: &RolloutStatus) -> bool {
    match &prior.last_upgraded_target_revision {
        None => false,
        Some(target) => {
            target != obs.target_revision
                || prior.last_source_revision.as_deref() != obs.source_revision
        }
    }
}

impl RolloutMachine {
    pub fn new(config: RolloutConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RolloutConfig {
        &self.config
    }

    /// Compute the next status of a rollout.
    pub fn reconcile(&self, obs: &Observation<'_>, prior: &RolloutStatus, now: u64) -> Decision {
        let mut status = prior.clone();
        let mut actions = Vec::new();
        let changed = revisions_changed(obs, prior);

        if prior.rolling_state.is_terminal() {
            if !changed {
                debug!(rollout = %obs.rollout, "rollout terminated, nothing to reconcile");
                return Decision {
                    status,
                    actions,
                    requeue: Requeue::Never,
                };
            }
            info!(
                rollout = %obs.rollout,
                source = ?obs.source_revision,
                target = %obs.target_revision,
                "rollout target changed, restarting the rollout"
            );
            // A failed rollout keeps its target frozen; give it back before
            // another workload is claimed.
            if prior.last_upgraded_target_revision.as_deref() != Some(obs.target_revision) {
                actions.push(Action::ReleasePreviousTarget);
            }
            status = RolloutStatus::default();
        } else if changed && prior.rolling_state == RollingState::RollingInBatches {
            // Replicas of the old pair are already committed. Fail first and
            // keep the old pair recorded so the next pass restarts cleanly.
            let message = format!(
                "revisions changed to {:?} -> {} while rolling",
                obs.source_revision, obs.target_revision
            );
            self.fail(obs, &mut status, &mut actions, "RevisionChanged", message, now);
            return Decision {
                status,
                actions,
                requeue: Requeue::Immediately,
            };
        }

        status.last_upgraded_target_revision = Some(obs.target_revision.to_string());
        status.last_source_revision = obs.source_revision.map(str::to_string);

        let requeue = match status.rolling_state {
            RollingState::Initial => self.initialize(obs, &mut status, &mut actions, now),
            RollingState::RollingInBatches => self.roll(obs, &mut status, &mut actions, now),
            RollingState::RolloutSucceeded | RollingState::RolloutFailed => Requeue::Never,
        };

        Decision {
            status,
            actions,
            requeue,
        }
    }

    fn initialize(
        &self,
        obs: &Observation<'_>,
        status: &mut RolloutStatus,
        actions: &mut Vec<Action>,
        now: u64,
    ) -> Requeue {
        if let Some(requeue) = self.await_revisions(obs, status, now) {
            return requeue;
        }
        if let Err(e) = validate_plan(obs.plan) {
            return self.reject_plan(obs, status, &e, now);
        }
        status.set_condition(Condition::new(
            ConditionType::PlanValid,
            ConditionStatus::True,
            "PlanValid",
            "",
            now,
        ));

        status.rolling_state = RollingState::RollingInBatches;
        status.batch_rolling_state = BatchRollingState::BatchInitial;
        status.current_batch = 0;
        status.ownership_claimed = false;
        status.batch_started_at = None;
        status.missing_since = None;
        actions.push(Action::MarkRevisionsRolling);
        info!(
            rollout = %obs.rollout,
            batches = obs.plan.batches.len(),
            partition = ?obs.plan.batch_partition,
            "rollout initialized, rolling in batches"
        );
        Requeue::Immediately
    }

    fn roll(
        &self,
        obs: &Observation<'_>,
        status: &mut RolloutStatus,
        actions: &mut Vec<Action>,
        now: u64,
    ) -> Requeue {
        if let Some(requeue) = self.await_revisions(obs, status, now) {
            return requeue;
        }
        if let Err(e) = validate_plan(obs.plan) {
            return self.reject_plan(obs, status, &e, now);
        }
        status.set_condition(Condition::new(
            ConditionType::PlanValid,
            ConditionStatus::True,
            "PlanValid",
            "",
            now,
        ));

        // ── Resolve workloads ──────────────────────────────────────
        let snapshot = match &obs.target {
            Observed::Found(snapshot) => snapshot,
            _ if status.ownership_claimed => {
                let err = RolloutError::WorkloadNotFound(format!(
                    "workload of revision {} disappeared after it was claimed",
                    obs.target_revision
                ));
                return self.fail(obs, status, actions, err.reason(), err.to_string(), now);
            }
            _ => return self.await_missing(obs, obs.target_revision, status, actions, now),
        };
        if !status.ownership_claimed && matches!(obs.source, Some(Observed::Missing)) {
            let source = obs.source_revision.unwrap_or_default();
            return self.await_missing(obs, source, status, actions, now);
        }
        status.missing_since = None;
        status.set_condition(Condition::new(
            ConditionType::WorkloadsResolved,
            ConditionStatus::True,
            "WorkloadsResolved",
            "",
            now,
        ));

        // ── Ownership ──────────────────────────────────────────────
        // A release interrupted after unpausing is finished, not undone.
        let releasing = status.ownership_claimed
            && status.batch_rolling_state == BatchRollingState::BatchReady
            && status.current_batch as usize + 1 == obs.plan.batches.len()
            && !obs.plan.paused
            && matches!(
                &snapshot.controlled_by,
                ControlledBy::RolloutEngine { rollout } if rollout == obs.rollout
            );
        if !releasing && !is_held_by(snapshot, obs.rollout) {
            if let ControlledBy::RolloutEngine { rollout: holder } = &snapshot.controlled_by {
                if holder != obs.rollout {
                    let err = RolloutError::OwnershipConflict {
                        workload: obs.target_revision.to_string(),
                        holder: holder.clone(),
                    };
                    warn!(rollout = %obs.rollout, %holder, "target workload held by another rollout");
                    status.set_condition(Condition::new(
                        ConditionType::OwnershipClaimed,
                        ConditionStatus::False,
                        err.reason(),
                        err.to_string(),
                        now,
                    ));
                    return Requeue::After(secs(self.config.conflict_backoff_secs));
                }
            }
            status.set_condition(Condition::new(
                ConditionType::OwnershipClaimed,
                ConditionStatus::False,
                "Claiming",
                "claiming the target workload",
                now,
            ));
            actions.push(Action::ClaimOwnership);
            return Requeue::Immediately;
        }
        if !status.ownership_claimed {
            info!(rollout = %obs.rollout, "target workload claimed");
            status.ownership_claimed = true;
        }
        status.set_condition(Condition::new(
            ConditionType::OwnershipClaimed,
            ConditionStatus::True,
            "Claimed",
            format!("workload controlled by rollout {}", obs.rollout),
            now,
        ));

        status.rollout_target_size = Some(snapshot.desired_replicas);
        status.upgraded_replicas = snapshot.updated_replicas;
        status.upgraded_ready_replicas = snapshot.updated_ready_replicas;

        // ── Batches ────────────────────────────────────────────────
        let current = status.current_batch;
        if let Some(partition) = obs.plan.batch_partition {
            if partition < current {
                let message =
                    format!("batch partition moved back to {partition} after batch {current} was reached");
                return self.fail(obs, status, actions, "BatchPartitionReduced", message, now);
            }
        }
        let target =
            match compute_batch_target(&obs.plan.batches, current, snapshot.desired_replicas) {
                Ok(target) => target,
                Err(e) => return self.reject_plan(obs, status, &e, now),
            };
        let poll = Requeue::After(secs(self.config.verify_poll_secs));

        match status.batch_rolling_state {
            BatchRollingState::BatchInitial => {
                if obs.plan.paused {
                    status.batch_rolling_state = BatchRollingState::BatchPausing;
                    return Requeue::Immediately;
                }
                actions.push(Action::SetTargetReplicas(target));
                status.batch_rolling_state = BatchRollingState::BatchInRolling;
                status.batch_started_at = Some(now);
                status.set_condition(Condition::new(
                    ConditionType::BatchReady,
                    ConditionStatus::False,
                    "BatchRolling",
                    format!("batch {current} rolling to {target} replicas"),
                    now,
                ));
                info!(rollout = %obs.rollout, batch = current, target, "batch started");
                poll
            }
            BatchRollingState::BatchInRolling => {
                if snapshot.target_replicas != Some(target) {
                    actions.push(Action::SetTargetReplicas(target));
                }
                if snapshot.updated_replicas >= target {
                    debug!(rollout = %obs.rollout, batch = current, "batch applied, verifying");
                    status.batch_rolling_state = BatchRollingState::BatchVerifying;
                    return Requeue::Immediately;
                }
                self.check_health_gate(obs, status, actions, now)
                    .unwrap_or(poll)
            }
            BatchRollingState::BatchVerifying => {
                if snapshot.updated_ready_replicas >= target {
                    status.batch_rolling_state = BatchRollingState::BatchReady;
                    status.set_condition(Condition::new(
                        ConditionType::BatchReady,
                        ConditionStatus::True,
                        "BatchReady",
                        format!("batch {current} has {target} ready replicas"),
                        now,
                    ));
                    info!(rollout = %obs.rollout, batch = current, "batch ready");
                    return Requeue::Immediately;
                }
                self.check_health_gate(obs, status, actions, now)
                    .unwrap_or(poll)
            }
            BatchRollingState::BatchReady => self.after_batch_ready(obs, status, actions, now),
            BatchRollingState::BatchPausing => {
                status.set_condition(Condition::new(
                    ConditionType::BatchPaused,
                    ConditionStatus::True,
                    "Paused",
                    format!("rollout paused at batch {current}"),
                    now,
                ));
                status.batch_rolling_state = BatchRollingState::BatchPaused;
                info!(rollout = %obs.rollout, batch = current, "rollout paused");
                Requeue::Never
            }
            BatchRollingState::BatchPaused => {
                if obs.plan.paused {
                    return Requeue::Never;
                }
                status.set_condition(Condition::new(
                    ConditionType::BatchPaused,
                    ConditionStatus::False,
                    "Resumed",
                    format!("rollout resumed at batch {current}"),
                    now,
                ));
                // Re-enter the batch: the target write is idempotent and the
                // gates are re-checked before advancing.
                status.batch_rolling_state = BatchRollingState::BatchInitial;
                info!(rollout = %obs.rollout, batch = current, "rollout resumed");
                Requeue::Immediately
            }
        }
    }

    fn after_batch_ready(
        &self,
        obs: &Observation<'_>,
        status: &mut RolloutStatus,
        actions: &mut Vec<Action>,
        now: u64,
    ) -> Requeue {
        if obs.plan.paused {
            status.batch_rolling_state = BatchRollingState::BatchPausing;
            return Requeue::Immediately;
        }

        let last = (obs.plan.batches.len() - 1) as u32;
        let limit = obs.plan.batch_partition.unwrap_or(last);
        let current = status.current_batch;

        if current < limit {
            status.current_batch = current + 1;
            status.batch_rolling_state = BatchRollingState::BatchInitial;
            status.batch_started_at = None;
            debug!(rollout = %obs.rollout, batch = current + 1, "advancing to next batch");
            return Requeue::Immediately;
        }

        if current == last {
            status.rolling_state = RollingState::RolloutSucceeded;
            status.set_condition(Condition::new(
                ConditionType::RolloutSucceeded,
                ConditionStatus::True,
                "RolloutSucceeded",
                format!(
                    "all {} replicas run revision {}",
                    status.rollout_target_size.unwrap_or_default(),
                    obs.target_revision
                ),
                now,
            ));
            if obs.source_revision.is_some() {
                actions.push(Action::MarkSourceInactive);
            }
            actions.push(Action::ReleaseOwnership);
            actions.push(Action::MarkTargetCompleted);
            info!(rollout = %obs.rollout, target = %obs.target_revision, "rollout succeeded");
            return Requeue::Never;
        }

        debug!(rollout = %obs.rollout, batch = current, "holding at batch partition");
        Requeue::Never
    }

    /// Hold while a revision has not been rendered for rolling.
    fn await_revisions(
        &self,
        obs: &Observation<'_>,
        status: &mut RolloutStatus,
        now: u64,
    ) -> Option<Requeue> {
        let revision = if obs.target == Observed::NotReady {
            obs.target_revision
        } else if obs.source == Some(Observed::NotReady) {
            obs.source_revision.unwrap_or_default()
        } else {
            return None;
        };
        debug!(rollout = %obs.rollout, %revision, "revision is not ready for rolling yet");
        status.set_condition(Condition::new(
            ConditionType::WorkloadsResolved,
            ConditionStatus::False,
            "RevisionNotReady",
            format!("revision {revision} is not ready for rolling yet"),
            now,
        ));
        Some(Requeue::After(secs(self.config.not_ready_retry_secs)))
    }

    /// Retry a missing, unclaimed workload until the grace window elapses.
    fn await_missing(
        &self,
        obs: &Observation<'_>,
        revision: &str,
        status: &mut RolloutStatus,
        actions: &mut Vec<Action>,
        now: u64,
    ) -> Requeue {
        let since = *status.missing_since.get_or_insert(now);
        let missing_for = now.saturating_sub(since);
        if missing_for >= self.config.not_found_grace_secs {
            let err = RolloutError::WorkloadNotFound(format!(
                "workload of revision {revision} missing for {missing_for}s"
            ));
            return self.fail(obs, status, actions, err.reason(), err.to_string(), now);
        }
        warn!(rollout = %obs.rollout, %revision, missing_for, "workload not found");
        status.set_condition(Condition::new(
            ConditionType::WorkloadsResolved,
            ConditionStatus::False,
            "WorkloadNotFound",
            format!("workload of revision {revision} not found"),
            now,
        ));
        Requeue::After(secs(self.config.not_found_retry_secs))
    }

    fn check_health_gate(
        &self,
        obs: &Observation<'_>,
        status: &mut RolloutStatus,
        actions: &mut Vec<Action>,
        now: u64,
    ) -> Option<Requeue> {
        let started = status.batch_started_at?;
        let waited_secs = now.saturating_sub(started);
        if waited_secs <= self.config.health_gate_timeout_secs {
            return None;
        }
        let err = RolloutError::HealthGateTimeout {
            batch: status.current_batch,
            waited_secs,
        };
        Some(self.fail(obs, status, actions, err.reason(), err.to_string(), now))
    }

    /// Record a malformed plan. No transition: the user has to fix it.
    fn reject_plan(
        &self,
        obs: &Observation<'_>,
        status: &mut RolloutStatus,
        err: &RolloutError,
        now: u64,
    ) -> Requeue {
        warn!(rollout = %obs.rollout, error = %err, "rejecting rollout plan");
        status.set_condition(Condition::new(
            ConditionType::PlanValid,
            ConditionStatus::False,
            err.reason(),
            err.to_string(),
            now,
        ));
        Requeue::Never
    }

    /// Terminal failure. The condition is written before the state flips.
    fn fail(
        &self,
        obs: &Observation<'_>,
        status: &mut RolloutStatus,
        actions: &mut Vec<Action>,
        reason: &str,
        message: String,
        now: u64,
    ) -> Requeue {
        warn!(rollout = %obs.rollout, reason, %message, "rollout failed");
        status.set_condition(Condition::new(
            ConditionType::RolloutFailed,
            ConditionStatus::True,
            reason,
            message,
            now,
        ));
        status.rolling_state = RollingState::RolloutFailed;
        actions.push(Action::ClearRolloutMarkers);
        Requeue::Never
    }
}
