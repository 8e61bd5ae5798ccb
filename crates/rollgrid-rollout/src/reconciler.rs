//! Reconciler — drives rollouts to completion.
//!
//! One [`Reconciler::reconcile`] invocation loads a rollout record, observes
//! its revisions and workloads, runs the state machine once, applies the
//! resulting actions, and persists the new status with optimistic
//! concurrency. A rollout whose deletion was requested is finalized
//! instead: its claims are handed back, then its record is removed.
//! [`Reconciler::run`] schedules invocations: at most one in flight per
//! rollout, many rollouts in parallel.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rollgrid_core::{epoch_secs, EngineConfig};
use rollgrid_state::{RollingState, RolloutRecord, RolloutSpec, RolloutStatus};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::accessor::{RevisionMark, RevisionStore, StatusStore, WorkloadAccessor, WorkloadHandle};
use crate::backend::StoreBackend;
use crate::error::{AccessError, RolloutError, RolloutResult};
use crate::machine::{Action, Observation, Observed, Requeue, RolloutMachine};
use crate::ownership::OwnershipManager;

/// Source of "now" in Unix seconds.
pub type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Executes the rollout state machine against real collaborators.
#[derive(Clone)]
pub struct Reconciler {
    statuses: Arc<dyn StatusStore>,
    revisions: Arc<dyn RevisionStore>,
    accessor: Arc<dyn WorkloadAccessor>,
    ownership: OwnershipManager,
    machine: RolloutMachine,
    config: EngineConfig,
    clock: Clock,
}

impl Reconciler {
    pub fn new(
        statuses: Arc<dyn StatusStore>,
        revisions: Arc<dyn RevisionStore>,
        accessor: Arc<dyn WorkloadAccessor>,
        config: EngineConfig,
    ) -> Self {
        Self {
            statuses,
            revisions,
            ownership: OwnershipManager::new(accessor.clone()),
            accessor,
            machine: RolloutMachine::new(config.rollout.clone()),
            config,
            clock: Arc::new(epoch_secs),
        }
    }

    /// Wire every collaborator to one store-backed implementation.
    pub fn from_backend(backend: StoreBackend, config: EngineConfig) -> Self {
        let backend = Arc::new(backend);
        Self::new(backend.clone(), backend.clone(), backend, config)
    }

    /// Replace the wall clock (tests).
    pub fn with_clock(mut self, clock: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Bound one collaborator call by the configured call timeout.
    async fn call<T, E, F>(&self, operation: &'static str, fut: F) -> RolloutResult<T>
    where
        F: Future<Output = Result<T, E>>,
        RolloutError: From<E>,
    {
        let after = self.config.call_timeout();
        match tokio::time::timeout(after, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(RolloutError::Timeout { operation, after }),
        }
    }

    /// Run one reconciliation of rollout `id`.
    pub async fn reconcile(&self, id: &str) -> RolloutResult<Requeue> {
        let started = std::time::Instant::now();
        let after = self.config.reconcile_timeout();
        let result = match tokio::time::timeout(after, self.reconcile_inner(id)).await {
            Ok(result) => result,
            Err(_) => Err(RolloutError::Timeout {
                operation: "reconcile",
                after,
            }),
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(requeue) => debug!(rollout = %id, ?requeue, elapsed_ms, "rollout reconciled"),
            Err(e) => warn!(rollout = %id, error = %e, elapsed_ms, "rollout reconcile failed"),
        }
        result
    }

    async fn reconcile_inner(&self, id: &str) -> RolloutResult<Requeue> {
        let Some(record) = self.call("load rollout", self.statuses.load(id)).await? else {
            debug!(rollout = %id, "rollout no longer exists");
            return Ok(Requeue::Never);
        };
        if record.spec.deletion_requested_at.is_some() {
            return self.finalize(id, &record).await;
        }
        let spec = &record.spec;
        let status = &record.status;

        if status.rolling_state.is_terminal()
            && status.last_upgraded_target_revision.as_deref() == Some(spec.target_revision.as_str())
            && status.last_source_revision == spec.source_revision
        {
            debug!(rollout = %id, state = ?status.rolling_state, "rollout terminated, skipping");
            return Ok(Requeue::Never);
        }

        let target = self.observe(&spec.namespace, &spec.target_revision).await?;
        let source = match &spec.source_revision {
            Some(name) => Some(self.observe(&spec.namespace, name).await?),
            None => None,
        };
        let observation = Observation {
            rollout: id,
            plan: &spec.plan,
            target_revision: &spec.target_revision,
            source_revision: spec.source_revision.as_deref(),
            target,
            source,
        };

        let decision = self.machine.reconcile(&observation, status, (self.clock)());
        for action in &decision.actions {
            self.apply(id, &record, *action).await?;
        }
        if decision.status != *status {
            self.persist(id, &record, &decision.status).await?;
        }
        Ok(decision.requeue)
    }

    /// Look up a revision and the workload it renders to.
    async fn observe(&self, namespace: &str, revision: &str) -> RolloutResult<Observed> {
        let Some(rev) = self
            .call("get revision", self.revisions.get_revision(namespace, revision))
            .await?
        else {
            return Ok(Observed::Missing);
        };
        if !rev.ready_for_rolling {
            return Ok(Observed::NotReady);
        }
        let Some(handle) = self
            .call("resolve workload", self.accessor.resolve(namespace, &rev.workload))
            .await?
        else {
            return Ok(Observed::Missing);
        };
        let snapshot = self
            .call("snapshot workload", self.accessor.snapshot(&handle))
            .await?;
        Ok(snapshot.map_or(Observed::Missing, Observed::Found))
    }

    async fn target_handle(&self, spec: &RolloutSpec) -> RolloutResult<Option<WorkloadHandle>> {
        let Some(rev) = self
            .call(
                "get revision",
                self.revisions.get_revision(&spec.namespace, &spec.target_revision),
            )
            .await?
        else {
            return Ok(None);
        };
        self.call("resolve workload", self.accessor.resolve(&spec.namespace, &rev.workload))
            .await
    }

    async fn require_target(&self, spec: &RolloutSpec) -> RolloutResult<WorkloadHandle> {
        self.target_handle(spec)
            .await?
            .ok_or_else(|| RolloutError::WorkloadNotFound(spec.target_revision.clone()))
    }

    /// Marking a revision that was deleted meanwhile is not an error.
    async fn mark(&self, namespace: &str, revision: &str, mark: RevisionMark) -> RolloutResult<()> {
        match self
            .call("mark revision", self.revisions.mark_revision(namespace, revision, mark))
            .await
        {
            Err(RolloutError::Access(AccessError::NotFound(_))) => {
                debug!(%namespace, %revision, ?mark, "revision gone, mark skipped");
                Ok(())
            }
            other => other,
        }
    }

    /// Release the workload of `revision` if rollout `id` still claims it.
    async fn release_revision(
        &self,
        namespace: &str,
        revision: &str,
        id: &str,
    ) -> RolloutResult<()> {
        let Some(rev) = self
            .call("get revision", self.revisions.get_revision(namespace, revision))
            .await?
        else {
            return Ok(());
        };
        let Some(handle) = self
            .call("resolve workload", self.accessor.resolve(namespace, &rev.workload))
            .await?
        else {
            return Ok(());
        };
        self.call("release workload", self.ownership.release_claim(&handle, id))
            .await?;
        Ok(())
    }

    /// Hand back everything rollout `id` holds, then drop its record.
    async fn finalize(&self, id: &str, record: &RolloutRecord) -> RolloutResult<Requeue> {
        let spec = &record.spec;
        let status = &record.status;
        let ns = spec.namespace.as_str();

        let mut targets = vec![spec.target_revision.as_str()];
        if let Some(previous) = status.last_upgraded_target_revision.as_deref() {
            if previous != spec.target_revision {
                targets.push(previous);
            }
        }
        for revision in targets {
            self.release_revision(ns, revision, id).await?;
        }

        if status.rolling_state == RollingState::RollingInBatches {
            if let Some(target) = &status.last_upgraded_target_revision {
                self.mark(ns, target, RevisionMark::RolloutEnded).await?;
            }
            if let Some(source) = &status.last_source_revision {
                self.mark(ns, source, RevisionMark::RolloutEnded).await?;
            }
        }

        let removed = self
            .call("remove rollout", self.statuses.remove(id, record.version))
            .await?;
        info!(rollout = %id, removed, "rollout finalized");
        Ok(Requeue::Never)
    }

    async fn apply(&self, id: &str, record: &RolloutRecord, action: Action) -> RolloutResult<()> {
        debug!(rollout = %id, ?action, "applying action");
        let spec = &record.spec;
        let ns = spec.namespace.as_str();
        match action {
            Action::MarkRevisionsRolling => {
                self.mark(ns, &spec.target_revision, RevisionMark::UnderRollout)
                    .await?;
                if let Some(source) = &spec.source_revision {
                    self.mark(ns, source, RevisionMark::UnderRollout).await?;
                }
            }
            Action::ClaimOwnership => {
                let handle = self.require_target(spec).await?;
                self.call("claim workload", self.ownership.claim(&handle, id))
                    .await?;
            }
            Action::SetTargetReplicas(replicas) => {
                let handle = self.require_target(spec).await?;
                self.call(
                    "set target replicas",
                    self.accessor.set_target_replica_count(&handle, replicas),
                )
                .await?;
            }
            Action::ReleaseOwnership => {
                if let Some(handle) = self.target_handle(spec).await? {
                    self.call("release workload", self.ownership.release(&handle, id))
                        .await?;
                }
            }
            Action::ReleasePreviousTarget => {
                if let Some(previous) = &record.status.last_upgraded_target_revision {
                    self.release_revision(ns, previous, id).await?;
                }
            }
            Action::MarkSourceInactive => {
                if let Some(source) = &spec.source_revision {
                    self.mark(ns, source, RevisionMark::Superseded).await?;
                }
            }
            Action::MarkTargetCompleted => {
                self.mark(ns, &spec.target_revision, RevisionMark::RollingCompleted)
                    .await?;
            }
            Action::ClearRolloutMarkers => {
                self.mark(ns, &spec.target_revision, RevisionMark::RolloutEnded)
                    .await?;
                if let Some(source) = &spec.source_revision {
                    self.mark(ns, source, RevisionMark::RolloutEnded).await?;
                }
            }
        }
        Ok(())
    }

    /// Write `status`, retrying while only the spec half of the record moved.
    async fn persist(
        &self,
        id: &str,
        record: &RolloutRecord,
        status: &RolloutStatus,
    ) -> RolloutResult<()> {
        let attempts = self.config.reconcile.status_update_attempts.max(1);
        let mut version = record.version;
        for attempt in 1..=attempts {
            match self
                .call("update status", self.statuses.update_status(id, status, version))
                .await
            {
                Ok(new_version) => {
                    debug!(rollout = %id, version = new_version, "rollout status persisted");
                    return Ok(());
                }
                Err(RolloutError::Access(AccessError::VersionConflict { found, .. })) => {
                    let Some(current) = self.call("load rollout", self.statuses.load(id)).await?
                    else {
                        debug!(rollout = %id, "rollout deleted while reconciling");
                        return Ok(());
                    };
                    if current.status != record.status {
                        return Err(RolloutError::VersionConflict {
                            key: id.to_string(),
                            attempts: attempt,
                        });
                    }
                    debug!(rollout = %id, attempt, found, "rollout spec moved, retrying status write");
                    version = current.version;
                }
                Err(e) => return Err(e),
            }
        }
        Err(RolloutError::VersionConflict {
            key: id.to_string(),
            attempts,
        })
    }

    /// Schedule reconciliations until `shutdown` fires.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let resync = self.config.resync_interval();
        info!(resync_secs = resync.as_secs(), "reconciler started");

        let mut schedules: HashMap<String, Schedule> = HashMap::new();
        let mut in_flight: HashMap<tokio::task::Id, String> = HashMap::new();
        let mut tasks: JoinSet<RolloutResult<Requeue>> = JoinSet::new();
        let mut tick = tokio::time::interval(resync);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let next_due = schedules
                .values()
                .filter(|s| !s.running)
                .filter_map(|s| s.due)
                .min();
            let wake = async move {
                match next_due {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.refresh(&mut schedules).await {
                        warn!(error = %e, "failed to list rollouts");
                    }
                }
                _ = wake => {}
                Some(joined) = tasks.join_next_with_id() => {
                    let (task_id, outcome) = match joined {
                        Ok((task_id, result)) => (task_id, Some(result)),
                        Err(e) => {
                            error!(error = %e, "reconcile task aborted");
                            (e.id(), None)
                        }
                    };
                    if let Some(id) = in_flight.remove(&task_id) {
                        if let Some(schedule) = schedules.get_mut(&id) {
                            schedule.settle(&id, outcome, Instant::now());
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!(in_flight = in_flight.len(), "reconciler shutting down");
                    tasks.shutdown().await;
                    break;
                }
            }

            self.dispatch(&mut schedules, &mut in_flight, &mut tasks);
        }
    }

    /// Pick up new, edited, and deleted rollouts.
    async fn refresh(&self, schedules: &mut HashMap<String, Schedule>) -> RolloutResult<()> {
        let records = self.call("list rollouts", self.statuses.list()).await?;
        let now = Instant::now();
        let mut present = Vec::with_capacity(records.len());
        for record in records {
            let id = record.spec.table_key();
            let schedule = schedules.entry(id.clone()).or_insert_with(|| Schedule {
                due: Some(now),
                seen_version: record.version,
                failures: 0,
                running: false,
            });
            if schedule.seen_version != record.version {
                schedule.seen_version = record.version;
                schedule.due = Some(now);
                schedule.failures = 0;
            } else if schedule.due.is_none() && !record.status.rolling_state.is_terminal() {
                // Held rollouts are re-checked every resync.
                schedule.due = Some(now);
            }
            present.push(id);
        }
        schedules.retain(|id, _| present.contains(id));
        Ok(())
    }

    fn dispatch(
        self: &Arc<Self>,
        schedules: &mut HashMap<String, Schedule>,
        in_flight: &mut HashMap<tokio::task::Id, String>,
        tasks: &mut JoinSet<RolloutResult<Requeue>>,
    ) {
        let now = Instant::now();
        for (id, schedule) in schedules.iter_mut() {
            if schedule.running || !schedule.due.is_some_and(|at| at <= now) {
                continue;
            }
            schedule.running = true;
            schedule.due = None;
            let this = Arc::clone(self);
            let rollout = id.clone();
            let handle = tasks.spawn(async move { this.reconcile(&rollout).await });
            in_flight.insert(handle.id(), id.clone());
        }
    }
}

/// Per-rollout scheduling state of the run loop.
#[derive(Debug)]
struct Schedule {
    due: Option<Instant>,
    /// Record version seen by the last listing.
    seen_version: u64,
    failures: u32,
    running: bool,
}

impl Schedule {
    fn settle(&mut self, id: &str, outcome: Option<RolloutResult<Requeue>>, now: Instant) {
        self.running = false;
        match outcome {
            Some(Ok(requeue)) => {
                self.failures = 0;
                self.due = match requeue {
                    Requeue::Immediately => Some(now),
                    Requeue::After(delay) => Some(now + delay),
                    // Woken by the next version change or resync.
                    Requeue::Never => None,
                };
            }
            Some(Err(e)) if !e.is_retryable() => {
                warn!(rollout = %id, error = %e, "rollout needs a spec change to continue");
                self.due = None;
            }
            _ => {
                self.failures += 1;
                let backoff = Duration::from_secs(1)
                    .saturating_mul(1 << self.failures.min(10).saturating_sub(1))
                    .min(MAX_BACKOFF);
                debug!(rollout = %id, failures = self.failures, backoff_secs = backoff.as_secs(), "backing off");
                self.due = Some(now + backoff);
            }
        }
    }
}
