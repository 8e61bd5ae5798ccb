//! Domain types for the rollgrid state store.
//!
//! These types represent the declarative objects the rollout engine reads
//! and writes: rollout records (user plan + engine status), revisions, and
//! the scalable workloads those revisions resolve to. All types are
//! serializable to/from JSON for storage in redb tables.

use serde::{Deserialize, Serialize};

/// Identity of a rollout, `{namespace}/{name}`.
pub type RolloutId = String;

/// Build the `{namespace}/{name}` key shared by every table.
pub fn object_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

// ── Rollout plan ──────────────────────────────────────────────────

/// How many replicas a single batch covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchSize {
    /// Absolute number of replicas.
    Replicas(i64),
    /// Percentage of the workload's desired replicas.
    Percent(i64),
}

/// One entry of a rollout plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutBatch {
    pub size: BatchSize,
}

impl RolloutBatch {
    pub fn replicas(n: i64) -> Self {
        Self {
            size: BatchSize::Replicas(n),
        }
    }

    pub fn percent(p: i64) -> Self {
        Self {
            size: BatchSize::Percent(p),
        }
    }
}

/// User-declared pace of a rollout. Edited at any time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutPlan {
    pub batches: Vec<RolloutBatch>,
    /// Batch index to advance to and hold at. `None` runs to completion.
    #[serde(default)]
    pub batch_partition: Option<u32>,
    #[serde(default)]
    pub paused: bool,
}

/// A rollout as declared by the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutSpec {
    pub namespace: String,
    pub name: String,
    pub target_revision: String,
    /// Absent on a first deployment: nothing to retire.
    #[serde(default)]
    pub source_revision: Option<String>,
    pub plan: RolloutPlan,
    /// Set when deletion was requested. The engine hands back any claimed
    /// workload before it removes the record.
    #[serde(default)]
    pub deletion_requested_at: Option<u64>,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub updated_at: u64,
}

impl RolloutSpec {
    /// Build the composite key for the rollouts table.
    pub fn table_key(&self) -> RolloutId {
        object_key(&self.namespace, &self.name)
    }
}

// ── Rollout status ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollingState {
    #[default]
    Initial,
    RollingInBatches,
    RolloutSucceeded,
    RolloutFailed,
}

impl RollingState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::RolloutSucceeded | Self::RolloutFailed)
    }
}

/// Sub-phase within the current batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchRollingState {
    #[default]
    BatchInitial,
    BatchInRolling,
    BatchVerifying,
    BatchReady,
    BatchPausing,
    BatchPaused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionType {
    PlanValid,
    WorkloadsResolved,
    OwnershipClaimed,
    BatchReady,
    BatchPaused,
    RolloutSucceeded,
    RolloutFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// A timestamped observation about the rollout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    pub status: ConditionStatus,
    /// Unix seconds of the last status flip.
    pub last_transition_time: u64,
    pub reason: String,
    pub message: String,
}

impl Condition {
    pub fn new(
        condition_type: ConditionType,
        status: ConditionStatus,
        reason: &str,
        message: impl Into<String>,
        now: u64,
    ) -> Self {
        Self {
            condition_type,
            status,
            last_transition_time: now,
            reason: reason.to_string(),
            message: message.into(),
        }
    }
}

/// Engine-owned progress record of a rollout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutStatus {
    pub rolling_state: RollingState,
    pub batch_rolling_state: BatchRollingState,
    pub current_batch: u32,
    #[serde(default)]
    pub last_upgraded_target_revision: Option<String>,
    #[serde(default)]
    pub last_source_revision: Option<String>,
    /// Desired replicas of the target workload as last observed.
    #[serde(default)]
    pub rollout_target_size: Option<u32>,
    #[serde(default)]
    pub upgraded_replicas: u32,
    #[serde(default)]
    pub upgraded_ready_replicas: u32,
    /// Set once the target workload was observed fully claimed.
    #[serde(default)]
    pub ownership_claimed: bool,
    /// When the current batch's target count was applied.
    #[serde(default)]
    pub batch_started_at: Option<u64>,
    /// When a required workload was first seen missing.
    #[serde(default)]
    pub missing_since: Option<u64>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl RolloutStatus {
    pub fn get_condition(&self, condition_type: ConditionType) -> Option<&Condition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }

    /// Insert or update a condition.
    ///
    /// `last_transition_time` only moves when the status flips, so writing
    /// the same observation twice leaves the record untouched.
    pub fn set_condition(&mut self, mut condition: Condition) {
        match self
            .conditions
            .iter_mut()
            .find(|c| c.condition_type == condition.condition_type)
        {
            Some(existing) => {
                if existing.status == condition.status {
                    condition.last_transition_time = existing.last_transition_time;
                }
                *existing = condition;
            }
            None => self.conditions.push(condition),
        }
    }

    /// Whether `condition_type` is present with status `True`.
    pub fn is_condition_true(&self, condition_type: ConditionType) -> bool {
        self.get_condition(condition_type)
            .is_some_and(|c| c.status == ConditionStatus::True)
    }
}

/// A rollout as persisted: user spec, engine status, and a version token
/// bumped on every write to either half.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutRecord {
    pub spec: RolloutSpec,
    #[serde(default)]
    pub status: RolloutStatus,
    pub version: u64,
}

// ── Revision ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevisionRollingStatus {
    #[default]
    Pending,
    Rolling,
    RollingCompleted,
    InactiveAfterRollingCompleted,
}

/// Signals the engine leaves on a revision for its natural controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionMarkers {
    /// The revision's workload is under active rollout control.
    pub under_rollout: bool,
    /// The revision has been replaced and must stop reconciling.
    pub superseded: bool,
}

/// An immutable snapshot of a deployable unit's desired specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    pub namespace: String,
    pub name: String,
    /// Name of the workload (same namespace) this revision renders to.
    pub workload: String,
    /// The revision's workload has been rendered and may be rolled.
    #[serde(default)]
    pub ready_for_rolling: bool,
    #[serde(default)]
    pub rolling_status: RevisionRollingStatus,
    #[serde(default)]
    pub markers: RevisionMarkers,
    #[serde(default)]
    pub updated_at: u64,
}

impl Revision {
    /// Build the composite key for the revisions table.
    pub fn table_key(&self) -> String {
        object_key(&self.namespace, &self.name)
    }

    pub fn workload_key(&self) -> String {
        object_key(&self.namespace, &self.workload)
    }
}

// ── Workload ──────────────────────────────────────────────────────

/// Who currently holds mutation rights over a workload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlledBy {
    #[default]
    None,
    RolloutEngine { rollout: RolloutId },
    NativeController { owner: String },
}

/// Replica counts reported by the workload's natural controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadStatus {
    pub total_replicas: u32,
    /// Replicas already running the target version.
    pub updated_replicas: u32,
    pub updated_ready_replicas: u32,
}

/// A scalable resource the rollout engine can freeze and pace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workload {
    pub namespace: String,
    pub name: String,
    /// The declarative owner control returns to on release.
    pub native_owner: String,
    /// Desired replicas of the workload.
    pub replicas: u32,
    /// Replicas the engine wants on the new version; `None` = all.
    #[serde(default)]
    pub target_replicas: Option<u32>,
    /// Freezes the natural controller's own updates.
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub controlled_by: ControlledBy,
    #[serde(default)]
    pub status: WorkloadStatus,
    #[serde(default)]
    pub updated_at: u64,
}

impl Workload {
    /// Build the composite key for the workloads table.
    pub fn table_key(&self) -> String {
        object_key(&self.namespace, &self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cond(status: ConditionStatus, reason: &str, now: u64) -> Condition {
        Condition::new(ConditionType::BatchPaused, status, reason, "", now)
    }

    #[test]
    fn set_condition_keeps_time_when_status_unchanged() {
        let mut status = RolloutStatus::default();
        status.set_condition(cond(ConditionStatus::True, "Paused", 100));
        status.set_condition(cond(ConditionStatus::True, "StillPaused", 200));

        let c = status.get_condition(ConditionType::BatchPaused).unwrap();
        assert_eq!(c.last_transition_time, 100);
        assert_eq!(c.reason, "StillPaused");
        assert_eq!(status.conditions.len(), 1);
    }

    #[test]
    fn set_condition_moves_time_on_flip() {
        let mut status = RolloutStatus::default();
        status.set_condition(cond(ConditionStatus::True, "Paused", 100));
        status.set_condition(cond(ConditionStatus::False, "Resumed", 300));

        let c = status.get_condition(ConditionType::BatchPaused).unwrap();
        assert_eq!(c.last_transition_time, 300);
        assert!(!status.is_condition_true(ConditionType::BatchPaused));
    }

    #[test]
    fn batch_size_wire_format() {
        let plan = RolloutPlan {
            batches: vec![RolloutBatch::percent(25), RolloutBatch::replicas(3)],
            batch_partition: Some(0),
            paused: false,
        };
        let json = serde_json::to_value(&plan).unwrap();
        assert_eq!(json["batches"][0]["size"]["percent"], 25);
        assert_eq!(json["batches"][1]["size"]["replicas"], 3);
    }

    #[test]
    fn plan_defaults_when_fields_omitted() {
        let plan: RolloutPlan =
            serde_json::from_str(r#"{"batches":[{"size":{"percent":100}}]}"#).unwrap();
        assert_eq!(plan.batch_partition, None);
        assert!(!plan.paused);
    }

    #[test]
    fn controlled_by_is_tagged() {
        let owner = ControlledBy::RolloutEngine {
            rollout: "prod/api".to_string(),
        };
        let json = serde_json::to_value(&owner).unwrap();
        assert_eq!(json["kind"], "rollout_engine");
        assert_eq!(json["rollout"], "prod/api");
    }
}
