//! Rollout engine error types.

use std::time::Duration;

use rollgrid_state::StateError;
use thiserror::Error;

/// Result type alias for collaborator calls.
pub type AccessResult<T> = Result<T, AccessError>;

/// Errors returned by the collaborators the engine drives (workload
/// accessor, revision store, status store).
#[derive(Debug, Error)]
pub enum AccessError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("version conflict on {key}: expected {expected}, found {found}")]
    VersionConflict {
        key: String,
        expected: u64,
        found: u64,
    },

    /// A conditional write saw a different current value.
    #[error("precondition failed on {key}: {reason}")]
    Precondition { key: String, reason: String },

    #[error("backend error: {0}")]
    Backend(String),
}

impl From<StateError> for AccessError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::NotFound(key) => Self::NotFound(key),
            StateError::VersionConflict {
                key,
                expected,
                found,
            } => Self::VersionConflict {
                key,
                expected,
                found,
            },
            StateError::Precondition { key, reason } => Self::Precondition { key, reason },
            other => Self::Backend(other.to_string()),
        }
    }
}

/// Result type alias for engine operations.
pub type RolloutResult<T> = Result<T, RolloutError>;

/// Failure taxonomy of the rollout engine.
#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error("workload not found: {0}")]
    WorkloadNotFound(String),

    #[error("workload {workload} is controlled by rollout {holder}")]
    OwnershipConflict { workload: String, holder: String },

    #[error("status of {key} kept conflicting after {attempts} attempts")]
    VersionConflict { key: String, attempts: u32 },

    #[error("batch {batch} not ready after {waited_secs}s")]
    HealthGateTimeout { batch: u32, waited_secs: u64 },

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error(transparent)]
    Access(#[from] AccessError),
}

impl RolloutError {
    /// Whether re-invoking the reconciliation can resolve this error.
    /// A bad plan needs a user edit instead.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::InvalidPlan(_))
    }

    /// Short machine-readable reason used on status conditions.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::InvalidPlan(_) => "InvalidPlan",
            Self::WorkloadNotFound(_) => "WorkloadNotFound",
            Self::OwnershipConflict { .. } => "OwnershipConflict",
            Self::VersionConflict { .. } => "VersionConflict",
            Self::HealthGateTimeout { .. } => "HealthGateTimeout",
            Self::Timeout { .. } => "Timeout",
            Self::Access(_) => "AccessError",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_errors_keep_their_kind() {
        let e: AccessError = StateError::NotFound("prod/api".to_string()).into();
        assert!(matches!(e, AccessError::NotFound(_)));

        let e: AccessError = StateError::VersionConflict {
            key: "prod/api".to_string(),
            expected: 1,
            found: 2,
        }
        .into();
        assert!(matches!(e, AccessError::VersionConflict { found: 2, .. }));

        let e: AccessError = StateError::Write("disk full".to_string()).into();
        assert!(matches!(e, AccessError::Backend(msg) if msg.contains("disk full")));
    }

    #[test]
    fn only_invalid_plan_is_final() {
        assert!(!RolloutError::InvalidPlan("empty".to_string()).is_retryable());
        assert!(RolloutError::OwnershipConflict {
            workload: "prod/api".to_string(),
            holder: "prod/other".to_string(),
        }
        .is_retryable());
        assert!(RolloutError::WorkloadNotFound("prod/api".to_string()).is_retryable());
    }

    #[test]
    fn health_gate_message_names_the_batch() {
        let e = RolloutError::HealthGateTimeout {
            batch: 2,
            waited_secs: 601,
        };
        assert_eq!(e.reason(), "HealthGateTimeout");
        assert_eq!(e.to_string(), "batch 2 not ready after 601s");
    }
}
