//! Collaborator implementations over the embedded state store.
//!
//! redb transactions block (a writer waits for the previous one), so every
//! call runs on tokio's blocking pool and the engine's timeouts stay able
//! to fire.

use async_trait::async_trait;
use rollgrid_core::epoch_secs;
use rollgrid_state::{
    object_key, ControlledBy, Revision, RevisionRollingStatus, RolloutRecord, RolloutStatus,
    StateError, StateResult, StateStore,
};
use tokio::task::{self, JoinError};

use crate::accessor::{
    RevisionMark, RevisionStore, StatusStore, WorkloadAccessor, WorkloadHandle, WorkloadSnapshot,
};
use crate::error::{AccessError, AccessResult};

/// Serves workloads, revisions, and rollout records from a [`StateStore`].
#[derive(Clone)]
pub struct StoreBackend {
    store: StateStore,
}

fn map_join_error(e: JoinError) -> AccessError {
    AccessError::Backend(format!("store task failed: {e}"))
}

impl StoreBackend {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    async fn blocking<T, F>(&self, f: F) -> AccessResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&StateStore) -> StateResult<T> + Send + 'static,
    {
        let store = self.store.clone();
        let result = task::spawn_blocking(move || f(&store))
            .await
            .map_err(map_join_error)?;
        Ok(result?)
    }
}

#[async_trait]
impl WorkloadAccessor for StoreBackend {
    async fn resolve(&self, namespace: &str, name: &str) -> AccessResult<Option<WorkloadHandle>> {
        let handle = WorkloadHandle::new(namespace, name);
        let key = handle.key();
        let found = self.blocking(move |store| store.get_workload(&key)).await?;
        Ok(found.map(|_| handle))
    }

    async fn snapshot(&self, handle: &WorkloadHandle) -> AccessResult<Option<WorkloadSnapshot>> {
        let key = handle.key();
        let workload = self.blocking(move |store| store.get_workload(&key)).await?;
        Ok(workload.as_ref().map(WorkloadSnapshot::from))
    }

    async fn set_pause_flag(&self, handle: &WorkloadHandle, paused: bool) -> AccessResult<()> {
        let key = handle.key();
        self.blocking(move |store| {
            store.update_workload(&key, |w| {
                w.paused = paused;
                w.updated_at = epoch_secs();
                Ok(())
            })
        })
        .await?;
        Ok(())
    }

    async fn set_controlled_by(
        &self,
        handle: &WorkloadHandle,
        expected: &ControlledBy,
        next: ControlledBy,
    ) -> AccessResult<()> {
        let key = handle.key();
        let expected = expected.clone();
        self.blocking(move |store| {
            store.update_workload(&key, |w| {
                if w.controlled_by != expected {
                    return Err(StateError::Precondition {
                        key: key.clone(),
                        reason: format!(
                            "controlled by {:?}, expected {:?}",
                            w.controlled_by, expected
                        ),
                    });
                }
                w.controlled_by = next;
                w.updated_at = epoch_secs();
                Ok(())
            })
        })
        .await?;
        Ok(())
    }

    async fn set_target_replica_count(
        &self,
        handle: &WorkloadHandle,
        replicas: u32,
    ) -> AccessResult<()> {
        let key = handle.key();
        self.blocking(move |store| {
            store.update_workload(&key, |w| {
                w.target_replicas = Some(replicas);
                w.updated_at = epoch_secs();
                Ok(())
            })
        })
        .await?;
        Ok(())
    }
}

#[async_trait]
impl RevisionStore for StoreBackend {
    async fn get_revision(&self, namespace: &str, name: &str) -> AccessResult<Option<Revision>> {
        let key = object_key(namespace, name);
        self.blocking(move |store| store.get_revision(&key)).await
    }

    async fn mark_revision(
        &self,
        namespace: &str,
        name: &str,
        mark: RevisionMark,
    ) -> AccessResult<()> {
        let key = object_key(namespace, name);
        self.blocking(move |store| {
            store.update_revision(&key, |r| {
                match mark {
                    RevisionMark::UnderRollout => {
                        r.markers.under_rollout = true;
                        r.rolling_status = RevisionRollingStatus::Rolling;
                    }
                    RevisionMark::RollingCompleted => {
                        r.markers.under_rollout = false;
                        r.rolling_status = RevisionRollingStatus::RollingCompleted;
                    }
                    RevisionMark::Superseded => {
                        r.markers.under_rollout = false;
                        r.markers.superseded = true;
                        r.rolling_status = RevisionRollingStatus::InactiveAfterRollingCompleted;
                    }
                    RevisionMark::RolloutEnded => r.markers.under_rollout = false,
                }
                r.updated_at = epoch_secs();
                Ok(())
            })
        })
        .await?;
        Ok(())
    }
}

#[async_trait]
impl StatusStore for StoreBackend {
    async fn load(&self, id: &str) -> AccessResult<Option<RolloutRecord>> {
        let id = id.to_string();
        self.blocking(move |store| store.get_rollout(&id)).await
    }

    async fn list(&self) -> AccessResult<Vec<RolloutRecord>> {
        self.blocking(|store| store.list_rollouts()).await
    }

    async fn update_status(
        &self,
        id: &str,
        status: &RolloutStatus,
        expected_version: u64,
    ) -> AccessResult<u64> {
        let id = id.to_string();
        let status = status.clone();
        self.blocking(move |store| store.update_rollout_status(&id, &status, expected_version))
            .await
    }

    async fn remove(&self, id: &str, expected_version: u64) -> AccessResult<bool> {
        let id = id.to_string();
        self.blocking(move |store| store.remove_rollout(&id, expected_version))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollgrid_state::{RevisionMarkers, Workload, WorkloadStatus};

    fn backend() -> StoreBackend {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_workload(&Workload {
                namespace: "prod".to_string(),
                name: "api-v2".to_string(),
                native_owner: "app-controller".to_string(),
                replicas: 3,
                target_replicas: None,
                paused: false,
                controlled_by: ControlledBy::None,
                status: WorkloadStatus::default(),
                updated_at: 0,
            })
            .unwrap();
        store
            .put_revision(&Revision {
                namespace: "prod".to_string(),
                name: "api-v2".to_string(),
                workload: "api-v2".to_string(),
                ready_for_rolling: true,
                rolling_status: RevisionRollingStatus::Pending,
                markers: RevisionMarkers::default(),
                updated_at: 0,
            })
            .unwrap();
        StoreBackend::new(store)
    }

    #[tokio::test]
    async fn resolve_and_snapshot() {
        let backend = backend();
        let handle = backend.resolve("prod", "api-v2").await.unwrap().unwrap();
        let snapshot = backend.snapshot(&handle).await.unwrap().unwrap();
        assert_eq!(snapshot.desired_replicas, 3);
        assert_eq!(snapshot.controlled_by, ControlledBy::None);
        assert!(backend.resolve("prod", "nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn controlled_by_is_compare_and_set() {
        let backend = backend();
        let handle = WorkloadHandle::new("prod", "api-v2");
        let ours = ControlledBy::RolloutEngine {
            rollout: "prod/api".to_string(),
        };

        backend
            .set_controlled_by(&handle, &ControlledBy::None, ours.clone())
            .await
            .unwrap();
        let err = backend
            .set_controlled_by(&handle, &ControlledBy::None, ControlledBy::None)
            .await
            .unwrap_err();
        assert!(matches!(err, AccessError::Precondition { .. }));

        let snapshot = backend.snapshot(&handle).await.unwrap().unwrap();
        assert_eq!(snapshot.controlled_by, ours);
    }

    #[tokio::test]
    async fn writes_to_missing_workload_are_not_found() {
        let backend = backend();
        let handle = WorkloadHandle::new("prod", "gone");
        let err = backend.set_target_replica_count(&handle, 1).await.unwrap_err();
        assert!(matches!(err, AccessError::NotFound(_)));
    }

    #[tokio::test]
    async fn revision_marks() {
        let backend = backend();
        backend
            .mark_revision("prod", "api-v2", RevisionMark::UnderRollout)
            .await
            .unwrap();
        let r = backend.get_revision("prod", "api-v2").await.unwrap().unwrap();
        assert!(r.markers.under_rollout);
        assert_eq!(r.rolling_status, RevisionRollingStatus::Rolling);

        backend
            .mark_revision("prod", "api-v2", RevisionMark::Superseded)
            .await
            .unwrap();
        let r = backend.get_revision("prod", "api-v2").await.unwrap().unwrap();
        assert!(!r.markers.under_rollout);
        assert!(r.markers.superseded);
        assert_eq!(
            r.rolling_status,
            RevisionRollingStatus::InactiveAfterRollingCompleted
        );
    }

    #[tokio::test]
    async fn store_calls_do_not_block_the_runtime() {
        let backend = backend();
        let store = backend.store().clone();
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        // Hold the single redb writer slot for a while.
        let writer = std::thread::spawn(move || {
            store
                .update_workload("prod/api-v2", |_| {
                    locked_tx.send(()).unwrap();
                    std::thread::sleep(std::time::Duration::from_millis(1500));
                    Ok(())
                })
                .unwrap();
        });
        locked_rx.recv().unwrap();

        let handle = WorkloadHandle::new("prod", "api-v2");
        let started = std::time::Instant::now();
        let waited = tokio::time::timeout(
            std::time::Duration::from_millis(200),
            backend.set_target_replica_count(&handle, 2),
        )
        .await;
        assert!(waited.is_err());
        assert!(started.elapsed() < std::time::Duration::from_millis(1000));

        writer.join().unwrap();
    }

    #[tokio::test]
    async fn remove_is_version_checked() {
        let backend = backend();
        let record = backend
            .store()
            .put_rollout(&rollgrid_state::RolloutSpec {
                namespace: "prod".to_string(),
                name: "api".to_string(),
                target_revision: "api-v2".to_string(),
                source_revision: None,
                plan: rollgrid_state::RolloutPlan {
                    batches: vec![rollgrid_state::RolloutBatch::percent(100)],
                    batch_partition: None,
                    paused: false,
                },
                deletion_requested_at: None,
                created_at: 0,
                updated_at: 0,
            })
            .unwrap();

        let err = backend.remove("prod/api", record.version + 1).await.unwrap_err();
        assert!(matches!(err, AccessError::VersionConflict { .. }));
        assert!(backend.remove("prod/api", record.version).await.unwrap());
        assert!(!backend.remove("prod/api", record.version).await.unwrap());
    }
}
