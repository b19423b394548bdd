use std::sync::Arc;

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    datastore::Datastore,
    error::{DatastoreError, LifecycleError, RegistryError},
    metrics_consts::{INDICES_DELETED, REGISTRATIONS_CREATED},
    registry::{
        sorted, IndexRegistration, NewRegistration, PermissionGrant, RegistrationStore,
        SketchStatus, TimelineRef,
    },
};

/// Everything a deletion of one index would remove. Show it to the operator,
/// then hand `token` back to `commit_deletion` to carry it out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionPlan {
    pub index_name: String,
    pub registrations: Vec<IndexRegistration>,
    pub dependents: Vec<TimelineRef>,
    pub token: Uuid,
}

impl DeletionPlan {
    /// Dependent timelines whose sketch is still in use.
    pub fn active_sketches(&self) -> Vec<&TimelineRef> {
        self.dependents
            .iter()
            .filter(|t| t.sketch_status != SketchStatus::Deleted)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionOutcome {
    NoSuchIndex,
    Deleted {
        timelines_removed: usize,
        // False when the physical index was already gone
        index_removed: bool,
    },
}

pub struct IndexLifecycleManager {
    store: Arc<dyn RegistrationStore>,
    datastore: Arc<dyn Datastore>,
}

impl IndexLifecycleManager {
    pub fn new(store: Arc<dyn RegistrationStore>, datastore: Arc<dyn Datastore>) -> Self {
        Self { store, datastore }
    }

    /// Create-or-get. Registering the same `(name, index_name)` twice yields
    /// the same registration and no second permission grant.
    pub async fn register(
        &self,
        new: &NewRegistration,
    ) -> Result<(IndexRegistration, bool), LifecycleError> {
        let (registration, created) = self.store.create_or_get(new).await?;
        if created {
            metrics::counter!(REGISTRATIONS_CREATED).increment(1);
            info!(
                id = registration.id,
                name = %registration.name,
                index = %registration.index_name,
                "Registered index"
            );
        } else {
            info!(
                id = registration.id,
                index = %registration.index_name,
                "Index already registered"
            );
        }
        Ok((registration, created))
    }

    /// Registers an index that was populated outside this tool.
    pub async fn register_existing(
        &self,
        new: &NewRegistration,
    ) -> Result<(IndexRegistration, bool), LifecycleError> {
        if !self.datastore.index_exists(&new.index_name).await? {
            return Err(LifecycleError::IndexNotFound(new.index_name.clone()));
        }
        self.register(new).await
    }

    pub async fn find_by_name(&self, name: &str) -> Result<Vec<IndexRegistration>, LifecycleError> {
        Ok(self.store.find_by_name(name).await?)
    }

    pub async fn permissions(
        &self,
        registration_id: i64,
    ) -> Result<Vec<PermissionGrant>, LifecycleError> {
        Ok(self.store.permissions(registration_id).await?)
    }

    /// `None` when nothing is registered under `index_name`.
    pub async fn plan_deletion(
        &self,
        index_name: &str,
    ) -> Result<Option<DeletionPlan>, LifecycleError> {
        let registrations = self.store.find_by_index(index_name).await?;
        if registrations.is_empty() {
            return Ok(None);
        }

        let ids: Vec<i64> = registrations.iter().map(|r| r.id).collect();
        let dependents = self.store.dependents(&ids).await?;
        let token = plan_token(index_name, &ids, &dependents);

        Ok(Some(DeletionPlan {
            index_name: index_name.to_string(),
            registrations,
            dependents,
            token,
        }))
    }

    pub async fn commit_deletion(
        &self,
        index_name: &str,
        token: Uuid,
    ) -> Result<DeletionOutcome, LifecycleError> {
        let Some(plan) = self.plan_deletion(index_name).await? else {
            info!(index = %index_name, "No such index, nothing to delete");
            return Ok(DeletionOutcome::NoSuchIndex);
        };
        if plan.token != token {
            return Err(LifecycleError::StalePlan(index_name.to_string()));
        }

        let registration_ids: Vec<i64> = plan.registrations.iter().map(|r| r.id).collect();
        let timeline_ids: Vec<i64> = plan.dependents.iter().map(|t| t.timeline_id).collect();

        let timelines_removed = match self
            .store
            .delete_cascade(&registration_ids, &timeline_ids)
            .await
        {
            Ok(n) => n,
            Err(RegistryError::DependentsChanged) | Err(RegistryError::NotFound { .. }) => {
                return Err(LifecycleError::StalePlan(index_name.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        // The relational side is gone, a failure from here on leaves only an orphaned index
        let index_removed = match self.remove_physical_index(index_name).await {
            Ok(removed) => removed,
            Err(source) => {
                error!(index = %index_name, "Index orphaned after deleting its registrations: {}", source);
                return Err(LifecycleError::OrphanedIndex {
                    index: index_name.to_string(),
                    source,
                });
            }
        };

        metrics::counter!(INDICES_DELETED).increment(1);
        info!(
            index = %index_name,
            timelines_removed,
            index_removed,
            "Deleted index"
        );
        Ok(DeletionOutcome::Deleted {
            timelines_removed,
            index_removed,
        })
    }

    async fn remove_physical_index(&self, index_name: &str) -> Result<bool, DatastoreError> {
        if !self.datastore.index_exists(index_name).await? {
            warn!(index = %index_name, "Physical index already absent, skipping");
            return Ok(false);
        }
        self.datastore.delete_index(index_name).await?;
        Ok(true)
    }
}

fn plan_token(index_name: &str, registration_ids: &[i64], dependents: &[TimelineRef]) -> Uuid {
    let timeline_ids: Vec<i64> = dependents.iter().map(|t| t.timeline_id).collect();
    let material = format!(
        "{}|{:?}|{:?}",
        index_name,
        sorted(registration_ids),
        sorted(&timeline_ids)
    );
    Uuid::new_v5(&Uuid::NAMESPACE_OID, material.as_bytes())
}
