use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use super::{
    default_grant, sorted, IndexRegistration, NewRegistration, PermissionGrant, RegistrationStore,
    Sketch, SketchStatus, Timeline, TimelineRef,
};
use crate::error::RegistryError;

#[derive(Debug, Default)]
struct State {
    next_id: i64,
    registrations: Vec<IndexRegistration>,
    grants: Vec<PermissionGrant>,
    sketches: Vec<Sketch>,
    timelines: Vec<Timeline>,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Registration store kept in process memory. A single lock around the
/// whole state gives every call the all-or-nothing behaviour of a transaction.
#[derive(Debug, Default)]
pub struct MemoryRegistrationStore {
    state: Mutex<State>,
}

impl MemoryRegistrationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registration_count(&self) -> usize {
        self.lock().registrations.len()
    }

    pub fn timeline_count(&self) -> usize {
        self.lock().timelines.len()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl RegistrationStore for MemoryRegistrationStore {
    async fn create_or_get(
        &self,
        new: &NewRegistration,
    ) -> Result<(IndexRegistration, bool), RegistryError> {
        let mut state = self.lock();
        if let Some(existing) = state
            .registrations
            .iter()
            .find(|r| r.name == new.name && r.index_name == new.index_name)
        {
            return Ok((existing.clone(), false));
        }

        let registration = IndexRegistration {
            id: state.next_id(),
            name: new.name.clone(),
            index_name: new.index_name.clone(),
            event_type: new.event_type.clone(),
            owner: new.owner.clone(),
            created_at: Utc::now(),
        };
        state.grants.push(default_grant(&registration));
        state.registrations.push(registration.clone());
        Ok((registration, true))
    }

    async fn find_by_index(
        &self,
        index_name: &str,
    ) -> Result<Vec<IndexRegistration>, RegistryError> {
        Ok(self
            .lock()
            .registrations
            .iter()
            .filter(|r| r.index_name == index_name)
            .cloned()
            .collect())
    }

    async fn find_by_name(&self, name: &str) -> Result<Vec<IndexRegistration>, RegistryError> {
        Ok(self
            .lock()
            .registrations
            .iter()
            .filter(|r| r.name == name)
            .cloned()
            .collect())
    }

    async fn permissions(
        &self,
        registration_id: i64,
    ) -> Result<Vec<PermissionGrant>, RegistryError> {
        Ok(self
            .lock()
            .grants
            .iter()
            .filter(|g| g.registration_id == registration_id)
            .cloned()
            .collect())
    }

    async fn dependents(&self, registration_ids: &[i64]) -> Result<Vec<TimelineRef>, RegistryError> {
        let state = self.lock();
        let mut refs = Vec::new();
        for timeline in state
            .timelines
            .iter()
            .filter(|t| registration_ids.contains(&t.registration_id))
        {
            let sketch = state
                .sketches
                .iter()
                .find(|s| s.id == timeline.sketch_id)
                .ok_or(RegistryError::NotFound {
                    entity: "sketch",
                    id: timeline.sketch_id,
                })?;
            refs.push(TimelineRef {
                timeline_id: timeline.id,
                timeline_name: timeline.name.clone(),
                registration_id: timeline.registration_id,
                sketch_id: sketch.id,
                sketch_name: sketch.name.clone(),
                sketch_status: sketch.status,
            });
        }
        refs.sort_by_key(|r| r.timeline_id);
        Ok(refs)
    }

    async fn delete_cascade(
        &self,
        registration_ids: &[i64],
        expected_timelines: &[i64],
    ) -> Result<usize, RegistryError> {
        let mut state = self.lock();

        for id in registration_ids {
            if !state.registrations.iter().any(|r| r.id == *id) {
                return Err(RegistryError::NotFound {
                    entity: "registration",
                    id: *id,
                });
            }
        }

        let current: Vec<i64> = state
            .timelines
            .iter()
            .filter(|t| registration_ids.contains(&t.registration_id))
            .map(|t| t.id)
            .collect();
        if sorted(&current) != sorted(expected_timelines) {
            return Err(RegistryError::DependentsChanged);
        }

        state
            .timelines
            .retain(|t| !registration_ids.contains(&t.registration_id));
        state
            .grants
            .retain(|g| !registration_ids.contains(&g.registration_id));
        state
            .registrations
            .retain(|r| !registration_ids.contains(&r.id));
        Ok(current.len())
    }

    async fn create_sketch(&self, name: &str) -> Result<Sketch, RegistryError> {
        let mut state = self.lock();
        let sketch = Sketch {
            id: state.next_id(),
            name: name.to_string(),
            status: SketchStatus::New,
        };
        state.sketches.push(sketch.clone());
        Ok(sketch)
    }

    async fn set_sketch_status(
        &self,
        sketch_id: i64,
        status: SketchStatus,
    ) -> Result<(), RegistryError> {
        let mut state = self.lock();
        let sketch = state
            .sketches
            .iter_mut()
            .find(|s| s.id == sketch_id)
            .ok_or(RegistryError::NotFound {
                entity: "sketch",
                id: sketch_id,
            })?;
        sketch.status = status;
        Ok(())
    }

    async fn attach_timeline(
        &self,
        sketch_id: i64,
        registration_id: i64,
        name: &str,
    ) -> Result<Timeline, RegistryError> {
        let mut state = self.lock();
        if !state.sketches.iter().any(|s| s.id == sketch_id) {
            return Err(RegistryError::NotFound {
                entity: "sketch",
                id: sketch_id,
            });
        }
        if !state.registrations.iter().any(|r| r.id == registration_id) {
            return Err(RegistryError::NotFound {
                entity: "registration",
                id: registration_id,
            });
        }
        let timeline = Timeline {
            id: state.next_id(),
            sketch_id,
            registration_id,
            name: name.to_string(),
        };
        state.timelines.push(timeline.clone());
        Ok(timeline)
    }
}
