use std::{fmt, str::FromStr};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RegistryError;

pub mod memory;
pub mod postgres;

pub use memory::MemoryRegistrationStore;
pub use postgres::PgRegistrationStore;

pub const READ_PERMISSION: &str = "read";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRegistration {
    pub name: String,
    pub index_name: String,
    pub event_type: String,
    // None for indices created by the system rather than a user
    pub owner: Option<String>,
}

/// The relational record that makes a physical index visible as a timeline source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct IndexRegistration {
    pub id: i64,
    pub name: String,
    pub index_name: String,
    pub event_type: String,
    pub owner: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PermissionGrant {
    pub registration_id: i64,
    pub permission: String,
    // None grants the permission to everyone
    pub grantee: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SketchStatus {
    New,
    Active,
    Archived,
    Deleted,
}

impl SketchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SketchStatus::New => "new",
            SketchStatus::Active => "active",
            SketchStatus::Archived => "archived",
            SketchStatus::Deleted => "deleted",
        }
    }

    // Unknown values are treated as live, so they still show up in deletion warnings
    pub fn from_db(s: &str) -> Self {
        s.parse().unwrap_or(SketchStatus::Active)
    }
}

impl FromStr for SketchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(SketchStatus::New),
            "active" => Ok(SketchStatus::Active),
            "archived" => Ok(SketchStatus::Archived),
            "deleted" => Ok(SketchStatus::Deleted),
            other => Err(format!("Unknown sketch status: {other}")),
        }
    }
}

impl fmt::Display for SketchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sketch {
    pub id: i64,
    pub name: String,
    pub status: SketchStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Timeline {
    pub id: i64,
    pub sketch_id: i64,
    pub registration_id: i64,
    pub name: String,
}

/// A timeline that depends on a registration, with the sketch that holds it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineRef {
    pub timeline_id: i64,
    pub timeline_name: String,
    pub registration_id: i64,
    pub sketch_id: i64,
    pub sketch_name: String,
    pub sketch_status: SketchStatus,
}

/// The relational side of index bookkeeping. Every mutating call is a single
/// transaction, either all of its writes are visible afterwards or none are.
#[async_trait]
pub trait RegistrationStore: Send + Sync {
    /// Returns the registration for `(name, index_name)`, creating it together
    /// with its default read grant if it doesn't exist. The flag is true when
    /// a new registration was created.
    async fn create_or_get(
        &self,
        new: &NewRegistration,
    ) -> Result<(IndexRegistration, bool), RegistryError>;

    async fn find_by_index(&self, index_name: &str)
        -> Result<Vec<IndexRegistration>, RegistryError>;

    async fn find_by_name(&self, name: &str) -> Result<Vec<IndexRegistration>, RegistryError>;

    async fn permissions(&self, registration_id: i64)
        -> Result<Vec<PermissionGrant>, RegistryError>;

    async fn dependents(&self, registration_ids: &[i64]) -> Result<Vec<TimelineRef>, RegistryError>;

    /// Deletes the timelines, grants and registrations in one transaction.
    /// Fails with `DependentsChanged`, deleting nothing, if the timelines
    /// referencing the registrations are no longer exactly `expected_timelines`.
    /// Returns the number of timelines removed.
    async fn delete_cascade(
        &self,
        registration_ids: &[i64],
        expected_timelines: &[i64],
    ) -> Result<usize, RegistryError>;

    async fn create_sketch(&self, name: &str) -> Result<Sketch, RegistryError>;

    async fn set_sketch_status(
        &self,
        sketch_id: i64,
        status: SketchStatus,
    ) -> Result<(), RegistryError>;

    async fn attach_timeline(
        &self,
        sketch_id: i64,
        registration_id: i64,
        name: &str,
    ) -> Result<Timeline, RegistryError>;
}

/// The grant every new registration starts with.
pub fn default_grant(registration: &IndexRegistration) -> PermissionGrant {
    PermissionGrant {
        registration_id: registration.id,
        permission: READ_PERMISSION.to_string(),
        grantee: registration.owner.clone(),
    }
}

pub(crate) fn sorted(ids: &[i64]) -> Vec<i64> {
    let mut ids = ids.to_vec();
    ids.sort_unstable();
    ids.dedup();
    ids
}
