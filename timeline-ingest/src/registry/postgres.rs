use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool};
use tracing::info;

use super::{
    sorted, IndexRegistration, NewRegistration, PermissionGrant, RegistrationStore, Sketch,
    SketchStatus, Timeline, TimelineRef, READ_PERMISSION,
};
use crate::error::RegistryError;

#[derive(Debug, sqlx::FromRow)]
struct SketchRow {
    id: i64,
    name: String,
    status: String,
}

impl From<SketchRow> for Sketch {
    fn from(row: SketchRow) -> Self {
        Sketch {
            id: row.id,
            name: row.name,
            status: SketchStatus::from_db(&row.status),
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TimelineRefRow {
    timeline_id: i64,
    timeline_name: String,
    registration_id: i64,
    sketch_id: i64,
    sketch_name: String,
    sketch_status: String,
}

impl From<TimelineRefRow> for TimelineRef {
    fn from(row: TimelineRefRow) -> Self {
        TimelineRef {
            timeline_id: row.timeline_id,
            timeline_name: row.timeline_name,
            registration_id: row.registration_id,
            sketch_id: row.sketch_id,
            sketch_name: row.sketch_name,
            sketch_status: SketchStatus::from_db(&row.sketch_status),
        }
    }
}

#[derive(Clone)]
pub struct PgRegistrationStore {
    pool: PgPool,
}

impl PgRegistrationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, RegistryError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> Result<(), RegistryError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Registry migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

const REGISTRATION_COLUMNS: &str = "id, name, index_name, event_type, owner, created_at";

#[async_trait]
impl RegistrationStore for PgRegistrationStore {
    async fn create_or_get(
        &self,
        new: &NewRegistration,
    ) -> Result<(IndexRegistration, bool), RegistryError> {
        let mut txn = self.pool.begin().await?;

        let inserted: Option<IndexRegistration> = sqlx::query_as(&format!(
            r#"
            INSERT INTO search_index (name, index_name, event_type, owner, created_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (name, index_name) DO NOTHING
            RETURNING {REGISTRATION_COLUMNS}
            "#
        ))
        .bind(&new.name)
        .bind(&new.index_name)
        .bind(&new.event_type)
        .bind(&new.owner)
        .fetch_optional(&mut *txn)
        .await?;

        let Some(registration) = inserted else {
            // Someone else got there first, their row is the registration
            let existing: IndexRegistration = sqlx::query_as(&format!(
                "SELECT {REGISTRATION_COLUMNS} FROM search_index WHERE name = $1 AND index_name = $2"
            ))
            .bind(&new.name)
            .bind(&new.index_name)
            .fetch_one(&mut *txn)
            .await?;
            txn.commit().await?;
            return Ok((existing, false));
        };

        sqlx::query(
            r#"
            INSERT INTO search_index_permission (registration_id, permission, grantee)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(registration.id)
        .bind(READ_PERMISSION)
        .bind(&registration.owner)
        .execute(&mut *txn)
        .await?;

        txn.commit().await?;
        Ok((registration, true))
    }

    async fn find_by_index(
        &self,
        index_name: &str,
    ) -> Result<Vec<IndexRegistration>, RegistryError> {
        Ok(sqlx::query_as(&format!(
            "SELECT {REGISTRATION_COLUMNS} FROM search_index WHERE index_name = $1 ORDER BY id"
        ))
        .bind(index_name)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn find_by_name(&self, name: &str) -> Result<Vec<IndexRegistration>, RegistryError> {
        Ok(sqlx::query_as(&format!(
            "SELECT {REGISTRATION_COLUMNS} FROM search_index WHERE name = $1 ORDER BY id"
        ))
        .bind(name)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn permissions(
        &self,
        registration_id: i64,
    ) -> Result<Vec<PermissionGrant>, RegistryError> {
        Ok(sqlx::query_as(
            r#"
            SELECT registration_id, permission, grantee
            FROM search_index_permission
            WHERE registration_id = $1
            ORDER BY id
            "#,
        )
        .bind(registration_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn dependents(&self, registration_ids: &[i64]) -> Result<Vec<TimelineRef>, RegistryError> {
        let rows: Vec<TimelineRefRow> = sqlx::query_as(
            r#"
            SELECT t.id AS timeline_id, t.name AS timeline_name, t.registration_id,
                   s.id AS sketch_id, s.name AS sketch_name, s.status AS sketch_status
            FROM timeline t
            JOIN sketch s ON s.id = t.sketch_id
            WHERE t.registration_id = ANY($1)
            ORDER BY t.id
            "#,
        )
        .bind(registration_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(TimelineRef::from).collect())
    }

    async fn delete_cascade(
        &self,
        registration_ids: &[i64],
        expected_timelines: &[i64],
    ) -> Result<usize, RegistryError> {
        let mut txn = self.pool.begin().await?;

        // Lock the registrations so no timeline can be attached while we check
        let locked: Vec<i64> =
            sqlx::query_scalar("SELECT id FROM search_index WHERE id = ANY($1) FOR UPDATE")
                .bind(registration_ids)
                .fetch_all(&mut *txn)
                .await?;
        if let Some(missing) = registration_ids.iter().find(|id| !locked.contains(id)) {
            txn.rollback().await?;
            return Err(RegistryError::NotFound {
                entity: "registration",
                id: *missing,
            });
        }

        let current: Vec<i64> = sqlx::query_scalar(
            "SELECT id FROM timeline WHERE registration_id = ANY($1) FOR UPDATE",
        )
        .bind(registration_ids)
        .fetch_all(&mut *txn)
        .await?;
        if sorted(&current) != sorted(expected_timelines) {
            txn.rollback().await?;
            return Err(RegistryError::DependentsChanged);
        }

        let removed = sqlx::query("DELETE FROM timeline WHERE registration_id = ANY($1)")
            .bind(registration_ids)
            .execute(&mut *txn)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM search_index_permission WHERE registration_id = ANY($1)")
            .bind(registration_ids)
            .execute(&mut *txn)
            .await?;
        sqlx::query("DELETE FROM search_index WHERE id = ANY($1)")
            .bind(registration_ids)
            .execute(&mut *txn)
            .await?;

        txn.commit().await?;
        Ok(removed as usize)
    }

    async fn create_sketch(&self, name: &str) -> Result<Sketch, RegistryError> {
        let row: SketchRow = sqlx::query_as(
            "INSERT INTO sketch (name, status) VALUES ($1, $2) RETURNING id, name, status",
        )
        .bind(name)
        .bind(SketchStatus::New.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn set_sketch_status(
        &self,
        sketch_id: i64,
        status: SketchStatus,
    ) -> Result<(), RegistryError> {
        let res = sqlx::query("UPDATE sketch SET status = $2 WHERE id = $1")
            .bind(sketch_id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        if res.rows_affected() == 0 {
            return Err(RegistryError::NotFound {
                entity: "sketch",
                id: sketch_id,
            });
        }
        Ok(())
    }

    async fn attach_timeline(
        &self,
        sketch_id: i64,
        registration_id: i64,
        name: &str,
    ) -> Result<Timeline, RegistryError> {
        let mut txn = self.pool.begin().await?;

        let sketch: Option<i64> = sqlx::query_scalar("SELECT id FROM sketch WHERE id = $1")
            .bind(sketch_id)
            .fetch_optional(&mut *txn)
            .await?;
        if sketch.is_none() {
            return Err(RegistryError::NotFound {
                entity: "sketch",
                id: sketch_id,
            });
        }

        // Shares the row lock taken by delete_cascade
        let registration: Option<i64> =
            sqlx::query_scalar("SELECT id FROM search_index WHERE id = $1 FOR SHARE")
                .bind(registration_id)
                .fetch_optional(&mut *txn)
                .await?;
        if registration.is_none() {
            return Err(RegistryError::NotFound {
                entity: "registration",
                id: registration_id,
            });
        }

        let timeline: Timeline = sqlx::query_as(
            r#"
            INSERT INTO timeline (sketch_id, registration_id, name)
            VALUES ($1, $2, $3)
            RETURNING id, sketch_id, registration_id, name
            "#,
        )
        .bind(sketch_id)
        .bind(registration_id)
        .bind(name)
        .fetch_one(&mut *txn)
        .await?;

        txn.commit().await?;
        Ok(timeline)
    }
}
