//! # Location Repository
//!
//! Monitoring stations, including ones created or renamed while offline.
//!
//! ## Pending Flags
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  needs_creation = 1   station only exists locally (server_id NULL)      │
//! │  needs_rename   = 1   update_name_not_yet_synced holds the new name     │
//! │                                                                         │
//! │  Location push clears each flag only after the backend call succeeds.   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::{DbError, DbResult};
use fieldsync_core::{Coords, Location};

#[derive(Debug, sqlx::FromRow)]
struct LocationRow {
    id: String,
    server_id: Option<String>,
    name: String,
    update_name_not_yet_synced: Option<String>,
    lat: f64,
    lng: f64,
    accuracy_m: f64,
    group_name: String,
    is_prod_environment: bool,
    needs_creation: bool,
    needs_rename: bool,
    updated_at: DateTime<Utc>,
}

impl From<LocationRow> for Location {
    fn from(row: LocationRow) -> Self {
        Location {
            id: row.id,
            server_id: row.server_id,
            name: row.name,
            update_name_not_yet_synced: row.update_name_not_yet_synced,
            coords: Coords::new(row.lat, row.lng),
            accuracy_m: row.accuracy_m,
            group_name: row.group_name,
            is_prod_environment: row.is_prod_environment,
            needs_creation: row.needs_creation,
            needs_rename: row.needs_rename,
            updated_at: row.updated_at,
        }
    }
}

/// Repository for station rows.
#[derive(Debug, Clone)]
pub struct LocationRepository {
    pool: SqlitePool,
}

impl LocationRepository {
    /// Creates a new LocationRepository.
    pub fn new(pool: SqlitePool) -> Self {
        LocationRepository { pool }
    }

    /// Inserts a station.
    ///
    /// ## Errors
    /// `UniqueViolation` if another row already holds the same server id
    /// in the same environment.
    pub async fn insert(&self, location: &Location) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO locations (
                id, server_id, name, update_name_not_yet_synced, lat, lng,
                accuracy_m, group_name, is_prod_environment,
                needs_creation, needs_rename, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(&location.id)
        .bind(&location.server_id)
        .bind(&location.name)
        .bind(&location.update_name_not_yet_synced)
        .bind(location.coords.lat)
        .bind(location.coords.lng)
        .bind(location.accuracy_m)
        .bind(&location.group_name)
        .bind(location.is_prod_environment)
        .bind(location.needs_creation)
        .bind(location.needs_rename)
        .bind(location.updated_at)
        .execute(&self.pool)
        .await?;

        debug!(id = %location.id, name = %location.name, "Stored station");
        Ok(())
    }

    /// Overwrites every column of an existing station.
    pub async fn update(&self, location: &Location) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE locations SET
                server_id = ?2,
                name = ?3,
                update_name_not_yet_synced = ?4,
                lat = ?5,
                lng = ?6,
                accuracy_m = ?7,
                group_name = ?8,
                is_prod_environment = ?9,
                needs_creation = ?10,
                needs_rename = ?11,
                updated_at = ?12
            WHERE id = ?1
            "#,
        )
        .bind(&location.id)
        .bind(&location.server_id)
        .bind(&location.name)
        .bind(&location.update_name_not_yet_synced)
        .bind(location.coords.lat)
        .bind(location.coords.lng)
        .bind(location.accuracy_m)
        .bind(&location.group_name)
        .bind(location.is_prod_environment)
        .bind(location.needs_creation)
        .bind(location.needs_rename)
        .bind(location.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Location", &location.id));
        }
        Ok(())
    }

    /// Gets a station by local id.
    pub async fn get(&self, id: &str) -> DbResult<Option<Location>> {
        let row = sqlx::query_as::<_, LocationRow>("SELECT * FROM locations WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(Into::into))
    }

    /// Gets a station by backend id within one environment.
    pub async fn get_by_server_id(
        &self,
        server_id: &str,
        is_prod_environment: bool,
    ) -> DbResult<Option<Location>> {
        let row = sqlx::query_as::<_, LocationRow>(
            "SELECT * FROM locations WHERE server_id = ?1 AND is_prod_environment = ?2",
        )
        .bind(server_id)
        .bind(is_prod_environment)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    /// Stations belonging to one group in one environment.
    pub async fn list_for_group(
        &self,
        group_name: &str,
        is_prod_environment: bool,
    ) -> DbResult<Vec<Location>> {
        let rows = sqlx::query_as::<_, LocationRow>(
            r#"
            SELECT * FROM locations
            WHERE group_name = ?1 AND is_prod_environment = ?2
            ORDER BY updated_at ASC, id ASC
            "#,
        )
        .bind(group_name)
        .bind(is_prod_environment)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Every station.
    pub async fn list_all(&self) -> DbResult<Vec<Location>> {
        let rows = sqlx::query_as::<_, LocationRow>(
            "SELECT * FROM locations ORDER BY updated_at ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Stations that still have to be created on the backend.
    pub async fn pending_creation(&self) -> DbResult<Vec<Location>> {
        let rows = sqlx::query_as::<_, LocationRow>(
            "SELECT * FROM locations WHERE needs_creation = 1 ORDER BY updated_at ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Stations whose local rename has not been pushed.
    pub async fn pending_rename(&self) -> DbResult<Vec<Location>> {
        let rows = sqlx::query_as::<_, LocationRow>(
            r#"
            SELECT * FROM locations
            WHERE needs_rename = 1 AND needs_creation = 0
            ORDER BY updated_at ASC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Records the backend id after a successful create.
    pub async fn mark_created(&self, id: &str, server_id: &str) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE locations
            SET server_id = ?2, needs_creation = 0, updated_at = ?3
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(server_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Location", id));
        }
        Ok(())
    }

    /// Stages a rename to be pushed on the next sync.
    ///
    /// A station that has not been created yet is renamed in place since
    /// the create call will carry the new name.
    pub async fn rename_local(&self, id: &str, name: &str) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE locations SET
                name = CASE WHEN needs_creation = 1 THEN ?2 ELSE name END,
                update_name_not_yet_synced = CASE WHEN needs_creation = 1 THEN NULL ELSE ?2 END,
                needs_rename = CASE WHEN needs_creation = 1 THEN 0 ELSE 1 END,
                updated_at = ?3
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(name)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Location", id));
        }
        Ok(())
    }

    /// Applies the staged name once the backend accepted the rename.
    pub async fn mark_rename_synced(&self, id: &str) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE locations SET
                name = COALESCE(update_name_not_yet_synced, name),
                update_name_not_yet_synced = NULL,
                needs_rename = 0,
                updated_at = ?2
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Deletes a station. Returns true if a row was removed.
    pub async fn delete(&self, id: &str) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM locations WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
