//! # Reference Image Repository
//!
//! Reference photos carry a tri-state `server_status` so that both uploads
//! and deletions made while offline survive until the backend confirms them.
//!
//! ```text
//!   NULL ──(user replaces photo)──► pending-upload ──(upload ok)──► NULL
//!   NULL ──(user deletes photo)───► pending-deletion ──(delete ok)──► row gone
//! ```

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::error::DbResult;
use fieldsync_core::{Coords, DeviceReferenceImage, ReferenceImageType, ServerStatus};

#[derive(Debug, sqlx::FromRow)]
struct ReferenceImageRow {
    device_id: String,
    is_prod_environment: bool,
    image_type: ReferenceImageType,
    file_path: String,
    file_key: Option<String>,
    lat: Option<f64>,
    lng: Option<f64>,
    server_status: Option<ServerStatus>,
    timestamp: DateTime<Utc>,
}

impl From<ReferenceImageRow> for DeviceReferenceImage {
    fn from(row: ReferenceImageRow) -> Self {
        let coords = match (row.lat, row.lng) {
            (Some(lat), Some(lng)) => Some(Coords::new(lat, lng)),
            _ => None,
        };

        DeviceReferenceImage {
            device_id: row.device_id,
            is_prod_environment: row.is_prod_environment,
            file_path: row.file_path,
            file_key: row.file_key,
            image_type: row.image_type,
            coords,
            server_status: row.server_status,
            timestamp: row.timestamp,
        }
    }
}

/// Repository for reference image rows.
#[derive(Debug, Clone)]
pub struct ReferenceImageRepository {
    pool: SqlitePool,
}

impl ReferenceImageRepository {
    /// Creates a new ReferenceImageRepository.
    pub fn new(pool: SqlitePool) -> Self {
        ReferenceImageRepository { pool }
    }

    /// Inserts or replaces the image for `(device, environment, type)`.
    pub async fn upsert(&self, image: &DeviceReferenceImage) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO reference_images (
                device_id, is_prod_environment, image_type, file_path,
                file_key, lat, lng, server_status, timestamp
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT (device_id, is_prod_environment, image_type) DO UPDATE SET
                file_path = excluded.file_path,
                file_key = excluded.file_key,
                lat = excluded.lat,
                lng = excluded.lng,
                server_status = excluded.server_status,
                timestamp = excluded.timestamp
            "#,
        )
        .bind(&image.device_id)
        .bind(image.is_prod_environment)
        .bind(image.image_type)
        .bind(&image.file_path)
        .bind(&image.file_key)
        .bind(image.coords.map(|c| c.lat))
        .bind(image.coords.map(|c| c.lng))
        .bind(image.server_status)
        .bind(image.timestamp)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Gets the image for `(device, environment, type)`.
    pub async fn get(
        &self,
        device_id: &str,
        is_prod_environment: bool,
        image_type: ReferenceImageType,
    ) -> DbResult<Option<DeviceReferenceImage>> {
        let row = sqlx::query_as::<_, ReferenceImageRow>(
            r#"
            SELECT * FROM reference_images
            WHERE device_id = ?1 AND is_prod_environment = ?2 AND image_type = ?3
            "#,
        )
        .bind(device_id)
        .bind(is_prod_environment)
        .bind(image_type)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    /// Every image for a device in one environment.
    pub async fn list_for_device(
        &self,
        device_id: &str,
        is_prod_environment: bool,
    ) -> DbResult<Vec<DeviceReferenceImage>> {
        let rows = sqlx::query_as::<_, ReferenceImageRow>(
            r#"
            SELECT * FROM reference_images
            WHERE device_id = ?1 AND is_prod_environment = ?2
            ORDER BY image_type
            "#,
        )
        .bind(device_id)
        .bind(is_prod_environment)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Images with the given pending server operation, oldest first.
    pub async fn with_status(&self, status: ServerStatus) -> DbResult<Vec<DeviceReferenceImage>> {
        let rows = sqlx::query_as::<_, ReferenceImageRow>(
            "SELECT * FROM reference_images WHERE server_status = ?1 ORDER BY timestamp ASC",
        )
        .bind(status)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Sets the server status and, when given, the backend file key.
    pub async fn set_server_status(
        &self,
        device_id: &str,
        is_prod_environment: bool,
        image_type: ReferenceImageType,
        status: Option<ServerStatus>,
        file_key: Option<&str>,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE reference_images
            SET server_status = ?4, file_key = COALESCE(?5, file_key)
            WHERE device_id = ?1 AND is_prod_environment = ?2 AND image_type = ?3
            "#,
        )
        .bind(device_id)
        .bind(is_prod_environment)
        .bind(image_type)
        .bind(status)
        .bind(file_key)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Deletes the image row. Returns true if a row was removed.
    pub async fn delete(
        &self,
        device_id: &str,
        is_prod_environment: bool,
        image_type: ReferenceImageType,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM reference_images
            WHERE device_id = ?1 AND is_prod_environment = ?2 AND image_type = ?3
            "#,
        )
        .bind(device_id)
        .bind(is_prod_environment)
        .bind(image_type)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
