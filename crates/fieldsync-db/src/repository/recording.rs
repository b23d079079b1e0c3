//! # Recording Repository
//!
//! Tracks recordings between download from a unit and final cleanup.
//!
//! ## Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Recording Row Lifecycle                             │
//! │                                                                         │
//! │  download from unit ──► INSERT (is_uploaded = 0)                        │
//! │                              │                                          │
//! │                  backend ingest ok                                      │
//! │                              ▼                                          │
//! │                    UPDATE is_uploaded = 1, server_upload_id             │
//! │                              │                                          │
//! │                  unit confirms delete                                   │
//! │                              ▼                                          │
//! │                          DELETE row                                     │
//! │                                                                         │
//! │  file missing / backend says not found ──► DELETE row (stale)           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use sqlx::SqlitePool;
use tracing::debug;

use crate::error::DbResult;
use fieldsync_core::Recording;

/// Repository for recording rows.
#[derive(Debug, Clone)]
pub struct RecordingRepository {
    pool: SqlitePool,
}

impl RecordingRepository {
    /// Creates a new RecordingRepository.
    pub fn new(pool: SqlitePool) -> Self {
        RecordingRepository { pool }
    }

    /// Inserts a recording. Returns false if `(name, device)` already exists.
    pub async fn insert(&self, recording: &Recording) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO recordings (
                name, device, path, size, is_prod_environment,
                is_uploaded, server_upload_id, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT (name, device) DO NOTHING
            "#,
        )
        .bind(&recording.name)
        .bind(&recording.device)
        .bind(&recording.path)
        .bind(recording.size)
        .bind(recording.is_prod_environment)
        .bind(recording.is_uploaded)
        .bind(&recording.server_upload_id)
        .bind(recording.created_at)
        .execute(&self.pool)
        .await?;

        let inserted = result.rows_affected() == 1;
        debug!(name = %recording.name, device = %recording.device, inserted, "Stored recording");
        Ok(inserted)
    }

    /// Gets a recording by its key.
    pub async fn get(&self, name: &str, device: &str) -> DbResult<Option<Recording>> {
        let recording = sqlx::query_as::<_, Recording>(
            "SELECT * FROM recordings WHERE name = ?1 AND device = ?2",
        )
        .bind(name)
        .bind(device)
        .fetch_optional(&self.pool)
        .await?;

        Ok(recording)
    }

    /// Names of every recording stored for a device, uploaded or not.
    pub async fn names_for_device(&self, device: &str) -> DbResult<Vec<String>> {
        let names = sqlx::query_scalar::<_, String>(
            "SELECT name FROM recordings WHERE device = ?1 ORDER BY name",
        )
        .bind(device)
        .fetch_all(&self.pool)
        .await?;

        Ok(names)
    }

    /// Recordings for a device that the backend has not ingested yet.
    ///
    /// Ordered oldest first so uploads follow capture order.
    pub async fn pending_upload(&self, device: &str) -> DbResult<Vec<Recording>> {
        let recordings = sqlx::query_as::<_, Recording>(
            r#"
            SELECT * FROM recordings
            WHERE device = ?1 AND is_uploaded = 0
            ORDER BY created_at ASC, name ASC
            "#,
        )
        .bind(device)
        .fetch_all(&self.pool)
        .await?;

        Ok(recordings)
    }

    /// Uploaded recordings whose on-unit copy has not been confirmed deleted.
    pub async fn awaiting_unit_delete(&self, device: &str) -> DbResult<Vec<Recording>> {
        let recordings = sqlx::query_as::<_, Recording>(
            r#"
            SELECT * FROM recordings
            WHERE device = ?1 AND is_uploaded = 1
            ORDER BY created_at ASC, name ASC
            "#,
        )
        .bind(device)
        .fetch_all(&self.pool)
        .await?;

        Ok(recordings)
    }

    /// Marks a recording as ingested by the backend.
    pub async fn mark_uploaded(
        &self,
        name: &str,
        device: &str,
        server_upload_id: Option<&str>,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE recordings
            SET is_uploaded = 1, server_upload_id = ?3
            WHERE name = ?1 AND device = ?2
            "#,
        )
        .bind(name)
        .bind(device)
        .bind(server_upload_id)
        .execute(&self.pool)
        .await?;

        debug!(name = %name, device = %device, "Recording marked uploaded");
        Ok(())
    }

    /// Deletes a recording row. Returns true if a row was removed.
    pub async fn delete(&self, name: &str, device: &str) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM recordings WHERE name = ?1 AND device = ?2")
            .bind(name)
            .bind(device)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Devices with at least one recording not yet uploaded in an environment.
    pub async fn devices_with_pending(&self, is_prod_environment: bool) -> DbResult<Vec<String>> {
        let devices = sqlx::query_scalar::<_, String>(
            r#"
            SELECT DISTINCT device FROM recordings
            WHERE is_uploaded = 0 AND is_prod_environment = ?1
            ORDER BY device
            "#,
        )
        .bind(is_prod_environment)
        .fetch_all(&self.pool)
        .await?;

        Ok(devices)
    }

    /// Counts recordings not yet uploaded, across all devices.
    pub async fn count_pending(&self) -> DbResult<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM recordings WHERE is_uploaded = 0")
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};
    use chrono::{Duration, Utc};

    fn recording(name: &str, device: &str, age_secs: i64) -> Recording {
        Recording {
            name: name.into(),
            device: device.into(),
            path: format!("/data/{device}/{name}"),
            size: 1024,
            is_prod_environment: true,
            is_uploaded: false,
            server_upload_id: None,
            created_at: Utc::now() - Duration::seconds(age_secs),
        }
    }

    #[tokio::test]
    async fn test_insert_is_unique_per_name_and_device() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.recordings();

        assert!(repo.insert(&recording("rec1.cptv", "100", 0)).await.unwrap());
        assert!(!repo.insert(&recording("rec1.cptv", "100", 0)).await.unwrap());
        assert!(repo.insert(&recording("rec1.cptv", "200", 0)).await.unwrap());

        assert_eq!(repo.names_for_device("100").await.unwrap(), vec!["rec1.cptv"]);
    }

    #[tokio::test]
    async fn test_mark_uploaded_moves_out_of_pending() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.recordings();

        repo.insert(&recording("old.cptv", "100", 60)).await.unwrap();
        repo.insert(&recording("new.cptv", "100", 0)).await.unwrap();

        let pending = repo.pending_upload("100").await.unwrap();
        assert_eq!(pending[0].name, "old.cptv");
        assert_eq!(pending.len(), 2);

        repo.mark_uploaded("old.cptv", "100", Some("9001")).await.unwrap();

        let pending = repo.pending_upload("100").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].name, "new.cptv");

        let waiting = repo.awaiting_unit_delete("100").await.unwrap();
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].server_upload_id.as_deref(), Some("9001"));
        assert_eq!(repo.count_pending().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.recordings();

        repo.insert(&recording("rec1.cptv", "100", 0)).await.unwrap();
        assert!(repo.delete("rec1.cptv", "100").await.unwrap());
        assert!(!repo.delete("rec1.cptv", "100").await.unwrap());
        assert!(repo.get("rec1.cptv", "100").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_devices_with_pending() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.recordings();

        repo.insert(&recording("a.cptv", "200", 0)).await.unwrap();
        repo.insert(&recording("b.cptv", "100", 0)).await.unwrap();
        repo.insert(&recording("c.cptv", "300", 0)).await.unwrap();
        repo.mark_uploaded("c.cptv", "300", None).await.unwrap();

        assert_eq!(repo.devices_with_pending(true).await.unwrap(), vec!["100", "200"]);
        assert!(repo.devices_with_pending(false).await.unwrap().is_empty());
    }
}
