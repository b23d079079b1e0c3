//! # Event Repository
//!
//! Diagnostic events pulled from units. Same lifecycle as recordings: a row
//! is inserted on download, flagged uploaded after the grouped backend call,
//! and deleted once the unit has dropped the key too.

use sqlx::SqlitePool;
use tracing::debug;

use crate::error::DbResult;
use fieldsync_core::DeviceEvent;

/// Repository for event rows.
#[derive(Debug, Clone)]
pub struct EventRepository {
    pool: SqlitePool,
}

impl EventRepository {
    /// Creates a new EventRepository.
    pub fn new(pool: SqlitePool) -> Self {
        EventRepository { pool }
    }

    /// Inserts an event. Returns false if `(key, device)` already exists.
    pub async fn insert(&self, event: &DeviceEvent) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO events (
                key, device, event_type, details, timestamp,
                is_uploaded, is_prod_environment
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT (key, device) DO NOTHING
            "#,
        )
        .bind(&event.key)
        .bind(&event.device)
        .bind(&event.event_type)
        .bind(&event.details)
        .bind(event.timestamp)
        .bind(event.is_uploaded)
        .bind(event.is_prod_environment)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Every event key stored for a device.
    pub async fn keys_for_device(&self, device: &str) -> DbResult<Vec<String>> {
        let keys = sqlx::query_scalar::<_, String>(
            "SELECT key FROM events WHERE device = ?1 ORDER BY key",
        )
        .bind(device)
        .fetch_all(&self.pool)
        .await?;

        Ok(keys)
    }

    /// Events for a device not yet uploaded, oldest first.
    pub async fn pending_upload(&self, device: &str) -> DbResult<Vec<DeviceEvent>> {
        let events = sqlx::query_as::<_, DeviceEvent>(
            r#"
            SELECT * FROM events
            WHERE device = ?1 AND is_uploaded = 0
            ORDER BY timestamp ASC, key ASC
            "#,
        )
        .bind(device)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }

    /// Uploaded events whose key has not been confirmed deleted on the unit.
    pub async fn awaiting_unit_delete(&self, device: &str) -> DbResult<Vec<DeviceEvent>> {
        let events = sqlx::query_as::<_, DeviceEvent>(
            r#"
            SELECT * FROM events
            WHERE device = ?1 AND is_uploaded = 1
            ORDER BY timestamp ASC, key ASC
            "#,
        )
        .bind(device)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }

    /// Marks the given keys uploaded in one transaction.
    ///
    /// Returns the number of rows changed.
    pub async fn mark_uploaded(&self, device: &str, keys: &[String]) -> DbResult<u64> {
        let mut tx = self.pool.begin().await?;
        let mut changed = 0;

        for key in keys {
            let result =
                sqlx::query("UPDATE events SET is_uploaded = 1 WHERE device = ?1 AND key = ?2")
                    .bind(device)
                    .bind(key)
                    .execute(&mut *tx)
                    .await?;
            changed += result.rows_affected();
        }

        tx.commit().await?;
        debug!(device = %device, changed, "Events marked uploaded");
        Ok(changed)
    }

    /// Deletes the given keys in one transaction.
    pub async fn delete(&self, device: &str, keys: &[String]) -> DbResult<u64> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0;

        for key in keys {
            let result = sqlx::query("DELETE FROM events WHERE device = ?1 AND key = ?2")
                .bind(device)
                .bind(key)
                .execute(&mut *tx)
                .await?;
            removed += result.rows_affected();
        }

        tx.commit().await?;
        Ok(removed)
    }

    /// Devices with at least one event not yet uploaded in an environment.
    pub async fn devices_with_pending(&self, is_prod_environment: bool) -> DbResult<Vec<String>> {
        let devices = sqlx::query_scalar::<_, String>(
            r#"
            SELECT DISTINCT device FROM events
            WHERE is_uploaded = 0 AND is_prod_environment = ?1
            ORDER BY device
            "#,
        )
        .bind(is_prod_environment)
        .fetch_all(&self.pool)
        .await?;

        Ok(devices)
    }

    /// Counts events not yet uploaded, across all devices.
    pub async fn count_pending(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events WHERE is_uploaded = 0")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};
    use chrono::Utc;

    fn event(key: &str, device: &str) -> DeviceEvent {
        DeviceEvent {
            key: key.into(),
            device: device.into(),
            event_type: "power-on".into(),
            details: r#"{"v":1}"#.into(),
            timestamp: Utc::now(),
            is_uploaded: false,
            is_prod_environment: true,
        }
    }

    #[tokio::test]
    async fn test_insert_is_unique_per_key_and_device() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.events();

        assert!(repo.insert(&event("1", "100")).await.unwrap());
        assert!(!repo.insert(&event("1", "100")).await.unwrap());
        assert!(repo.insert(&event("1", "200")).await.unwrap());
        assert_eq!(repo.keys_for_device("100").await.unwrap(), vec!["1"]);
    }

    #[tokio::test]
    async fn test_mark_uploaded_then_delete() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.events();

        repo.insert(&event("1", "100")).await.unwrap();
        repo.insert(&event("2", "100")).await.unwrap();
        repo.insert(&event("3", "100")).await.unwrap();

        let keys = vec!["1".to_string(), "2".to_string()];
        assert_eq!(repo.mark_uploaded("100", &keys).await.unwrap(), 2);
        assert_eq!(repo.pending_upload("100").await.unwrap().len(), 1);
        assert_eq!(repo.awaiting_unit_delete("100").await.unwrap().len(), 2);

        assert_eq!(repo.delete("100", &keys).await.unwrap(), 2);
        assert!(repo.awaiting_unit_delete("100").await.unwrap().is_empty());
        assert_eq!(repo.count_pending().await.unwrap(), 1);
    }
}
