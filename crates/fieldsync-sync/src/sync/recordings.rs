//! Recording legs: unit → local download, local → backend upload, and
//! best-effort cleanup of uploaded copies on the unit.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use fieldsync_core::validation::validate_recording_name;
use fieldsync_core::{Device, Recording};

use super::{Flow, SyncEngine, SyncReport};
use crate::error::{SyncError, SyncResult};
use crate::retry::{retry, RetryPolicy};

/// Transient failures on a recording upload are retried this many times.
const UPLOAD_ATTEMPTS: u32 = 3;
const UPLOAD_RETRY_DELAY: Duration = Duration::from_secs(2);

impl SyncEngine {
    /// Downloads every recording the unit has that is not stored locally.
    pub(super) async fn download_recordings(
        &self,
        device: &Device,
        report: &mut SyncReport,
    ) -> SyncResult<()> {
        let on_unit = self.unit.get_recordings(&device.url).await?;
        let known: HashSet<String> = self
            .db
            .recordings()
            .names_for_device(&device.id)
            .await?
            .into_iter()
            .collect();

        let missing: Vec<String> = on_unit.into_iter().filter(|n| !known.contains(n)).collect();
        if missing.is_empty() {
            return Ok(());
        }

        let dir = self.config.recordings_dir(&device.id);
        tokio::fs::create_dir_all(&dir).await?;
        debug!(device_id = %device.id, count = missing.len(), "Downloading recordings");

        for name in missing {
            if !self.is_active() {
                info!(device_id = %device.id, "Recording download interrupted");
                break;
            }

            if let Err(e) = validate_recording_name(&name) {
                warn!(device_id = %device.id, name = %name, error = %e, "Skipping recording");
                continue;
            }

            let dest = dir.join(&name);
            match self.unit.download_recording(&device.url, &name, &dest).await {
                Ok(size) => {
                    let recording = Recording {
                        name: name.clone(),
                        device: device.id.clone(),
                        path: dest.display().to_string(),
                        size: i64::try_from(size).unwrap_or(i64::MAX),
                        is_prod_environment: device.is_prod_environment,
                        is_uploaded: false,
                        server_upload_id: None,
                        created_at: Utc::now(),
                    };
                    self.db.recordings().insert(&recording).await?;
                    report.recordings_downloaded += 1;
                }
                Err(e) => {
                    warn!(device_id = %device.id, name = %name, error = %e, "Recording download failed");
                    report.errors += 1;
                    let _ = tokio::fs::remove_file(&dest).await;
                    if e.is_unreachable() {
                        return Err(e);
                    }
                }
            }
        }

        Ok(())
    }

    /// Uploads a unit's pending recordings one at a time.
    pub(super) async fn upload_recordings(
        &self,
        device_id: &str,
        group: Option<&str>,
        report: &mut SyncReport,
    ) -> SyncResult<Flow> {
        let pending = self.db.recordings().pending_upload(device_id).await?;

        for recording in pending {
            if !self.is_active() {
                break;
            }

            let path = PathBuf::from(&recording.path);
            let policy = RetryPolicy::exponential(UPLOAD_ATTEMPTS, UPLOAD_RETRY_DELAY);
            let upload = retry(policy, || self.backend.upload_recording(&recording, &path)).await;
            match upload {
                Ok(server_id) => {
                    self.db
                        .recordings()
                        .mark_uploaded(&recording.name, device_id, server_id.as_deref())
                        .await?;
                    report.recordings_uploaded += 1;
                    info!(device_id, name = %recording.name, "Recording uploaded");
                }
                // Only a missing local file is final. A backend 404 can name
                // a unit id the backend no longer knows.
                Err(e @ SyncError::FileMissing(_)) => {
                    info!(device_id, name = %recording.name, error = %e, "Dropping stale recording");
                    self.db.recordings().delete(&recording.name, device_id).await?;
                    let _ = tokio::fs::remove_file(&path).await;
                    report.recordings_pruned += 1;
                }
                Err(e) if e.is_access_error() => {
                    if self.on_access_error(device_id, group, &e, report).await == Flow::SkipDevice {
                        return Ok(Flow::SkipDevice);
                    }
                }
                Err(e) => {
                    warn!(device_id, name = %recording.name, error = %e, "Recording upload failed");
                    report.errors += 1;
                }
            }
        }

        Ok(Flow::Continue)
    }

    /// Deletes uploaded recordings from the unit, then their local rows.
    pub(super) async fn delete_uploaded_recordings(&self, device: &Device) -> SyncResult<()> {
        let uploaded = self.db.recordings().awaiting_unit_delete(&device.id).await?;

        for recording in uploaded {
            if !self.is_active() {
                break;
            }

            match self.unit.delete_recording(&device.url, &recording.name).await {
                Ok(()) => {}
                Err(e) if e.is_stale_reference() => {}
                Err(e) => {
                    debug!(device_id = %device.id, name = %recording.name, error = %e, "Unit kept recording");
                    continue;
                }
            }

            self.db.recordings().delete(&recording.name, &device.id).await?;
            let _ = tokio::fs::remove_file(&recording.path).await;
        }

        Ok(())
    }
}
