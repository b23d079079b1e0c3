//! Reference image sync.
//!
//! ```text
//!  1. pending-deletion  → backend delete  (not found / forbidden /
//!                                          unprocessable also finalize)
//!  2. pending-upload    → backend upload  → store file key, clear status
//!  3. read-sync         → for each connected unit and image type:
//!                           remote absent          → nothing
//!                           local absent           → download
//!                           SHA-256 / key mismatch → re-download
//! ```

use std::path::{Path, PathBuf};

use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use fieldsync_core::{Coords, Device, DeviceReferenceImage, ReferenceImageType, ServerStatus};

use super::{SyncEngine, SyncReport};
use crate::backend::RemoteReferenceImage;
use crate::error::{SyncError, SyncResult};

/// Hex SHA-256 of a file's contents.
pub async fn file_fingerprint(path: &Path) -> SyncResult<String> {
    let bytes = tokio::fs::read(path).await?;
    Ok(fingerprint(&bytes))
}

fn fingerprint(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Backend answers that mean a pending deletion is already done.
fn deletion_settled(err: &SyncError) -> bool {
    matches!(
        err,
        SyncError::NotFound(_) | SyncError::Forbidden(_) | SyncError::Unprocessable(_)
    )
}

impl SyncEngine {
    /// Stores a new reference image locally and queues it for upload.
    pub async fn stage_reference_image(
        &self,
        device: &Device,
        image_type: ReferenceImageType,
        bytes: &[u8],
        coords: Option<Coords>,
    ) -> SyncResult<DeviceReferenceImage> {
        let path = self.image_path(&device.id, device.is_prod_environment, image_type);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::write(&path, bytes).await?;

        let image = DeviceReferenceImage {
            device_id: device.id.clone(),
            is_prod_environment: device.is_prod_environment,
            file_path: path.display().to_string(),
            file_key: None,
            image_type,
            coords,
            server_status: Some(ServerStatus::PendingUpload),
            timestamp: Utc::now(),
        };
        self.db.reference_images().upsert(&image).await?;
        Ok(image)
    }

    /// Queues a reference image for deletion. Images the backend never
    /// saw are removed immediately.
    pub async fn stage_reference_image_deletion(
        &self,
        device_id: &str,
        is_prod_environment: bool,
        image_type: ReferenceImageType,
    ) -> SyncResult<()> {
        let images = self.db.reference_images();
        let Some(image) = images.get(device_id, is_prod_environment, image_type).await? else {
            return Ok(());
        };

        if image.file_key.is_none() {
            images.delete(device_id, is_prod_environment, image_type).await?;
            let _ = tokio::fs::remove_file(&image.file_path).await;
        } else {
            images
                .set_server_status(
                    device_id,
                    is_prod_environment,
                    image_type,
                    Some(ServerStatus::PendingDeletion),
                    None,
                )
                .await?;
        }
        Ok(())
    }

    pub(super) async fn sync_reference_images(&self, report: &mut SyncReport) {
        if let Err(e) = self.apply_pending_image_deletions(report).await {
            warn!(error = %e, "Pending image deletions stopped");
            report.errors += 1;
        }
        if let Err(e) = self.apply_pending_image_uploads(report).await {
            warn!(error = %e, "Pending image uploads stopped");
            report.errors += 1;
        }

        let is_prod = self.config.is_prod_environment();
        for device in self.registry.connected().await {
            if !self.is_active() {
                break;
            }
            if device.is_prod_environment != is_prod {
                continue;
            }
            for image_type in ReferenceImageType::ALL {
                if let Err(e) = self.read_sync_image(&device.id, image_type, report).await {
                    debug!(device_id = %device.id, %image_type, error = %e, "Image read-sync failed");
                    report.errors += 1;
                }
            }
        }
    }

    async fn apply_pending_image_deletions(&self, report: &mut SyncReport) -> SyncResult<()> {
        let images = self.db.reference_images();
        let is_prod = self.config.is_prod_environment();

        for image in images.with_status(ServerStatus::PendingDeletion).await? {
            if !self.is_active() {
                break;
            }
            if image.is_prod_environment != is_prod {
                continue;
            }

            match self
                .backend
                .delete_reference_image(&image.device_id, image.image_type)
                .await
            {
                Ok(()) => {}
                Err(e) if deletion_settled(&e) => {
                    debug!(device_id = %image.device_id, error = %e, "Image already gone on backend");
                }
                Err(e) => {
                    warn!(device_id = %image.device_id, error = %e, "Image deletion failed");
                    report.errors += 1;
                    continue;
                }
            }

            images
                .delete(&image.device_id, image.is_prod_environment, image.image_type)
                .await?;
            let _ = tokio::fs::remove_file(&image.file_path).await;
            report.images_synced += 1;
            info!(device_id = %image.device_id, image_type = %image.image_type, "Reference image deleted");
        }

        Ok(())
    }

    async fn apply_pending_image_uploads(&self, report: &mut SyncReport) -> SyncResult<()> {
        let images = self.db.reference_images();
        let is_prod = self.config.is_prod_environment();

        for image in images.with_status(ServerStatus::PendingUpload).await? {
            if !self.is_active() {
                break;
            }
            if image.is_prod_environment != is_prod {
                continue;
            }

            let path = PathBuf::from(&image.file_path);
            match self
                .backend
                .upload_reference_image(&image.device_id, image.image_type, &path)
                .await
            {
                Ok(file_key) => {
                    images
                        .set_server_status(
                            &image.device_id,
                            image.is_prod_environment,
                            image.image_type,
                            None,
                            Some(&file_key),
                        )
                        .await?;
                    report.images_synced += 1;
                    info!(device_id = %image.device_id, image_type = %image.image_type, "Reference image uploaded");
                }
                Err(e) if e.is_stale_reference() => {
                    info!(device_id = %image.device_id, error = %e, "Dropping stale reference image");
                    images
                        .delete(&image.device_id, image.is_prod_environment, image.image_type)
                        .await?;
                }
                Err(e) => {
                    warn!(device_id = %image.device_id, error = %e, "Image upload failed");
                    report.errors += 1;
                }
            }
        }

        Ok(())
    }

    async fn read_sync_image(
        &self,
        device_id: &str,
        image_type: ReferenceImageType,
        report: &mut SyncReport,
    ) -> SyncResult<()> {
        let is_prod = self.config.is_prod_environment();
        let local = self
            .db
            .reference_images()
            .get(device_id, is_prod, image_type)
            .await?;

        if local.as_ref().is_some_and(|l| !l.is_synced()) {
            return Ok(());
        }

        let Some(remote) = self
            .backend
            .get_reference_image_info(device_id, image_type)
            .await?
        else {
            return Ok(());
        };

        let up_to_date = match &local {
            None => false,
            Some(local) => self.matches_remote(local, &remote).await,
        };
        if up_to_date {
            return Ok(());
        }

        let bytes = self
            .backend
            .download_reference_image(device_id, image_type)
            .await?;
        let path = self.image_path(device_id, is_prod, image_type);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::write(&path, &bytes).await?;

        let image = DeviceReferenceImage {
            device_id: device_id.to_string(),
            is_prod_environment: is_prod,
            file_path: path.display().to_string(),
            file_key: Some(remote.file_key),
            image_type,
            coords: local.and_then(|l| l.coords),
            server_status: None,
            timestamp: Utc::now(),
        };
        self.db.reference_images().upsert(&image).await?;
        report.images_synced += 1;
        info!(device_id, %image_type, "Reference image downloaded");
        Ok(())
    }

    async fn matches_remote(&self, local: &DeviceReferenceImage, remote: &RemoteReferenceImage) -> bool {
        match &remote.sha256 {
            Some(expected) => match file_fingerprint(Path::new(&local.file_path)).await {
                Ok(actual) => actual.eq_ignore_ascii_case(expected),
                Err(_) => false,
            },
            None => {
                local.file_key.as_deref() == Some(remote.file_key.as_str())
                    && tokio::fs::try_exists(&local.file_path).await.unwrap_or(false)
            }
        }
    }

    fn image_path(&self, device_id: &str, is_prod: bool, image_type: ReferenceImageType) -> PathBuf {
        let env = if is_prod { "prod" } else { "test" };
        self.config
            .images_dir()
            .join(format!("{device_id}-{env}-{image_type}.jpg"))
    }
}
