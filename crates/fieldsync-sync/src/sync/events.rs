//! Event legs. Events are uploaded grouped by `(type, details)`: one
//! request per group carrying every matching timestamp.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use fieldsync_core::{group_events, Device, DeviceEvent};

use super::{Flow, SyncEngine, SyncReport};
use crate::error::SyncResult;

/// Keys requested from the unit per call.
const EVENT_FETCH_BATCH: usize = 50;

impl SyncEngine {
    /// Stores every event the unit has that is not stored locally.
    pub(super) async fn download_events(
        &self,
        device: &Device,
        report: &mut SyncReport,
    ) -> SyncResult<()> {
        let on_unit = self.unit.get_event_keys(&device.url).await?;
        let known: HashSet<String> = self
            .db
            .events()
            .keys_for_device(&device.id)
            .await?
            .into_iter()
            .collect();

        let missing: Vec<String> = on_unit.into_iter().filter(|k| !known.contains(k)).collect();

        for batch in missing.chunks(EVENT_FETCH_BATCH) {
            if !self.is_active() {
                break;
            }

            for event in self.unit.get_events(&device.url, batch).await? {
                let row = DeviceEvent {
                    key: event.key,
                    device: device.id.clone(),
                    event_type: event.event_type,
                    details: event.details.to_string(),
                    timestamp: event.timestamp,
                    is_uploaded: false,
                    is_prod_environment: device.is_prod_environment,
                };
                if self.db.events().insert(&row).await? {
                    report.events_downloaded += 1;
                }
            }
        }

        Ok(())
    }

    /// Uploads a unit's pending events, one request per group.
    pub(super) async fn upload_events(
        &self,
        device_id: &str,
        group: Option<&str>,
        report: &mut SyncReport,
    ) -> SyncResult<Flow> {
        let pending = self.db.events().pending_upload(device_id).await?;
        if pending.is_empty() {
            return Ok(Flow::Continue);
        }

        let groups = group_events(&pending);
        debug!(device_id, events = pending.len(), groups = groups.len(), "Uploading events");

        for event_group in groups {
            if !self.is_active() {
                break;
            }

            match self.backend.upload_event_group(device_id, &event_group).await {
                Ok(()) => {
                    let marked = self
                        .db
                        .events()
                        .mark_uploaded(device_id, &event_group.keys)
                        .await?;
                    report.events_uploaded += u32::try_from(marked).unwrap_or(u32::MAX);
                    info!(
                        device_id,
                        event_type = %event_group.event_type,
                        count = marked,
                        "Event group uploaded"
                    );
                }
                Err(e) if e.is_access_error() => {
                    if self.on_access_error(device_id, group, &e, report).await == Flow::SkipDevice {
                        return Ok(Flow::SkipDevice);
                    }
                }
                Err(e) => {
                    warn!(device_id, event_type = %event_group.event_type, error = %e, "Event upload failed");
                    report.errors += 1;
                }
            }
        }

        Ok(Flow::Continue)
    }

    /// Deletes uploaded event keys on the unit, then their local rows.
    pub(super) async fn delete_uploaded_events(&self, device: &Device) -> SyncResult<()> {
        let keys: Vec<String> = self
            .db
            .events()
            .awaiting_unit_delete(&device.id)
            .await?
            .into_iter()
            .map(|e| e.key)
            .collect();

        if keys.is_empty() {
            return Ok(());
        }

        match self.unit.delete_events(&device.url, &keys).await {
            Ok(()) => {
                self.db.events().delete(&device.id, &keys).await?;
                Ok(())
            }
            Err(e) => {
                debug!(device_id = %device.id, error = %e, "Unit kept events");
                Err(e)
            }
        }
    }
}
