//! # Offline Sync Engine
//!
//! Moves data between connected units, the local store and the backend.
//!
//! ## Sync Cycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Offline Sync Engine                              │
//! │                                                                         │
//! │  sync_device(unit)                         sync_all()                   │
//! │  ─────────────────                         ──────────                   │
//! │  1. download new recordings ─┐             every connected unit  ─┐     │
//! │  2. download new events     ─┤ unit→local  + units with pending   │     │
//! │                              │             rows (upload only)     │     │
//! │  uploads permitted? ─────────┘               join_all ◄───────────┘     │
//! │  3. upload recordings        ┐                   │                      │
//! │  4. upload grouped events    │ local→backend     ▼                      │
//! │  5. delete uploaded copies   │             reference images             │
//! │     on the unit (best effort)┘             stations                     │
//! │                                                                         │
//! │  UPLOAD GATE:                                                          │
//! │  should_upload && AP link not up && backend reachable                  │
//! │                                                                         │
//! │  FAILURE POLICY (per item):                                            │
//! │  • local file gone                    → drop local row, no retry       │
//! │  • forbidden + no group membership    → needs-group-access, skip unit  │
//! │  • session rejected                   → skip unit this cycle           │
//! │  • 5xx / transient                    → keep local state, next item    │
//! │                                                                         │
//! │  Every loop checks the active flag between items.                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

mod events;
mod locations;
mod recordings;
mod reference_images;

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use fieldsync_core::Device;
use fieldsync_db::Database;

use crate::backend::BackendApi;
use crate::config::SyncConfig;
use crate::emitter::SyncEventEmitter;
use crate::error::SyncError;
use crate::geofence::StationMatcher;
use crate::registry::DeviceRegistry;
use crate::unit::UnitApi;

pub use reference_images::file_fingerprint;

// =============================================================================
// Sync Report
// =============================================================================

/// Counters for one sync cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub recordings_downloaded: u32,
    pub recordings_uploaded: u32,
    /// Rows dropped because their file or backend record is gone.
    pub recordings_pruned: u32,
    pub events_downloaded: u32,
    pub events_uploaded: u32,
    pub images_synced: u32,
    pub stations_synced: u32,
    /// Item-level failures that were logged and skipped.
    pub errors: u32,
    /// Groups the user must join before uploads can succeed.
    pub needs_group_access: Vec<String>,
}

impl SyncReport {
    pub fn merge(&mut self, other: SyncReport) {
        self.recordings_downloaded += other.recordings_downloaded;
        self.recordings_uploaded += other.recordings_uploaded;
        self.recordings_pruned += other.recordings_pruned;
        self.events_downloaded += other.events_downloaded;
        self.events_uploaded += other.events_uploaded;
        self.images_synced += other.images_synced;
        self.stations_synced += other.stations_synced;
        self.errors += other.errors;
        for group in other.needs_group_access {
            if !self.needs_group_access.contains(&group) {
                self.needs_group_access.push(group);
            }
        }
    }
}

/// Whether an upload loop may move on to the next item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    SkipDevice,
}

// =============================================================================
// Sync Engine
// =============================================================================

/// Reconciles units, the local store and the backend. Cheap to clone.
#[derive(Clone)]
pub struct SyncEngine {
    config: Arc<SyncConfig>,
    db: Database,
    unit: Arc<dyn UnitApi>,
    backend: Arc<dyn BackendApi>,
    registry: DeviceRegistry,
    emitter: Arc<dyn SyncEventEmitter>,
    matcher: StationMatcher,
    active: Arc<watch::Sender<bool>>,
    uploads_allowed: Arc<AtomicBool>,
    in_progress: Arc<Mutex<HashSet<String>>>,
    last_report: Arc<RwLock<Option<SyncReport>>>,
}

impl SyncEngine {
    pub fn new(
        config: Arc<SyncConfig>,
        db: Database,
        unit: Arc<dyn UnitApi>,
        backend: Arc<dyn BackendApi>,
        registry: DeviceRegistry,
        emitter: Arc<dyn SyncEventEmitter>,
    ) -> Self {
        let (active, _) = watch::channel(true);

        SyncEngine {
            matcher: StationMatcher::from_settings(&config.stations),
            config,
            db,
            unit,
            backend,
            registry,
            emitter,
            active: Arc::new(active),
            uploads_allowed: Arc::new(AtomicBool::new(true)),
            in_progress: Arc::new(Mutex::new(HashSet::new())),
            last_report: Arc::new(RwLock::new(None)),
        }
    }

    // =========================================================================
    // Flags
    // =========================================================================

    /// Clearing the flag makes every running loop stop at its next item.
    pub fn set_active(&self, active: bool) {
        self.active.send_replace(active);
    }

    pub fn is_active(&self) -> bool {
        *self.active.borrow()
    }

    /// Subscribes to the shared active flag.
    pub fn subscribe_active(&self) -> watch::Receiver<bool> {
        self.active.subscribe()
    }

    /// Gates upload legs. Cleared while the host is on a unit's AP.
    pub fn set_uploads_allowed(&self, allowed: bool) {
        self.uploads_allowed.store(allowed, Ordering::SeqCst);
    }

    pub async fn last_report(&self) -> Option<SyncReport> {
        self.last_report.read().await.clone()
    }

    pub fn matcher(&self) -> &StationMatcher {
        &self.matcher
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    async fn uploads_permitted(&self) -> bool {
        if !self.config.app.should_upload {
            debug!("Uploads disabled by configuration");
            return false;
        }
        if !self.uploads_allowed.load(Ordering::SeqCst) {
            debug!("Uploads paused while on a unit access point");
            return false;
        }
        if !self.backend.is_reachable().await {
            debug!("Backend unreachable, skipping uploads");
            return false;
        }
        true
    }

    // =========================================================================
    // Cycles
    // =========================================================================

    /// Full cycle for one connected unit.
    pub async fn sync_device(&self, device: &Device) -> SyncReport {
        let report = self.sync_device_inner(device).await;
        self.finish(&report).await;
        report
    }

    /// Cycle for every connected unit plus any unit with rows still
    /// waiting for upload, followed by reference images and stations.
    pub async fn sync_all(&self) -> SyncReport {
        let mut report = SyncReport::default();
        if !self.is_active() {
            return report;
        }

        let is_prod = self.config.is_prod_environment();
        let connected: Vec<Device> = self
            .registry
            .connected()
            .await
            .into_iter()
            .filter(|d| d.is_prod_environment == is_prod)
            .collect();

        let uploads = self.uploads_permitted().await;
        let offline: Vec<String> = if uploads {
            self.devices_with_pending(is_prod)
                .await
                .into_iter()
                .filter(|id| !connected.iter().any(|d| &d.id == id))
                .collect()
        } else {
            Vec::new()
        };

        let online_cycles = connected.iter().map(|d| self.sync_device_inner(d));
        for device_report in join_all(online_cycles).await {
            report.merge(device_report);
        }

        let offline_cycles = offline.iter().map(|id| self.upload_offline(id));
        for device_report in join_all(offline_cycles).await {
            report.merge(device_report);
        }

        if uploads && self.is_active() {
            self.sync_reference_images(&mut report).await;
            self.sync_locations(&mut report).await;
        }

        self.finish(&report).await;
        report
    }

    async fn sync_device_inner(&self, device: &Device) -> SyncReport {
        let mut report = SyncReport::default();

        if !self.is_active() {
            return report;
        }
        let Some(_guard) = InProgress::acquire(&self.in_progress, &device.id) else {
            debug!(device_id = %device.id, "Sync already running for unit");
            return report;
        };

        info!(device_id = %device.id, name = %device.name, "Syncing unit");

        if let Err(e) = self.download_recordings(device, &mut report).await {
            warn!(device_id = %device.id, error = %e, "Recording download stopped");
            report.errors += 1;
        }
        if let Err(e) = self.download_events(device, &mut report).await {
            warn!(device_id = %device.id, error = %e, "Event download stopped");
            report.errors += 1;
        }

        if self.uploads_permitted().await {
            self.push_device_settings(device).await;
            report.merge(self.upload_for_device(&device.id, Some(device)).await);
        }

        report
    }

    /// Upload legs for a unit that is not connected. Shares the per-unit
    /// guard with [`sync_device`](Self::sync_device) so no row is submitted
    /// twice.
    async fn upload_offline(&self, device_id: &str) -> SyncReport {
        let Some(_guard) = InProgress::acquire(&self.in_progress, device_id) else {
            debug!(device_id, "Sync already running for unit");
            return SyncReport::default();
        };
        self.upload_for_device(device_id, None).await
    }

    /// Upload legs for one unit. Unit-side deletes run only when the unit
    /// is connected.
    async fn upload_for_device(&self, device_id: &str, connected: Option<&Device>) -> SyncReport {
        let mut report = SyncReport::default();
        let group = match connected {
            Some(device) => Some(device.group.clone()),
            None => self.registry.get(device_id).await.map(|d| d.group),
        };

        match self
            .upload_recordings(device_id, group.as_deref(), &mut report)
            .await
        {
            Ok(Flow::Continue) => {}
            Ok(Flow::SkipDevice) => return report,
            Err(e) => {
                warn!(device_id, error = %e, "Recording upload stopped");
                report.errors += 1;
            }
        }

        match self
            .upload_events(device_id, group.as_deref(), &mut report)
            .await
        {
            Ok(Flow::Continue) => {}
            Ok(Flow::SkipDevice) => return report,
            Err(e) => {
                warn!(device_id, error = %e, "Event upload stopped");
                report.errors += 1;
            }
        }

        if let Some(device) = connected {
            if let Err(e) = self.delete_uploaded_recordings(device).await {
                debug!(device_id, error = %e, "Recording cleanup on unit skipped");
            }
            if let Err(e) = self.delete_uploaded_events(device).await {
                debug!(device_id, error = %e, "Event cleanup on unit skipped");
            }
        }

        report
    }

    async fn devices_with_pending(&self, is_prod: bool) -> Vec<String> {
        let mut devices = BTreeSet::new();

        match self.db.recordings().devices_with_pending(is_prod).await {
            Ok(ids) => devices.extend(ids),
            Err(e) => warn!(error = %e, "Failed to list devices with pending recordings"),
        }
        match self.db.events().devices_with_pending(is_prod).await {
            Ok(ids) => devices.extend(ids),
            Err(e) => warn!(error = %e, "Failed to list devices with pending events"),
        }

        devices.into_iter().collect()
    }

    async fn push_device_settings(&self, device: &Device) {
        let settings = serde_json::json!({
            "name": device.name,
            "capabilities": device.capabilities,
        });

        if let Err(e) = self.backend.update_device_settings(&device.id, &settings).await {
            debug!(device_id = %device.id, error = %e, "Device settings push failed");
        }
    }

    /// Decides what an access error means for the rest of a unit's queue.
    pub(crate) async fn on_access_error(
        &self,
        device_id: &str,
        group: Option<&str>,
        err: &SyncError,
        report: &mut SyncReport,
    ) -> Flow {
        if let SyncError::AuthFailed(_) = err {
            warn!(device_id, error = %err, "Session rejected, skipping unit this cycle");
            report.errors += 1;
            return Flow::SkipDevice;
        }

        let Some(group) = group else {
            warn!(device_id, error = %err, "Upload forbidden");
            report.errors += 1;
            return Flow::Continue;
        };

        match self.backend.user_has_group_access(group).await {
            Ok(false) => {
                info!(device_id, group, "User needs access to group");
                self.emitter.emit_needs_group_access(device_id, group);
                if !report.needs_group_access.iter().any(|g| g == group) {
                    report.needs_group_access.push(group.to_string());
                }
                Flow::SkipDevice
            }
            Ok(true) => {
                warn!(device_id, group, error = %err, "Upload forbidden despite group access");
                report.errors += 1;
                Flow::Continue
            }
            Err(e) => {
                warn!(device_id, group, error = %e, "Group access check failed");
                report.errors += 1;
                Flow::Continue
            }
        }
    }

    async fn finish(&self, report: &SyncReport) {
        *self.last_report.write().await = Some(report.clone());
        self.emitter.emit_sync_finished(report);
    }
}

/// Marks a unit as being synced for as long as the guard lives.
struct InProgress {
    set: Arc<Mutex<HashSet<String>>>,
    device_id: String,
}

impl InProgress {
    fn acquire(set: &Arc<Mutex<HashSet<String>>>, device_id: &str) -> Option<Self> {
        let inserted = set
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(device_id.to_string());

        inserted.then(|| InProgress {
            set: set.clone(),
            device_id: device_id.to_string(),
        })
    }
}

impl Drop for InProgress {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.device_id);
    }
}
