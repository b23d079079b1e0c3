//! # Event Emitter
//!
//! Notification hook for whatever front end hosts the agent. The engine
//! never surfaces failures as errors past a sync cycle; it reports them
//! here instead.

use tracing::{info, warn};

use crate::access_point::ApState;
use crate::sync::SyncReport;

/// Receives user-visible sync notifications.
pub trait SyncEventEmitter: Send + Sync {
    /// The user must be added to `group` before uploads for `device_id`
    /// can succeed.
    fn emit_needs_group_access(&self, device_id: &str, group: &str);

    /// A sync cycle finished.
    fn emit_sync_finished(&self, report: &SyncReport);

    /// Progress text from a unit's software update.
    fn emit_update_progress(&self, device_id: &str, progress: Option<f64>, text: &str);

    fn emit_ap_state(&self, state: ApState);

    fn emit_error(&self, message: &str);
}

/// Emitter that drops everything.
pub struct NoOpEmitter;

impl SyncEventEmitter for NoOpEmitter {
    fn emit_needs_group_access(&self, _device_id: &str, _group: &str) {}
    fn emit_sync_finished(&self, _report: &SyncReport) {}
    fn emit_update_progress(&self, _device_id: &str, _progress: Option<f64>, _text: &str) {}
    fn emit_ap_state(&self, _state: ApState) {}
    fn emit_error(&self, _message: &str) {}
}

/// Emitter that writes every notification to the log. Used by the daemon.
pub struct LogEmitter;

impl SyncEventEmitter for LogEmitter {
    fn emit_needs_group_access(&self, device_id: &str, group: &str) {
        warn!(device_id, group, "Needs group access");
    }

    fn emit_sync_finished(&self, report: &SyncReport) {
        info!(
            recordings_downloaded = report.recordings_downloaded,
            recordings_uploaded = report.recordings_uploaded,
            events_uploaded = report.events_uploaded,
            images_synced = report.images_synced,
            stations_synced = report.stations_synced,
            errors = report.errors,
            "Sync finished"
        );
    }

    fn emit_update_progress(&self, device_id: &str, progress: Option<f64>, text: &str) {
        info!(device_id, ?progress, text, "Update progress");
    }

    fn emit_ap_state(&self, state: ApState) {
        info!(state = %state, "AP state");
    }

    fn emit_error(&self, message: &str) {
        warn!(message, "Sync error");
    }
}
