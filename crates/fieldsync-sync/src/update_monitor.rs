//! # Update Monitor
//!
//! Follows a unit's software update after it has been triggered.
//!
//! ```text
//!  trigger(unit) ──► unit.trigger_update()
//!                        │
//!                        ▼
//!                 spawn poll task ──► every poll_interval:
//!                                        get_update_status()
//!                                        emit progress
//!                                        stop when not running, when the
//!                                        text says done, or after max_polls
//! ```
//!
//! One poll task per unit. A second trigger while one runs is rejected.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use fieldsync_core::Device;

use crate::config::UpdateSettings;
use crate::emitter::SyncEventEmitter;
use crate::error::{SyncError, SyncResult};
use crate::unit::{UnitApi, UpdateStatus};

/// Progress phrases that mean the unit has nothing more to do.
const FINISHED_MARKERS: [&str; 4] = ["complete", "no update", "up to date", "finished"];

fn is_finished(status: &UpdateStatus) -> bool {
    if !status.running_update {
        return true;
    }
    status.progress_text.as_deref().is_some_and(|text| {
        let text = text.to_lowercase();
        FINISHED_MARKERS.iter().any(|m| text.contains(m))
    })
}

/// Per-unit entry in the monitor's task table.
enum PollSlot {
    /// Claimed while the trigger RPC is in flight.
    Starting,
    Polling(JoinHandle<()>),
}

impl PollSlot {
    fn is_live(&self) -> bool {
        match self {
            PollSlot::Starting => true,
            PollSlot::Polling(handle) => !handle.is_finished(),
        }
    }
}

type PollTasks = Arc<Mutex<HashMap<String, PollSlot>>>;

/// Releases a `Starting` claim unless the trigger got as far as polling.
struct StartingClaim<'a> {
    tasks: &'a PollTasks,
    device_id: &'a str,
}

impl Drop for StartingClaim<'_> {
    fn drop(&mut self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if matches!(tasks.get(self.device_id), Some(PollSlot::Starting)) {
            tasks.remove(self.device_id);
        }
    }
}

/// Triggers unit updates and polls them to completion. Cheap to clone.
#[derive(Clone)]
pub struct UpdateMonitor {
    unit: Arc<dyn UnitApi>,
    emitter: Arc<dyn SyncEventEmitter>,
    poll_interval: Duration,
    max_polls: u32,
    tasks: PollTasks,
}

impl UpdateMonitor {
    pub fn new(
        settings: &UpdateSettings,
        unit: Arc<dyn UnitApi>,
        emitter: Arc<dyn SyncEventEmitter>,
    ) -> Self {
        UpdateMonitor {
            unit,
            emitter,
            poll_interval: Duration::from_secs(settings.poll_interval_secs),
            max_polls: settings.max_polls,
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Starts an update on `device` and begins polling its status.
    ///
    /// The unit is claimed before the trigger RPC goes out, so a second
    /// trigger is rejected even while the first is still waiting on the unit.
    pub async fn trigger(&self, device: &Device) -> SyncResult<()> {
        {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            if tasks.get(&device.id).is_some_and(PollSlot::is_live) {
                return Err(SyncError::UpdateInProgress(device.id.clone()));
            }
            tasks.insert(device.id.clone(), PollSlot::Starting);
        }
        let _claim = StartingClaim {
            tasks: &self.tasks,
            device_id: &device.id,
        };

        self.unit.trigger_update(&device.url).await?;
        info!(device_id = %device.id, "Update triggered");

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let started = match tasks.get_mut(&device.id) {
            Some(slot) if matches!(slot, PollSlot::Starting) => {
                let handle = tokio::spawn(self.clone().poll(device.id.clone(), device.url.clone()));
                *slot = PollSlot::Polling(handle);
                Ok(())
            }
            // Cancelled while the trigger was in flight.
            _ => Err(SyncError::ShuttingDown),
        };
        started
    }

    pub fn is_running(&self, device_id: &str) -> bool {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(device_id)
            .is_some_and(PollSlot::is_live)
    }

    /// Aborts every poll task and drops pending claims.
    pub fn cancel_all(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        for (device_id, slot) in tasks.drain() {
            debug!(device_id = %device_id, "Cancelling update poll");
            if let PollSlot::Polling(handle) = slot {
                handle.abort();
            }
        }
    }

    async fn poll(self, device_id: String, url: String) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        // The first tick completes immediately; the unit needs a moment.
        ticker.tick().await;

        for _ in 0..self.max_polls {
            ticker.tick().await;

            match self.unit.get_update_status(&url).await {
                Ok(Some(status)) => {
                    let text = status.progress_text.as_deref().unwrap_or_default();
                    self.emitter
                        .emit_update_progress(&device_id, status.progress_percent, text);

                    if is_finished(&status) {
                        info!(device_id = %device_id, text, "Update finished");
                        self.forget(&device_id);
                        return;
                    }
                }
                Ok(None) => debug!(device_id = %device_id, "No update status yet"),
                Err(e) => debug!(device_id = %device_id, error = %e, "Update status poll failed"),
            }
        }

        warn!(device_id = %device_id, polls = self.max_polls, "Gave up waiting for update");
        self.emitter
            .emit_error(&format!("Update on unit {device_id} did not finish"));
        self.forget(&device_id);
    }

    fn forget(&self, device_id: &str) {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(device_id);
    }
}
