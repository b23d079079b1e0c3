//! In-memory unit and backend doubles shared by the crate's tests.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use fieldsync_core::{Coords, EventGroup, Recording, ReferenceImageType};

use crate::backend::{BackendApi, RemoteReferenceImage, RemoteStation};
use crate::error::{SyncError, SyncResult};
use crate::unit::{UnitApi, UnitEvent, UnitInfo, UnitLocation, UpdateStatus, WifiNetwork};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// =============================================================================
// Fake Unit
// =============================================================================

#[derive(Debug, Clone)]
pub struct FakeUnitDevice {
    pub info: UnitInfo,
    pub recordings: BTreeMap<String, Vec<u8>>,
    pub events: BTreeMap<String, UnitEvent>,
    pub location: Option<UnitLocation>,
    pub battery_voltage: Option<f64>,
    pub audio_mode: Option<String>,
    pub wifi_networks: Vec<WifiNetwork>,
    pub probes: HashSet<String>,
    pub update_statuses: VecDeque<UpdateStatus>,
    /// How long `trigger_update` takes to answer.
    pub trigger_delay: Duration,
}

impl FakeUnitDevice {
    pub fn new(id: &str, hardware_id: &str, group: &str) -> Self {
        FakeUnitDevice {
            info: UnitInfo {
                id: id.into(),
                hardware_id: Some(hardware_id.into()),
                name: format!("unit-{id}"),
                group: group.into(),
                server_url: Some("https://api.fieldsync.org".into()),
            },
            recordings: BTreeMap::new(),
            events: BTreeMap::new(),
            location: None,
            battery_voltage: None,
            audio_mode: None,
            wifi_networks: Vec::new(),
            probes: HashSet::new(),
            update_statuses: VecDeque::new(),
            trigger_delay: Duration::ZERO,
        }
    }
}

/// Units keyed by the base URL they answer on.
#[derive(Debug, Default)]
pub struct FakeUnit {
    devices: Mutex<HashMap<String, FakeUnitDevice>>,
    calls: Mutex<Vec<String>>,
    refuse_deletes: Mutex<bool>,
}

impl FakeUnit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve(&self, base_url: &str, device: FakeUnitDevice) {
        lock(&self.devices).insert(base_url.to_string(), device);
    }

    pub fn unplug(&self, base_url: &str) {
        lock(&self.devices).remove(base_url);
    }

    pub fn with_device<R>(&self, base_url: &str, f: impl FnOnce(&mut FakeUnitDevice) -> R) -> R {
        let mut devices = lock(&self.devices);
        let device = devices
            .get_mut(base_url)
            .unwrap_or_else(|| panic!("no fake unit at {base_url}"));
        f(device)
    }

    pub fn refuse_deletes(&self, refuse: bool) {
        *lock(&self.refuse_deletes) = refuse;
    }

    /// Number of recorded calls whose name starts with `prefix`.
    pub fn call_count(&self, prefix: &str) -> usize {
        lock(&self.calls).iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn record(&self, call: &str, base_url: &str) {
        lock(&self.calls).push(format!("{call}:{base_url}"));
    }

    fn device<R>(
        &self,
        call: &str,
        base_url: &str,
        f: impl FnOnce(&mut FakeUnitDevice) -> SyncResult<R>,
    ) -> SyncResult<R> {
        self.record(call, base_url);
        let mut devices = lock(&self.devices);
        match devices.get_mut(base_url) {
            Some(device) => f(device),
            None => Err(SyncError::ConnectionFailed(format!("{base_url} refused"))),
        }
    }

    fn deletes_refused(&self) -> bool {
        *lock(&self.refuse_deletes)
    }
}

#[async_trait]
impl UnitApi for FakeUnit {
    async fn get_device_info(&self, base_url: &str) -> SyncResult<UnitInfo> {
        self.device("get_device_info", base_url, |d| Ok(d.info.clone()))
    }

    async fn get_device_config(&self, base_url: &str) -> SyncResult<Option<serde_json::Value>> {
        self.device("get_device_config", base_url, |_| Ok(None))
    }

    async fn set_device_config(
        &self,
        base_url: &str,
        _section: &str,
        _values: &serde_json::Value,
    ) -> SyncResult<()> {
        self.device("set_device_config", base_url, |_| Ok(()))
    }

    async fn get_recordings(&self, base_url: &str) -> SyncResult<Vec<String>> {
        self.device("get_recordings", base_url, |d| {
            Ok(d.recordings.keys().cloned().collect())
        })
    }

    async fn download_recording(&self, base_url: &str, name: &str, dest: &Path) -> SyncResult<u64> {
        let bytes = self.device("download_recording", base_url, |d| {
            d.recordings
                .get(name)
                .cloned()
                .ok_or_else(|| SyncError::NotFound(name.to_string()))
        })?;
        tokio::fs::write(dest, &bytes).await?;
        Ok(bytes.len() as u64)
    }

    async fn delete_recording(&self, base_url: &str, name: &str) -> SyncResult<()> {
        let refused = self.deletes_refused();
        self.device("delete_recording", base_url, |d| {
            if refused {
                return Err(SyncError::UnexpectedStatus {
                    status: 500,
                    message: "busy".into(),
                });
            }
            d.recordings.remove(name);
            Ok(())
        })
    }

    async fn get_event_keys(&self, base_url: &str) -> SyncResult<Vec<String>> {
        self.device("get_event_keys", base_url, |d| Ok(d.events.keys().cloned().collect()))
    }

    async fn get_events(&self, base_url: &str, keys: &[String]) -> SyncResult<Vec<UnitEvent>> {
        self.device("get_events", base_url, |d| {
            Ok(keys.iter().filter_map(|k| d.events.get(k).cloned()).collect())
        })
    }

    async fn delete_events(&self, base_url: &str, keys: &[String]) -> SyncResult<()> {
        self.device("delete_events", base_url, |d| {
            for key in keys {
                d.events.remove(key);
            }
            Ok(())
        })
    }

    async fn get_location(&self, base_url: &str) -> SyncResult<Option<UnitLocation>> {
        self.device("get_location", base_url, |d| Ok(d.location.clone()))
    }

    async fn set_location(&self, base_url: &str, location: &UnitLocation) -> SyncResult<()> {
        self.device("set_location", base_url, |d| {
            d.location = Some(location.clone());
            Ok(())
        })
    }

    async fn get_wifi_networks(&self, base_url: &str) -> SyncResult<Vec<WifiNetwork>> {
        self.device("get_wifi_networks", base_url, |d| Ok(d.wifi_networks.clone()))
    }

    async fn get_current_wifi(&self, base_url: &str) -> SyncResult<Option<String>> {
        self.device("get_current_wifi", base_url, |d| {
            Ok(d.wifi_networks.first().map(|n| n.ssid.clone()))
        })
    }

    async fn save_wifi_network(&self, base_url: &str, ssid: &str, _password: &str) -> SyncResult<()> {
        self.device("save_wifi_network", base_url, |d| {
            d.wifi_networks.push(WifiNetwork {
                ssid: ssid.to_string(),
                quality: None,
                security: None,
            });
            Ok(())
        })
    }

    async fn forget_wifi_network(&self, base_url: &str, ssid: &str) -> SyncResult<()> {
        self.device("forget_wifi_network", base_url, |d| {
            d.wifi_networks.retain(|n| n.ssid != ssid);
            Ok(())
        })
    }

    async fn check_internet(&self, base_url: &str) -> SyncResult<bool> {
        self.device("check_internet", base_url, |_| Ok(true))
    }

    async fn get_modem_status(&self, base_url: &str) -> SyncResult<Option<serde_json::Value>> {
        self.device("get_modem_status", base_url, |_| Ok(None))
    }

    async fn get_battery_voltage(&self, base_url: &str) -> SyncResult<Option<f64>> {
        self.device("get_battery_voltage", base_url, |d| Ok(d.battery_voltage))
    }

    async fn get_audio_mode(&self, base_url: &str) -> SyncResult<Option<String>> {
        self.device("get_audio_mode", base_url, |d| Ok(d.audio_mode.clone()))
    }

    async fn set_audio_mode(&self, base_url: &str, mode: &str) -> SyncResult<()> {
        self.device("set_audio_mode", base_url, |d| {
            d.audio_mode = Some(mode.to_string());
            Ok(())
        })
    }

    async fn take_test_recording(&self, base_url: &str) -> SyncResult<()> {
        self.device("take_test_recording", base_url, |_| Ok(()))
    }

    async fn trigger_update(&self, base_url: &str) -> SyncResult<()> {
        let delay = self.device("trigger_update", base_url, |d| Ok(d.trigger_delay))?;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn get_update_status(&self, base_url: &str) -> SyncResult<Option<UpdateStatus>> {
        self.device("get_update_status", base_url, |d| {
            let next = if d.update_statuses.len() > 1 {
                d.update_statuses.pop_front()
            } else {
                d.update_statuses.front().cloned()
            };
            Ok(next)
        })
    }

    async fn probe(&self, base_url: &str, path: &str) -> SyncResult<bool> {
        self.device("probe", base_url, |d| Ok(d.probes.contains(path)))
    }
}

// =============================================================================
// Fake Backend
// =============================================================================

/// Failure a fake backend call should produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    NotFound,
    Forbidden,
    Server,
}

impl Failure {
    fn error(self) -> SyncError {
        match self {
            Failure::NotFound => SyncError::NotFound("gone".into()),
            Failure::Forbidden => SyncError::Forbidden("not a member".into()),
            Failure::Server => SyncError::ServerError {
                status: 500,
                message: "boom".into(),
            },
        }
    }
}

#[derive(Debug, Default)]
pub struct BackendState {
    pub uploaded_recordings: Vec<(String, String)>,
    pub event_groups: Vec<(String, EventGroup)>,
    pub created_stations: Vec<(String, String)>,
    pub renamed_stations: Vec<(String, String)>,
    pub stations: HashMap<String, Vec<RemoteStation>>,
    pub images: HashMap<(String, ReferenceImageType), (String, Vec<u8>)>,
    pub deleted_images: Vec<(String, ReferenceImageType)>,
    pub uploaded_images: Vec<(String, ReferenceImageType)>,
    pub recording_failure: Option<Failure>,
    pub event_failure: Option<Failure>,
    pub image_delete_failure: Option<Failure>,
    pub station_failure: Option<Failure>,
    pub denied_groups: HashSet<String>,
    pub unreachable: bool,
    next_id: u64,
}

#[derive(Debug, Default)]
pub struct FakeBackend {
    pub state: Mutex<BackendState>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, BackendState> {
        lock(&self.state)
    }
}

#[async_trait]
impl BackendApi for FakeBackend {
    async fn upload_recording(&self, recording: &Recording, file: &Path) -> SyncResult<Option<String>> {
        if let Some(failure) = self.state().recording_failure {
            return Err(failure.error());
        }
        if !tokio::fs::try_exists(file).await.unwrap_or(false) {
            return Err(SyncError::FileMissing(file.display().to_string()));
        }

        let mut state = self.state();
        state.next_id += 1;
        let id = state.next_id;
        state
            .uploaded_recordings
            .push((recording.device.clone(), recording.name.clone()));
        Ok(Some(id.to_string()))
    }

    async fn upload_event_group(&self, device_id: &str, group: &EventGroup) -> SyncResult<()> {
        let mut state = self.state();
        if let Some(failure) = state.event_failure {
            return Err(failure.error());
        }
        state.event_groups.push((device_id.to_string(), group.clone()));
        Ok(())
    }

    async fn upload_reference_image(
        &self,
        device_id: &str,
        image_type: ReferenceImageType,
        file: &Path,
    ) -> SyncResult<String> {
        let bytes = tokio::fs::read(file).await?;
        let mut state = self.state();
        let key = format!("{device_id}/{image_type}");
        state
            .images
            .insert((device_id.to_string(), image_type), (key.clone(), bytes));
        state.uploaded_images.push((device_id.to_string(), image_type));
        Ok(key)
    }

    async fn get_reference_image_info(
        &self,
        device_id: &str,
        image_type: ReferenceImageType,
    ) -> SyncResult<Option<RemoteReferenceImage>> {
        use sha2::{Digest, Sha256};
        Ok(self
            .state()
            .images
            .get(&(device_id.to_string(), image_type))
            .map(|(key, bytes)| RemoteReferenceImage {
                file_key: key.clone(),
                sha256: Some(hex::encode(Sha256::digest(bytes))),
            }))
    }

    async fn download_reference_image(
        &self,
        device_id: &str,
        image_type: ReferenceImageType,
    ) -> SyncResult<Vec<u8>> {
        self.state()
            .images
            .get(&(device_id.to_string(), image_type))
            .map(|(_, bytes)| bytes.clone())
            .ok_or_else(|| SyncError::NotFound(format!("{device_id} {image_type}")))
    }

    async fn delete_reference_image(
        &self,
        device_id: &str,
        image_type: ReferenceImageType,
    ) -> SyncResult<()> {
        let mut state = self.state();
        if let Some(failure) = state.image_delete_failure {
            return Err(failure.error());
        }
        state.images.remove(&(device_id.to_string(), image_type));
        state.deleted_images.push((device_id.to_string(), image_type));
        Ok(())
    }

    async fn create_station(&self, group: &str, name: &str, coords: Coords) -> SyncResult<String> {
        let mut state = self.state();
        if let Some(failure) = state.station_failure {
            return Err(failure.error());
        }
        state.next_id += 1;
        let id = format!("s{}", state.next_id);
        state
            .created_stations
            .push((group.to_string(), name.to_string()));
        state
            .stations
            .entry(group.to_string())
            .or_default()
            .push(RemoteStation {
                id: id.clone(),
                name: name.to_string(),
                coords,
            });
        Ok(id)
    }

    async fn rename_station(&self, station_id: &str, name: &str) -> SyncResult<()> {
        let mut state = self.state();
        if let Some(failure) = state.station_failure {
            return Err(failure.error());
        }
        state
            .renamed_stations
            .push((station_id.to_string(), name.to_string()));
        for station in state.stations.values_mut().flatten() {
            if station.id == station_id {
                station.name = name.to_string();
            }
        }
        Ok(())
    }

    async fn list_stations(&self, group: &str) -> SyncResult<Vec<RemoteStation>> {
        Ok(self.state().stations.get(group).cloned().unwrap_or_default())
    }

    async fn user_has_group_access(&self, group: &str) -> SyncResult<bool> {
        Ok(!self.state().denied_groups.contains(group))
    }

    async fn update_device_settings(
        &self,
        _device_id: &str,
        _settings: &serde_json::Value,
    ) -> SyncResult<()> {
        Ok(())
    }

    async fn end_user_agreement_version(&self) -> SyncResult<u32> {
        Ok(3)
    }

    async fn is_reachable(&self) -> bool {
        !self.state().unreachable
    }
}
