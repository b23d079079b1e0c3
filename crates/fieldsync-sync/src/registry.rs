//! # Device Registry
//!
//! Authoritative in-memory map of known units and their connection state.
//!
//! ## Observable Store
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        DeviceRegistry                                   │
//! │                                                                         │
//! │   devices: HashMap<id, Device>        version: watch<u64>               │
//! │        ▲                                   │                            │
//! │        │ upsert / mark_disconnected /      │ bumped on every mutation   │
//! │        │ prune                             ▼                            │
//! │   DiscoveryController               subscribers (AP state machine,      │
//! │                                     agent status, UI bridge)            │
//! │                                                                         │
//! │  RECONNECT DEDUP:                                                      │
//! │  A unit that re-registers gets a new backend id but keeps its          │
//! │  hardware id. On upsert, any entry with the same hardware id under a   │
//! │  different id is removed first, so at most one entry per physical      │
//! │  unit survives.                                                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, RwLock};
use tracing::{debug, info};

use fieldsync_core::{ConnectionState, Device};

/// Default idle window before a disconnected entry is pruned.
pub const DEFAULT_PRUNE_IDLE: Duration = Duration::from_secs(60);

/// Shared registry of known units. Cheap to clone.
#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    devices: Arc<RwLock<HashMap<String, Device>>>,
    version: Arc<watch::Sender<u64>>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0u64);
        DeviceRegistry {
            devices: Arc::new(RwLock::new(HashMap::new())),
            version: Arc::new(version),
        }
    }

    /// Inserts or replaces a device.
    ///
    /// Returns true if the id was not present before.
    pub async fn upsert(&self, device: Device) -> bool {
        let mut devices = self.devices.write().await;

        if let Some(hardware_id) = device.hardware_id.as_deref() {
            let stale: Vec<String> = devices
                .values()
                .filter(|d| d.id != device.id && d.hardware_id.as_deref() == Some(hardware_id))
                .map(|d| d.id.clone())
                .collect();

            for old_id in stale {
                devices.remove(&old_id);
                info!(
                    old_id = %old_id,
                    new_id = %device.id,
                    hardware_id = %hardware_id,
                    "Unit re-registered under a new id"
                );
            }
        }

        let id = device.id.clone();
        let is_new = devices.insert(id.clone(), device).is_none();
        drop(devices);

        debug!(device_id = %id, is_new, "Registry upsert");
        self.bump();
        is_new
    }

    /// Flags a device as disconnected and restarts its idle clock.
    ///
    /// Returns false if the id is unknown or already disconnected.
    pub async fn mark_disconnected(&self, id: &str) -> bool {
        let changed = {
            let mut devices = self.devices.write().await;
            match devices.get_mut(id) {
                Some(device) if device.connection_state == ConnectionState::Connected => {
                    device.connection_state = ConnectionState::Disconnected;
                    device.last_seen_at = Utc::now();
                    true
                }
                _ => false,
            }
        };

        if changed {
            info!(device_id = %id, "Unit disconnected");
            self.bump();
        }
        changed
    }

    /// Refreshes `last_seen_at` and the battery reading of a connected unit.
    pub async fn touch(&self, id: &str, battery_percent: Option<f64>) {
        let mut devices = self.devices.write().await;
        if let Some(device) = devices.get_mut(id) {
            device.last_seen_at = Utc::now();
            if battery_percent.is_some() {
                device.battery_percent = battery_percent;
            }
        }
    }

    pub async fn get(&self, id: &str) -> Option<Device> {
        self.devices.read().await.get(id).cloned()
    }

    pub async fn find_by_hardware_id(&self, hardware_id: &str) -> Option<Device> {
        self.devices
            .read()
            .await
            .values()
            .find(|d| d.hardware_id.as_deref() == Some(hardware_id))
            .cloned()
    }

    /// Finds the device announced at a discovery endpoint.
    pub async fn find_by_endpoint(&self, endpoint: &str) -> Option<Device> {
        self.devices
            .read()
            .await
            .values()
            .find(|d| d.endpoint == endpoint)
            .cloned()
    }

    /// Every device, sorted by id.
    pub async fn snapshot(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.devices.read().await.values().cloned().collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    /// Connected devices, sorted by id.
    pub async fn connected(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self
            .devices
            .read()
            .await
            .values()
            .filter(|d| d.is_connected())
            .cloned()
            .collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.devices.read().await.is_empty()
    }

    /// Removes disconnected entries idle for longer than `max_idle`.
    pub async fn prune(&self, max_idle: Duration) -> usize {
        self.prune_at(max_idle, Utc::now()).await
    }

    /// [`prune`](Self::prune) against an explicit clock.
    pub async fn prune_at(&self, max_idle: Duration, now: DateTime<Utc>) -> usize {
        let max_idle =
            chrono::Duration::from_std(max_idle).unwrap_or_else(|_| chrono::Duration::days(365));

        let removed = {
            let mut devices = self.devices.write().await;
            let before = devices.len();
            devices.retain(|_, d| d.is_connected() || now - d.last_seen_at <= max_idle);
            before - devices.len()
        };

        if removed > 0 {
            debug!(removed, "Pruned idle disconnected units");
            self.bump();
        }
        removed
    }

    /// Current version. Bumped after every mutation.
    pub fn version(&self) -> u64 {
        *self.version.borrow()
    }

    /// Subscribes to version bumps.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v += 1);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use fieldsync_core::Capabilities;

    pub(crate) fn device(id: &str, hardware_id: Option<&str>, endpoint: &str) -> Device {
        Device {
            id: id.into(),
            hardware_id: hardware_id.map(String::from),
            host: "192.168.4.1".into(),
            name: format!("unit-{id}"),
            group: "kea-watch".into(),
            is_prod_environment: true,
            connection_state: ConnectionState::Connected,
            endpoint: endpoint.into(),
            url: "http://192.168.4.1".into(),
            capabilities: Capabilities::default(),
            last_seen_at: Utc::now(),
            battery_percent: None,
        }
    }

    #[tokio::test]
    async fn test_reregistration_keeps_one_entry() {
        let registry = DeviceRegistry::new();

        registry.upsert(device("100", Some("h1"), "E1")).await;
        registry.upsert(device("101", Some("h1"), "E1")).await;

        let all = registry.snapshot().await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, "101");
        assert!(all[0].is_connected());
        assert_eq!(registry.find_by_hardware_id("h1").await.unwrap().id, "101");
    }

    #[tokio::test]
    async fn test_same_hardware_id_many_upserts() {
        let registry = DeviceRegistry::new();

        for id in ["1", "2", "3", "2", "4"] {
            registry.upsert(device(id, Some("h9"), "E9")).await;
        }
        registry.upsert(device("50", Some("other"), "E2")).await;

        assert_eq!(registry.len().await, 2);
        assert_eq!(registry.find_by_hardware_id("h9").await.unwrap().id, "4");
    }

    #[tokio::test]
    async fn test_devices_without_hardware_id_are_not_merged() {
        let registry = DeviceRegistry::new();

        registry.upsert(device("1", None, "E1")).await;
        registry.upsert(device("2", None, "E2")).await;
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn test_mark_disconnected_and_prune() {
        let registry = DeviceRegistry::new();
        registry.upsert(device("100", Some("h1"), "E1")).await;
        registry.upsert(device("200", Some("h2"), "E2")).await;

        assert!(registry.mark_disconnected("100").await);
        assert!(!registry.mark_disconnected("100").await);
        assert!(!registry.mark_disconnected("missing").await);
        assert_eq!(registry.connected().await.len(), 1);

        // Within the idle window nothing goes.
        let soon = Utc::now() + chrono::Duration::seconds(30);
        assert_eq!(registry.prune_at(DEFAULT_PRUNE_IDLE, soon).await, 0);

        let later = Utc::now() + chrono::Duration::seconds(61);
        assert_eq!(registry.prune_at(DEFAULT_PRUNE_IDLE, later).await, 1);

        // Connected entries are never pruned.
        let remaining = registry.snapshot().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "200");
    }

    #[tokio::test]
    async fn test_version_bumps_and_notifies() {
        let registry = DeviceRegistry::new();
        let mut rx = registry.subscribe();
        assert_eq!(registry.version(), 0);

        registry.upsert(device("100", None, "E1")).await;
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), 1);

        registry.mark_disconnected("100").await;
        assert_eq!(registry.version(), 2);
    }

    #[tokio::test]
    async fn test_find_by_endpoint() {
        let registry = DeviceRegistry::new();
        registry.upsert(device("100", None, "tc-100._http._tcp")).await;

        assert_eq!(
            registry.find_by_endpoint("tc-100._http._tcp").await.unwrap().id,
            "100"
        );
        assert!(registry.find_by_endpoint("nope").await.is_none());
    }
}
