//! # Device Diagnostics
//!
//! Read-mostly view of a connected unit's network and power state for the
//! controlling app. Readings go through the [`DiagnosticCache`]; writes go
//! straight to the unit and invalidate the readings they change.
//!
//! | Reading            | TTL setting              | Invalidated by           |
//! |--------------------|--------------------------|--------------------------|
//! | wifi networks      | `cache.network_ttl_secs` | save / forget network    |
//! | current wifi       | `cache.network_ttl_secs` | save / forget network    |
//! | modem status       | `cache.network_ttl_secs` |                          |
//! | internet reachable | `cache.internet_ttl_secs`| save / forget network    |
//! | battery            | `cache.network_ttl_secs` |                          |
//!
//! Failed reads log and return an empty value.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use fieldsync_core::{BatteryCurve, Device};

use crate::cache::{DiagnosticCache, DiagnosticKey};
use crate::config::CacheSettings;
use crate::error::SyncResult;
use crate::prober::CapabilityProber;
use crate::unit::{UnitApi, WifiNetwork};

/// Diagnostics facade over one [`UnitApi`].
#[derive(Clone)]
pub struct DeviceDiagnostics {
    unit: Arc<dyn UnitApi>,
    cache: DiagnosticCache,
    prober: CapabilityProber,
    battery_curve: BatteryCurve,
    network_ttl: Duration,
    internet_ttl: Duration,
}

impl DeviceDiagnostics {
    pub fn new(
        unit: Arc<dyn UnitApi>,
        cache: DiagnosticCache,
        prober: CapabilityProber,
        settings: &CacheSettings,
    ) -> Self {
        DeviceDiagnostics {
            unit,
            cache,
            prober,
            battery_curve: BatteryCurve::lithium_pack(),
            network_ttl: Duration::from_secs(settings.network_ttl_secs),
            internet_ttl: Duration::from_secs(settings.internet_ttl_secs),
        }
    }

    pub async fn wifi_networks(&self, device: &Device) -> Vec<WifiNetwork> {
        let unit = self.unit.clone();
        let url = device.url.clone();
        let result = self
            .cache
            .get(&device.id, DiagnosticKey::WifiNetworks, self.network_ttl, || async move {
                unit.get_wifi_networks(&url).await
            })
            .await;
        Self::or_default(result, device, "wifi networks")
    }

    pub async fn current_wifi(&self, device: &Device) -> Option<String> {
        let unit = self.unit.clone();
        let url = device.url.clone();
        let result = self
            .cache
            .get(&device.id, DiagnosticKey::CurrentWifi, self.network_ttl, || async move {
                unit.get_current_wifi(&url).await
            })
            .await;
        Self::or_default(result, device, "current wifi")
    }

    pub async fn modem_status(&self, device: &Device) -> Option<serde_json::Value> {
        let unit = self.unit.clone();
        let url = device.url.clone();
        let result = self
            .cache
            .get(&device.id, DiagnosticKey::ModemStatus, self.network_ttl, || async move {
                unit.get_modem_status(&url).await
            })
            .await;
        Self::or_default(result, device, "modem status")
    }

    /// Whether the unit itself can reach the internet.
    pub async fn internet_reachable(&self, device: &Device) -> bool {
        let unit = self.unit.clone();
        let url = device.url.clone();
        let result = self
            .cache
            .get(
                &device.id,
                DiagnosticKey::InternetReachable,
                self.internet_ttl,
                || async move { unit.check_internet(&url).await },
            )
            .await;
        Self::or_default(result, device, "internet check")
    }

    /// Battery level in percent, interpolated from the reported voltage.
    pub async fn battery_percent(&self, device: &Device) -> Option<f64> {
        let unit = self.unit.clone();
        let url = device.url.clone();
        let result = self
            .cache
            .get(&device.id, DiagnosticKey::Battery, self.network_ttl, || async move {
                unit.get_battery_voltage(&url).await
            })
            .await;
        let voltage: Option<f64> = Self::or_default(result, device, "battery");
        voltage.map(|v| self.battery_curve.percent(v))
    }

    pub async fn save_wifi_network(&self, device: &Device, ssid: &str, password: &str) -> SyncResult<()> {
        self.unit.save_wifi_network(&device.url, ssid, password).await?;
        info!(device_id = %device.id, ssid, "Saved wifi network on unit");
        self.invalidate_network(&device.id).await;
        Ok(())
    }

    pub async fn forget_wifi_network(&self, device: &Device, ssid: &str) -> SyncResult<()> {
        self.unit.forget_wifi_network(&device.url, ssid).await?;
        info!(device_id = %device.id, ssid, "Forgot wifi network on unit");
        self.invalidate_network(&device.id).await;
        Ok(())
    }

    /// Switches the audio mode and drops cached capabilities.
    pub async fn set_audio_mode(&self, device: &Device, mode: &str) -> SyncResult<()> {
        self.unit.set_audio_mode(&device.url, mode).await?;
        self.prober.invalidate(&device.id).await;
        Ok(())
    }

    pub async fn audio_mode(&self, device: &Device) -> Option<String> {
        Self::or_default(self.unit.get_audio_mode(&device.url).await, device, "audio mode")
    }

    pub async fn take_test_recording(&self, device: &Device) -> SyncResult<()> {
        self.unit.take_test_recording(&device.url).await
    }

    pub async fn device_config(&self, device: &Device) -> Option<serde_json::Value> {
        let unit = self.unit.clone();
        let url = device.url.clone();
        let result = self
            .cache
            .get(&device.id, DiagnosticKey::DeviceConfig, self.network_ttl, || async move {
                unit.get_device_config(&url).await
            })
            .await;
        Self::or_default(result, device, "device config")
    }

    pub async fn set_device_config(
        &self,
        device: &Device,
        section: &str,
        values: &serde_json::Value,
    ) -> SyncResult<()> {
        self.unit.set_device_config(&device.url, section, values).await?;
        self.cache.invalidate(&device.id, DiagnosticKey::DeviceConfig).await;
        Ok(())
    }

    /// Warms the network readings on a spawned task.
    pub fn refresh_in_background(&self, device: &Device) {
        let unit = self.unit.clone();
        let url = device.url.clone();
        self.cache
            .refresh_in_background(&device.id, DiagnosticKey::WifiNetworks, move || async move {
                unit.get_wifi_networks(&url).await
            });

        let unit = self.unit.clone();
        let url = device.url.clone();
        self.cache
            .refresh_in_background(&device.id, DiagnosticKey::ModemStatus, move || async move {
                unit.get_modem_status(&url).await
            });
    }

    async fn invalidate_network(&self, device_id: &str) {
        for key in [
            DiagnosticKey::WifiNetworks,
            DiagnosticKey::CurrentWifi,
            DiagnosticKey::InternetReachable,
        ] {
            self.cache.invalidate(device_id, key).await;
        }
    }

    fn or_default<T: Default>(result: SyncResult<T>, device: &Device, what: &str) -> T {
        result.unwrap_or_else(|e| {
            warn!(device_id = %device.id, what, error = %e, "Diagnostic read failed");
            T::default()
        })
    }
}
