//! # Unit API
//!
//! HTTP client for the management API every field unit serves on its
//! local interface. All calls take the unit's base URL, because the same
//! unit may answer on its mDNS name and on its raw address.
//!
//! ## Request Shape
//! ```text
//! ┌──────────────┐   Basic Auth, short timeouts   ┌──────────────────────┐
//! │ HttpUnitClient│ ─────────────────────────────► │ unit: /api/*         │
//! │              │                                 │                      │
//! │  status map: │ ◄───────────────────────────── │ JSON or file bytes   │
//! │  401 auth    │                                 └──────────────────────┘
//! │  404 missing │
//! │  other ≠2xx  │   body truncated to 200 chars in the error
//! └──────────────┘
//! ```
//!
//! Read endpoints are lenient: a body that does not parse is logged and
//! treated as absent data instead of failing the whole sync pass.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use fieldsync_core::Coords;

use crate::config::UnitSettings;
use crate::error::{truncate_body, SyncError, SyncResult};

// =============================================================================
// Wire Types
// =============================================================================

/// Identity reported by `/api/device-info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitInfo {
    pub id: String,
    pub hardware_id: Option<String>,
    pub name: String,
    pub group: String,
    /// Backend the unit is registered against.
    pub server_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawUnitInfo {
    #[serde(rename = "deviceID", alias = "id")]
    device_id: serde_json::Value,
    #[serde(rename = "saltID", alias = "hardwareID", default)]
    salt_id: Option<serde_json::Value>,
    #[serde(rename = "devicename", alias = "name", default)]
    name: String,
    #[serde(rename = "groupname", alias = "group", default)]
    group: String,
    #[serde(rename = "serverURL", default)]
    server_url: Option<String>,
}

fn value_to_id(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl TryFrom<RawUnitInfo> for UnitInfo {
    type Error = SyncError;

    fn try_from(raw: RawUnitInfo) -> Result<Self, Self::Error> {
        let id = value_to_id(&raw.device_id)
            .ok_or_else(|| SyncError::InvalidResponse("device-info without a device id".into()))?;

        Ok(UnitInfo {
            id,
            hardware_id: raw.salt_id.as_ref().and_then(value_to_id),
            name: raw.name,
            group: raw.group,
            server_url: raw.server_url.filter(|u| !u.is_empty()),
        })
    }
}

/// One diagnostic event as returned by the unit.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitEvent {
    pub key: String,
    pub event_type: String,
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct RawEventEntry {
    #[serde(default = "default_true")]
    success: bool,
    event: Option<RawEvent>,
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "Type")]
    event_type: String,
    #[serde(rename = "Details", default)]
    details: serde_json::Value,
    #[serde(rename = "Timestamp")]
    timestamp: String,
}

fn default_true() -> bool {
    true
}

/// GPS fix stored on the unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitLocation {
    #[serde(rename = "latitude")]
    pub lat: f64,
    #[serde(rename = "longitude")]
    pub lng: f64,
    #[serde(default)]
    pub altitude: Option<f64>,
    #[serde(default)]
    pub accuracy: Option<f64>,
}

impl UnitLocation {
    pub fn coords(&self) -> Coords {
        Coords::new(self.lat, self.lng)
    }

    /// Units report 0,0 when no fix has ever been stored.
    pub fn is_unset(&self) -> bool {
        self.lat == 0.0 && self.lng == 0.0
    }
}

/// A wifi network visible to, or saved on, the unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WifiNetwork {
    #[serde(rename = "SSID", alias = "ssid")]
    pub ssid: String,
    #[serde(rename = "Quality", alias = "quality", default)]
    pub quality: Option<i64>,
    #[serde(rename = "Security", alias = "security", default)]
    pub security: Option<String>,
}

/// Software update progress reported by the unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateStatus {
    #[serde(rename = "RunningUpdate", default)]
    pub running_update: bool,
    #[serde(rename = "UpdateProgressPercentage", default)]
    pub progress_percent: Option<f64>,
    #[serde(rename = "UpdateProgressStr", default)]
    pub progress_text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BatteryBody {
    #[serde(rename = "mainBattery", alias = "voltage")]
    main_battery: f64,
}

#[derive(Debug, Deserialize)]
struct AudioModeBody {
    #[serde(alias = "audioMode")]
    mode: String,
}

#[derive(Debug, Deserialize)]
struct CurrentWifiBody {
    #[serde(rename = "SSID", alias = "ssid", default)]
    ssid: Option<String>,
}

// =============================================================================
// Unit API Trait
// =============================================================================

/// Management API exposed by a field unit.
#[async_trait]
pub trait UnitApi: Send + Sync {
    async fn get_device_info(&self, base_url: &str) -> SyncResult<UnitInfo>;

    /// Arbitrary config sections as JSON.
    async fn get_device_config(&self, base_url: &str) -> SyncResult<Option<serde_json::Value>>;
    async fn set_device_config(
        &self,
        base_url: &str,
        section: &str,
        values: &serde_json::Value,
    ) -> SyncResult<()>;

    /// Names of recordings stored on the unit.
    async fn get_recordings(&self, base_url: &str) -> SyncResult<Vec<String>>;
    /// Streams a recording into `dest`. Returns the byte count.
    async fn download_recording(&self, base_url: &str, name: &str, dest: &Path) -> SyncResult<u64>;
    async fn delete_recording(&self, base_url: &str, name: &str) -> SyncResult<()>;

    async fn get_event_keys(&self, base_url: &str) -> SyncResult<Vec<String>>;
    async fn get_events(&self, base_url: &str, keys: &[String]) -> SyncResult<Vec<UnitEvent>>;
    async fn delete_events(&self, base_url: &str, keys: &[String]) -> SyncResult<()>;

    async fn get_location(&self, base_url: &str) -> SyncResult<Option<UnitLocation>>;
    async fn set_location(&self, base_url: &str, location: &UnitLocation) -> SyncResult<()>;

    async fn get_wifi_networks(&self, base_url: &str) -> SyncResult<Vec<WifiNetwork>>;
    async fn get_current_wifi(&self, base_url: &str) -> SyncResult<Option<String>>;
    async fn save_wifi_network(&self, base_url: &str, ssid: &str, password: &str) -> SyncResult<()>;
    async fn forget_wifi_network(&self, base_url: &str, ssid: &str) -> SyncResult<()>;
    async fn check_internet(&self, base_url: &str) -> SyncResult<bool>;

    async fn get_modem_status(&self, base_url: &str) -> SyncResult<Option<serde_json::Value>>;
    /// Main battery voltage, if the unit has a battery monitor.
    async fn get_battery_voltage(&self, base_url: &str) -> SyncResult<Option<f64>>;

    async fn get_audio_mode(&self, base_url: &str) -> SyncResult<Option<String>>;
    async fn set_audio_mode(&self, base_url: &str, mode: &str) -> SyncResult<()>;
    async fn take_test_recording(&self, base_url: &str) -> SyncResult<()>;

    async fn trigger_update(&self, base_url: &str) -> SyncResult<()>;
    async fn get_update_status(&self, base_url: &str) -> SyncResult<Option<UpdateStatus>>;

    /// Returns true if `path` answers 2xx, false on 404.
    async fn probe(&self, base_url: &str, path: &str) -> SyncResult<bool>;
}

// =============================================================================
// HTTP Implementation
// =============================================================================

/// reqwest-backed [`UnitApi`].
#[derive(Debug, Clone)]
pub struct HttpUnitClient {
    http: reqwest::Client,
    username: String,
    password: String,
    download_timeout: Duration,
}

impl HttpUnitClient {
    pub fn new(settings: &UnitSettings) -> SyncResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .map_err(|e| SyncError::InvalidConfig(format!("unit HTTP client: {e}")))?;

        Ok(HttpUnitClient {
            http,
            username: settings.username.clone(),
            password: settings.password.clone(),
            download_timeout: Duration::from_secs(settings.download_timeout_secs),
        })
    }

    fn url(base_url: &str, path: &str) -> String {
        format!("{}{}", base_url.trim_end_matches('/'), path)
    }

    fn get(&self, base_url: &str, path: &str) -> reqwest::RequestBuilder {
        let url = Self::url(base_url, path);
        debug!("GET {}", url);
        self.http
            .get(url)
            .basic_auth(&self.username, Some(&self.password))
    }

    fn post(&self, base_url: &str, path: &str) -> reqwest::RequestBuilder {
        let url = Self::url(base_url, path);
        debug!("POST {}", url);
        self.http
            .post(url)
            .basic_auth(&self.username, Some(&self.password))
    }

    fn delete(&self, base_url: &str, path: &str) -> reqwest::RequestBuilder {
        let url = Self::url(base_url, path);
        debug!("DELETE {}", url);
        self.http
            .delete(url)
            .basic_auth(&self.username, Some(&self.password))
    }

    /// Maps non-success statuses to errors.
    async fn check(resp: reqwest::Response, what: &str) -> SyncResult<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        match status {
            reqwest::StatusCode::UNAUTHORIZED => Err(SyncError::AuthFailed(format!(
                "unit rejected credentials for {what}"
            ))),
            reqwest::StatusCode::NOT_FOUND => Err(SyncError::NotFound(what.to_string())),
            _ => {
                let body = resp.text().await.unwrap_or_default();
                Err(SyncError::UnexpectedStatus {
                    status: status.as_u16(),
                    message: truncate_body(&body),
                })
            }
        }
    }

    async fn send(&self, req: reqwest::RequestBuilder, what: &str) -> SyncResult<reqwest::Response> {
        let resp = req.send().await?;
        Self::check(resp, what).await
    }

    /// Parses a JSON body, logging and returning `None` on malformed input.
    async fn lenient<T: DeserializeOwned>(resp: reqwest::Response, what: &str) -> Option<T> {
        let body = match resp.text().await {
            Ok(body) => body,
            Err(e) => {
                warn!(what, error = %e, "Failed to read unit response");
                return None;
            }
        };

        match serde_json::from_str(&body) {
            Ok(value) => Some(value),
            Err(e) => {
                let preview = truncate_body(&body);
                warn!(what, error = %e, body = %preview, "Malformed unit response, treating as absent");
                None
            }
        }
    }

    fn keys_form(keys: &[String]) -> SyncResult<[(&'static str, String); 1]> {
        let numeric: Vec<serde_json::Value> = keys
            .iter()
            .map(|k| match k.parse::<u64>() {
                Ok(n) => serde_json::Value::from(n),
                Err(_) => serde_json::Value::from(k.as_str()),
            })
            .collect();
        Ok([("keys", serde_json::to_string(&numeric)?)])
    }
}

#[async_trait]
impl UnitApi for HttpUnitClient {
    async fn get_device_info(&self, base_url: &str) -> SyncResult<UnitInfo> {
        let resp = self
            .send(self.get(base_url, "/api/device-info"), "device-info")
            .await?;
        let raw: RawUnitInfo = resp.json().await?;
        raw.try_into()
    }

    async fn get_device_config(&self, base_url: &str) -> SyncResult<Option<serde_json::Value>> {
        let resp = self.send(self.get(base_url, "/api/config"), "config").await?;
        Ok(Self::lenient(resp, "config").await)
    }

    async fn set_device_config(
        &self,
        base_url: &str,
        section: &str,
        values: &serde_json::Value,
    ) -> SyncResult<()> {
        let form = [("section", section.to_string()), ("config", values.to_string())];
        self.send(self.post(base_url, "/api/config").form(&form), "config")
            .await?;
        Ok(())
    }

    async fn get_recordings(&self, base_url: &str) -> SyncResult<Vec<String>> {
        let resp = self
            .send(self.get(base_url, "/api/recordings"), "recordings")
            .await?;
        Ok(Self::lenient(resp, "recordings").await.unwrap_or_default())
    }

    async fn download_recording(&self, base_url: &str, name: &str, dest: &Path) -> SyncResult<u64> {
        let req = self
            .get(base_url, &format!("/api/recording/{name}"))
            .timeout(self.download_timeout);
        let mut resp = self.send(req, name).await?;

        let mut file = tokio::fs::File::create(dest).await?;
        let mut written: u64 = 0;
        while let Some(chunk) = resp.chunk().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        debug!(name, bytes = written, "Recording downloaded");
        Ok(written)
    }

    async fn delete_recording(&self, base_url: &str, name: &str) -> SyncResult<()> {
        self.send(self.delete(base_url, &format!("/api/recording/{name}")), name)
            .await?;
        Ok(())
    }

    async fn get_event_keys(&self, base_url: &str) -> SyncResult<Vec<String>> {
        let resp = self
            .send(self.get(base_url, "/api/event-keys"), "event-keys")
            .await?;
        let keys: Vec<serde_json::Value> =
            Self::lenient(resp, "event-keys").await.unwrap_or_default();
        Ok(keys.iter().filter_map(value_to_id).collect())
    }

    async fn get_events(&self, base_url: &str, keys: &[String]) -> SyncResult<Vec<UnitEvent>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let form = Self::keys_form(keys)?;
        let resp = self
            .send(self.post(base_url, "/api/events").form(&form), "events")
            .await?;
        let entries: HashMap<String, RawEventEntry> =
            Self::lenient(resp, "events").await.unwrap_or_default();

        let mut events = Vec::with_capacity(entries.len());
        for (key, entry) in entries {
            let Some(raw) = entry.event.filter(|_| entry.success) else {
                debug!(key = %key, "Unit could not return event");
                continue;
            };

            match DateTime::parse_from_rfc3339(&raw.timestamp) {
                Ok(ts) => events.push(UnitEvent {
                    key,
                    event_type: raw.event_type,
                    details: raw.details,
                    timestamp: ts.with_timezone(&Utc),
                }),
                Err(e) => warn!(key = %key, error = %e, "Skipping event with bad timestamp"),
            }
        }

        events.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.key.cmp(&b.key)));
        Ok(events)
    }

    async fn delete_events(&self, base_url: &str, keys: &[String]) -> SyncResult<()> {
        if keys.is_empty() {
            return Ok(());
        }

        let form = Self::keys_form(keys)?;
        self.send(self.delete(base_url, "/api/events").form(&form), "events")
            .await?;
        Ok(())
    }

    async fn get_location(&self, base_url: &str) -> SyncResult<Option<UnitLocation>> {
        let resp = match self.send(self.get(base_url, "/api/location"), "location").await {
            Ok(resp) => resp,
            Err(SyncError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        let location: Option<UnitLocation> = Self::lenient(resp, "location").await;
        Ok(location.filter(|l| !l.is_unset()))
    }

    async fn set_location(&self, base_url: &str, location: &UnitLocation) -> SyncResult<()> {
        let form = [
            ("latitude", location.lat.to_string()),
            ("longitude", location.lng.to_string()),
            ("altitude", location.altitude.unwrap_or(0.0).to_string()),
            ("accuracy", location.accuracy.unwrap_or(0.0).to_string()),
            ("timestamp", Utc::now().timestamp_millis().to_string()),
        ];
        self.send(self.post(base_url, "/api/location").form(&form), "location")
            .await?;
        Ok(())
    }

    async fn get_wifi_networks(&self, base_url: &str) -> SyncResult<Vec<WifiNetwork>> {
        let resp = self
            .send(self.get(base_url, "/api/network/wifi"), "wifi")
            .await?;
        Ok(Self::lenient(resp, "wifi").await.unwrap_or_default())
    }

    async fn get_current_wifi(&self, base_url: &str) -> SyncResult<Option<String>> {
        let resp = self
            .send(self.get(base_url, "/api/network/wifi/current"), "current-wifi")
            .await?;
        let body: Option<CurrentWifiBody> = Self::lenient(resp, "current-wifi").await;
        Ok(body.and_then(|b| b.ssid).filter(|s| !s.is_empty()))
    }

    async fn save_wifi_network(&self, base_url: &str, ssid: &str, password: &str) -> SyncResult<()> {
        let form = [("ssid", ssid), ("password", password)];
        self.send(
            self.post(base_url, "/api/network/wifi/save").form(&form),
            "wifi-save",
        )
        .await?;
        Ok(())
    }

    async fn forget_wifi_network(&self, base_url: &str, ssid: &str) -> SyncResult<()> {
        let form = [("ssid", ssid)];
        self.send(
            self.post(base_url, "/api/network/wifi/forget").form(&form),
            "wifi-forget",
        )
        .await?;
        Ok(())
    }

    async fn check_internet(&self, base_url: &str) -> SyncResult<bool> {
        let resp = self
            .get(base_url, "/api/network/internet")
            .send()
            .await?;
        Ok(resp.status().is_success())
    }

    async fn get_modem_status(&self, base_url: &str) -> SyncResult<Option<serde_json::Value>> {
        match self.send(self.get(base_url, "/api/modem"), "modem").await {
            Ok(resp) => Ok(Self::lenient(resp, "modem").await),
            Err(SyncError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn get_battery_voltage(&self, base_url: &str) -> SyncResult<Option<f64>> {
        match self.send(self.get(base_url, "/api/battery"), "battery").await {
            Ok(resp) => {
                let body: Option<BatteryBody> = Self::lenient(resp, "battery").await;
                Ok(body.map(|b| b.main_battery).filter(|v| v.is_finite() && *v > 0.0))
            }
            Err(SyncError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn get_audio_mode(&self, base_url: &str) -> SyncResult<Option<String>> {
        match self
            .send(self.get(base_url, "/api/audio/audio-mode"), "audio-mode")
            .await
        {
            Ok(resp) => {
                let body: Option<AudioModeBody> = Self::lenient(resp, "audio-mode").await;
                Ok(body.map(|b| b.mode))
            }
            Err(SyncError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn set_audio_mode(&self, base_url: &str, mode: &str) -> SyncResult<()> {
        let form = [("audio-mode", mode)];
        self.send(
            self.post(base_url, "/api/audio/audio-mode").form(&form),
            "audio-mode",
        )
        .await?;
        Ok(())
    }

    async fn take_test_recording(&self, base_url: &str) -> SyncResult<()> {
        self.send(
            self.post(base_url, "/api/camera/test-recording"),
            "test-recording",
        )
        .await?;
        Ok(())
    }

    async fn trigger_update(&self, base_url: &str) -> SyncResult<()> {
        self.send(self.post(base_url, "/api/salt-update"), "salt-update")
            .await?;
        Ok(())
    }

    async fn get_update_status(&self, base_url: &str) -> SyncResult<Option<UpdateStatus>> {
        let resp = self
            .send(self.get(base_url, "/api/salt-update"), "salt-update")
            .await?;
        Ok(Self::lenient(resp, "salt-update").await)
    }

    async fn probe(&self, base_url: &str, path: &str) -> SyncResult<bool> {
        match self.send(self.get(base_url, path), path).await {
            Ok(_) => Ok(true),
            Err(SyncError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
