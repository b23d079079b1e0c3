//! # Backend API
//!
//! Client for the cloud backend that ingests recordings and events and
//! owns stations and reference images.
//!
//! ## Response Handling
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Backend Status → SyncError                           │
//! │                                                                         │
//! │   401 ──► AuthFailed        404 ──► NotFound       5xx ──► ServerError  │
//! │   403 ──► Forbidden         422 ──► Unprocessable  other ──► Unexpected │
//! │                                                                         │
//! │   2xx ──► { success, messages[], ... }                                  │
//! │              success = false ──► Rejected(messages)                     │
//! │                                                                         │
//! │   Forbidden is narrowed to NeedsGroupAccess by the sync engine, which  │
//! │   knows which group the request touched.                               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use fieldsync_core::{Coords, EventGroup, Recording, ReferenceImageType};

use crate::error::{truncate_body, SyncError, SyncResult};
use crate::session::SessionProvider;

// =============================================================================
// Wire Types
// =============================================================================

/// A station as the backend knows it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteStation {
    pub id: String,
    pub name: String,
    pub coords: Coords,
}

/// Metadata of the backend's copy of a reference image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteReferenceImage {
    pub file_key: String,
    /// Hex SHA-256 of the file, when the backend reports one.
    pub sha256: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default = "default_success")]
    success: bool,
    #[serde(default)]
    messages: Vec<String>,
}

fn default_success() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadBody {
    #[serde(default)]
    recording_id: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileKeyBody {
    #[serde(alias = "key")]
    file_key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageInfoBody {
    file_key: Option<String>,
    #[serde(default)]
    sha256: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StationIdBody {
    station_id: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct RawStation {
    id: serde_json::Value,
    name: String,
    location: RawPoint,
}

#[derive(Debug, Deserialize)]
struct RawPoint {
    lat: f64,
    lng: f64,
}

#[derive(Debug, Deserialize)]
struct StationsBody {
    #[serde(default)]
    stations: Vec<RawStation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EuaBody {
    eua_version: u32,
}

fn id_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// =============================================================================
// Backend API Trait
// =============================================================================

/// Operations the sync engine needs from the backend.
#[async_trait]
pub trait BackendApi: Send + Sync {
    /// Returns the backend's recording id, if it reports one.
    async fn upload_recording(&self, recording: &Recording, file: &Path) -> SyncResult<Option<String>>;

    async fn upload_event_group(&self, device_id: &str, group: &EventGroup) -> SyncResult<()>;

    /// Returns the file key the backend stored the image under.
    async fn upload_reference_image(
        &self,
        device_id: &str,
        image_type: ReferenceImageType,
        file: &Path,
    ) -> SyncResult<String>;
    async fn get_reference_image_info(
        &self,
        device_id: &str,
        image_type: ReferenceImageType,
    ) -> SyncResult<Option<RemoteReferenceImage>>;
    async fn download_reference_image(
        &self,
        device_id: &str,
        image_type: ReferenceImageType,
    ) -> SyncResult<Vec<u8>>;
    async fn delete_reference_image(
        &self,
        device_id: &str,
        image_type: ReferenceImageType,
    ) -> SyncResult<()>;

    /// Returns the new station's backend id.
    async fn create_station(&self, group: &str, name: &str, coords: Coords) -> SyncResult<String>;
    async fn rename_station(&self, station_id: &str, name: &str) -> SyncResult<()>;
    async fn list_stations(&self, group: &str) -> SyncResult<Vec<RemoteStation>>;

    async fn user_has_group_access(&self, group: &str) -> SyncResult<bool>;
    async fn update_device_settings(
        &self,
        device_id: &str,
        settings: &serde_json::Value,
    ) -> SyncResult<()>;
    async fn end_user_agreement_version(&self) -> SyncResult<u32>;

    /// Cheap reachability check used to gate upload legs.
    async fn is_reachable(&self) -> bool;
}

// =============================================================================
// HTTP Implementation
// =============================================================================

/// reqwest-backed [`BackendApi`].
#[derive(Clone)]
pub struct HttpBackendClient {
    http: reqwest::Client,
    base_url: String,
    session: Arc<dyn SessionProvider>,
}

impl std::fmt::Debug for HttpBackendClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBackendClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpBackendClient {
    pub fn new(
        base_url: &str,
        timeout: Duration,
        session: Arc<dyn SessionProvider>,
    ) -> SyncResult<Self> {
        let parsed = url::Url::parse(base_url)?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(SyncError::InvalidUrl(format!("{base_url}: not http(s)")));
        }

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::InvalidConfig(format!("backend HTTP client: {e}")))?;

        Ok(HttpBackendClient {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            session,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn authed(&self, method: reqwest::Method, path: &str) -> SyncResult<reqwest::RequestBuilder> {
        let token = self.session.access_token().await?;
        let url = self.url(path);
        debug!("{} {}", method, url);
        Ok(self.http.request(method, url).bearer_auth(token))
    }

    /// Maps status codes, returning the body text of a 2xx response.
    async fn execute(&self, req: reqwest::RequestBuilder, what: &str) -> SyncResult<String> {
        let resp = req.send().await?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();

        if status.is_success() {
            return Ok(body);
        }

        let message = Self::error_message(&body);
        Err(match status.as_u16() {
            401 => SyncError::AuthFailed(format!("{what}: {message}")),
            403 => SyncError::Forbidden(format!("{what}: {message}")),
            404 => SyncError::NotFound(format!("{what}: {message}")),
            422 => SyncError::Unprocessable(format!("{what}: {message}")),
            500..=599 => SyncError::ServerError {
                status: status.as_u16(),
                message,
            },
            code => SyncError::UnexpectedStatus {
                status: code,
                message,
            },
        })
    }

    /// Messages from an error envelope, or the truncated raw body.
    fn error_message(body: &str) -> String {
        match serde_json::from_str::<Envelope>(body) {
            Ok(env) if !env.messages.is_empty() => env.messages.join("; "),
            _ => truncate_body(body),
        }
    }

    /// Checks the `{ success, messages }` envelope and parses the payload.
    fn parse<T: DeserializeOwned>(body: &str, what: &str) -> SyncResult<T> {
        let envelope: Envelope = serde_json::from_str(body).map_err(|e| {
            SyncError::InvalidResponse(format!("{what}: {e}: {}", truncate_body(body)))
        })?;
        if !envelope.success {
            return Err(SyncError::Rejected(format!(
                "{what}: {}",
                envelope.messages.join("; ")
            )));
        }

        serde_json::from_str(body)
            .map_err(|e| SyncError::InvalidResponse(format!("{what}: {e}")))
    }

    /// Envelope check for calls whose payload is ignored.
    fn check_envelope(body: &str, what: &str) -> SyncResult<()> {
        if body.trim().is_empty() {
            return Ok(());
        }
        match serde_json::from_str::<Envelope>(body) {
            Ok(env) if !env.success => Err(SyncError::Rejected(format!(
                "{what}: {}",
                env.messages.join("; ")
            ))),
            _ => Ok(()),
        }
    }

    async fn file_part(file: &Path) -> SyncResult<Part> {
        let bytes = tokio::fs::read(file).await?;
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        Ok(Part::bytes(bytes).file_name(name))
    }

    fn image_path(device_id: &str, image_type: ReferenceImageType) -> String {
        format!("/api/v1/devices/{device_id}/reference-image?type={image_type}")
    }
}

#[async_trait]
impl BackendApi for HttpBackendClient {
    async fn upload_recording(&self, recording: &Recording, file: &Path) -> SyncResult<Option<String>> {
        let part = Self::file_part(file).await?;
        let data = json!({
            "fileName": recording.name,
            "recordingDateTime": recording.recording_time(),
            "size": recording.size,
        });
        let form = Form::new()
            .text("data", data.to_string())
            .part("file", part);

        let path = format!("/api/v1/recordings/device/{}", recording.device);
        let req = self.authed(reqwest::Method::POST, &path).await?.multipart(form);
        let body = self.execute(req, &recording.name).await?;
        let parsed: UploadBody = Self::parse(&body, "upload recording")?;

        Ok(parsed.recording_id.as_ref().and_then(id_string))
    }

    async fn upload_event_group(&self, device_id: &str, group: &EventGroup) -> SyncResult<()> {
        let details: serde_json::Value = serde_json::from_str(&group.details)
            .unwrap_or_else(|_| serde_json::Value::String(group.details.clone()));
        let payload = json!({
            "description": { "type": group.event_type, "details": details },
            "dateTimes": group.timestamps,
        });

        let path = format!("/api/v1/events/device/{device_id}");
        let req = self.authed(reqwest::Method::POST, &path).await?.json(&payload);
        let body = self.execute(req, "upload events").await?;
        Self::check_envelope(&body, "upload events")
    }

    async fn upload_reference_image(
        &self,
        device_id: &str,
        image_type: ReferenceImageType,
        file: &Path,
    ) -> SyncResult<String> {
        let form = Form::new().part("file", Self::file_part(file).await?);
        let req = self
            .authed(reqwest::Method::POST, &Self::image_path(device_id, image_type))
            .await?
            .multipart(form);
        let body = self.execute(req, "upload reference image").await?;
        let parsed: FileKeyBody = Self::parse(&body, "upload reference image")?;
        Ok(parsed.file_key)
    }

    async fn get_reference_image_info(
        &self,
        device_id: &str,
        image_type: ReferenceImageType,
    ) -> SyncResult<Option<RemoteReferenceImage>> {
        let path = format!("/api/v1/devices/{device_id}/reference-image/info?type={image_type}");
        let req = self.authed(reqwest::Method::GET, &path).await?;
        let body = match self.execute(req, "reference image info").await {
            Ok(body) => body,
            Err(SyncError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        let parsed: ImageInfoBody = Self::parse(&body, "reference image info")?;
        Ok(parsed.file_key.map(|file_key| RemoteReferenceImage {
            file_key,
            sha256: parsed.sha256.map(|s| s.to_ascii_lowercase()),
        }))
    }

    async fn download_reference_image(
        &self,
        device_id: &str,
        image_type: ReferenceImageType,
    ) -> SyncResult<Vec<u8>> {
        let req = self
            .authed(reqwest::Method::GET, &Self::image_path(device_id, image_type))
            .await?;
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(match status.as_u16() {
                401 => SyncError::AuthFailed("download reference image".into()),
                403 => SyncError::Forbidden("download reference image".into()),
                404 => SyncError::NotFound(format!("{device_id} {image_type}")),
                code @ 500..=599 => SyncError::ServerError {
                    status: code,
                    message: "download reference image".into(),
                },
                code => SyncError::UnexpectedStatus {
                    status: code,
                    message: "download reference image".into(),
                },
            });
        }

        Ok(resp.bytes().await?.to_vec())
    }

    async fn delete_reference_image(
        &self,
        device_id: &str,
        image_type: ReferenceImageType,
    ) -> SyncResult<()> {
        let req = self
            .authed(reqwest::Method::DELETE, &Self::image_path(device_id, image_type))
            .await?;
        let body = self.execute(req, "delete reference image").await?;
        Self::check_envelope(&body, "delete reference image")
    }

    async fn create_station(&self, group: &str, name: &str, coords: Coords) -> SyncResult<String> {
        let payload = json!({
            "station": { "name": name, "lat": coords.lat, "lng": coords.lng },
        });
        let path = format!("/api/v1/groups/{group}/stations");
        let req = self.authed(reqwest::Method::POST, &path).await?.json(&payload);
        let body = self.execute(req, "create station").await?;
        let parsed: StationIdBody = Self::parse(&body, "create station")?;

        id_string(&parsed.station_id)
            .ok_or_else(|| SyncError::InvalidResponse("create station: empty station id".into()))
    }

    async fn rename_station(&self, station_id: &str, name: &str) -> SyncResult<()> {
        let payload = json!({ "station-updates": { "name": name } });
        let path = format!("/api/v1/stations/{station_id}");
        let req = self.authed(reqwest::Method::PATCH, &path).await?.json(&payload);
        let body = self.execute(req, "rename station").await?;
        Self::check_envelope(&body, "rename station")
    }

    async fn list_stations(&self, group: &str) -> SyncResult<Vec<RemoteStation>> {
        let path = format!("/api/v1/groups/{group}/stations");
        let req = self.authed(reqwest::Method::GET, &path).await?;
        let body = self.execute(req, "list stations").await?;
        let parsed: StationsBody = Self::parse(&body, "list stations")?;

        Ok(parsed
            .stations
            .into_iter()
            .filter_map(|s| {
                let id = id_string(&s.id)?;
                Some(RemoteStation {
                    id,
                    name: s.name,
                    coords: Coords::new(s.location.lat, s.location.lng),
                })
            })
            .collect())
    }

    async fn user_has_group_access(&self, group: &str) -> SyncResult<bool> {
        let path = format!("/api/v1/groups/{group}");
        let req = self.authed(reqwest::Method::GET, &path).await?;
        match self.execute(req, "group access").await {
            Ok(_) => Ok(true),
            Err(SyncError::Forbidden(_)) | Err(SyncError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn update_device_settings(
        &self,
        device_id: &str,
        settings: &serde_json::Value,
    ) -> SyncResult<()> {
        let payload = json!({ "settings": settings });
        let path = format!("/api/v1/devices/{device_id}/settings");
        let req = self.authed(reqwest::Method::POST, &path).await?.json(&payload);
        let body = self.execute(req, "device settings").await?;
        Self::check_envelope(&body, "device settings")
    }

    async fn end_user_agreement_version(&self) -> SyncResult<u32> {
        let req = self
            .http
            .get(self.url("/api/v1/end-user-agreement/latest"));
        let body = self.execute(req, "end user agreement").await?;
        let parsed: EuaBody = Self::parse(&body, "end user agreement")?;
        Ok(parsed.eua_version)
    }

    async fn is_reachable(&self) -> bool {
        match self.http.get(self.url("/api/v1/ping")).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                warn!(error = %e, "Backend unreachable");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::StaticSessionProvider;
    use chrono::{DateTime, Utc};
    use fieldsync_core::DeviceEvent;
    use wiremock::matchers::{body_json, body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> HttpBackendClient {
        HttpBackendClient::new(
            &server.uri(),
            Duration::from_secs(5),
            Arc::new(StaticSessionProvider::new(Some("tok".into()))),
        )
        .unwrap()
    }

    fn recording(dir: &Path) -> (Recording, std::path::PathBuf) {
        let file = dir.join("rec1.cptv");
        std::fs::write(&file, b"cptv-bytes").unwrap();
        let recording = Recording {
            name: "rec1.cptv".into(),
            device: "100".into(),
            path: file.to_string_lossy().into_owned(),
            size: 10,
            is_prod_environment: true,
            is_uploaded: false,
            server_upload_id: None,
            created_at: Utc::now(),
        };
        (recording, file)
    }

    #[tokio::test]
    async fn test_upload_recording_returns_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/recordings/device/100"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true, "messages": ["Thanks"], "recordingId": 9001
            })))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let (rec, file) = recording(dir.path());

        let id = client(&server).upload_recording(&rec, &file).await.unwrap();
        assert_eq!(id.as_deref(), Some("9001"));
    }

    #[tokio::test]
    async fn test_upload_sends_capture_time_from_name() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/recordings/device/100"))
            .and(body_string_contains(r#""recordingDateTime":"2024-01-01T12:00:00Z""#))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true, "messages": [], "recordingId": 9002
            })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let (mut rec, file) = recording(dir.path());
        rec.name = "20240101-120000.cptv".into();

        let id = client(&server).upload_recording(&rec, &file).await.unwrap();
        assert_eq!(id.as_deref(), Some("9002"));
    }

    #[tokio::test]
    async fn test_missing_local_file_is_stale() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let (rec, file) = recording(dir.path());
        std::fs::remove_file(&file).unwrap();

        let err = client(&server).upload_recording(&rec, &file).await.unwrap_err();
        assert!(err.is_stale_reference());
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let server = MockServer::start().await;
        for (station, status) in [("1", 401), ("2", 403), ("3", 404), ("4", 422), ("5", 503)] {
            Mock::given(method("PATCH"))
                .and(path(format!("/api/v1/stations/{station}")))
                .respond_with(ResponseTemplate::new(status).set_body_json(json!({
                    "success": false, "messages": ["nope"]
                })))
                .mount(&server)
                .await;
        }

        let backend = client(&server);
        let err = |id: &'static str| {
            let backend = backend.clone();
            async move { backend.rename_station(id, "x").await.unwrap_err() }
        };

        assert!(matches!(err("1").await, SyncError::AuthFailed(_)));
        assert!(matches!(err("2").await, SyncError::Forbidden(_)));
        assert!(matches!(err("3").await, SyncError::NotFound(_)));
        assert!(matches!(err("4").await, SyncError::Unprocessable(_)));
        match err("5").await {
            SyncError::ServerError { status, message } => {
                assert_eq!(status, 503);
                assert_eq!(message, "nope");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_success_false_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/groups/kea-watch/stations"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": false, "messages": ["duplicate name"]
            })))
            .mount(&server)
            .await;

        let err = client(&server)
            .create_station("kea-watch", "Ridge", Coords::new(-41.0, 174.0))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Rejected(ref m) if m.contains("duplicate name")));
    }

    #[tokio::test]
    async fn test_event_group_payload() {
        let server = MockServer::start().await;
        let t1 = DateTime::parse_from_rfc3339("2024-01-01T08:00:00Z").unwrap().with_timezone(&Utc);
        let t2 = DateTime::parse_from_rfc3339("2024-01-01T09:00:00Z").unwrap().with_timezone(&Utc);

        Mock::given(method("POST"))
            .and(path("/api/v1/events/device/100"))
            .and(body_json(json!({
                "description": { "type": "rpi-power-on", "details": {"v": 1} },
                "dateTimes": [t1, t2],
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
            .expect(1)
            .mount(&server)
            .await;

        let events: Vec<DeviceEvent> = [("k1", t1), ("k2", t2)]
            .into_iter()
            .map(|(key, ts)| DeviceEvent {
                key: key.into(),
                device: "100".into(),
                event_type: "rpi-power-on".into(),
                details: r#"{"v":1}"#.into(),
                timestamp: ts,
                is_uploaded: false,
                is_prod_environment: true,
            })
            .collect();
        let groups = fieldsync_core::group_events(&events);

        client(&server)
            .upload_event_group("100", &groups[0])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_reference_image_info_absent_on_404() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/devices/100/reference-image/info"))
            .and(query_param("type", "pov"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let info = client(&server)
            .get_reference_image_info("100", ReferenceImageType::Pov)
            .await
            .unwrap();
        assert!(info.is_none());
    }

    #[tokio::test]
    async fn test_group_access() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/groups/kea-watch"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/groups/private"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let backend = client(&server);
        assert!(backend.user_has_group_access("kea-watch").await.unwrap());
        assert!(!backend.user_has_group_access("private").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_stations() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/groups/kea-watch/stations"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "stations": [
                    {"id": 7, "name": "Ridge", "location": {"lat": -41.0, "lng": 174.0}},
                    {"id": null, "name": "Broken", "location": {"lat": 0.0, "lng": 0.0}}
                ]
            })))
            .mount(&server)
            .await;

        let stations = client(&server).list_stations("kea-watch").await.unwrap();
        assert_eq!(stations.len(), 1);
        assert_eq!(stations[0].id, "7");
        assert_eq!(stations[0].name, "Ridge");
    }
}
