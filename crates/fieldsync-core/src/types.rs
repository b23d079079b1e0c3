//! # Domain Types
//!
//! Core domain types shared by the registry, the database and the sync engine.
//!
//! ## Type Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │     Device      │   │    Recording    │   │   DeviceEvent   │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  id (backend)   │   │  (name, device) │   │  (key, device)  │       │
//! │  │  hardware_id    │   │  path, size     │   │  type, details  │       │
//! │  │  endpoint       │   │  is_uploaded    │   │  timestamp      │       │
//! │  │  connection     │   │  server id      │   │  is_uploaded    │       │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘       │
//! │                                                                         │
//! │  ┌──────────────────────┐   ┌─────────────────────────────────┐        │
//! │  │ DeviceReferenceImage │   │        Location (Station)       │        │
//! │  │  ──────────────────  │   │  ─────────────────────────────  │        │
//! │  │  (device, env, type) │   │  id / server_id                 │        │
//! │  │  file_key            │   │  coords, group, environment     │        │
//! │  │  server_status       │   │  needs_creation / needs_rename  │        │
//! │  │   (tri-state)        │   │                                 │        │
//! │  └──────────────────────┘   └─────────────────────────────────┘        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Dual-Key Identity for Devices
//! - `id`: assigned by the backend, may change when a unit re-registers
//! - `hardware_id`: salt-assigned, survives re-registration, used for dedup

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::CoreError;
use crate::geo;

// =============================================================================
// Coordinates
// =============================================================================

/// A WGS84 position in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Coords {
    pub lat: f64,
    pub lng: f64,
}

impl Coords {
    /// Creates a coordinate pair without validation.
    ///
    /// Use [`crate::validation::validate_coords`] for untrusted input.
    pub const fn new(lat: f64, lng: f64) -> Self {
        Coords { lat, lng }
    }

    /// Great-circle distance to another point in meters.
    pub fn distance_to(&self, other: Coords) -> f64 {
        geo::distance_m(*self, other)
    }
}

// =============================================================================
// Connection State
// =============================================================================

/// Connection state of a unit as tracked by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Last verification reached the unit.
    Connected,
    /// Unit could not be verified by either URL or raw host.
    #[default]
    Disconnected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
        }
    }
}

impl std::str::FromStr for ConnectionState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "connected" => Ok(ConnectionState::Connected),
            "disconnected" => Ok(ConnectionState::Disconnected),
            other => Err(CoreError::UnknownConnectionState(other.to_string())),
        }
    }
}

// =============================================================================
// Device
// =============================================================================

/// Optional capabilities a unit may support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Capabilities {
    /// Unit can record audio and exposes the audio-mode endpoint.
    pub audio: bool,
    /// Unit supports extended-length recordings.
    pub long_recording: bool,
}

/// A field unit known to the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Device {
    /// Backend-assigned identifier. May change across re-registration.
    pub id: String,

    /// Salt-assigned hardware identifier. Stable dedup key.
    pub hardware_id: Option<String>,

    /// Raw host (usually an IP address) the unit was found at.
    pub host: String,

    /// Human-readable device name.
    pub name: String,

    /// Backend group the unit belongs to.
    pub group: String,

    /// Whether the unit is registered against the production backend.
    pub is_prod_environment: bool,

    /// Current connection state.
    pub connection_state: ConnectionState,

    /// Discovery endpoint the unit was announced at.
    pub endpoint: String,

    /// Base URL that answered the last device-info probe.
    pub url: String,

    /// Probed optional capabilities.
    pub capabilities: Capabilities,

    /// Last time the unit was seen or its state changed.
    #[ts(as = "String")]
    pub last_seen_at: DateTime<Utc>,

    /// Battery level derived from the unit's reported voltage.
    pub battery_percent: Option<f64>,
}

impl Device {
    /// Returns true if the device is currently connected.
    pub fn is_connected(&self) -> bool {
        self.connection_state == ConnectionState::Connected
    }
}

// =============================================================================
// Recording
// =============================================================================

/// A recording downloaded from a unit and waiting for backend ingest.
///
/// Uniqueness: `(name, device)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct Recording {
    /// File name on the unit (e.g. `20240101-120000.cptv`).
    pub name: String,

    /// Device id the recording came from.
    pub device: String,

    /// Local path of the downloaded file.
    pub path: String,

    /// File size in bytes.
    pub size: i64,

    /// Environment the owning device is registered against.
    pub is_prod_environment: bool,

    /// True once the backend has ingested the file.
    pub is_uploaded: bool,

    /// Backend recording id returned on ingest.
    pub server_upload_id: Option<String>,

    /// When the recording was stored locally.
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
}

/// Stem format units use when naming recordings, in UTC.
const RECORDING_NAME_FORMAT: &str = "%Y%m%d-%H%M%S";

impl Recording {
    /// When the unit captured the recording, read from its file name.
    /// `None` for names that do not carry a timestamp.
    pub fn recorded_at(&self) -> Option<DateTime<Utc>> {
        let stem = self.name.split('.').next()?;
        let naive = NaiveDateTime::parse_from_str(stem, RECORDING_NAME_FORMAT).ok()?;
        Some(Utc.from_utc_datetime(&naive))
    }

    /// Capture time when known, otherwise the local download time.
    pub fn recording_time(&self) -> DateTime<Utc> {
        self.recorded_at().unwrap_or(self.created_at)
    }
}

// =============================================================================
// Device Event
// =============================================================================

/// A diagnostic event pulled from a unit.
///
/// Uniqueness: `(key, device)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct DeviceEvent {
    /// Event key assigned by the unit.
    pub key: String,

    /// Device id the event came from.
    pub device: String,

    /// Event type (e.g. `rpi-power-on`).
    pub event_type: String,

    /// Event details as JSON text.
    pub details: String,

    /// When the event happened on the unit.
    #[ts(as = "String")]
    pub timestamp: DateTime<Utc>,

    /// True once included in a successful grouped upload.
    pub is_uploaded: bool,

    /// Environment the owning device is registered against.
    pub is_prod_environment: bool,
}

// =============================================================================
// Reference Images
// =============================================================================

/// Kind of reference photo stored for a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "kebab-case"))]
#[ts(export)]
#[serde(rename_all = "kebab-case")]
pub enum ReferenceImageType {
    /// Point-of-view shot taken through the unit's camera.
    Pov,
    /// Photo of the unit as installed.
    InSitu,
}

impl ReferenceImageType {
    /// All image types, in sync order.
    pub const ALL: [ReferenceImageType; 2] = [ReferenceImageType::Pov, ReferenceImageType::InSitu];

    /// Wire name used by the backend.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferenceImageType::Pov => "pov",
            ReferenceImageType::InSitu => "in-situ",
        }
    }
}

impl std::fmt::Display for ReferenceImageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ReferenceImageType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pov" => Ok(ReferenceImageType::Pov),
            "in-situ" | "insitu" => Ok(ReferenceImageType::InSitu),
            other => Err(CoreError::UnknownImageType(other.to_string())),
        }
    }
}

/// Pending server-side operation for an artifact.
///
/// Stored as `Option<ServerStatus>`: `None` means synced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "kebab-case"))]
#[ts(export)]
#[serde(rename_all = "kebab-case")]
pub enum ServerStatus {
    /// Local file must be uploaded to the backend.
    PendingUpload,
    /// Backend copy must be deleted; local record goes once that succeeds.
    PendingDeletion,
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerStatus::PendingUpload => write!(f, "pending-upload"),
            ServerStatus::PendingDeletion => write!(f, "pending-deletion"),
        }
    }
}

impl std::str::FromStr for ServerStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending-upload" => Ok(ServerStatus::PendingUpload),
            "pending-deletion" => Ok(ServerStatus::PendingDeletion),
            other => Err(CoreError::UnknownServerStatus(other.to_string())),
        }
    }
}

/// A reference photo for a unit.
///
/// Uniqueness: `(device_id, is_prod_environment, image_type)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct DeviceReferenceImage {
    pub device_id: String,
    pub is_prod_environment: bool,
    /// Local path of the image file.
    pub file_path: String,
    /// Backend file key, set once uploaded or downloaded.
    pub file_key: Option<String>,
    pub image_type: ReferenceImageType,
    pub coords: Option<Coords>,
    pub server_status: Option<ServerStatus>,
    #[ts(as = "String")]
    pub timestamp: DateTime<Utc>,
}

impl DeviceReferenceImage {
    /// Returns true if no server operation is outstanding.
    pub fn is_synced(&self) -> bool {
        self.server_status.is_none()
    }
}

// =============================================================================
// Location (Station)
// =============================================================================

/// A named, geofenced monitoring station.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Location {
    /// Local identifier (UUID for stations created offline).
    pub id: String,

    /// Backend station id once known.
    pub server_id: Option<String>,

    /// Station name.
    pub name: String,

    /// New name set locally and not yet pushed to the backend.
    pub update_name_not_yet_synced: Option<String>,

    pub coords: Coords,

    /// Reported GPS accuracy when the station was recorded, in meters.
    pub accuracy_m: f64,

    pub group_name: String,
    pub is_prod_environment: bool,

    /// Station exists only locally and must be created on the backend.
    pub needs_creation: bool,

    /// Station was renamed locally and the rename must be pushed.
    pub needs_rename: bool,

    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
}

impl Location {
    /// Returns true if the backend already knows this station.
    pub fn is_server_known(&self) -> bool {
        self.server_id.is_some() && !self.needs_creation
    }

    /// Returns true if this station and `other` share a group and environment.
    pub fn same_scope(&self, other: &Location) -> bool {
        self.group_name == other.group_name && self.is_prod_environment == other.is_prod_environment
    }
}
