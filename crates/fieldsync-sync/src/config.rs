//! # Agent Configuration
//!
//! Configuration management for the connectivity and sync engine.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     FIELDSYNC_ENVIRONMENT=test                                         │
//! │     FIELDSYNC_BACKEND_TOKEN=...                                        │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/fieldsync/fieldsync.toml (Linux)                         │
//! │     ~/Library/Application Support/org.fieldsync.fieldsync/ (macOS)     │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [app]
//! environment = "prod"   # prod | test
//! should_upload = true
//!
//! [backend]
//! prod_url = "https://api.fieldsync.org"
//! test_url = "https://api-test.fieldsync.org"
//!
//! [unit]
//! username = "admin"
//! password = "feathers"
//!
//! [discovery]
//! static_hosts = ["192.168.4.1"]
//!
//! [sync]
//! interval_secs = 300
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Environment
// =============================================================================

/// Which backend deployment the agent talks to.
///
/// Every stored record carries `is_prod_environment` so that test and
/// production data never mix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    #[default]
    Prod,
    Test,
}

impl Environment {
    /// Returns true for the production backend.
    pub fn is_prod(&self) -> bool {
        matches!(self, Environment::Prod)
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Environment::Prod => write!(f, "prod"),
            Environment::Test => write!(f, "test"),
        }
    }
}

impl std::str::FromStr for Environment {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "prod" | "production" => Ok(Environment::Prod),
            "test" | "staging" => Ok(Environment::Test),
            other => Err(SyncError::InvalidConfig(format!(
                "Unknown environment: '{}'. Valid options: prod, test",
                other
            ))),
        }
    }
}

// =============================================================================
// App Settings
// =============================================================================

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSettings {
    /// Backend deployment in use.
    #[serde(default)]
    pub environment: Environment,

    /// Root directory for downloaded recordings and reference images.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// When false, recordings are downloaded but never uploaded.
    #[serde(default = "default_true")]
    pub should_upload: bool,
}

fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("org", "fieldsync", "fieldsync")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("fieldsync-data"))
}

fn default_true() -> bool {
    true
}

impl Default for AppSettings {
    fn default() -> Self {
        AppSettings {
            environment: Environment::default(),
            data_dir: default_data_dir(),
            should_upload: true,
        }
    }
}

// =============================================================================
// Backend Settings
// =============================================================================

/// Backend REST API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSettings {
    /// Production API base URL.
    #[serde(default = "default_prod_url")]
    pub prod_url: String,

    /// Test API base URL.
    #[serde(default = "default_test_url")]
    pub test_url: String,

    /// Request timeout (seconds).
    #[serde(default = "default_backend_timeout")]
    pub request_timeout_secs: u64,

    /// Static bearer token used by the headless daemon.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

fn default_prod_url() -> String {
    "https://api.fieldsync.org".to_string()
}

fn default_test_url() -> String {
    "https://api-test.fieldsync.org".to_string()
}

fn default_backend_timeout() -> u64 {
    30
}

impl Default for BackendSettings {
    fn default() -> Self {
        BackendSettings {
            prod_url: default_prod_url(),
            test_url: default_test_url(),
            request_timeout_secs: default_backend_timeout(),
            token: None,
        }
    }
}

// =============================================================================
// Unit Settings
// =============================================================================

/// Settings for talking to field units over the local network.
///
/// Units are low-power embedded servers, so every timeout is short.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitSettings {
    /// Shared Basic-Auth user for the unit's local HTTP surface.
    #[serde(default = "default_unit_username")]
    pub username: String,

    /// Shared Basic-Auth password.
    #[serde(default = "default_unit_password")]
    pub password: String,

    /// HTTP port the unit listens on.
    #[serde(default = "default_unit_port")]
    pub port: u16,

    #[serde(default = "default_unit_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_unit_request_timeout")]
    pub request_timeout_secs: u64,

    /// Timeout for recording downloads.
    #[serde(default = "default_unit_download_timeout")]
    pub download_timeout_secs: u64,

    /// Suffix appended to a unit name to form its mDNS hostname.
    #[serde(default = "default_mdns_suffix")]
    pub mdns_suffix: String,
}

fn default_unit_username() -> String {
    "admin".to_string()
}

fn default_unit_password() -> String {
    "feathers".to_string()
}

fn default_unit_port() -> u16 {
    80
}

fn default_unit_connect_timeout() -> u64 {
    3
}

fn default_unit_request_timeout() -> u64 {
    10
}

fn default_unit_download_timeout() -> u64 {
    20
}

fn default_mdns_suffix() -> String {
    ".local".to_string()
}

impl Default for UnitSettings {
    fn default() -> Self {
        UnitSettings {
            username: default_unit_username(),
            password: default_unit_password(),
            port: default_unit_port(),
            connect_timeout_secs: default_unit_connect_timeout(),
            request_timeout_secs: default_unit_request_timeout(),
            download_timeout_secs: default_unit_download_timeout(),
            mdns_suffix: default_mdns_suffix(),
        }
    }
}

// =============================================================================
// Discovery Settings
// =============================================================================

/// Unit discovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySettings {
    /// Safety-net rediscovery interval (seconds).
    #[serde(default = "default_rediscovery_interval")]
    pub rediscovery_interval_secs: u64,

    /// Connection attempts per found service.
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,

    /// Fixed delay between connection attempts (milliseconds).
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,

    /// Disconnected registry entries older than this are pruned (seconds).
    #[serde(default = "default_prune_idle")]
    pub prune_idle_secs: u64,

    /// Hosts announced by the static discovery transport.
    #[serde(default)]
    pub static_hosts: Vec<String>,
}

fn default_rediscovery_interval() -> u64 {
    30
}

fn default_connect_attempts() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    1000
}

fn default_prune_idle() -> u64 {
    60
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        DiscoverySettings {
            rediscovery_interval_secs: default_rediscovery_interval(),
            connect_attempts: default_connect_attempts(),
            retry_delay_ms: default_retry_delay(),
            prune_idle_secs: default_prune_idle(),
            static_hosts: Vec::new(),
        }
    }
}

// =============================================================================
// Access Point Settings
// =============================================================================

/// Hotspot pairing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessPointSettings {
    /// Maximum time spent in `LoadingConnect` (seconds).
    #[serde(default = "default_ap_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Maximum time spent in `LoadingDisconnect` (seconds).
    #[serde(default = "default_ap_disconnect_timeout")]
    pub disconnect_timeout_secs: u64,

    /// Connect requests inside this window after an accepted one are dropped.
    #[serde(default = "default_ap_debounce")]
    pub debounce_ms: u64,
}

fn default_ap_connect_timeout() -> u64 {
    120
}

fn default_ap_disconnect_timeout() -> u64 {
    30
}

fn default_ap_debounce() -> u64 {
    2000
}

impl Default for AccessPointSettings {
    fn default() -> Self {
        AccessPointSettings {
            connect_timeout_secs: default_ap_connect_timeout(),
            disconnect_timeout_secs: default_ap_disconnect_timeout(),
            debounce_ms: default_ap_debounce(),
        }
    }
}

// =============================================================================
// Cache Settings
// =============================================================================

/// Diagnostic cache TTLs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Wifi, modem and battery reads (seconds).
    #[serde(default = "default_network_ttl")]
    pub network_ttl_secs: u64,

    /// Aggregate internet reachability (seconds).
    #[serde(default = "default_internet_ttl")]
    pub internet_ttl_secs: u64,

    /// Capability probes (seconds).
    #[serde(default = "default_capability_ttl")]
    pub capability_ttl_secs: u64,
}

fn default_network_ttl() -> u64 {
    20
}

fn default_internet_ttl() -> u64 {
    60
}

fn default_capability_ttl() -> u64 {
    300
}

impl Default for CacheSettings {
    fn default() -> Self {
        CacheSettings {
            network_ttl_secs: default_network_ttl(),
            internet_ttl_secs: default_internet_ttl(),
            capability_ttl_secs: default_capability_ttl(),
        }
    }
}

// =============================================================================
// Station Settings
// =============================================================================

/// Monitoring-station geofence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationSettings {
    /// Minimum allowed distance between two stations (meters).
    /// Half of it is the base merge radius.
    #[serde(default = "default_min_separation")]
    pub min_separation_m: f64,
}

fn default_min_separation() -> f64 {
    fieldsync_core::DEFAULT_MIN_STATION_SEPARATION_M
}

impl Default for StationSettings {
    fn default() -> Self {
        StationSettings {
            min_separation_m: default_min_separation(),
        }
    }
}

// =============================================================================
// Sync Settings
// =============================================================================

/// Periodic sync cycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Seconds between full sync cycles (pending uploads, reference
    /// images, stations).
    #[serde(default = "default_sync_interval")]
    pub interval_secs: u64,
}

fn default_sync_interval() -> u64 {
    300
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            interval_secs: default_sync_interval(),
        }
    }
}

// =============================================================================
// Update Settings
// =============================================================================

/// Software-update monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateSettings {
    #[serde(default = "default_update_poll_interval")]
    pub poll_interval_secs: u64,

    /// Upper bound on polls before the monitor gives up.
    #[serde(default = "default_update_max_polls")]
    pub max_polls: u32,
}

fn default_update_poll_interval() -> u64 {
    5
}

fn default_update_max_polls() -> u32 {
    120
}

impl Default for UpdateSettings {
    fn default() -> Self {
        UpdateSettings {
            poll_interval_secs: default_update_poll_interval(),
            max_polls: default_update_max_polls(),
        }
    }
}

// =============================================================================
// Logging Settings
// =============================================================================

/// Logging settings. `RUST_LOG` wins over `level` when set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Colored output.
    #[serde(default = "default_true")]
    pub ansi: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        LoggingSettings {
            level: default_log_level(),
            ansi: true,
        }
    }
}

// =============================================================================
// Main Configuration
// =============================================================================

/// Complete agent configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub app: AppSettings,

    #[serde(default)]
    pub backend: BackendSettings,

    #[serde(default)]
    pub unit: UnitSettings,

    #[serde(default)]
    pub discovery: DiscoverySettings,

    #[serde(default)]
    pub access_point: AccessPointSettings,

    #[serde(default)]
    pub cache: CacheSettings,

    #[serde(default)]
    pub stations: StationSettings,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub update: UpdateSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

impl SyncConfig {
    /// Creates a new config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (fieldsync.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading config from file");
                let contents = std::fs::read_to_string(&path)
                    .map_err(|e| SyncError::ConfigLoadFailed(e.to_string()))?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents).map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;

        info!(?path, "Config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        for (name, url) in [
            ("backend.prod_url", &self.backend.prod_url),
            ("backend.test_url", &self.backend.test_url),
        ] {
            if url.is_empty() {
                return Err(SyncError::InvalidUrl(format!("{} must not be empty", name)));
            }
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(SyncError::InvalidUrl(format!(
                    "{} must start with http:// or https://, got: {}",
                    name, url
                )));
            }
        }

        let non_zero = [
            ("backend.request_timeout_secs", self.backend.request_timeout_secs),
            ("unit.connect_timeout_secs", self.unit.connect_timeout_secs),
            ("unit.request_timeout_secs", self.unit.request_timeout_secs),
            ("unit.download_timeout_secs", self.unit.download_timeout_secs),
            ("discovery.rediscovery_interval_secs", self.discovery.rediscovery_interval_secs),
            ("discovery.connect_attempts", u64::from(self.discovery.connect_attempts)),
            ("discovery.prune_idle_secs", self.discovery.prune_idle_secs),
            ("access_point.connect_timeout_secs", self.access_point.connect_timeout_secs),
            ("access_point.disconnect_timeout_secs", self.access_point.disconnect_timeout_secs),
            ("cache.network_ttl_secs", self.cache.network_ttl_secs),
            ("cache.internet_ttl_secs", self.cache.internet_ttl_secs),
            ("cache.capability_ttl_secs", self.cache.capability_ttl_secs),
            ("sync.interval_secs", self.sync.interval_secs),
            ("update.poll_interval_secs", self.update.poll_interval_secs),
            ("update.max_polls", u64::from(self.update.max_polls)),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(SyncError::InvalidConfig(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }

        let separation = self.stations.min_separation_m;
        if separation.is_nan() || separation <= 0.0 {
            return Err(SyncError::InvalidConfig(
                "stations.min_separation_m must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(env) = std::env::var("FIELDSYNC_ENVIRONMENT") {
            match env.parse() {
                Ok(parsed) => {
                    debug!(environment = %env, "Overriding environment from environment");
                    self.app.environment = parsed;
                }
                Err(e) => warn!(?e, "Ignoring FIELDSYNC_ENVIRONMENT"),
            }
        }

        if let Ok(dir) = std::env::var("FIELDSYNC_DATA_DIR") {
            self.app.data_dir = PathBuf::from(dir);
        }

        if let Ok(flag) = std::env::var("FIELDSYNC_SHOULD_UPLOAD") {
            self.app.should_upload = flag != "false" && flag != "0";
        }

        if let Ok(url) = std::env::var("FIELDSYNC_BACKEND_PROD_URL") {
            debug!(url = %url, "Overriding prod backend URL from environment");
            self.backend.prod_url = url;
        }

        if let Ok(url) = std::env::var("FIELDSYNC_BACKEND_TEST_URL") {
            self.backend.test_url = url;
        }

        if let Ok(token) = std::env::var("FIELDSYNC_BACKEND_TOKEN") {
            self.backend.token = Some(token);
        }

        if let Ok(user) = std::env::var("FIELDSYNC_UNIT_USERNAME") {
            self.unit.username = user;
        }

        if let Ok(password) = std::env::var("FIELDSYNC_UNIT_PASSWORD") {
            self.unit.password = password;
        }

        if let Ok(hosts) = std::env::var("FIELDSYNC_STATIC_HOSTS") {
            self.discovery.static_hosts = hosts
                .split(',')
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(String::from)
                .collect();
        }

        if let Ok(level) = std::env::var("FIELDSYNC_LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("org", "fieldsync", "fieldsync")
            .map(|dirs| dirs.config_dir().join("fieldsync.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Returns true when talking to the production backend.
    pub fn is_prod_environment(&self) -> bool {
        self.app.environment.is_prod()
    }

    /// Backend base URL for the active environment.
    pub fn backend_url(&self) -> &str {
        match self.app.environment {
            Environment::Prod => &self.backend.prod_url,
            Environment::Test => &self.backend.test_url,
        }
    }

    /// Directory that holds downloaded recordings for one unit.
    pub fn recordings_dir(&self, device_id: &str) -> PathBuf {
        self.app.data_dir.join("recordings").join(device_id)
    }

    /// Directory that holds reference images.
    pub fn images_dir(&self) -> PathBuf {
        self.app.data_dir.join("reference-images")
    }

    pub fn rediscovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery.rediscovery_interval_secs)
    }

    pub fn prune_idle(&self) -> Duration {
        Duration::from_secs(self.discovery.prune_idle_secs)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync.interval_secs)
    }

    pub fn update_poll_interval(&self) -> Duration {
        Duration::from_secs(self.update.poll_interval_secs)
    }
}
