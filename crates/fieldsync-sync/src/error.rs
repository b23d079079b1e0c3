//! # Sync Error Types
//!
//! Error types for connectivity and sync operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │ Transient net   │  │  Backend access         │ │
//! │  │                 │  │  (retried)      │  │  (never retried)        │ │
//! │  │  InvalidConfig  │  │  Connection     │  │  AuthFailed             │ │
//! │  │  InvalidUrl     │  │  Timeout        │  │  NeedsGroupAccess       │ │
//! │  │  ConfigLoad/Save│  │                 │  │  Forbidden              │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │ Stale reference │  │   Server side   │  │  Protocol / parse       │ │
//! │  │ (pruned)        │  │ (state kept)    │  │  (treated as absent)    │ │
//! │  │  NotFound       │  │  ServerError    │  │  InvalidResponse        │ │
//! │  │  FileMissing    │  │                 │  │  SerializationFailed    │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  Unit unreachable needs BOTH the URL check and the host check to fail  │
//! │  before a Connected device is flipped to Disconnected.                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering every failure in this crate.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Invalid backend or unit URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// Connection refused, reset or DNS failure.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Request timeout.
    #[error("Request timeout after {0} seconds")]
    Timeout(u64),

    /// Unit failed both the URL and the host reachability checks.
    #[error("Unit unreachable: {0}")]
    Unreachable(String),

    // =========================================================================
    // Backend Access Errors
    // =========================================================================
    /// Session missing, expired or rejected.
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// The user is not a member of the group that owns the target.
    #[error("Needs access to group '{group}'")]
    NeedsGroupAccess { group: String },

    /// Forbidden for a reason other than group membership.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    // =========================================================================
    // Stale References
    // =========================================================================
    /// The backend or unit no longer knows the referenced item.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A local file referenced by a record is gone.
    #[error("File missing: {0}")]
    FileMissing(String),

    // =========================================================================
    // Server Errors
    // =========================================================================
    /// The backend rejected the payload as unprocessable.
    #[error("Unprocessable: {0}")]
    Unprocessable(String),

    /// 5xx from the backend.
    #[error("Server error (HTTP {status}): {message}")]
    ServerError { status: u16, message: String },

    /// Any other non-success status.
    #[error("Unexpected HTTP status {status}: {message}")]
    UnexpectedStatus { status: u16, message: String },

    /// `{ success: false }` envelope with a 2xx status.
    #[error("Request rejected: {0}")]
    Rejected(String),

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// Response body did not have the expected shape.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Failed to serialize or deserialize JSON.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    // =========================================================================
    // Local Errors
    // =========================================================================
    /// Database query failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// File I/O failed.
    #[error("File error: {0}")]
    FileError(String),

    /// Caller-supplied value failed validation.
    #[error("Validation error: {0}")]
    Validation(#[from] fieldsync_core::ValidationError),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Agent is shutting down.
    #[error("Agent is shutting down")]
    ShuttingDown,

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),

    /// An update poll is already running for this unit.
    #[error("Update already in progress for device {0}")]
    UpdateInProgress(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SyncError::Timeout(0)
        } else if err.is_connect() {
            SyncError::ConnectionFailed(err.to_string())
        } else if err.is_decode() {
            SyncError::InvalidResponse(err.to_string())
        } else if let Some(status) = err.status() {
            SyncError::UnexpectedStatus {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            SyncError::ConnectionFailed(err.to_string())
        }
    }
}

impl From<fieldsync_db::DbError> for SyncError {
    fn from(err: fieldsync_db::DbError) -> Self {
        SyncError::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            SyncError::FileMissing(err.to_string())
        } else {
            SyncError::FileError(err.to_string())
        }
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

/// First 200 characters of a response body, for error messages.
pub(crate) fn truncate_body(body: &str) -> String {
    body.chars().take(200).collect()
}

// =============================================================================
// Error Categorization
// =============================================================================

impl SyncError {
    /// Returns true for transient network failures worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::ConnectionFailed(_) | SyncError::Timeout(_)
        )
    }

    /// Returns true when the unit could not be reached at all.
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            SyncError::Unreachable(_) | SyncError::ConnectionFailed(_) | SyncError::Timeout(_)
        )
    }

    /// Returns true for backend auth or access failures. Never retried.
    pub fn is_access_error(&self) -> bool {
        matches!(
            self,
            SyncError::AuthFailed(_) | SyncError::NeedsGroupAccess { .. } | SyncError::Forbidden(_)
        )
    }

    /// Returns true when the referenced item no longer exists.
    pub fn is_stale_reference(&self) -> bool {
        matches!(self, SyncError::NotFound(_) | SyncError::FileMissing(_))
    }

    /// Returns true for 5xx responses. Local state must be left as is.
    pub fn is_server_error(&self) -> bool {
        matches!(self, SyncError::ServerError { .. })
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(SyncError::ConnectionFailed("refused".into()).is_retryable());
        assert!(SyncError::Timeout(3).is_retryable());

        assert!(!SyncError::AuthFailed("expired".into()).is_retryable());
        assert!(!SyncError::NotFound("rec1.cptv".into()).is_retryable());
        assert!(!SyncError::InvalidConfig("bad".into()).is_retryable());
    }

    #[test]
    fn test_categories_are_distinct() {
        let access = SyncError::NeedsGroupAccess {
            group: "kea-watch".into(),
        };
        assert!(access.is_access_error());
        assert!(!access.is_stale_reference());
        assert!(access.to_string().contains("kea-watch"));

        let server = SyncError::ServerError {
            status: 503,
            message: "maintenance".into(),
        };
        assert!(server.is_server_error());
        assert!(!server.is_retryable());

        assert!(SyncError::FileMissing("/tmp/x".into()).is_stale_reference());
        assert!(SyncError::Unreachable("10.0.0.2".into()).is_unreachable());
    }

    #[test]
    fn test_io_not_found_is_stale() {
        let err: SyncError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(err.is_stale_reference());

        let err: SyncError = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "no").into();
        assert!(matches!(err, SyncError::FileError(_)));
    }
}
