//! # Error Types
//!
//! Domain-specific error types for fieldsync-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  fieldsync-core errors (this file)                                     │
//! │  ├── CoreError        - General domain errors                          │
//! │  └── ValidationError  - Input validation failures                      │
//! │                                                                         │
//! │  fieldsync-db errors (separate crate)                                  │
//! │  └── DbError          - Database operation failures                    │
//! │                                                                         │
//! │  fieldsync-sync errors (separate crate)                                │
//! │  └── SyncError        - Network, unit, backend and config failures     │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → SyncError → log / notification    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Core domain errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A value failed validation.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// A reference image type string was not recognised.
    #[error("Unknown reference image type: {0}")]
    UnknownImageType(String),

    /// A server status string was not recognised.
    #[error("Unknown server status: {0}")]
    UnknownServerStatus(String),

    /// A connection state string was not recognised.
    #[error("Unknown connection state: {0}")]
    UnknownConnectionState(String),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    /// A required field was empty.
    #[error("{field} is required")]
    Required { field: String },

    /// A string exceeded its maximum length.
    #[error("{field} must be at most {max} characters (got {actual})")]
    TooLong {
        field: String,
        max: usize,
        actual: usize,
    },

    /// Latitude/longitude out of range or not finite.
    #[error("Invalid coordinates: lat={lat}, lng={lng}")]
    InvalidCoordinates { lat: f64, lng: f64 },

    /// GPS accuracy must be a finite, non-negative number of meters.
    #[error("Invalid GPS accuracy: {0}")]
    InvalidAccuracy(f64),

    /// A battery curve was malformed.
    #[error("Invalid battery curve: {0}")]
    InvalidBatteryCurve(String),

    /// Event details were not valid JSON.
    #[error("Event details are not valid JSON: {0}")]
    InvalidEventDetails(String),

    /// Recording name cannot be used as a local file name.
    #[error("Invalid recording name: {0}")]
    InvalidRecordingName(String),
}

impl ValidationError {
    /// Creates a Required error for the given field.
    pub fn required(field: impl Into<String>) -> Self {
        ValidationError::Required {
            field: field.into(),
        }
    }
}

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::TooLong {
            field: "name".into(),
            max: 10,
            actual: 12,
        };
        assert_eq!(err.to_string(), "name must be at most 10 characters (got 12)");
    }

    #[test]
    fn test_core_error_from_validation() {
        let err: CoreError = ValidationError::required("group").into();
        assert!(err.to_string().contains("group is required"));
    }
}
