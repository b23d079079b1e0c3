//! # Validation Module
//!
//! Validation for values that arrive from units, GPS fixes and user input.
//!
//! ## Usage
//! ```rust
//! use fieldsync_core::validation::{validate_coords, validate_station_name};
//!
//! validate_coords(-43.53, 172.63).unwrap();
//! validate_station_name("North ridge").unwrap();
//! ```

use crate::error::ValidationError;
use crate::types::Coords;
use crate::MAX_STATION_NAME_LEN;

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

// =============================================================================
// Geo Validators
// =============================================================================

/// Validates a latitude/longitude pair and returns it as [`Coords`].
///
/// ## Rules
/// - Both values finite
/// - Latitude in [-90, 90], longitude in [-180, 180]
pub fn validate_coords(lat: f64, lng: f64) -> ValidationResult<Coords> {
    let valid = lat.is_finite()
        && lng.is_finite()
        && (-90.0..=90.0).contains(&lat)
        && (-180.0..=180.0).contains(&lng);

    if valid {
        Ok(Coords::new(lat, lng))
    } else {
        Err(ValidationError::InvalidCoordinates { lat, lng })
    }
}

/// Validates a GPS accuracy value in meters.
pub fn validate_accuracy(accuracy_m: f64) -> ValidationResult<f64> {
    if accuracy_m.is_finite() && accuracy_m >= 0.0 {
        Ok(accuracy_m)
    } else {
        Err(ValidationError::InvalidAccuracy(accuracy_m))
    }
}

// =============================================================================
// String Validators
// =============================================================================

/// Validates a station name and returns it trimmed.
pub fn validate_station_name(name: &str) -> ValidationResult<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::required("station name"));
    }

    let len = trimmed.chars().count();
    if len > MAX_STATION_NAME_LEN {
        return Err(ValidationError::TooLong {
            field: "station name".into(),
            max: MAX_STATION_NAME_LEN,
            actual: len,
        });
    }

    Ok(trimmed.to_string())
}

/// Validates that event details are JSON text.
pub fn validate_event_details(details: &str) -> ValidationResult<()> {
    serde_json::from_str::<serde_json::Value>(details)
        .map(|_| ())
        .map_err(|e| ValidationError::InvalidEventDetails(e.to_string()))
}

/// Validates a recording file name reported by a unit.
///
/// Names are used as local file names, so path separators and parent
/// references are rejected.
pub fn validate_recording_name(name: &str) -> ValidationResult<()> {
    if name.trim().is_empty() {
        return Err(ValidationError::required("recording name"));
    }
    if name.contains('/') || name.contains('\\') || name == "." || name == ".." {
        return Err(ValidationError::InvalidRecordingName(name.to_string()));
    }
    Ok(())
}
