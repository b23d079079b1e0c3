//! # Great-Circle Geometry
//!
//! Distance math used by the geofence station matcher.
//!
//! ## Merge Radius
//! ```text
//!   merge_radius = min_separation / 2  +  2 × gps_accuracy
//!
//!   default:       60 m / 2 = 30 m     +  2 × accuracy
//!
//!        ┌──────────── merge radius ────────────┐
//!        │                                      │
//!   existing ●───────────── d ──────────────● new
//!
//!   d < merge_radius  →  same physical site, merge into existing
//! ```

use crate::types::Coords;

/// Mean Earth radius in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Haversine great-circle distance between two points, in meters.
///
/// Symmetric, and exactly zero for identical points.
#[must_use]
pub fn distance_m(a: Coords, b: Coords) -> f64 {
    const EPSILON: f64 = 1e-10;

    if (a.lat - b.lat).abs() < EPSILON && (a.lng - b.lng).abs() < EPSILON {
        return 0.0;
    }

    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let delta_lat = (b.lat - a.lat).to_radians();
    let delta_lng = (b.lng - a.lng).to_radians();

    let h = (delta_lat / 2.0).sin().powi(2)
        + lat1.cos() * lat2.cos() * (delta_lng / 2.0).sin().powi(2);

    // Rounding can push h a hair outside [0, 1]
    let h = h.clamp(0.0, 1.0);

    let c = 2.0 * h.sqrt().asin();
    let result = EARTH_RADIUS_M * c;

    if result.is_finite() {
        result
    } else {
        f64::MAX
    }
}

/// Radius under which two stations are considered the same site.
///
/// Negative or non-finite accuracy is treated as zero.
#[must_use]
pub fn merge_radius_m(min_separation_m: f64, accuracy_m: f64) -> f64 {
    let accuracy = if accuracy_m.is_finite() && accuracy_m > 0.0 {
        accuracy_m
    } else {
        0.0
    };
    min_separation_m / 2.0 + 2.0 * accuracy
}

/// Returns true if `b` lies strictly inside the merge radius around `a`.
#[must_use]
pub fn within_merge_radius(a: Coords, b: Coords, min_separation_m: f64, accuracy_m: f64) -> bool {
    distance_m(a, b) < merge_radius_m(min_separation_m, accuracy_m)
}
