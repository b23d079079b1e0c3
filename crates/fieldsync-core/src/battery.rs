//! # Battery Interpolation
//!
//! Units report a raw pack voltage; the app shows a percentage. The mapping is
//! a piecewise-linear curve over a voltage table.
//!
//! ```text
//!  percent
//!   100 ┤                                   ●───── clamp
//!       │                              ●
//!    50 ┤               ●────●────●
//!       │        ●
//!     0 ┤ ●─────                       clamp below first point
//!       └─┬──────┬──────┬────┬────┬────┬────┬──▶ volts
//! ```

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Piecewise-linear voltage to percentage table.
///
/// Voltages are strictly increasing and percentages non-decreasing, so the
/// interpolated value is monotonic in voltage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatteryCurve {
    points: Vec<(f64, f64)>,
}

impl BatteryCurve {
    /// Builds a curve from `(voltage, percent)` points.
    pub fn new(points: Vec<(f64, f64)>) -> Result<Self, ValidationError> {
        if points.len() < 2 {
            return Err(ValidationError::InvalidBatteryCurve(
                "at least two points are required".into(),
            ));
        }

        for &(v, p) in &points {
            if !v.is_finite() || !p.is_finite() {
                return Err(ValidationError::InvalidBatteryCurve(format!(
                    "non-finite point ({v}, {p})"
                )));
            }
        }

        for pair in points.windows(2) {
            let (v0, p0) = pair[0];
            let (v1, p1) = pair[1];
            if v1 <= v0 {
                return Err(ValidationError::InvalidBatteryCurve(format!(
                    "voltages must increase: {v0} then {v1}"
                )));
            }
            if p1 < p0 {
                return Err(ValidationError::InvalidBatteryCurve(format!(
                    "percentages must not decrease: {p0} then {p1}"
                )));
            }
        }

        Ok(BatteryCurve { points })
    }

    /// Discharge curve for the units' 10-cell lithium-ion pack (30 V - 42 V).
    pub fn lithium_pack() -> Self {
        BatteryCurve {
            points: vec![
                (30.0, 0.0),
                (33.0, 5.0),
                (34.5, 10.0),
                (35.5, 20.0),
                (36.0, 30.0),
                (36.5, 40.0),
                (37.0, 50.0),
                (37.6, 60.0),
                (38.3, 70.0),
                (39.2, 80.0),
                (40.2, 90.0),
                (42.0, 100.0),
            ],
        }
    }

    /// Lowest percentage in the table.
    pub fn min_percent(&self) -> f64 {
        self.points[0].1
    }

    /// Highest percentage in the table.
    pub fn max_percent(&self) -> f64 {
        self.points[self.points.len() - 1].1
    }

    /// Interpolates the percentage for a voltage, clamping outside the table.
    pub fn percent(&self, voltage: f64) -> f64 {
        if voltage.is_nan() {
            return self.min_percent();
        }

        let (first_v, first_p) = self.points[0];
        if voltage <= first_v {
            return first_p;
        }

        let (last_v, last_p) = self.points[self.points.len() - 1];
        if voltage >= last_v {
            return last_p;
        }

        for pair in self.points.windows(2) {
            let (v0, p0) = pair[0];
            let (v1, p1) = pair[1];
            if voltage <= v1 {
                let t = (voltage - v0) / (v1 - v0);
                return p0 + t * (p1 - p0);
            }
        }

        last_p
    }
}

impl Default for BatteryCurve {
    fn default() -> Self {
        BatteryCurve::lithium_pack()
    }
}
