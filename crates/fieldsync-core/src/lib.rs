//! # fieldsync-core: Pure Domain Logic for FieldSync
//!
//! This crate holds the domain model shared by the connectivity and offline
//! sync engine: field units, the artifacts they capture, and the monitoring
//! stations those artifacts are attached to. Everything here is a pure
//! function or plain data.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        FieldSync Architecture                           │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 Controlling App / apps/agent                    │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │          fieldsync-sync (discovery, AP, sync engine)            │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │             ★ fieldsync-core (THIS CRATE) ★                     │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │    geo    │  │  battery  │  │  events   │  │   │
//! │  │   │  Device   │  │ haversine │  │  voltage  │  │ grouping  │  │   │
//! │  │   │ Recording │  │  merge    │  │  curve    │  │ by (type, │  │   │
//! │  │   │ Location  │  │  radius   │  │           │  │  details) │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                 fieldsync-db (Database Layer)                   │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Domain types (Device, Recording, DeviceEvent, Location, ...)
//! - [`geo`] - Great-circle distance and the station merge radius
//! - [`battery`] - Voltage to percentage interpolation
//! - [`events`] - Grouping events for batched upload
//! - [`error`] - Domain error types
//! - [`validation`] - Input validation
//!
//! ## Example Usage
//!
//! ```rust
//! use fieldsync_core::geo::distance_m;
//! use fieldsync_core::Coords;
//!
//! let a = Coords::new(0.0, 0.0);
//! let b = Coords::new(0.0, 1.0);
//!
//! // One degree of longitude at the equator is roughly 111 km
//! let d = distance_m(a, b);
//! assert!((d - 111_195.0).abs() < 1_000.0);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod battery;
pub mod error;
pub mod events;
pub mod geo;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use battery::BatteryCurve;
pub use error::{CoreError, ValidationError};
pub use events::{group_events, EventGroup};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Default minimum distance allowed between two stations of the same group.
///
/// Half of this value is the base of the merge radius, so the default
/// gives a 30 m base radius.
pub const DEFAULT_MIN_STATION_SEPARATION_M: f64 = 60.0;

/// Maximum length of a station name.
pub const MAX_STATION_NAME_LEN: usize = 128;
