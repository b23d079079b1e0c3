//! # fieldsync-sync: Connectivity & Offline Sync Engine for FieldSync
//!
//! Finds field units on the local network, keeps a live registry of them,
//! pulls their recordings and events into the local store, and pushes
//! everything to the backend once internet is available.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Field Agent Architecture                         │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                    FieldAgent (Main Orchestrator)                │  │
//! │  │                                                                  │  │
//! │  │  Owns the active flag, spawns and cancels every task             │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │   Discovery    │  │  AccessPoint   │  │      SyncEngine        │    │
//! │  │   Controller   │  │  state machine │  │                        │    │
//! │  │                │  │                │  │ unit → local store     │    │
//! │  │ connect, probe │  │ join/leave the │  │ local store → backend  │    │
//! │  │ re-verify      │  │ unit's own AP  │  │ images, stations       │    │
//! │  └───────┬────────┘  └───────┬────────┘  └───────────┬────────────┘    │
//! │          │                   │                       │                  │
//! │          ▼                   ▼                       ▼                  │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │ DeviceRegistry (live units)   DiagnosticCache (TTL per unit)    │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! │  COLLABORATORS (traits):                                               │
//! │  • DiscoveryTransport  • UnitApi  • HotspotControl                     │
//! │  • BackendApi  • SessionProvider  • SyncEventEmitter                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! ### Lifecycle
//! - [`agent`] - `FieldAgent` start/shutdown and status
//! - [`config`] - TOML configuration with environment overrides
//! - [`error`] - Sync error types
//! - [`emitter`] - Notification hook for the host app
//!
//! ### Units
//! - [`registry`] - Live device registry
//! - [`transport`] - Discovery transport trait and static hosts
//! - [`discovery`] - Connect, probe and re-verify units
//! - [`unit`] - Unit HTTP API
//! - [`prober`] - Capability probing
//! - [`cache`] / [`diagnostics`] - TTL cache and the diagnostics facade
//! - [`hotspot`] / [`access_point`] - Joining a unit's own access point
//! - [`update_monitor`] - Software update polling
//!
//! ### Backend
//! - [`backend`] - Backend REST API
//! - [`session`] - Bearer token sessions
//! - [`sync`] - The offline sync engine
//! - [`geofence`] - Station merge rules
//!
//! ### Utilities
//! - [`retry`] - Fixed and exponential retry
//! - [`rate_limit`] - Debounce
//!
//! ## Usage
//!
//! ```rust,ignore
//! use fieldsync_sync::{FieldAgent, SyncConfig};
//! use fieldsync_db::{Database, DbConfig};
//!
//! let config = SyncConfig::load_or_default(None)?;
//! let db = Database::new(DbConfig::new(config.app.data_dir.join("fieldsync.db"))).await?;
//!
//! let mut agent = FieldAgent::builder(config).with_database(db).build()?;
//! agent.start().await?;
//!
//! let status = agent.status().await;
//! println!("Units: {}", status.device_count);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod agent;
pub mod config;
pub mod emitter;
pub mod error;

pub mod access_point;
pub mod cache;
pub mod diagnostics;
pub mod discovery;
pub mod hotspot;
pub mod prober;
pub mod registry;
pub mod transport;
pub mod unit;
pub mod update_monitor;

pub mod backend;
pub mod geofence;
pub mod session;
pub mod sync;

pub mod rate_limit;
pub mod retry;

#[cfg(test)]
mod testing;

// =============================================================================
// Re-exports
// =============================================================================

pub use agent::{AgentStatus, FieldAgent, FieldAgentBuilder};
pub use config::{Environment, SyncConfig};
pub use emitter::{LogEmitter, NoOpEmitter, SyncEventEmitter};
pub use error::{SyncError, SyncResult};

pub use access_point::{AccessPointHandle, AccessPointService, ApState};
pub use diagnostics::DeviceDiagnostics;
pub use discovery::{DiscoveryController, DiscoveryState};
pub use hotspot::{ApEvent, HotspotControl, UnsupportedHotspot};
pub use registry::DeviceRegistry;
pub use transport::{DiscoveryEvent, DiscoveryTransport, StaticHostTransport};
pub use unit::{HttpUnitClient, UnitApi};
pub use update_monitor::UpdateMonitor;

pub use backend::{BackendApi, HttpBackendClient};
pub use geofence::{StationDraft, StationMatcher, StationOutcome};
pub use session::{RefreshOutcome, SessionProvider, StaticSessionProvider, TokenSession};
pub use sync::{SyncEngine, SyncReport};
