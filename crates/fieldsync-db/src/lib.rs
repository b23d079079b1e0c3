//! # fieldsync-db: Local Record Store for FieldSync
//!
//! SQLite-backed CRUD for the records the sync engine reconciles with the
//! backend. Each record type gets its own repository keyed the way the
//! domain model describes.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        FieldSync Data Flow                              │
//! │                                                                         │
//! │  Sync engine (fieldsync-sync)                                          │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                   fieldsync-db (THIS CRATE)                     │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌──────────────────┐   ┌─────────────┐  │   │
//! │  │   │   Database    │    │  Repositories    │   │ Migrations  │  │   │
//! │  │   │   (pool.rs)   │    │                  │   │ (embedded)  │  │   │
//! │  │   │               │◄───│ RecordingRepo    │   │ 001_init    │  │   │
//! │  │   │  SqlitePool   │    │ EventRepo        │   │             │  │   │
//! │  │   │               │    │ LocationRepo     │   │             │  │   │
//! │  │   │               │    │ ReferenceImgRepo │   │             │  │   │
//! │  │   └───────────────┘    └──────────────────┘   └─────────────┘  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use fieldsync_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("fieldsync.db")).await?;
//! let pending = db.recordings().pending_upload("100").await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

pub use repository::event::EventRepository;
pub use repository::location::LocationRepository;
pub use repository::recording::RecordingRepository;
pub use repository::reference_image::ReferenceImageRepository;
