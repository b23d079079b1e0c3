//! # Hotspot Control
//!
//! Platform hook for joining a unit's own wifi access point. The access
//! point state machine drives it; the platform reports changes it did not
//! initiate (user switched networks, AP went down) as [`ApEvent`]s.

use async_trait::async_trait;

use crate::error::{SyncError, SyncResult};

/// Platform-side access point change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApEvent {
    /// The phone or host is now on the unit's AP.
    Connected,
    /// The AP connection dropped.
    Disconnected,
    /// The platform refused or failed a join attempt.
    ConnectFailed(String),
}

/// Joins and leaves a unit's access point.
#[async_trait]
pub trait HotspotControl: Send + Sync {
    /// Returns once the platform has joined the AP.
    async fn connect_to_device_ap(&self) -> SyncResult<()>;

    async fn disconnect_from_device_ap(&self) -> SyncResult<()>;

    /// Asks the platform whether the AP connection is still up.
    async fn check_is_ap_connected(&self) -> SyncResult<bool>;
}

/// Hotspot for hosts that cannot join access points.
///
/// Connect attempts fail, so the state machine falls straight back to
/// `Default`.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedHotspot;

#[async_trait]
impl HotspotControl for UnsupportedHotspot {
    async fn connect_to_device_ap(&self) -> SyncResult<()> {
        Err(SyncError::Internal(
            "joining a unit access point is not supported on this host".into(),
        ))
    }

    async fn disconnect_from_device_ap(&self) -> SyncResult<()> {
        Ok(())
    }

    async fn check_is_ap_connected(&self) -> SyncResult<bool> {
        Ok(false)
    }
}
