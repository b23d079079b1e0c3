//! # Discovery Transport
//!
//! Seam between the discovery controller and whatever finds units on the
//! local network (mDNS/DNS-SD on a phone, a static host list on a
//! daemon).
//!
//! ```text
//! ┌──────────────────────┐  discover(tx)   ┌──────────────────────────────┐
//! │ DiscoveryController  │ ──────────────► │ DiscoveryTransport           │
//! │                      │                 │  (mDNS, static hosts, test)  │
//! │        events_rx ◄───┼─────────────────┤  ServiceFound / ServiceLost  │
//! └──────────────────────┘   mpsc          │  ServiceFailed / Error       │
//!                                          └──────────────────────────────┘
//! ```

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::{SyncError, SyncResult};

/// Event published by a discovery transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// A unit announced itself.
    ServiceFound {
        /// Service name, also used as the mDNS host label.
        endpoint: String,
        /// Resolved host, usually an IPv4 address.
        host: String,
    },
    /// A previously announced unit went away.
    ServiceLost { endpoint: String },
    /// A service was seen but could not be resolved.
    ServiceFailed { endpoint: String, message: String },
    /// The transport itself failed.
    ///
    /// A fatal error stops discovery until the next restart.
    DiscoveryError { message: String, fatal: bool },
}

/// Finds units on the local network.
#[async_trait]
pub trait DiscoveryTransport: Send + Sync {
    /// Starts publishing events on `events`. Calling it while already
    /// running must not duplicate announcements.
    async fn discover(&self, events: mpsc::Sender<DiscoveryEvent>) -> SyncResult<()>;

    /// Stops publishing events.
    async fn stop_discover(&self) -> SyncResult<()>;
}

// =============================================================================
// Static Host Transport
// =============================================================================

/// Announces a fixed list of hosts once per `discover` call.
///
/// Used by the headless agent where no platform mDNS browser is available.
#[derive(Debug, Default)]
pub struct StaticHostTransport {
    hosts: Vec<String>,
    running: AtomicBool,
}

impl StaticHostTransport {
    pub fn new(hosts: Vec<String>) -> Self {
        StaticHostTransport {
            hosts,
            running: AtomicBool::new(false),
        }
    }

    /// Endpoint name used for a static host.
    pub fn endpoint_for(host: &str) -> String {
        format!("static:{host}")
    }
}

#[async_trait]
impl DiscoveryTransport for StaticHostTransport {
    async fn discover(&self, events: mpsc::Sender<DiscoveryEvent>) -> SyncResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("Static discovery already running");
            return Ok(());
        }

        info!(hosts = self.hosts.len(), "Announcing static hosts");
        for host in &self.hosts {
            events
                .send(DiscoveryEvent::ServiceFound {
                    endpoint: Self::endpoint_for(host),
                    host: host.clone(),
                })
                .await
                .map_err(|_| SyncError::ChannelError("discovery event channel closed".into()))?;
        }

        Ok(())
    }

    async fn stop_discover(&self) -> SyncResult<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }
}
