//! # Discovery Controller
//!
//! Turns transport announcements into registry entries.
//!
//! ## Connection Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Discovery Controller                             │
//! │                                                                         │
//! │  ServiceFound(endpoint, host)                                           │
//! │       │                                                                 │
//! │       ├── endpoint already connecting? ──► drop                         │
//! │       ▼                                                                 │
//! │  race device-info:  http://<endpoint>.local   vs   http://<host>        │
//! │       │             (first success wins, retried with a fixed delay)    │
//! │       ▼                                                                 │
//! │  probe capabilities + battery ──► registry.upsert ──► connected_tx      │
//! │                                                     (triggers sync)     │
//! │                                                                         │
//! │  ServiceLost(endpoint)                                                  │
//! │       └── cached URL check fails AND raw host check fails               │
//! │                 ──► registry.mark_disconnected                          │
//! │                                                                         │
//! │  Every rediscovery interval: restart the transport and re-verify every  │
//! │  connected unit the same way.                                           │
//! │                                                                         │
//! │  shutdown(): close, abort every spawned connect/verify/restart task,    │
//! │  stop the transport. A closed controller never starts again.            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures_util::future::select_ok;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use fieldsync_core::{BatteryCurve, ConnectionState, Device};

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::prober::CapabilityProber;
use crate::registry::DeviceRegistry;
use crate::retry::{retry_any, RetryPolicy};
use crate::transport::{DiscoveryEvent, DiscoveryTransport};
use crate::unit::{UnitApi, UnitInfo};

/// Buffer size for transport events.
const EVENT_CHANNEL_SIZE: usize = 64;

/// Whether the transport is currently browsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    Idle,
    Discovering,
}

/// Drives a [`DiscoveryTransport`] and keeps the [`DeviceRegistry`] current.
pub struct DiscoveryController {
    config: Arc<SyncConfig>,
    transport: Arc<dyn DiscoveryTransport>,
    unit: Arc<dyn UnitApi>,
    registry: DeviceRegistry,
    prober: CapabilityProber,
    battery_curve: BatteryCurve,
    state: watch::Sender<DiscoveryState>,
    in_flight: Mutex<HashSet<String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
    events_tx: mpsc::Sender<DiscoveryEvent>,
    connected_tx: mpsc::Sender<Device>,
}

impl DiscoveryController {
    /// Creates the controller and the receiver its [`run`](Self::run) loop
    /// consumes.
    pub fn new(
        config: Arc<SyncConfig>,
        transport: Arc<dyn DiscoveryTransport>,
        unit: Arc<dyn UnitApi>,
        registry: DeviceRegistry,
        prober: CapabilityProber,
        connected_tx: mpsc::Sender<Device>,
    ) -> (Self, mpsc::Receiver<DiscoveryEvent>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let (state, _) = watch::channel(DiscoveryState::Idle);

        let controller = DiscoveryController {
            config,
            transport,
            unit,
            registry,
            prober,
            battery_curve: BatteryCurve::lithium_pack(),
            state,
            in_flight: Mutex::new(HashSet::new()),
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            events_tx,
            connected_tx,
        };
        (controller, events_rx)
    }

    pub fn state(&self) -> DiscoveryState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<DiscoveryState> {
        self.state.subscribe()
    }

    /// Starts the transport. No-op while already discovering, refused once
    /// the controller is shut down.
    pub async fn start(&self) -> SyncResult<()> {
        if self.is_closed() {
            debug!("Discovery is shut down, not starting");
            return Err(SyncError::ShuttingDown);
        }

        let started = self.state.send_if_modified(|state| {
            if *state == DiscoveryState::Idle {
                *state = DiscoveryState::Discovering;
                true
            } else {
                false
            }
        });

        if !started {
            debug!("Discovery already running");
            return Ok(());
        }

        if let Err(e) = self.transport.discover(self.events_tx.clone()).await {
            error!(error = %e, "Failed to start discovery");
            self.state.send_replace(DiscoveryState::Idle);
            return Err(e);
        }

        info!("Discovery started");
        Ok(())
    }

    pub async fn stop(&self) -> SyncResult<()> {
        let result = self.transport.stop_discover().await;
        self.state.send_replace(DiscoveryState::Idle);
        info!("Discovery stopped");
        result
    }

    /// Closes the controller and stops the transport. Safe to call twice.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.close();
        self.stop().await
    }

    /// Marks the controller closed and aborts every task it spawned.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);

        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in &tasks {
            task.abort();
        }
        debug!(aborted = tasks.len(), "Discovery tasks cancelled");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of spawned tasks that have not finished yet.
    pub fn pending_tasks(&self) -> usize {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|task| !task.is_finished());
        tasks.len()
    }

    /// Restarts the transport so every unit on the network is announced
    /// again.
    pub async fn rediscover(&self) -> SyncResult<()> {
        if let Err(e) = self.stop().await {
            warn!(error = %e, "Failed to stop discovery before restart");
        }
        self.start().await
    }

    /// Processes transport events, rediscovery triggers and the periodic
    /// safety net until `active` turns false.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<DiscoveryEvent>,
        mut triggers: mpsc::Receiver<()>,
        mut active: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(self.config.rediscovery_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        info!("Discovery loop started");

        loop {
            tokio::select! {
                Some(event) = events.recv() => {
                    self.handle_event(event);
                }
                Some(()) = triggers.recv() => {
                    debug!("Rediscovery requested");
                    self.spawn_rediscover();
                }
                _ = ticker.tick() => {
                    self.spawn_rediscover();
                    self.spawn_recheck();
                }
                changed = active.changed() => {
                    if changed.is_err() || !*active.borrow() {
                        break;
                    }
                }
            }
        }

        if let Err(e) = self.shutdown().await {
            warn!(error = %e, "Failed to stop discovery");
        }
        info!("Discovery loop stopped");
    }

    /// Dispatches one transport event. Connection work runs on spawned tasks.
    pub fn handle_event(self: &Arc<Self>, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::ServiceFound { endpoint, host } => {
                if !self.begin_connect(&endpoint) {
                    debug!(endpoint = %endpoint, "Connection attempt already in flight");
                    return;
                }

                let this = Arc::clone(self);
                self.track(async move {
                    if let Err(e) = this.connect(&endpoint, &host).await {
                        warn!(endpoint = %endpoint, host = %host, error = %e, "Could not connect to unit");
                    }
                    this.end_connect(&endpoint);
                });
            }
            DiscoveryEvent::ServiceLost { endpoint } => {
                let this = Arc::clone(self);
                self.track(async move { this.handle_lost(&endpoint).await });
            }
            DiscoveryEvent::ServiceFailed { endpoint, message } => {
                warn!(endpoint = %endpoint, message = %message, "Service could not be resolved");
            }
            DiscoveryEvent::DiscoveryError { message, fatal } => {
                if fatal {
                    error!(message = %message, "Discovery failed, waiting for next restart");
                    self.state.send_replace(DiscoveryState::Idle);
                } else {
                    warn!(message = %message, "Discovery error");
                }
            }
        }
    }

    /// Resolves a unit, probes it and registers it as connected.
    pub async fn connect(&self, endpoint: &str, host: &str) -> SyncResult<Device> {
        let candidates = self.candidate_urls(endpoint, host);
        let policy = RetryPolicy::fixed(
            self.config.discovery.connect_attempts,
            Duration::from_millis(self.config.discovery.retry_delay_ms),
        );

        let (url, info) = retry_any(policy, || self.race(&candidates)).await?;

        let capabilities = self.prober.probe(&info.id, &url).await;
        let battery_percent = match self.unit.get_battery_voltage(&url).await {
            Ok(voltage) => voltage.map(|v| self.battery_curve.percent(v)),
            Err(e) => {
                debug!(device_id = %info.id, error = %e, "Battery read failed");
                None
            }
        };

        let device = Device {
            is_prod_environment: self.is_prod_server(info.server_url.as_deref()),
            id: info.id,
            hardware_id: info.hardware_id,
            host: host.to_string(),
            name: info.name,
            group: info.group,
            connection_state: ConnectionState::Connected,
            endpoint: endpoint.to_string(),
            url,
            capabilities,
            last_seen_at: Utc::now(),
            battery_percent,
        };

        self.registry.upsert(device.clone()).await;
        info!(
            device_id = %device.id,
            name = %device.name,
            url = %device.url,
            "Unit connected"
        );

        if self.connected_tx.send(device.clone()).await.is_err() {
            debug!("Connected-device channel closed");
        }
        Ok(device)
    }

    /// Returns true unless both the cached URL and the raw host fail the
    /// device-info check.
    pub async fn is_reachable(&self, device: &Device) -> bool {
        if self.unit.get_device_info(&device.url).await.is_ok() {
            return true;
        }

        let host_url = self.host_url(&device.host);
        if host_url != device.url && self.unit.get_device_info(&host_url).await.is_ok() {
            return true;
        }

        false
    }

    /// Re-verifies every connected unit.
    pub async fn recheck_connected(&self) {
        for device in self.registry.connected().await {
            self.verify(&device).await;
        }
    }

    async fn handle_lost(&self, endpoint: &str) {
        match self.registry.find_by_endpoint(endpoint).await {
            Some(device) if device.is_connected() => self.verify(&device).await,
            _ => debug!(endpoint = %endpoint, "Lost service was not connected"),
        }
    }

    async fn verify(&self, device: &Device) {
        if self.is_reachable(device).await {
            self.registry.touch(&device.id, None).await;
        } else {
            let err = SyncError::Unreachable(device.host.clone());
            info!(device_id = %device.id, error = %err, "Marking unit disconnected");
            self.registry.mark_disconnected(&device.id).await;
        }
    }

    async fn race(&self, candidates: &[String]) -> SyncResult<(String, UnitInfo)> {
        let attempts = candidates.iter().map(|url| {
            let unit = self.unit.clone();
            let url = url.clone();
            Box::pin(async move {
                let info = unit.get_device_info(&url).await?;
                Ok::<_, SyncError>((url, info))
            })
        });

        let (winner, _) = select_ok(attempts).await?;
        Ok(winner)
    }

    /// mDNS-style URL first (when the endpoint is a host label), then the
    /// raw host.
    fn candidate_urls(&self, endpoint: &str, host: &str) -> Vec<String> {
        let mut urls = Vec::with_capacity(2);

        let label = endpoint.split('.').next().unwrap_or_default();
        let is_label = !label.is_empty()
            && label != host
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-');
        if is_label {
            urls.push(self.host_url(&format!("{label}{}", self.config.unit.mdns_suffix)));
        }

        urls.push(self.host_url(host));
        urls.dedup();
        urls
    }

    fn host_url(&self, host: &str) -> String {
        match self.config.unit.port {
            80 => format!("http://{host}"),
            port => format!("http://{host}:{port}"),
        }
    }

    /// A unit is on the test backend only if it names the configured test URL.
    fn is_prod_server(&self, server_url: Option<&str>) -> bool {
        let host_of = |u: &str| url::Url::parse(u).ok().and_then(|u| u.host_str().map(str::to_owned));

        match (server_url.and_then(host_of), host_of(&self.config.backend.test_url)) {
            (Some(unit_host), Some(test_host)) => unit_host != test_host,
            _ => true,
        }
    }

    fn begin_connect(&self, endpoint: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(endpoint.to_string())
    }

    fn end_connect(&self, endpoint: &str) {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(endpoint);
    }

    fn spawn_rediscover(self: &Arc<Self>) {
        let this = Arc::clone(self);
        self.track(async move {
            if let Err(e) = this.rediscover().await {
                warn!(error = %e, "Rediscovery failed");
            }
        });
    }

    fn spawn_recheck(self: &Arc<Self>) {
        let this = Arc::clone(self);
        self.track(async move { this.recheck_connected().await });
    }

    /// Spawns `work` so [`shutdown`](Self::shutdown) can abort it. Dropped
    /// once the controller is closed.
    fn track<F>(&self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if self.is_closed() {
            debug!("Discovery is shut down, dropping task");
            return;
        }
        tasks.retain(|task| !task.is_finished());
        tasks.push(tokio::spawn(work));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DiagnosticCache;
    use crate::testing::{FakeUnit, FakeUnitDevice};
    use crate::transport::StaticHostTransport;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingTransport {
        discovers: AtomicU32,
    }

    #[async_trait]
    impl DiscoveryTransport for CountingTransport {
        async fn discover(&self, _events: mpsc::Sender<DiscoveryEvent>) -> SyncResult<()> {
            self.discovers.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn stop_discover(&self) -> SyncResult<()> {
            Ok(())
        }
    }

    struct Fixture {
        controller: Arc<DiscoveryController>,
        unit: Arc<FakeUnit>,
        registry: DeviceRegistry,
        connected_rx: mpsc::Receiver<Device>,
    }

    fn fixture(transport: Arc<dyn DiscoveryTransport>) -> Fixture {
        let mut config = SyncConfig::default();
        config.discovery.retry_delay_ms = 10;
        let unit = Arc::new(FakeUnit::new());
        let registry = DeviceRegistry::new();
        let prober = CapabilityProber::new(unit.clone(), DiagnosticCache::new(), Duration::from_secs(300));
        let (connected_tx, connected_rx) = mpsc::channel(8);

        let (controller, _events) = DiscoveryController::new(
            Arc::new(config),
            transport,
            unit.clone(),
            registry.clone(),
            prober,
            connected_tx,
        );

        Fixture {
            controller: Arc::new(controller),
            unit,
            registry,
            connected_rx,
        }
    }

    fn static_fixture() -> Fixture {
        fixture(Arc::new(StaticHostTransport::new(Vec::new())))
    }

    #[tokio::test]
    async fn test_found_unit_is_registered_and_announced() {
        let mut fx = static_fixture();
        let mut fake = FakeUnitDevice::new("100", "h1", "kea-watch");
        fake.battery_voltage = Some(42.0);
        fx.unit.serve("http://10.0.0.5", fake);

        fx.controller.handle_event(DiscoveryEvent::ServiceFound {
            endpoint: "tc-100".into(),
            host: "10.0.0.5".into(),
        });

        let device = fx.connected_rx.recv().await.unwrap();
        assert_eq!(device.id, "100");
        assert_eq!(device.url, "http://10.0.0.5");
        assert_eq!(device.endpoint, "tc-100");
        assert!(device.is_prod_environment);
        assert_eq!(device.battery_percent, Some(100.0));
        assert!(fx.registry.get("100").await.unwrap().is_connected());
    }

    #[tokio::test]
    async fn test_mdns_candidate_wins_when_it_answers() {
        let fx = static_fixture();
        fx.unit
            .serve("http://tc-100.local", FakeUnitDevice::new("100", "h1", "kea-watch"));

        let device = fx.controller.connect("tc-100", "10.0.0.5").await.unwrap();
        assert_eq!(device.url, "http://tc-100.local");
        assert_eq!(device.host, "10.0.0.5");
    }

    #[tokio::test]
    async fn test_concurrent_found_events_connect_once() {
        let mut fx = static_fixture();
        fx.unit
            .serve("http://10.0.0.5", FakeUnitDevice::new("100", "h1", "kea-watch"));

        let endpoint = StaticHostTransport::endpoint_for("10.0.0.5");
        for _ in 0..3 {
            fx.controller.handle_event(DiscoveryEvent::ServiceFound {
                endpoint: endpoint.clone(),
                host: "10.0.0.5".into(),
            });
        }

        fx.connected_rx.recv().await.unwrap();
        assert_eq!(fx.unit.call_count("get_device_info"), 1);
        assert_eq!(fx.registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_reregistered_unit_replaces_old_entry() {
        let fx = static_fixture();
        fx.unit
            .serve("http://10.0.0.5", FakeUnitDevice::new("100", "h1", "kea-watch"));
        fx.controller.connect("static:10.0.0.5", "10.0.0.5").await.unwrap();

        fx.unit
            .serve("http://10.0.0.5", FakeUnitDevice::new("101", "h1", "kea-watch"));
        fx.controller.connect("static:10.0.0.5", "10.0.0.5").await.unwrap();

        let all = fx.registry.snapshot().await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, "101");
        assert!(all[0].is_connected());
    }

    #[tokio::test]
    async fn test_lost_needs_both_checks_to_fail() {
        let fx = static_fixture();
        fx.unit
            .serve("http://tc-100.local", FakeUnitDevice::new("100", "h1", "kea-watch"));
        fx.unit
            .serve("http://10.0.0.5", FakeUnitDevice::new("100", "h1", "kea-watch"));
        fx.controller.connect("tc-100", "10.0.0.5").await.unwrap();

        // mDNS name stops resolving but the raw host still answers.
        fx.unit.unplug("http://tc-100.local");
        fx.controller.handle_lost("tc-100").await;
        assert!(fx.registry.get("100").await.unwrap().is_connected());

        fx.unit.unplug("http://10.0.0.5");
        fx.controller.handle_lost("tc-100").await;
        assert!(!fx.registry.get("100").await.unwrap().is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_unit_is_retried_then_dropped() {
        let fx = static_fixture();

        let err = fx
            .controller
            .connect("static:10.0.0.9", "10.0.0.9")
            .await
            .unwrap_err();

        assert!(err.is_unreachable());
        assert_eq!(fx.unit.call_count("get_device_info"), 3);
        assert!(fx.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let transport = Arc::new(CountingTransport {
            discovers: AtomicU32::new(0),
        });
        let fx = fixture(transport.clone());

        fx.controller.start().await.unwrap();
        fx.controller.start().await.unwrap();
        assert_eq!(transport.discovers.load(Ordering::SeqCst), 1);
        assert_eq!(fx.controller.state(), DiscoveryState::Discovering);

        fx.controller.rediscover().await.unwrap();
        assert_eq!(transport.discovers.load(Ordering::SeqCst), 2);

        fx.controller.stop().await.unwrap();
        assert_eq!(fx.controller.state(), DiscoveryState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_aborts_pending_connect() {
        let mut fx = static_fixture();

        // Nothing answers yet, so the connect task sits in its retry delay.
        fx.controller.handle_event(DiscoveryEvent::ServiceFound {
            endpoint: "static:10.0.0.5".into(),
            host: "10.0.0.5".into(),
        });
        assert_eq!(fx.controller.pending_tasks(), 1);

        fx.controller.shutdown().await.unwrap();
        assert_eq!(fx.controller.pending_tasks(), 0);

        fx.unit
            .serve("http://10.0.0.5", FakeUnitDevice::new("100", "h1", "kea-watch"));
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(fx.registry.is_empty().await);
        assert!(fx.connected_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_controller_never_restarts_transport() {
        let transport = Arc::new(CountingTransport {
            discovers: AtomicU32::new(0),
        });
        let fx = fixture(transport.clone());

        fx.controller.start().await.unwrap();
        fx.controller.shutdown().await.unwrap();
        assert!(fx.controller.is_closed());
        assert_eq!(fx.controller.state(), DiscoveryState::Idle);

        fx.controller.spawn_rediscover();
        fx.controller.spawn_recheck();
        assert_eq!(fx.controller.pending_tasks(), 0);

        assert!(matches!(fx.controller.start().await, Err(SyncError::ShuttingDown)));
        assert!(fx.controller.rediscover().await.is_err());
        assert_eq!(transport.discovers.load(Ordering::SeqCst), 1);
        assert_eq!(fx.controller.state(), DiscoveryState::Idle);
    }

    #[tokio::test]
    async fn test_loop_exit_closes_controller() {
        let transport = Arc::new(CountingTransport {
            discovers: AtomicU32::new(0),
        });
        let fx = fixture(transport.clone());
        let (_events_tx, events_rx) = mpsc::channel(1);
        let (_triggers_tx, triggers_rx) = mpsc::channel(1);
        let (active_tx, active_rx) = watch::channel(true);

        let run = tokio::spawn(fx.controller.clone().run(events_rx, triggers_rx, active_rx));
        fx.controller.start().await.unwrap();

        active_tx.send_replace(false);
        run.await.unwrap();

        assert!(fx.controller.is_closed());
        fx.controller.handle_event(DiscoveryEvent::ServiceLost {
            endpoint: "static:10.0.0.5".into(),
        });
        assert_eq!(fx.controller.pending_tasks(), 0);
        assert_eq!(transport.discovers.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_test_backend_units_are_not_prod() {
        let fx = static_fixture();
        assert!(fx.controller.is_prod_server(Some("https://api.fieldsync.org")));
        assert!(!fx.controller.is_prod_server(Some("https://api-test.fieldsync.org/")));
        assert!(fx.controller.is_prod_server(None));
    }
}
