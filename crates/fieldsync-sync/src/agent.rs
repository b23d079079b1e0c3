//! # Field Agent
//!
//! Owns every long-running piece of the engine and their lifetimes.
//!
//! ## Agent Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        FieldAgent Architecture                          │
//! │                                                                         │
//! │   DiscoveryTransport ──events──► DiscoveryController ──upsert──►        │
//! │                                        │               DeviceRegistry   │
//! │                                        │ connected            │         │
//! │                                        ▼                      │ changes │
//! │                                  sync router                  ▼         │
//! │                                  (one task per unit)   AccessPoint      │
//! │                                        │               service          │
//! │                                        ▼                      │         │
//! │                                   SyncEngine ◄── uploads gate ┘         │
//! │                                                                         │
//! │  start():    active flag on, discovery loop, AP service, router,       │
//! │              AP state pump, prune interval, periodic sync_all           │
//! │  shutdown(): active flag off, stop discovery, stop AP service,         │
//! │              abort tasks, cancel update polls                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use fieldsync_core::Device;
use fieldsync_db::Database;

use crate::access_point::{AccessPointHandle, AccessPointService, ApState};
use crate::backend::{BackendApi, HttpBackendClient};
use crate::cache::DiagnosticCache;
use crate::config::SyncConfig;
use crate::diagnostics::DeviceDiagnostics;
use crate::discovery::{DiscoveryController, DiscoveryState};
use crate::emitter::{NoOpEmitter, SyncEventEmitter};
use crate::error::{SyncError, SyncResult};
use crate::geofence::{StationDraft, StationOutcome};
use crate::hotspot::{ApEvent, HotspotControl, UnsupportedHotspot};
use crate::prober::CapabilityProber;
use crate::registry::DeviceRegistry;
use crate::session::StaticSessionProvider;
use crate::sync::{SyncEngine, SyncReport};
use crate::transport::{DiscoveryTransport, StaticHostTransport};
use crate::unit::{HttpUnitClient, UnitApi};
use crate::update_monitor::UpdateMonitor;

/// Buffered connected-unit notifications between discovery and the router.
const CONNECTED_CHANNEL_SIZE: usize = 32;

// =============================================================================
// Agent Status
// =============================================================================

/// Snapshot of the agent for status queries.
#[derive(Debug, Clone)]
pub struct AgentStatus {
    pub running: bool,
    pub discovery: DiscoveryState,
    pub access_point: ApState,
    /// Units in the registry, connected or not.
    pub device_count: usize,
    pub connected_count: usize,
    pub last_report: Option<SyncReport>,
    pub last_error: Option<String>,
}

// =============================================================================
// Field Agent
// =============================================================================

/// Main agent that wires discovery, the access point machine and the
/// sync engine together.
pub struct FieldAgent {
    config: Arc<SyncConfig>,
    transport: Arc<dyn DiscoveryTransport>,
    unit: Arc<dyn UnitApi>,
    hotspot: Arc<dyn HotspotControl>,
    emitter: Arc<dyn SyncEventEmitter>,
    registry: DeviceRegistry,
    prober: CapabilityProber,
    diagnostics: DeviceDiagnostics,
    engine: SyncEngine,
    updates: UpdateMonitor,
    last_error: Arc<RwLock<Option<String>>>,

    /// Set while running.
    discovery: Option<Arc<DiscoveryController>>,
    access_point: Option<AccessPointHandle>,
    tasks: Vec<JoinHandle<()>>,
}

impl FieldAgent {
    pub fn builder(config: SyncConfig) -> FieldAgentBuilder {
        FieldAgentBuilder::new(config)
    }

    pub fn is_running(&self) -> bool {
        self.discovery.is_some()
    }

    /// Starts discovery and every background task. No-op while running.
    pub async fn start(&mut self) -> SyncResult<()> {
        if self.is_running() {
            debug!("Agent already running");
            return Ok(());
        }

        info!(
            environment = ?self.config.app.environment,
            backend = %self.config.backend_url(),
            "Starting field agent"
        );

        self.engine.set_active(true);

        let (connected_tx, connected_rx) = mpsc::channel(CONNECTED_CHANNEL_SIZE);
        let (rediscover_tx, rediscover_rx) = mpsc::channel(1);

        let (controller, events_rx) = DiscoveryController::new(
            self.config.clone(),
            self.transport.clone(),
            self.unit.clone(),
            self.registry.clone(),
            self.prober.clone(),
            connected_tx,
        );
        let controller = Arc::new(controller);

        let access_point = AccessPointService::new(
            self.config.access_point.clone(),
            self.hotspot.clone(),
            self.registry.clone(),
            rediscover_tx,
        )
        .start();

        self.tasks.push(tokio::spawn(controller.clone().run(
            events_rx,
            rediscover_rx,
            self.engine.subscribe_active(),
        )));
        self.tasks.push(tokio::spawn(Self::route_connected(
            self.engine.clone(),
            self.last_error.clone(),
            connected_rx,
        )));
        self.tasks.push(tokio::spawn(Self::pump_ap_state(
            self.engine.clone(),
            self.emitter.clone(),
            access_point.subscribe(),
        )));
        self.tasks.push(tokio::spawn(Self::prune_idle(
            self.registry.clone(),
            self.config.prune_idle(),
        )));
        self.tasks.push(tokio::spawn(Self::sync_periodically(
            self.engine.clone(),
            self.last_error.clone(),
            self.config.sync_interval(),
        )));

        if let Err(e) = controller.start().await {
            error!(error = %e, "Discovery did not start");
            self.record_error(&e).await;
        }

        self.discovery = Some(controller);
        self.access_point = Some(access_point);

        info!("Field agent started");
        Ok(())
    }

    /// Stops everything [`start`](Self::start) spawned. Safe to call twice.
    pub async fn shutdown(&mut self) -> SyncResult<()> {
        let Some(discovery) = self.discovery.take() else {
            debug!("Agent not running");
            return Ok(());
        };

        info!("Shutting down field agent");
        self.engine.set_active(false);

        if let Err(e) = discovery.shutdown().await {
            warn!(error = %e, "Failed to stop discovery");
        }
        if let Some(access_point) = self.access_point.take() {
            let _ = access_point.shutdown().await;
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.updates.cancel_all();

        info!("Field agent stopped");
        Ok(())
    }

    pub async fn status(&self) -> AgentStatus {
        let access_point = match &self.access_point {
            Some(handle) => handle.state().await,
            None => ApState::Default,
        };

        AgentStatus {
            running: self.is_running(),
            discovery: self
                .discovery
                .as_ref()
                .map(|d| d.state())
                .unwrap_or(DiscoveryState::Idle),
            access_point,
            device_count: self.registry.len().await,
            connected_count: self.registry.connected().await.len(),
            last_report: self.engine.last_report().await,
            last_error: self.last_error.read().await.clone(),
        }
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Runs a full sync cycle now.
    pub async fn sync_all(&self) -> SyncReport {
        self.engine.sync_all().await
    }

    /// Creates a station, merging it into a nearby one when it duplicates it.
    pub async fn create_station(&self, draft: StationDraft) -> SyncResult<StationOutcome> {
        self.engine
            .matcher()
            .create_station(self.engine.database(), draft)
            .await
    }

    /// Requests a connection to a unit's access point.
    pub async fn connect_to_device_ap(&self) -> SyncResult<()> {
        self.access_point()?.connect().await
    }

    pub async fn disconnect_from_device_ap(&self) -> SyncResult<()> {
        self.access_point()?.disconnect().await
    }

    /// Forwards an access point change the platform noticed on its own.
    pub async fn report_ap_event(&self, event: ApEvent) -> SyncResult<()> {
        self.access_point()?.report(event).await
    }

    /// Starts a software update on a connected unit.
    pub async fn trigger_update(&self, device_id: &str) -> SyncResult<()> {
        let device = self
            .registry
            .get(device_id)
            .await
            .filter(Device::is_connected)
            .ok_or_else(|| SyncError::Unreachable(device_id.to_string()))?;
        self.updates.trigger(&device).await
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn diagnostics(&self) -> &DeviceDiagnostics {
        &self.diagnostics
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    pub fn update_monitor(&self) -> &UpdateMonitor {
        &self.updates
    }

    fn access_point(&self) -> SyncResult<&AccessPointHandle> {
        self.access_point.as_ref().ok_or(SyncError::ShuttingDown)
    }

    async fn record_error(&self, err: &SyncError) {
        *self.last_error.write().await = Some(err.to_string());
        self.emitter.emit_error(&err.to_string());
    }

    // =========================================================================
    // Background Tasks
    // =========================================================================

    /// Syncs each newly connected unit on its own task. Dropping the
    /// router aborts every cycle it started.
    async fn route_connected(
        engine: SyncEngine,
        last_error: Arc<RwLock<Option<String>>>,
        mut connected_rx: mpsc::Receiver<Device>,
    ) {
        let mut cycles = JoinSet::new();

        loop {
            tokio::select! {
                maybe = connected_rx.recv() => {
                    let Some(device) = maybe else { break };
                    let engine = engine.clone();
                    let last_error = last_error.clone();
                    cycles.spawn(async move {
                        let report = engine.sync_device(&device).await;
                        if report.errors > 0 {
                            *last_error.write().await = Some(format!(
                                "{} item(s) failed while syncing unit {}",
                                report.errors, device.id
                            ));
                        }
                    });
                }
                Some(joined) = cycles.join_next() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!(error = %e, "Sync cycle panicked");
                        }
                    }
                }
            }
        }

        while cycles.join_next().await.is_some() {}
        debug!("Sync router stopped");
    }

    /// Mirrors AP state into the emitter and the upload gate.
    async fn pump_ap_state(
        engine: SyncEngine,
        emitter: Arc<dyn SyncEventEmitter>,
        mut state_rx: watch::Receiver<ApState>,
    ) {
        while state_rx.changed().await.is_ok() {
            let state = *state_rx.borrow_and_update();
            emitter.emit_ap_state(state);
            engine.set_uploads_allowed(state != ApState::Connected);
        }
    }

    /// Full cycles on a timer: pending uploads for every unit, reference
    /// images and stations. The first cycle runs at start.
    async fn sync_periodically(
        engine: SyncEngine,
        last_error: Arc<RwLock<Option<String>>>,
        every: Duration,
    ) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if !engine.is_active() {
                continue;
            }

            let report = engine.sync_all().await;
            debug!(
                uploaded = report.recordings_uploaded,
                images = report.images_synced,
                stations = report.stations_synced,
                errors = report.errors,
                "Periodic sync finished"
            );
            if report.errors > 0 {
                *last_error.write().await =
                    Some(format!("{} item(s) failed in periodic sync", report.errors));
            }
        }
    }

    async fn prune_idle(registry: DeviceRegistry, max_idle: Duration) {
        let mut ticker = tokio::time::interval(max_idle);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let removed = registry.prune(max_idle).await;
            if removed > 0 {
                debug!(removed, "Pruned idle units");
            }
        }
    }
}

impl Drop for FieldAgent {
    fn drop(&mut self) {
        self.engine.set_active(false);
        if let Some(discovery) = &self.discovery {
            discovery.close();
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.updates.cancel_all();
    }
}

// =============================================================================
// Builder Pattern
// =============================================================================

/// Builder for [`FieldAgent`]. Every collaborator except the database has
/// a production default.
pub struct FieldAgentBuilder {
    config: SyncConfig,
    db: Option<Database>,
    unit: Option<Arc<dyn UnitApi>>,
    backend: Option<Arc<dyn BackendApi>>,
    transport: Option<Arc<dyn DiscoveryTransport>>,
    hotspot: Option<Arc<dyn HotspotControl>>,
    emitter: Option<Arc<dyn SyncEventEmitter>>,
}

impl FieldAgentBuilder {
    pub fn new(config: SyncConfig) -> Self {
        FieldAgentBuilder {
            config,
            db: None,
            unit: None,
            backend: None,
            transport: None,
            hotspot: None,
            emitter: None,
        }
    }

    pub fn with_database(mut self, db: Database) -> Self {
        self.db = Some(db);
        self
    }

    pub fn with_unit_api(mut self, unit: Arc<dyn UnitApi>) -> Self {
        self.unit = Some(unit);
        self
    }

    pub fn with_backend(mut self, backend: Arc<dyn BackendApi>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn DiscoveryTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_hotspot(mut self, hotspot: Arc<dyn HotspotControl>) -> Self {
        self.hotspot = Some(hotspot);
        self
    }

    pub fn with_emitter(mut self, emitter: Arc<dyn SyncEventEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    pub fn build(self) -> SyncResult<FieldAgent> {
        self.config.validate()?;

        let db = self
            .db
            .ok_or_else(|| SyncError::InvalidConfig("Database required".into()))?;

        let unit: Arc<dyn UnitApi> = match self.unit {
            Some(unit) => unit,
            None => Arc::new(HttpUnitClient::new(&self.config.unit)?),
        };
        let backend: Arc<dyn BackendApi> = match self.backend {
            Some(backend) => backend,
            None => Arc::new(HttpBackendClient::new(
                self.config.backend_url(),
                Duration::from_secs(self.config.backend.request_timeout_secs),
                Arc::new(StaticSessionProvider::new(self.config.backend.token.clone())),
            )?),
        };
        let transport = self.transport.unwrap_or_else(|| {
            Arc::new(StaticHostTransport::new(
                self.config.discovery.static_hosts.clone(),
            ))
        });
        let hotspot = self.hotspot.unwrap_or_else(|| Arc::new(UnsupportedHotspot));
        let emitter = self.emitter.unwrap_or_else(|| Arc::new(NoOpEmitter));

        let config = Arc::new(self.config);
        let registry = DeviceRegistry::new();
        let cache = DiagnosticCache::new();
        let prober = CapabilityProber::new(
            unit.clone(),
            cache.clone(),
            Duration::from_secs(config.cache.capability_ttl_secs),
        );
        let diagnostics = DeviceDiagnostics::new(unit.clone(), cache, prober.clone(), &config.cache);
        let engine = SyncEngine::new(
            config.clone(),
            db,
            unit.clone(),
            backend,
            registry.clone(),
            emitter.clone(),
        );
        let updates = UpdateMonitor::new(&config.update, unit.clone(), emitter.clone());

        Ok(FieldAgent {
            config,
            transport,
            unit,
            hotspot,
            emitter,
            registry,
            prober,
            diagnostics,
            engine,
            updates,
            last_error: Arc::new(RwLock::new(None)),
            discovery: None,
            access_point: None,
            tasks: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeBackend, FakeUnit, FakeUnitDevice};
    use async_trait::async_trait;
    use fieldsync_core::ReferenceImageType;
    use fieldsync_db::DbConfig;
    use tempfile::TempDir;
    use tokio::time::sleep;

    const HOST: &str = "192.168.4.1";

    async fn agent(hosts: Vec<String>) -> (FieldAgent, Arc<FakeUnit>, Arc<FakeBackend>, TempDir) {
        let dir = TempDir::new().unwrap();
        let mut config = SyncConfig::default();
        config.app.data_dir = dir.path().to_path_buf();
        config.discovery.retry_delay_ms = 10;

        let unit = Arc::new(FakeUnit::new());
        let backend = Arc::new(FakeBackend::new());
        let db = Database::new(DbConfig::in_memory()).await.unwrap();

        let agent = FieldAgent::builder(config)
            .with_database(db)
            .with_unit_api(unit.clone())
            .with_backend(backend.clone())
            .with_transport(Arc::new(StaticHostTransport::new(hosts)))
            .build()
            .unwrap();

        (agent, unit, backend, dir)
    }

    #[tokio::test]
    async fn test_build_requires_database() {
        let err = FieldAgent::builder(SyncConfig::default())
            .build()
            .err()
            .expect("build without a database must fail");
        assert!(matches!(err, SyncError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_discovered_unit_is_synced() {
        let (mut agent, unit, backend, _dir) = agent(vec![HOST.into()]).await;
        let mut fake = FakeUnitDevice::new("100", "h1", "kea-watch");
        fake.recordings.insert("rec1.cptv".into(), b"thermal".to_vec());
        unit.serve(&format!("http://{HOST}"), fake);

        agent.start().await.unwrap();

        for _ in 0..200 {
            if !backend.state().uploaded_recordings.is_empty() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(
            backend.state().uploaded_recordings,
            vec![("100".to_string(), "rec1.cptv".to_string())]
        );
        let status = agent.status().await;
        assert!(status.running);
        assert_eq!(status.discovery, DiscoveryState::Discovering);
        assert_eq!(status.connected_count, 1);

        agent.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_and_shutdown_are_idempotent() {
        let (mut agent, _unit, _backend, _dir) = agent(Vec::new()).await;

        agent.start().await.unwrap();
        agent.start().await.unwrap();
        assert_eq!(agent.tasks.len(), 5);

        agent.shutdown().await.unwrap();
        agent.shutdown().await.unwrap();

        let status = agent.status().await;
        assert!(!status.running);
        assert_eq!(status.discovery, DiscoveryState::Idle);
        assert!(!agent.engine().is_active());
        assert!(matches!(
            agent.connect_to_device_ap().await,
            Err(SyncError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_started_agent_pushes_offline_station() {
        let (mut agent, _unit, backend, _dir) = agent(Vec::new()).await;
        let outcome = agent
            .create_station(StationDraft {
                name: "Ridge".into(),
                coords: fieldsync_core::Coords::new(-43.5, 172.6),
                accuracy_m: 5.0,
                group_name: "kea-watch".into(),
                is_prod_environment: true,
            })
            .await
            .unwrap();
        assert!(matches!(outcome, StationOutcome::Created(_)));

        agent.start().await.unwrap();

        for _ in 0..200 {
            if !backend.state().created_stations.is_empty() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(
            backend.state().created_stations,
            vec![("kea-watch".to_string(), "Ridge".to_string())]
        );
        agent.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_started_agent_pushes_staged_reference_image() {
        let (mut agent, _unit, backend, _dir) = agent(Vec::new()).await;
        let dev = crate::registry::tests::device("100", Some("h1"), "E1");
        agent
            .engine()
            .stage_reference_image(&dev, ReferenceImageType::Pov, b"jpeg", None)
            .await
            .unwrap();

        agent.start().await.unwrap();

        for _ in 0..200 {
            if !backend.state().uploaded_images.is_empty() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(
            backend.state().uploaded_images,
            vec![("100".to_string(), ReferenceImageType::Pov)]
        );
        agent.shutdown().await.unwrap();
    }

    struct JoinableHotspot;

    #[async_trait]
    impl HotspotControl for JoinableHotspot {
        async fn connect_to_device_ap(&self) -> SyncResult<()> {
            Ok(())
        }
        async fn disconnect_from_device_ap(&self) -> SyncResult<()> {
            Ok(())
        }
        async fn check_is_ap_connected(&self) -> SyncResult<bool> {
            Ok(true)
        }
    }

    #[tokio::test]
    async fn test_ap_link_pauses_uploads() {
        let dir = TempDir::new().unwrap();
        let mut config = SyncConfig::default();
        config.app.data_dir = dir.path().to_path_buf();
        let backend = Arc::new(FakeBackend::new());
        let mut agent = FieldAgent::builder(config)
            .with_database(Database::new(DbConfig::in_memory()).await.unwrap())
            .with_unit_api(Arc::new(FakeUnit::new()))
            .with_backend(backend.clone())
            .with_transport(Arc::new(StaticHostTransport::new(Vec::new())))
            .with_hotspot(Arc::new(JoinableHotspot))
            .build()
            .unwrap();
        agent.start().await.unwrap();

        let mut ap = agent.access_point().unwrap().subscribe();
        agent.connect_to_device_ap().await.unwrap();
        ap.wait_for(|s| *s == ApState::Connected).await.unwrap();

        // Give the state pump a moment to flip the gate.
        sleep(Duration::from_millis(50)).await;

        let recording = fieldsync_core::Recording {
            name: "a.cptv".into(),
            device: "200".into(),
            path: dir.path().join("a.cptv").display().to_string(),
            size: 4,
            is_prod_environment: true,
            is_uploaded: false,
            server_upload_id: None,
            created_at: chrono::Utc::now(),
        };
        tokio::fs::write(&recording.path, b"cptv").await.unwrap();
        agent.engine().database().recordings().insert(&recording).await.unwrap();

        let report = agent.sync_all().await;
        assert_eq!(report.recordings_uploaded, 0);
        assert!(backend.state().uploaded_recordings.is_empty());

        agent.shutdown().await.unwrap();
    }
}
