//! # Access Point State Machine
//!
//! Tracks the host's direct wifi link to a unit's own access point.
//!
//! ## State Transitions
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Access Point State Machine                          │
//! │                                                                         │
//! │  ┌─────────┐ connect  ┌────────────────┐   ok    ┌───────────┐          │
//! │  │ Default │ ───────► │ LoadingConnect │ ──────► │ Connected │          │
//! │  └────▲────┘          └───────┬────────┘         └─────┬─────┘          │
//! │       │   fail / 2 min timeout│                        │ disconnect     │
//! │       ◄───────────────────────┘                        ▼                │
//! │       │                                   ┌───────────────────┐         │
//! │       │  fail / 30 s timeout              │ LoadingDisconnect │         │
//! │       ◄───────────────────────────────────┴─────────┬─────────┘         │
//! │       │                                             │ ok                │
//! │       │        next connect      ┌──────────────┐   │                   │
//! │       └──────────────────────────┤ Disconnected │ ◄─┘                   │
//! │                                  └──────────────┘                       │
//! │                                                                         │
//! │  • Connect is debounced and ignored while Connected / LoadingConnect.   │
//! │  • Reaching Connected triggers rediscovery.                             │
//! │  • Registry empties while Connected: ask the platform, flip to          │
//! │    Disconnected only if it says the AP link is gone.                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::AccessPointSettings;
use crate::error::{SyncError, SyncResult};
use crate::hotspot::{ApEvent, HotspotControl};
use crate::rate_limit::Debounce;
use crate::registry::DeviceRegistry;

// =============================================================================
// State
// =============================================================================

/// Access point link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApState {
    #[default]
    Default,
    LoadingConnect,
    Connected,
    LoadingDisconnect,
    Disconnected,
}

impl ApState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApState::Default => "default",
            ApState::LoadingConnect => "loadingConnect",
            ApState::Connected => "connected",
            ApState::LoadingDisconnect => "loadingDisconnect",
            ApState::Disconnected => "disconnected",
        }
    }

    /// Whether the machine may move from `self` to `next`.
    pub fn can_transition_to(&self, next: ApState) -> bool {
        use ApState::*;
        matches!(
            (self, next),
            (Default, LoadingConnect)
                | (LoadingConnect, Connected)
                | (LoadingConnect, Default)
                | (Connected, LoadingDisconnect)
                | (Connected, Disconnected)
                | (LoadingDisconnect, Disconnected)
                | (LoadingDisconnect, Default)
                | (Disconnected, Default)
        )
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, ApState::LoadingConnect | ApState::LoadingDisconnect)
    }
}

impl fmt::Display for ApState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Service & Handle
// =============================================================================

/// Hotspot call the service has handed off to a worker task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkOp {
    Join,
    Leave,
}

/// Result of a hotspot call, tagged with the attempt that started it.
#[derive(Debug)]
struct LinkDone {
    attempt: u64,
    op: LinkOp,
    result: SyncResult<()>,
}

struct InFlight {
    attempt: u64,
    task: JoinHandle<()>,
}

/// Runs the state machine on its own task.
///
/// Hotspot calls run on worker tasks so that platform events and commands
/// are handled while a join or leave is pending.
pub struct AccessPointService {
    settings: AccessPointSettings,
    hotspot: Arc<dyn HotspotControl>,
    registry: DeviceRegistry,
    state: Arc<RwLock<ApState>>,
    state_tx: watch::Sender<ApState>,
    rediscover_tx: mpsc::Sender<()>,
    done_tx: mpsc::Sender<LinkDone>,
    done_rx: mpsc::Receiver<LinkDone>,
    attempt: u64,
    in_flight: Option<InFlight>,
}

/// Handle for driving the access point service.
#[derive(Clone)]
pub struct AccessPointHandle {
    state: Arc<RwLock<ApState>>,
    state_rx: watch::Receiver<ApState>,
    cmd_tx: mpsc::Sender<ApCommand>,
    debounce: Arc<Debounce>,
}

/// Commands accepted by the access point service.
#[derive(Debug)]
pub enum ApCommand {
    Connect,
    Disconnect,
    /// Change reported by the platform.
    Platform(ApEvent),
    Shutdown,
}

impl AccessPointHandle {
    pub async fn state(&self) -> ApState {
        *self.state.read().await
    }

    pub fn subscribe(&self) -> watch::Receiver<ApState> {
        self.state_rx.clone()
    }

    /// Requests a connection to the unit's AP.
    ///
    /// Calls inside the debounce window after an accepted one are dropped.
    pub async fn connect(&self) -> SyncResult<()> {
        if !self.debounce.try_acquire() {
            debug!("AP connect debounced");
            return Ok(());
        }

        self.send(ApCommand::Connect).await
    }

    pub async fn disconnect(&self) -> SyncResult<()> {
        self.send(ApCommand::Disconnect).await
    }

    /// Forwards a platform-side change.
    pub async fn report(&self, event: ApEvent) -> SyncResult<()> {
        self.send(ApCommand::Platform(event)).await
    }

    pub async fn shutdown(&self) -> SyncResult<()> {
        self.send(ApCommand::Shutdown).await
    }

    async fn send(&self, cmd: ApCommand) -> SyncResult<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| SyncError::ChannelError("AP command channel closed".into()))
    }
}

impl AccessPointService {
    /// `rediscover_tx` is pinged every time the link comes up.
    pub fn new(
        settings: AccessPointSettings,
        hotspot: Arc<dyn HotspotControl>,
        registry: DeviceRegistry,
        rediscover_tx: mpsc::Sender<()>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ApState::Default);
        let (done_tx, done_rx) = mpsc::channel(4);

        AccessPointService {
            settings,
            hotspot,
            registry,
            state: Arc::new(RwLock::new(ApState::Default)),
            state_tx,
            rediscover_tx,
            done_tx,
            done_rx,
            attempt: 0,
            in_flight: None,
        }
    }

    /// Spawns the state machine and returns a handle to it.
    pub fn start(self) -> AccessPointHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);

        let handle = AccessPointHandle {
            state: self.state.clone(),
            state_rx: self.state_tx.subscribe(),
            cmd_tx,
            debounce: Arc::new(Debounce::new(Duration::from_millis(self.settings.debounce_ms))),
        };

        tokio::spawn(async move {
            self.run(cmd_rx).await;
        });

        handle
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<ApCommand>) {
        let mut registry_rx = self.registry.subscribe();
        info!("Access point service started");

        loop {
            tokio::select! {
                Some(cmd) = cmd_rx.recv() => {
                    match cmd {
                        ApCommand::Shutdown => break,
                        ApCommand::Connect => self.handle_connect().await,
                        ApCommand::Disconnect => self.handle_disconnect().await,
                        ApCommand::Platform(event) => self.handle_platform_event(event).await,
                    }
                }
                Some(done) = self.done_rx.recv() => {
                    self.handle_link_done(done).await;
                }
                Ok(()) = registry_rx.changed() => {
                    self.handle_registry_change().await;
                }
                else => break,
            }
        }

        self.cancel_in_flight();
        info!("Access point service stopped");
    }

    async fn handle_connect(&mut self) {
        let current = self.current().await;
        match current {
            ApState::Connected | ApState::LoadingConnect => {
                debug!(state = %current, "AP connect ignored");
                return;
            }
            ApState::LoadingDisconnect => {
                debug!("AP connect ignored while disconnecting");
                return;
            }
            ApState::Disconnected => self.transition(ApState::Default).await,
            ApState::Default => {}
        }

        self.transition(ApState::LoadingConnect).await;
        self.begin(LinkOp::Join);
    }

    async fn handle_disconnect(&mut self) {
        let current = self.current().await;
        if current != ApState::Connected {
            debug!(state = %current, "AP disconnect ignored");
            return;
        }

        self.transition(ApState::LoadingDisconnect).await;
        self.begin(LinkOp::Leave);
    }

    /// Runs a hotspot call on a worker task. Its result comes back through
    /// `done_rx` tagged with a fresh attempt number.
    fn begin(&mut self, op: LinkOp) {
        self.cancel_in_flight();
        self.attempt += 1;
        let attempt = self.attempt;

        let limit = Duration::from_secs(match op {
            LinkOp::Join => self.settings.connect_timeout_secs,
            LinkOp::Leave => self.settings.disconnect_timeout_secs,
        });
        let hotspot = self.hotspot.clone();
        let done_tx = self.done_tx.clone();

        let task = tokio::spawn(async move {
            let call = async {
                match op {
                    LinkOp::Join => hotspot.connect_to_device_ap().await,
                    LinkOp::Leave => hotspot.disconnect_from_device_ap().await,
                }
            };
            let result = match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => Err(SyncError::Timeout(limit.as_secs())),
            };
            let _ = done_tx.send(LinkDone { attempt, op, result }).await;
        });

        self.in_flight = Some(InFlight { attempt, task });
    }

    fn cancel_in_flight(&mut self) {
        if let Some(in_flight) = self.in_flight.take() {
            debug!(attempt = in_flight.attempt, "Cancelling AP call");
            in_flight.task.abort();
        }
    }

    async fn handle_link_done(&mut self, done: LinkDone) {
        if self.in_flight.as_ref().map(|f| f.attempt) != Some(done.attempt) {
            debug!(attempt = done.attempt, "Ignoring superseded AP result");
            return;
        }
        self.in_flight = None;

        let current = self.current().await;
        match (done.op, done.result) {
            (LinkOp::Join, Ok(())) => {
                if current == ApState::LoadingConnect {
                    self.on_link_up().await;
                }
            }
            (LinkOp::Join, Err(e)) => {
                warn!(error = %e, "AP connect failed");
                if current == ApState::LoadingConnect {
                    self.transition(ApState::Default).await;
                }
            }
            (LinkOp::Leave, Ok(())) => {
                if current == ApState::LoadingDisconnect {
                    self.transition(ApState::Disconnected).await;
                }
            }
            (LinkOp::Leave, Err(e)) => {
                warn!(error = %e, "AP disconnect failed");
                if current == ApState::LoadingDisconnect {
                    self.transition(ApState::Default).await;
                }
            }
        }
    }

    async fn handle_platform_event(&mut self, event: ApEvent) {
        let current = self.current().await;
        debug!(state = %current, ?event, "Platform AP event");

        match event {
            ApEvent::Connected => match current {
                ApState::Connected => {}
                ApState::LoadingConnect => {
                    self.cancel_in_flight();
                    self.on_link_up().await;
                }
                ApState::Default | ApState::Disconnected => {
                    if current == ApState::Disconnected {
                        self.transition(ApState::Default).await;
                    }
                    self.transition(ApState::LoadingConnect).await;
                    self.on_link_up().await;
                }
                ApState::LoadingDisconnect => {}
            },
            ApEvent::Disconnected => {
                if matches!(current, ApState::Connected | ApState::LoadingDisconnect) {
                    self.cancel_in_flight();
                    self.transition(ApState::Disconnected).await;
                }
            }
            ApEvent::ConnectFailed(message) => {
                if current == ApState::LoadingConnect {
                    warn!(message = %message, "Platform reported AP connect failure");
                    self.cancel_in_flight();
                    self.transition(ApState::Default).await;
                }
            }
        }
    }

    /// Devices vanished while the link is up: confirm with the platform
    /// before declaring the link gone.
    async fn handle_registry_change(&self) {
        if self.current().await != ApState::Connected {
            return;
        }
        if !self.registry.connected().await.is_empty() {
            return;
        }

        match self.hotspot.check_is_ap_connected().await {
            Ok(true) => debug!("No units visible but AP link is still up"),
            Ok(false) => {
                info!("AP link lost");
                self.transition(ApState::Disconnected).await;
            }
            Err(e) => {
                warn!(error = %e, "AP link check failed");
                self.transition(ApState::Disconnected).await;
            }
        }
    }

    async fn on_link_up(&self) {
        self.transition(ApState::Connected).await;
        if self.rediscover_tx.try_send(()).is_err() {
            debug!("Rediscovery already pending");
        }
    }

    async fn current(&self) -> ApState {
        *self.state.read().await
    }

    async fn transition(&self, next: ApState) {
        let mut state = self.state.write().await;
        if !state.can_transition_to(next) {
            warn!(from = %*state, to = %next, "Rejected AP transition");
            return;
        }

        info!(from = %*state, to = %next, "AP state changed");
        *state = next;
        self.state_tx.send_replace(next);
    }
}
