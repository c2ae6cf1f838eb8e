//! The device session coordinator.
//!
//! Owns one [`PairingStore`] and one [`Transport`] per device, opens a
//! single live connection on first use, and shares it across every
//! protocol session: the heartbeat loop, the one debug session, the
//! app-service operations, and the syslog relay. Background loops are
//! tracked so [`shutdown`](SessionCoordinator::shutdown) can cancel
//! them without leaking tasks.
//!
//! Construct with dependencies injected; tests wire in fake transports
//! and several coordinators can coexist in one process.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tracing::info;

use crate::bundle::BundleId;
use crate::catalog::AppCatalogService;
use crate::debug::{DebugHandle, DebugPhase, DebugSession, DebugTarget};
use crate::error::LinkError;
use crate::heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatService, HeartbeatState};
use crate::icon::{DecodedIcon, IconDecoder, IconService, PngIconDecoder};
use crate::launch::LaunchService;
use crate::pairing::{PairingCredential, PairingStore};
use crate::syslog::{RelayState, SyslogEvent, SyslogRelay};
use crate::transport::{ChannelKind, Connection, SharedChannel, Transport};

// ── ConnectionHealth ─────────────────────────────────────────────

/// Snapshot of the link and every session's status.
///
/// Failures are reported per sub-channel; nothing reconnects
/// automatically, so callers use this to drive their own policy.
#[derive(Debug, Clone)]
pub struct ConnectionHealth {
    /// Whether a device connection is currently held.
    pub connected: bool,
    pub heartbeat: HeartbeatState,
    pub syslog: RelayState,
    pub debug: DebugPhase,
}

// ── SessionCoordinator ───────────────────────────────────────────

/// Façade over every protocol session of one paired device.
pub struct SessionCoordinator {
    pairing: PairingStore,
    transport: Arc<dyn Transport>,
    icon_decoder: Arc<dyn IconDecoder>,
    connection: Mutex<Option<Arc<dyn Connection>>>,
    app_channel: Mutex<Option<SharedChannel>>,
    heartbeat: HeartbeatService,
    relay: SyslogRelay,
    debug: DebugSession,
}

impl SessionCoordinator {
    pub fn new(pairing: PairingStore, transport: Arc<dyn Transport>) -> Self {
        Self {
            pairing,
            transport,
            icon_decoder: Arc::new(PngIconDecoder),
            connection: Mutex::new(None),
            app_channel: Mutex::new(None),
            heartbeat: HeartbeatService::new(HeartbeatConfig::default()),
            relay: SyslogRelay::new(),
            debug: DebugSession::new(),
        }
    }

    /// Override the heartbeat tuning. Call before the first start.
    pub fn with_heartbeat_config(mut self, config: HeartbeatConfig) -> Self {
        self.heartbeat = HeartbeatService::new(config);
        self
    }

    /// Swap the icon decoder.
    pub fn with_icon_decoder(mut self, decoder: Arc<dyn IconDecoder>) -> Self {
        self.icon_decoder = decoder;
        self
    }

    // ── Connection management ────────────────────────────────────

    /// Resolve the pairing credential (cached after first success).
    pub async fn pairing_file(&self) -> Result<PairingCredential, LinkError> {
        self.pairing.get_pairing().await
    }

    /// The single live connection, opened on first use.
    async fn connection(&self) -> Result<Arc<dyn Connection>, LinkError> {
        let mut slot = self.connection.lock().await;
        if let Some(connection) = slot.as_ref() {
            return Ok(connection.clone());
        }

        let credential = self.pairing.get_pairing().await?;
        match self.transport.open(&credential).await {
            Ok(connection) => {
                info!(udid = %credential.udid, "device connection opened");
                let connection: Arc<dyn Connection> = Arc::from(connection);
                *slot = Some(connection.clone());
                Ok(connection)
            }
            Err(e) => {
                if matches!(e, LinkError::PairingInvalid(_)) {
                    // The credential was rejected; force re-discovery.
                    self.pairing.invalidate().await;
                }
                Err(e)
            }
        }
    }

    /// The shared app-service sub-channel, opened on first use.
    async fn app_channel(&self) -> Result<SharedChannel, LinkError> {
        let mut slot = self.app_channel.lock().await;
        if let Some(channel) = slot.as_ref() {
            return Ok(channel.clone());
        }

        let connection = self.connection().await?;
        let channel = connection.open_channel(ChannelKind::AppService).await?;
        let shared = SharedChannel::new(channel);
        *slot = Some(shared.clone());
        Ok(shared)
    }

    /// Current link and session status.
    pub async fn connection_health(&self) -> ConnectionHealth {
        ConnectionHealth {
            connected: self.connection.lock().await.is_some(),
            heartbeat: self.heartbeat.state(),
            syslog: self.relay.state(),
            debug: self.debug.phase(),
        }
    }

    /// Cancel every active loop and session, then drop the connection.
    pub async fn shutdown(&self) {
        self.heartbeat.stop().await;
        self.relay.stop().await;
        self.debug.detach().await;
        self.app_channel.lock().await.take();
        self.connection.lock().await.take();
        info!("coordinator shut down");
    }

    // ── Heartbeat ────────────────────────────────────────────────

    /// Start the keep-alive loop, replacing any previous one.
    pub async fn start_heartbeat(
        &self,
    ) -> Result<mpsc::UnboundedReceiver<HeartbeatEvent>, LinkError> {
        let connection = self.connection().await?;
        let channel = connection.open_channel(ChannelKind::Heartbeat).await?;
        Ok(self.heartbeat.start(channel).await)
    }

    pub async fn stop_heartbeat(&self) {
        self.heartbeat.stop().await;
    }

    pub fn heartbeat_state(&self) -> HeartbeatState {
        self.heartbeat.state()
    }

    // ── Debug session ────────────────────────────────────────────

    /// Attach to an app by bundle identifier, launching it suspended.
    pub async fn attach_debug_by_bundle_id(
        &self,
        bundle_id: &BundleId,
    ) -> Result<DebugHandle, LinkError> {
        self.attach(DebugTarget::Bundle(bundle_id.clone())).await
    }

    /// Attach to an already-running process.
    pub async fn attach_debug_by_pid(&self, pid: u32) -> Result<DebugHandle, LinkError> {
        self.attach(DebugTarget::Pid(pid)).await
    }

    async fn attach(&self, target: DebugTarget) -> Result<DebugHandle, LinkError> {
        // Cheap pre-check before opening a channel; the session slot
        // re-checks atomically.
        if self.debug.is_active().await {
            return Err(LinkError::SessionBusy);
        }

        let connection = self.connection().await?;
        let channel = connection.open_channel(ChannelKind::Debug).await?;
        let catalog = AppCatalogService::new(self.app_channel().await?);
        self.debug.attach(target, channel, catalog).await
    }

    /// End the active debug session, leaving the target running.
    pub async fn detach_debug(&self) {
        self.debug.detach().await;
    }

    pub fn debug_phase(&self) -> DebugPhase {
        self.debug.phase()
    }

    // ── App service ──────────────────────────────────────────────

    pub async fn list_user_apps(&self) -> Result<BTreeMap<BundleId, String>, LinkError> {
        AppCatalogService::new(self.app_channel().await?)
            .list_user_apps()
            .await
    }

    pub async fn list_all_apps(&self) -> Result<BTreeMap<BundleId, String>, LinkError> {
        AppCatalogService::new(self.app_channel().await?)
            .list_all_apps()
            .await
    }

    pub async fn list_hidden_system_apps(&self) -> Result<BTreeMap<BundleId, String>, LinkError> {
        AppCatalogService::new(self.app_channel().await?)
            .list_hidden_system_apps()
            .await
    }

    pub async fn app_icon(&self, bundle_id: &BundleId) -> Result<DecodedIcon, LinkError> {
        IconService::new(self.app_channel().await?, self.icon_decoder.clone())
            .icon(bundle_id)
            .await
    }

    pub async fn launch_without_debug(&self, bundle_id: &BundleId) -> Result<(), LinkError> {
        LaunchService::new(self.app_channel().await?)
            .launch_without_debug(bundle_id)
            .await
    }

    // ── Syslog relay ─────────────────────────────────────────────

    /// Start streaming device logs, restarting any active stream.
    pub async fn start_syslog_relay(
        &self,
    ) -> Result<mpsc::UnboundedReceiver<SyslogEvent>, LinkError> {
        let connection = self.connection().await?;
        let channel = connection.open_channel(ChannelKind::Syslog).await?;
        Ok(self.relay.start(channel).await)
    }

    /// Stop the relay. Idempotent; no event arrives after it returns.
    pub async fn stop_syslog_relay(&self) {
        self.relay.stop().await;
    }

    pub fn syslog_state(&self) -> RelayState {
        self.relay.state()
    }
}

// ── Tests ────────────────────────────────────────────────────────
