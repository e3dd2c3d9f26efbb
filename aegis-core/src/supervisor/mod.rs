//! Connection supervisor: the connect/keep-connection state machine
//!
//! Owns the required-state variable (Disconnect/Connect/KeepConnection),
//! runs the pause/resume timer, drives the connect→monitor→reconnect loop
//! and fans tunnel state transitions out to the firewall, split-tunnel and
//! client-notification subsystems.
//!
//! Concurrency model: every connect attempt spawns its helper tasks
//! (firewall watchdogs, state forwarder, route-change receiver, health
//! monitor) under an attempt-scoped stop signal; `disconnect()` blocks until
//! the whole attempt has torn down, so rapid connect/disconnect cycles never
//! leak tasks.

mod attempt;
mod events;
mod health;
#[cfg(test)]
pub(crate) mod testutil;

pub use events::VpnEventSink;
pub use health::BackendConnectivityCheckState;

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;

use crate::dns::{AntiTrackerMetadata, DnsManager, DnsSettings};
use crate::firewall::{FirewallCoordinator, KillSwitchStatus};
use crate::netchange::NetChangeDetector;
use crate::netinfo;
use crate::obfs::{ObfsLauncher, ObfsTransport, ObfsTransportType, OriginalServerInfo};
use crate::preferences::PreferencesStore;
use crate::session::{AccountStatus, RemoteSessionApi};
use crate::splittun::{SplitTunnelApplyContext, SplitTunnelCoordinator};
use crate::vpn::{
    ConnectionParams, TunnelBuilder, TunnelProcess, TunnelSpec, TunnelState, TunnelStateInfo,
    VpnError, VpnResult, VpnType,
};

/// The VPN state the supervisor is required to reach.
///
/// `Connect` means "establish once"; promoted to `KeepConnection` the moment
/// the tunnel reaches Connected, so any later unexpected drop triggers an
/// automatic retry. `Disconnect` suppresses all retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequiredState {
    Disconnect = 0,
    Connect = 1,
    KeepConnection = 2,
}

/// Atomic cell for [`RequiredState`].
pub(crate) struct RequiredStateCell(AtomicU8);

impl RequiredStateCell {
    fn new() -> Self {
        Self(AtomicU8::new(RequiredState::Disconnect as u8))
    }

    pub(crate) fn get(&self) -> RequiredState {
        match self.0.load(Ordering::SeqCst) {
            1 => RequiredState::Connect,
            2 => RequiredState::KeepConnection,
            _ => RequiredState::Disconnect,
        }
    }

    pub(crate) fn set(&self, state: RequiredState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    /// Connect → KeepConnection, leaving any other value untouched.
    pub(crate) fn promote_connected(&self) {
        let _ = self.0.compare_exchange(
            RequiredState::Connect as u8,
            RequiredState::KeepConnection as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }
}

/// Additional information about the current VPN connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct VpnSessionInfo {
    pub outbound_ipv4: Option<IpAddr>,
    pub outbound_ipv6: Option<IpAddr>,
    pub vpn_local_ipv4: Option<IpAddr>,
    pub vpn_local_ipv6: Option<IpAddr>,
}

/// Pause window: non-`None` `pause_till` means paused.
#[derive(Debug, Default)]
struct PauseWindow {
    pause_till: Option<DateTime<Utc>>,
    /// Kill-switch state before the pause, to restore on resume.
    pre_pause_firewall_enabled: bool,
}

/// Platform behavior switches.
#[derive(Debug, Clone, Copy)]
pub struct PlatformFlags {
    /// The OS requires the firewall to be visibly enabled before the tunnel
    /// may start (coexistence ordering requirement).
    pub require_firewall_before_tunnel: bool,
}

impl Default for PlatformFlags {
    fn default() -> Self {
        Self {
            require_firewall_before_tunnel: cfg!(windows),
        }
    }
}

/// Everything the supervisor needs from the outside world.
pub struct SupervisorDeps {
    pub prefs: Arc<PreferencesStore>,
    pub api: Arc<dyn RemoteSessionApi>,
    pub firewall: Arc<dyn FirewallCoordinator>,
    pub split_tunnel: Arc<dyn SplitTunnelCoordinator>,
    pub net_change: Arc<dyn NetChangeDetector>,
    pub dns: Arc<dyn DnsManager>,
    pub tunnel_builder: Arc<dyn TunnelBuilder>,
    pub obfs_launcher: Option<Arc<dyn ObfsLauncher>>,
    pub platform: PlatformFlags,
}

pub struct ConnectionSupervisor {
    prefs: Arc<PreferencesStore>,
    api: Arc<dyn RemoteSessionApi>,
    firewall: Arc<dyn FirewallCoordinator>,
    split_tunnel: Arc<dyn SplitTunnelCoordinator>,
    net_change: Arc<dyn NetChangeDetector>,
    dns: Arc<dyn DnsManager>,
    tunnel_builder: Arc<dyn TunnelBuilder>,
    obfs_launcher: Option<Arc<dyn ObfsLauncher>>,
    platform: PlatformFlags,

    event_sink: RwLock<Option<Arc<dyn VpnEventSink>>>,

    required_state: RequiredStateCell,

    /// The single tunnel handle; `None` means disconnected.
    tunnel: Mutex<Option<Arc<dyn TunnelProcess>>>,

    /// Serializes physical connect attempts.
    connect_lock: tokio::sync::Mutex<()>,

    /// Completion signal of the in-flight attempt; `disconnect()` blocks on
    /// it until teardown finished.
    attempt_done: Mutex<Option<watch::Receiver<bool>>>,

    pause_lock: tokio::sync::Mutex<()>,
    pause_state: Mutex<PauseWindow>,

    session_info: Mutex<VpnSessionInfo>,

    /// Connection settings received while connected are parked here and
    /// persisted only after the tunnel later disconnects.
    parked_params: Mutex<Option<ConnectionParams>>,

    health: health::HealthMonitorState,

    daemon_stopping: AtomicBool,
}

impl ConnectionSupervisor {
    pub fn new(deps: SupervisorDeps) -> Arc<Self> {
        Arc::new(Self {
            prefs: deps.prefs,
            api: deps.api,
            firewall: deps.firewall,
            split_tunnel: deps.split_tunnel,
            net_change: deps.net_change,
            dns: deps.dns,
            tunnel_builder: deps.tunnel_builder,
            obfs_launcher: deps.obfs_launcher,
            platform: deps.platform,
            event_sink: RwLock::new(None),
            required_state: RequiredStateCell::new(),
            tunnel: Mutex::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
            attempt_done: Mutex::new(None),
            pause_lock: tokio::sync::Mutex::new(()),
            pause_state: Mutex::new(PauseWindow::default()),
            session_info: Mutex::new(VpnSessionInfo::default()),
            parked_params: Mutex::new(None),
            health: health::HealthMonitorState::new(),
            daemon_stopping: AtomicBool::new(false),
        })
    }

    pub fn set_event_sink(&self, sink: Arc<dyn VpnEventSink>) {
        *self.event_sink.write() = Some(sink);
    }

    pub fn mark_daemon_stopping(&self) {
        self.daemon_stopping.store(true, Ordering::SeqCst);
    }

    pub fn is_daemon_stopping(&self) -> bool {
        self.daemon_stopping.load(Ordering::SeqCst)
    }

    // ---------------------------------------------------------------------
    // Public connection lifecycle
    // ---------------------------------------------------------------------

    /// Establish a connection and keep it up until an explicit disconnect.
    ///
    /// Runs the whole retry loop: the call returns when the connection ends
    /// for good. Only the *first* attempt's error is returned; errors of
    /// automatic retries are reported asynchronously through the event sink.
    pub async fn connect(self: &Arc<Self>, params: ConnectionParams) -> VpnResult<()> {
        // erase any parked live-reconfiguration update from a previous run
        *self.parked_params.lock() = None;

        let result = self.connect_inner(params).await;

        // apply settings received while the VPN was connected
        let parked = self.parked_params.lock().take();
        if let Some(parked) = parked {
            if parked.check_is_defined().is_ok() {
                if let Err(e) = self.store_connection_params(&parked) {
                    error!("Failed to store parked connection settings: {e}");
                }
            }
        }

        result
    }

    async fn connect_inner(self: &Arc<Self>, mut params: ConnectionParams) -> VpnResult<()> {
        // keep last used connection params
        if let Err(e) = self.set_connection_params(params.clone()) {
            error!("Failed to store connection settings: {e}");
        }

        let prefs = self.prefs.snapshot();
        let can_reconfigure_other_vpns =
            params.can_reconfigure_other_vpns_once || prefs.permission_reconfigure_other_vpns;

        // if the account is inactive or the subscription looks expired -
        // refresh the account status from the backend first
        if prefs.account.is_stale() {
            if let Ok(status) = self.request_session_status().await {
                // refresh succeeded: enforce the actual status.
                // refresh failed: do nothing and keep connecting.
                if !status.active {
                    if Utc::now().timestamp() >= status.active_until {
                        return Err(VpnError::SubscriptionExpired);
                    }
                    return Err(VpnError::SubscriptionNotActive);
                }
            }
        }

        params.validate(true, &self.prefs.snapshot().account)?;

        // candidate lists are kept so every retry can draw a fresh host pair
        let candidates = params.clone();
        params
            .normalize_hosts()
            .map_err(|e| VpnError::Validation(format!("failed to normalize hosts: {e}")))?;

        // obfuscation side-channel: rewrite the effective endpoint to the
        // local proxy, remember the original for client-facing reporting
        let mut original_server: Option<OriginalServerInfo> = None;
        let mut obfs: Option<Arc<dyn ObfsTransport>> = None;
        if params.obfs_transport.is_active() {
            let (updated, transport, original) = self.start_obfs(&params).await?;
            params = updated;
            obfs = Some(transport);
            original_server = Some(original);
        }

        if params.vpn_type == VpnType::WireGuard {
            // A failed key regeneration is tolerated while the active keys
            // are still within their grace period.
            let session = &self.prefs.snapshot().session;
            if !session.wg_keys_usable() {
                if let Some(obfs) = &obfs {
                    let _ = obfs.stop().await;
                }
                return Err(VpnError::Tunnel(
                    "WireGuard credentials are stale (please regenerate keys or re-login)"
                        .to_string(),
                ));
            }
        }

        let firewall_on = params.firewall_on;
        let firewall_during_connection = params.firewall_on_during_connection;
        let manual_dns = params.manual_dns.clone();
        let anti_tracker = params.anti_tracker.clone();

        let result = self
            .keep_connection(
                original_server,
                params,
                candidates,
                manual_dns,
                anti_tracker,
                firewall_on,
                firewall_during_connection,
                obfs.clone(),
                can_reconfigure_other_vpns,
            )
            .await;

        if let Some(obfs) = obfs {
            if let Err(e) = obfs.stop().await {
                error!("Failed to stop obfuscation transport: {e}");
            }
        }

        result
    }

    /// Disconnect and block until the in-flight attempt fully tore down.
    /// Idempotent: returns Ok immediately when no tunnel exists.
    pub async fn disconnect(&self) -> VpnResult<()> {
        self.required_state.set(RequiredState::Disconnect);
        // resume a paused connection first, without a "resumed" notification
        if let Err(e) = self.resume_silent().await {
            error!("Resume failed: {e}");
        }
        self.disconnect_inner().await
    }

    /// Tear the active tunnel down without touching the required state.
    /// When the required state is KeepConnection the retry loop re-attempts.
    pub(crate) async fn disconnect_inner(&self) -> VpnResult<()> {
        let tunnel = self.tunnel.lock().clone();
        let Some(tunnel) = tunnel else {
            return Ok(());
        };

        if self.required_state.get() == RequiredState::KeepConnection {
            info!("Disconnecting (going to reconnect)...");
        } else {
            info!("Disconnecting...");
        }

        // capture the completion signal before triggering teardown
        let done = self.attempt_done.lock().clone();

        // monitors first: some are prone to lengthy waits
        self.health.request_stop();
        self.net_change.uninit();

        tunnel
            .disconnect()
            .await
            .map_err(|e| VpnError::Tunnel(format!("failed to disconnect VPN: {e}")))?;

        if let Some(mut done) = done {
            let _ = done.wait_for(|finished| *finished).await;
        }

        Ok(())
    }

    /// Trigger a reconnect by disconnecting; the retry loop's KeepConnection
    /// state performs the actual re-attempt.
    pub async fn reconnect(&self) -> VpnResult<()> {
        if self.is_daemon_stopping() {
            warn!("Reconnect ignored: daemon is stopping");
            return Ok(());
        }
        self.disconnect_inner().await
    }

    pub fn connected_or_connecting(&self) -> bool {
        self.tunnel.lock().is_some()
    }

    /// Connected tunnel protocol, if a tunnel process exists.
    pub fn connected_type(&self) -> Option<VpnType> {
        self.tunnel.lock().as_ref().map(|t| t.vpn_type())
    }

    // ---------------------------------------------------------------------
    // Pause / resume
    // ---------------------------------------------------------------------

    pub async fn pause(self: &Arc<Self>, duration_seconds: u32) -> VpnResult<()> {
        let tunnel = self
            .tunnel
            .lock()
            .clone()
            .ok_or_else(|| VpnError::Tunnel("VPN not connected".to_string()))?;

        if duration_seconds == 0 {
            return Err(VpnError::Validation(
                "the duration of the pause has not been specified".to_string(),
            ));
        }

        let result = self.pause_inner(tunnel, duration_seconds).await;
        self.sink_on_vpn_pause_changed();
        result
    }

    async fn pause_inner(
        self: &Arc<Self>,
        tunnel: Arc<dyn TunnelProcess>,
        duration_seconds: u32,
    ) -> VpnResult<()> {
        let _guard = self.pause_lock.lock().await;

        let fw_status = self
            .firewall
            .status()
            .await
            .map_err(|e| VpnError::Firewall(format!("failed to check kill-switch status: {e}")))?;
        self.pause_state.lock().pre_pause_firewall_enabled = fw_status.is_enabled;

        // a persistent firewall is left alone; a non-persistent one would
        // block all traffic while paused, so it is forced off
        if fw_status.is_enabled && !fw_status.is_persistent {
            info!("Disabling non-persistent firewall for the pause");
            self.set_kill_switch_state(false).await?;
        }

        info!("Pausing...");
        self.firewall.client_paused();

        tunnel.pause().await?;

        let till = Utc::now() + chrono::Duration::seconds(i64::from(duration_seconds));
        self.pause_state.lock().pause_till = Some(till);
        info!("Paused for {duration_seconds}s (till {till})");

        // pause changes effective reachability
        if !self.prefs.snapshot().full_tunnel_enabled {
            if let Err(e) = self.apply_split_tunnel_config().await {
                error!("{e}");
            }
        }

        let sup = self.clone();
        tokio::spawn(async move { sup.resume_ticker(duration_seconds).await });

        Ok(())
    }

    /// 1-second ticker that resumes automatically once wall-clock time
    /// passes the pause deadline. Wall clock (not a timer) so time spent in
    /// system sleep counts against the pause.
    async fn resume_ticker(self: Arc<Self>, duration_seconds: u32) {
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;

            if !self.is_paused() {
                self.pause_state.lock().pause_till = None;
                break;
            }

            let due = matches!(self.paused_till(), Some(till) if Utc::now() >= till);
            if !due {
                continue;
            }

            info!("Automatic resuming after {duration_seconds}s ...");

            // after system sleep the network interfaces may not be ready yet
            let mut last_log: Option<std::time::Instant> = None;
            loop {
                if !self.is_paused() || netinfo::outbound_ip(false).is_ok() {
                    break;
                }
                if last_log.map_or(true, |t| t.elapsed() > Duration::from_secs(15)) {
                    info!("Resume delayed: IPv4 interface not ready yet");
                    last_log = Some(std::time::Instant::now());
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }

            if let Err(e) = self.resume().await {
                error!("Resume failed: {e}");
            }
            break;
        }
        info!("Resumed");
    }

    pub async fn resume(&self) -> VpnResult<()> {
        let result = async {
            match self.tunnel.lock().clone() {
                Some(tunnel) if tunnel.is_paused() => {}
                _ => return Err(VpnError::Tunnel("VPN not paused".to_string())),
            }

            self.resume_silent().await?;

            if !self.prefs.snapshot().full_tunnel_enabled {
                self.apply_split_tunnel_config().await?;
            }
            Ok(())
        }
        .await;

        self.sink_on_vpn_pause_changed();
        result
    }

    /// Resume without notifying clients; used by `disconnect()`.
    async fn resume_silent(&self) -> VpnResult<()> {
        let _guard = self.pause_lock.lock().await;

        let pre_pause_firewall = {
            let mut pause = self.pause_state.lock();
            pause.pause_till = None;
            pause.pre_pause_firewall_enabled
        };

        let Some(tunnel) = self.tunnel.lock().clone() else {
            return Ok(());
        };
        if !tunnel.is_paused() {
            return Ok(());
        }

        info!("Resuming...");
        self.firewall.client_resumed();
        tunnel.resume().await?;

        // restore the pre-pause kill-switch state, non-persistent only
        match self.firewall.status().await {
            Ok(status) => {
                if !status.is_persistent && status.is_enabled != pre_pause_firewall {
                    if let Err(e) = self.set_kill_switch_state(pre_pause_firewall).await {
                        error!("Failed to restore kill-switch state: {e}");
                    }
                }
            }
            Err(e) => error!("Failed to check kill-switch status: {e}"),
        }

        Ok(())
    }

    pub fn is_paused(&self) -> bool {
        let tunnel_paused = self
            .tunnel
            .lock()
            .as_ref()
            .map(|t| t.is_paused())
            .unwrap_or(false);
        tunnel_paused && self.pause_state.lock().pause_till.is_some()
    }

    pub fn paused_till(&self) -> Option<DateTime<Utc>> {
        self.pause_state.lock().pause_till
    }

    // ---------------------------------------------------------------------
    // The retry loop
    // ---------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn keep_connection(
        self: &Arc<Self>,
        original_server: Option<OriginalServerInfo>,
        normalized_params: ConnectionParams,
        candidate_params: ConnectionParams,
        manual_dns: DnsSettings,
        anti_tracker: AntiTrackerMetadata,
        firewall_on: bool,
        firewall_during_connection: bool,
        obfs: Option<Arc<dyn ObfsTransport>>,
        can_reconfigure_other_vpns: bool,
    ) -> VpnResult<()> {
        if !self.prefs.snapshot().session.is_logged_in() {
            return Err(VpnError::NotLoggedIn);
        }

        let result = self
            .keep_connection_loop(
                original_server,
                normalized_params,
                candidate_params,
                manual_dns,
                anti_tracker,
                firewall_on,
                firewall_during_connection,
                obfs,
                can_reconfigure_other_vpns,
            )
            .await;

        // with no client connected the disconnection notification reaches
        // nobody; keep the outcome in the local system log instead
        if !self.sink_is_client_connected(false) {
            match &result {
                Err(e) => self.system_log(format!("Failed to connect VPN: {e}")),
                Ok(()) => self.system_log("VPN disconnected".to_string()),
            }
        }

        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn keep_connection_loop(
        self: &Arc<Self>,
        original_server: Option<OriginalServerInfo>,
        normalized_params: ConnectionParams,
        candidate_params: ConnectionParams,
        manual_dns: DnsSettings,
        anti_tracker: AntiTrackerMetadata,
        firewall_on: bool,
        firewall_during_connection: bool,
        obfs: Option<Arc<dyn ObfsTransport>>,
        can_reconfigure_other_vpns: bool,
    ) -> VpnResult<()> {
        // persist the attempt's DNS defaults immediately: a crash mid-attempt
        // still leaves usable settings behind
        if let Err(e) = self.save_default_dns_params(&manual_dns, &anti_tracker) {
            error!("Failed to save DNS defaults: {e}");
        }

        // keeping the connection only matters once we are connected
        self.required_state.set(RequiredState::Connect);

        // no delay before the first reconnection
        let mut delay_before_reconnect = Duration::ZERO;

        self.sink_save_early(
            TunnelStateInfo::new(TunnelState::Connecting, "Connecting"),
            true,
        );

        loop {
            // fresh parameters per attempt: a new host pair is drawn unless
            // an obfuscation proxy pinned the endpoint rewrite
            let attempt_params = if obfs.is_some() {
                normalized_params.clone()
            } else {
                let mut p = candidate_params.clone();
                p.normalize_hosts()?;
                p
            };

            // a fresh tunnel object per attempt: new keys/ports may be needed
            let tunnel = self.build_tunnel(&attempt_params).await?;

            let attempt_started = std::time::Instant::now();

            // DNS settings may have changed since the loop started
            let (current_dns, current_anti_tracker) = self.default_manual_dns_params();

            let connect_result = self
                .run_attempt(
                    original_server,
                    tunnel,
                    current_dns,
                    current_anti_tracker,
                    firewall_on,
                    firewall_during_connection,
                    obfs.clone(),
                    can_reconfigure_other_vpns,
                )
                .await;

            if let Err(e) = &connect_result {
                error!("Connection error: {e}");
                if self.required_state.get() == RequiredState::Connect {
                    // error only on the first try; once KeepConnection, errors
                    // are swallowed and we reconnect
                    return connect_result;
                }
            }

            if self.required_state.get() == RequiredState::KeepConnection {
                self.sink_save_early(
                    TunnelStateInfo::new(
                        TunnelState::Reconnecting,
                        "Reconnecting due to disconnection",
                    ),
                    true,
                );

                // no delay when the last attempt ran long enough
                if attempt_started.elapsed() > Duration::from_secs(30) {
                    delay_before_reconnect = Duration::ZERO;
                }
                // no delay when the tunnel itself requested reconnection
                if let Err(e) = &connect_result {
                    if e.is_reconnection_required() {
                        info!("VPN object requested re-connection");
                        delay_before_reconnect = Duration::ZERO;
                    }
                }

                if delay_before_reconnect > Duration::ZERO {
                    info!("Reconnecting (pause {delay_before_reconnect:?})...");
                    // poll in small steps so a concurrent disconnect request
                    // interrupts the wait almost immediately
                    let pause_till = std::time::Instant::now() + delay_before_reconnect;
                    while std::time::Instant::now() < pause_till
                        && self.required_state.get() != RequiredState::Disconnect
                    {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                } else {
                    info!("Reconnecting...");
                }

                if self.required_state.get() == RequiredState::KeepConnection {
                    // consecutive reconnections are delayed by 5 seconds
                    delay_before_reconnect = Duration::from_secs(5);
                    continue;
                }
            }

            break;
        }

        Ok(())
    }

    async fn build_tunnel(&self, params: &ConnectionParams) -> VpnResult<Arc<dyn TunnelProcess>> {
        let prefs = self.prefs.snapshot();

        if params.vpn_type == VpnType::WireGuard && !prefs.session.is_wg_credentials_ok() {
            return Err(VpnError::Tunnel(
                "WireGuard credentials are not defined (please regenerate credentials or re-login)"
                    .to_string(),
            ));
        }

        let spec = TunnelSpec {
            vpn_type: params.vpn_type,
            entry_host: params.entry_host()?.clone(),
            exit_host: params.exit_host().cloned(),
            port: params.port(),
            mtu: params.wireguard.mtu,
            ipv6: params.ipv6,
            credentials: prefs.session.clone(),
            proxy: params.openvpn.proxy.clone(),
        };

        self.tunnel_builder
            .build(&spec)
            .await
            .map_err(|e| VpnError::Tunnel(format!("failed to create VPN object: {e}")))
    }

    // ---------------------------------------------------------------------
    // Obfuscation side-channel
    // ---------------------------------------------------------------------

    async fn start_obfs(
        &self,
        params: &ConnectionParams,
    ) -> VpnResult<(
        ConnectionParams,
        Arc<dyn ObfsTransport>,
        OriginalServerInfo,
    )> {
        let launcher = self.obfs_launcher.as_ref().ok_or_else(|| {
            VpnError::Obfs("obfuscation transport is not available on this system".to_string())
        })?;

        let port = params.port();
        match params.obfs_transport {
            ObfsTransportType::Quic if port.is_tcp => {
                return Err(VpnError::Obfs(
                    "not an acceptable port type for a QUIC obfuscation connection (UDP expected)"
                        .to_string(),
                ))
            }
            ObfsTransportType::Tcp if port.port != 0 && !port.is_tcp => {
                return Err(VpnError::Obfs(
                    "not an acceptable port type for a TCP obfuscation connection (TCP expected)"
                        .to_string(),
                ))
            }
            _ => {}
        }

        let entry = params.entry_host()?;
        let remote_host = if entry.obfs_host.is_empty() {
            entry.endpoint_ip.clone()
        } else {
            entry.obfs_host.clone()
        };
        let remote_ip: IpAddr = remote_host.parse().map_err(|_| {
            VpnError::Obfs(format!("invalid obfuscation endpoint '{remote_host}'"))
        })?;
        let remote_port = if port.port != 0 {
            port.port
        } else {
            // preferred ports: 443 for QUIC, 80 for TCP transports
            match params.obfs_transport {
                ObfsTransportType::Tcp => 80,
                _ => 443,
            }
        };

        info!("Starting obfuscation transport...");
        let transport = launcher
            .start(
                params.obfs_transport,
                std::net::SocketAddr::new(remote_ip, remote_port),
                &entry.dns_name,
            )
            .await?;

        let original = OriginalServerInfo {
            ip: entry
                .endpoint_ip
                .parse()
                .map_err(|_| VpnError::Obfs("invalid entry server address".to_string()))?,
            port: port.port,
            is_tcp: port.is_tcp,
            proxy_type: params.obfs_transport,
        };

        // the tunnel now connects to the local proxy instead of the server
        let mut updated = params.clone();
        let local_port = transport.local_port();
        {
            let host = updated.entry_host_mut()?;
            host.endpoint_ip = "127.0.0.1".to_string();
        }
        updated.set_port(crate::vpn::PortSelection {
            port: local_port,
            is_tcp: false,
        });

        Ok((updated, transport, original))
    }

    // ---------------------------------------------------------------------
    // Kill-switch operations
    // ---------------------------------------------------------------------

    pub async fn kill_switch_state(&self) -> VpnResult<KillSwitchStatus> {
        let mut status = self.firewall.status().await?;
        let prefs = self.prefs.snapshot();
        status.is_allow_lan = prefs.kill_switch.allow_lan;
        status.is_allow_multicast = prefs.kill_switch.allow_lan_multicast;
        status.is_allow_api_servers = prefs.kill_switch.allow_api_servers;
        status.user_exceptions = prefs.kill_switch.user_exceptions.clone();
        Ok(status)
    }

    pub async fn set_kill_switch_state(&self, enabled: bool) -> VpnResult<()> {
        self.firewall.set_enabled(enabled).await?;
        self.sink_on_kill_switch_changed();
        Ok(())
    }

    pub async fn set_kill_switch_persistent(&self, persistent: bool) -> VpnResult<()> {
        self.prefs
            .update(|p| p.kill_switch.persistent = persistent)?;
        self.firewall.set_persistent(persistent).await?;
        self.sink_on_kill_switch_changed();
        Ok(())
    }

    pub async fn set_kill_switch_allow_lan(
        &self,
        allow_lan: bool,
        allow_multicast: bool,
    ) -> VpnResult<()> {
        self.prefs.update(|p| {
            p.kill_switch.allow_lan = allow_lan;
            p.kill_switch.allow_lan_multicast = allow_multicast;
        })?;
        self.firewall.set_allow_lan(allow_lan, allow_multicast).await?;
        self.sink_on_kill_switch_changed();
        Ok(())
    }

    pub async fn set_kill_switch_user_exceptions(&self, exceptions: &str) -> VpnResult<()> {
        self.prefs
            .update(|p| p.kill_switch.user_exceptions = exceptions.to_string())?;
        self.firewall.set_user_exceptions(exceptions).await?;
        self.sink_on_kill_switch_changed();
        Ok(())
    }

    // ---------------------------------------------------------------------
    // DNS
    // ---------------------------------------------------------------------

    /// Apply a manual-DNS/anti-tracker selection to the active tunnel and
    /// the firewall DNS rule, and persist it as the connection default.
    pub async fn set_manual_dns(
        &self,
        dns: DnsSettings,
        anti_tracker: AntiTrackerMetadata,
    ) -> VpnResult<()> {
        if let Err(e) = self.save_default_dns_params(&dns, &anti_tracker) {
            error!("Failed to save DNS defaults: {e}");
        }

        // anti-tracker DNS wins over a manual selection
        let effective = anti_tracker.dns().unwrap_or_else(|| dns.clone());

        let Some(tunnel) = self.tunnel.lock().clone() else {
            return Ok(());
        };

        match effective.ip() {
            Some(ip) => {
                tunnel
                    .set_manual_dns(ip)
                    .await
                    .map_err(|e| VpnError::Dns(format!("failed to set DNS: {e}")))?;
                self.firewall.on_change_dns(Some(ip)).await?;
            }
            None => {
                tunnel
                    .reset_manual_dns()
                    .await
                    .map_err(|e| VpnError::Dns(format!("failed to reset DNS: {e}")))?;
                self.firewall.on_change_dns(None).await?;
            }
        }
        Ok(())
    }

    fn save_default_dns_params(
        &self,
        dns: &DnsSettings,
        anti_tracker: &AntiTrackerMetadata,
    ) -> VpnResult<()> {
        self.prefs.update(|p| {
            p.last_connection_params.manual_dns = dns.clone();
            p.last_connection_params.anti_tracker = anti_tracker.clone();
        })?;
        Ok(())
    }

    /// The currently stored default DNS/anti-tracker selection.
    pub fn default_manual_dns_params(&self) -> (DnsSettings, AntiTrackerMetadata) {
        let params = &self.prefs.snapshot().last_connection_params;
        (params.manual_dns.clone(), params.anti_tracker.clone())
    }

    // ---------------------------------------------------------------------
    // Split tunnel
    // ---------------------------------------------------------------------

    /// Re-program the split-tunnel driver from current settings and the
    /// current connectivity state, then refresh full-tunnel rules.
    pub async fn apply_split_tunnel_config(&self) -> VpnResult<()> {
        let prefs = self.prefs.snapshot();
        let session_info = *self.session_info.lock();

        let vpn_connected =
            self.tunnel.lock().is_some() && session_info.vpn_local_ipv4.is_some();

        let ctx = SplitTunnelApplyContext {
            vpn_connected,
            vpn_paused: self.is_paused(),
            config: prefs.split_tunnel.clone(),
            outbound_ipv4: session_info.outbound_ipv4,
            outbound_ipv6: session_info.outbound_ipv6,
            vpn_local_ipv4: session_info.vpn_local_ipv4,
            vpn_local_ipv6: session_info.vpn_local_ipv6,
        };
        self.split_tunnel.apply_config(ctx).await?;

        // full-tunnel rules depend on the same connectivity facts
        if let Err(e) = self.firewall.apply_full_tunnel().await {
            error!("Failed to apply full-tunnel rules: {e}");
        }
        Ok(())
    }

    pub async fn split_tunnel_set_config(
        &self,
        config: crate::preferences::SplitTunnelConfig,
    ) -> VpnResult<()> {
        self.prefs.update(|p| p.split_tunnel = config.clone())?;
        let result = self.apply_split_tunnel_config().await;
        self.sink_on_split_tunnel_changed();
        result
    }

    pub async fn split_tunnel_add_app(&self, exec: &str) -> VpnResult<()> {
        self.prefs.update(|p| {
            if !p.split_tunnel.apps.iter().any(|a| a == exec) {
                p.split_tunnel.apps.push(exec.to_string());
            }
        })?;
        self.split_tunnel.add_app(exec).await?;
        self.sink_on_split_tunnel_changed();
        Ok(())
    }

    pub async fn split_tunnel_remove_app(&self, exec: &str) -> VpnResult<()> {
        self.prefs
            .update(|p| p.split_tunnel.apps.retain(|a| a != exec))?;
        self.split_tunnel.remove_app(exec).await?;
        self.sink_on_split_tunnel_changed();
        Ok(())
    }

    pub async fn split_tunnel_status(&self) -> VpnResult<crate::splittun::SplitTunnelStatus> {
        self.split_tunnel.status().await
    }

    // ---------------------------------------------------------------------
    // Connection parameters and session info
    // ---------------------------------------------------------------------

    pub fn get_connection_params(&self) -> ConnectionParams {
        self.prefs.snapshot().last_connection_params.clone()
    }

    /// Store connection settings. While connected the update is parked and
    /// applied only after the tunnel later disconnects, so the stored params
    /// always describe the actual last connection.
    pub fn set_connection_params(&self, params: ConnectionParams) -> VpnResult<()> {
        if self.connected_or_connecting() {
            *self.parked_params.lock() = Some(params);
            return Ok(());
        }
        self.store_connection_params(&params)
    }

    fn store_connection_params(&self, params: &ConnectionParams) -> VpnResult<()> {
        self.prefs
            .update(|p| p.last_connection_params = params.clone())?;
        Ok(())
    }

    pub fn vpn_session_info(&self) -> VpnSessionInfo {
        *self.session_info.lock()
    }

    pub(crate) fn set_vpn_session_info(&self, info: VpnSessionInfo) {
        *self.session_info.lock() = info;
    }

    // ---------------------------------------------------------------------
    // Session status
    // ---------------------------------------------------------------------

    pub async fn request_session_status(&self) -> VpnResult<AccountStatus> {
        let prefs = self.prefs.snapshot();
        if !prefs.session.is_logged_in() {
            return Err(VpnError::NotLoggedIn);
        }
        let status = self.api.session_status(&prefs.session.session_token).await?;
        self.prefs.update(|p| p.account = status.clone())?;
        Ok(status)
    }

    pub fn preferences(&self) -> Arc<PreferencesStore> {
        self.prefs.clone()
    }

    // ---------------------------------------------------------------------
    // Event sink helpers
    // ---------------------------------------------------------------------

    fn sink(&self) -> Option<Arc<dyn VpnEventSink>> {
        self.event_sink.read().clone()
    }

    pub(crate) fn sink_save_early(&self, state: TunnelStateInfo, save_and_process: bool) {
        if let Some(sink) = self.sink() {
            sink.on_vpn_state_save_early(state, save_and_process);
        }
    }

    pub(crate) fn sink_process_saved(&self) {
        if let Some(sink) = self.sink() {
            sink.on_vpn_state_process_saved();
        }
    }

    pub(crate) fn sink_on_kill_switch_changed(&self) {
        if let Some(sink) = self.sink() {
            sink.on_kill_switch_state_changed();
        }
    }

    pub(crate) fn sink_on_split_tunnel_changed(&self) {
        if let Some(sink) = self.sink() {
            sink.on_split_tunnel_status_changed();
        }
    }

    fn sink_on_vpn_pause_changed(&self) {
        if let Some(sink) = self.sink() {
            sink.on_vpn_pause_changed();
        }
    }

    pub(crate) fn sink_is_client_connected(&self, only_ui: bool) -> bool {
        self.sink()
            .map(|s| s.is_client_connected(only_ui))
            .unwrap_or(false)
    }

    /// Keep an operator-visible record when nobody is listening.
    fn system_log(&self, message: String) {
        info!(target: "system", "{message}");
    }

    pub(crate) fn required_state(&self) -> RequiredState {
        self.required_state.get()
    }
}
