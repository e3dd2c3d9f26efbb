//! Local client protocol server and the connection-request queue
//!
//! TCP interface for UI/CLI clients (newline-delimited JSON, loopback only)
//! plus the request serializer that collapses bursts of client-issued
//! "connect" requests into at most one in-flight request: a newer request
//! always supersedes an older unprocessed one, and any active connection is
//! torn down before a new one begins.

pub mod types;

pub use types::{ClientRequest, ClientType, DaemonMessage};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Notify};

use crate::preferences::PreferencesStore;
use crate::session::{RemoteSessionApi, SessionData};
use crate::supervisor::{ConnectionSupervisor, VpnEventSink};
use crate::vpn::{
    ConnectionParams, DisconnectionReason, TunnelState, TunnelStateInfo, VpnError, VpnResult,
};

/// Depth-1 "latest pending request" cell with last-write-wins semantics.
///
/// Pushing drains any unconsumed previous request (discarding it) before
/// storing the new one; the consumer pops the single stored request or waits.
struct RequestSlot {
    cell: Mutex<Option<ConnectionParams>>,
    notify: Notify,
}

impl RequestSlot {
    fn new() -> Self {
        Self {
            cell: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    fn push(&self, params: ConnectionParams) {
        let mut cell = self.cell.lock();
        if cell.take().is_some() {
            info!("Skipping previous connection request. Newest request received!");
        }
        *cell = Some(params);
        self.notify.notify_one();
    }

    async fn pop(&self) -> ConnectionParams {
        loop {
            // register for wakeup before checking: a push between the check
            // and the await would otherwise be lost
            let notified = self.notify.notified();
            if let Some(params) = self.cell.lock().take() {
                return params;
            }
            notified.await;
        }
    }

    fn is_empty(&self) -> bool {
        self.cell.lock().is_none()
    }
}

struct ClientConn {
    client_type: ClientType,
    authenticated: bool,
    outbox: mpsc::UnboundedSender<String>,
}

/// Protocol server configuration.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Loopback port to listen on; 0 picks an ephemeral port.
    pub listen_port: u16,
    /// Shared secret clients must present in their Hello.
    pub secret: u64,
}

/// TCP protocol server. Also implements the supervisor's event sink: it is
/// the single holder of the last known VPN state, updated via the
/// save-early/process-saved two-step.
pub struct Protocol {
    weak_self: Weak<Protocol>,
    config: ProtocolConfig,
    supervisor: Arc<ConnectionSupervisor>,
    api: Arc<dyn RemoteSessionApi>,
    prefs: Arc<PreferencesStore>,

    connections: Mutex<HashMap<u64, ClientConn>>,
    next_conn_id: AtomicU64,

    last_state: Mutex<TunnelStateInfo>,

    request_slot: RequestSlot,
    /// Held for the whole of a request registration; the consumer loop locks
    /// it before processing, so a new request is never read until the
    /// registration (including the teardown of any active connection) has
    /// completed.
    admission: tokio::sync::Mutex<()>,
    disconnect_requested: AtomicBool,

    is_running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,

    /// Error of the last unattended connection attempt, replayed to the
    /// first client that connects so it is not silently lost.
    last_connection_error: Mutex<Option<String>>,
}

impl Protocol {
    pub fn new(
        config: ProtocolConfig,
        supervisor: Arc<ConnectionSupervisor>,
        api: Arc<dyn RemoteSessionApi>,
    ) -> Arc<Self> {
        let prefs = supervisor.preferences();
        let (shutdown_tx, _) = watch::channel(false);

        let protocol = Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            config,
            supervisor: supervisor.clone(),
            api,
            prefs,
            connections: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
            last_state: Mutex::new(TunnelStateInfo::default()),
            request_slot: RequestSlot::new(),
            admission: tokio::sync::Mutex::new(()),
            disconnect_requested: AtomicBool::new(false),
            is_running: AtomicBool::new(false),
            shutdown_tx,
            last_connection_error: Mutex::new(None),
        });

        supervisor.set_event_sink(protocol.clone());
        protocol
    }

    /// Start listening and processing. Returns the actual listening port.
    pub async fn start(self: &Arc<Self>) -> VpnResult<u16> {
        let listener = TcpListener::bind(("127.0.0.1", self.config.listen_port))
            .await
            .map_err(|e| VpnError::Other(format!("failed to start protocol listener: {e}")))?;
        let port = listener
            .local_addr()
            .map_err(VpnError::Io)?
            .port();

        self.is_running.store(true, Ordering::SeqCst);
        info!("Protocol server started on 127.0.0.1:{port}");

        {
            let protocol = self.clone();
            tokio::spawn(async move { protocol.process_connection_requests().await });
        }

        {
            let protocol = self.clone();
            let mut shutdown = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        accepted = listener.accept() => {
                            match accepted {
                                Ok((stream, peer)) => {
                                    debug!("Client connection from {peer}");
                                    let protocol = protocol.clone();
                                    tokio::spawn(async move { protocol.process_client(stream).await });
                                }
                                Err(e) => {
                                    error!("Failed to accept client connection: {e}");
                                    break;
                                }
                            }
                        }
                        _ = shutdown.changed() => break,
                    }
                }
                info!("Protocol listener stopped");
            });
        }

        Ok(port)
    }

    /// Stop: notify clients the daemon is exiting, refuse new connections.
    pub fn stop(&self) {
        info!("Stopping ...");
        self.notify_clients(&DaemonMessage::DaemonExitingNotification { idx: 0 }, false);
        self.supervisor.mark_daemon_stopping();
        self.is_running.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);
    }

    // ---------------------------------------------------------------------
    // Connection-request admission control
    // ---------------------------------------------------------------------

    /// Register a new connection request.
    ///
    /// If more than one request arrives in a short period, all are ignored
    /// except the last one. The ordering here is load-bearing: the new
    /// request is durably enqueued *before* the old connection's teardown,
    /// so a consumer can never race into reading the new request while an
    /// older connection is still alive — and the admission lock keeps the
    /// consumer out until this function returns.
    pub async fn register_connection_request(&self, params: ConnectionParams) {
        self.disconnect_requested.store(false, Ordering::SeqCst);

        let _admission = self.admission.lock().await;

        self.request_slot.push(params);

        // Disconnect any active connection. No "disconnected" notification
        // is sent: a new connection request is already pending.
        if let Err(e) = self.supervisor.disconnect().await {
            error!("Failed to stop active connection for new request: {e}");
        }
    }

    /// The consumer loop: processes registered connection requests strictly
    /// one at a time.
    async fn process_connection_requests(self: Arc<Self>) {
        info!("Connection requests processor started");

        while self.is_running.load(Ordering::SeqCst) {
            let mut request = self.request_slot.pop().await;

            // Ordering requirement: the firewall must be up before the
            // tunnel starts and torn down only after the tunnel stops, so
            // the per-request flags are forced to the "during connection"
            // policy here.
            request.firewall_on = false;
            request.firewall_on_during_connection = true;

            // wait until the registration (incl. teardown) has finished
            drop(self.admission.lock().await);

            // a newer request may have been registered while we waited for
            // admission; the popped one is superseded and dropped silently
            if !self.request_slot.is_empty() {
                continue;
            }

            self.last_connection_error.lock().take();

            // synchronous processing: runs the whole retry loop. A separate
            // task makes this a panic boundary: a panicking attempt is
            // converted into an ordinary error and the processor survives.
            let connection_error = {
                let protocol = self.clone();
                match tokio::spawn(
                    async move { protocol.process_connect_request(request).await },
                )
                .await
                {
                    Ok(result) => result,
                    Err(join_error) => {
                        // a crashed attempt may leave a half-applied,
                        // traffic-blocking firewall behind; fail open
                        if let Err(e) = self.supervisor.set_kill_switch_state(false).await {
                            error!("Failed to disable firewall after panic: {e}");
                        }
                        Err(VpnError::Other(format!(
                            "panic during processing connection request: {join_error}"
                        )))
                    }
                }
            };

            if let Err(e) = &connection_error {
                error!("Connection request failed: {e}");
                self.save_last_error(&e.to_string());
            }

            // exactly one terminal notification per request — unless a newer
            // request is already queued (its processing follows immediately)
            if self.request_slot.is_empty()
                || self.disconnect_requested.load(Ordering::SeqCst)
            {
                self.send_terminal_disconnected(connection_error.err());
            }
        }

        info!("Connection requests processor stopped");
    }

    /// One connect request, with a single automatic recovery attempt for the
    /// recoverable device-registration error class.
    async fn process_connect_request(&self, request: ConnectionParams) -> VpnResult<()> {
        if self.disconnect_requested.load(Ordering::SeqCst) {
            info!("Disconnection was requested. Canceling connection.");
            return self.supervisor.disconnect().await;
        }

        let mut result = self.supervisor.connect(request.clone()).await;

        if let Err(err) = &result {
            if err.is_recoverable_session_error() {
                info!(
                    "First attempt to connect failed with recoverable error '{err}'; \
                     will logout-login and try to connect again"
                );
                result = self.recover_session_and_retry(request).await;
            }
        }

        if result.is_err() {
            // deliberate fail-open on the error path: a half-applied
            // firewall from a failed attempt must not strand the user
            if let Err(e) = self.supervisor.set_kill_switch_state(false).await {
                error!("Failed to disable firewall after connection error: {e}");
            }
        }

        result
    }

    async fn recover_session_and_retry(&self, mut request: ConnectionParams) -> VpnResult<()> {
        let session = self.prefs.snapshot().session.clone();

        if session.account_id.is_empty() {
            // no stored account: log out locally, tell the user to re-login
            info!("No account ID stored; logging out locally");
            if let Err(e) = self.session_delete(true).await {
                warn!("Local logout failed: {e}");
            }
            return Err(VpnError::Other(
                "this device is not registered under this user account anymore; \
                 please log in again"
                    .to_string(),
            ));
        }

        self.session_new(&session.account_id, &session.device_name)
            .await
            .map_err(|e| VpnError::Api(format!("error logging in after logout: {e}")))?;

        // all clients learn about the changed session
        self.notify_clients(&self.hello_notification(), true);

        info!("Logout-login successful, now trying to connect again");

        // reflect the freshly issued entry-server/port/DNS in the request
        let prefs = self.prefs.snapshot();
        let stored = &prefs.last_connection_params;
        if stored.wireguard.entry_server.hosts.is_empty() {
            return Err(VpnError::Other(
                "invalid settings after logout-login: no entry server hosts".to_string(),
            ));
        }
        request.wireguard.entry_server = stored.wireguard.entry_server.clone();
        request.wireguard.port = stored.wireguard.port;
        request.manual_dns = stored.manual_dns.clone();

        self.supervisor.connect(request).await
    }

    /// Send the exactly-once terminal Disconnected notification, classifying
    /// the disconnection reason from the last observed tunnel state.
    fn send_terminal_disconnected(&self, connection_error: Option<VpnError>) {
        let last_state = {
            let mut guard = self.last_state.lock();
            std::mem::replace(
                &mut *guard,
                TunnelStateInfo::new(TunnelState::Disconnected, ""),
            )
        };

        let mut reason = DisconnectionReason::Unknown;
        let mut description = connection_error.map(|e| e.to_string());

        if last_state.state == TunnelState::Exiting && last_state.is_auth_error {
            reason = DisconnectionReason::AuthenticationError;
            if description.is_none() {
                description = Some("authentication failure".to_string());
            }
        }
        if self.disconnect_requested.load(Ordering::SeqCst) {
            // explicit user action: clients suppress their own auto-reconnect
            reason = DisconnectionReason::DisconnectRequested;
        }

        let failure = description.is_some();
        if let Some(msg) = &description {
            self.save_last_error(msg);
        }

        self.notify_clients(
            &DaemonMessage::DisconnectedNotification {
                idx: 0,
                failure,
                reason,
                reason_description: description.unwrap_or_default(),
            },
            true,
        );
    }

    fn save_last_error(&self, message: &str) {
        // with no clients connected the notification reaches nobody; keep
        // the error and replay it to the first client that connects
        if !self.is_client_connected(false) {
            *self.last_connection_error.lock() =
                Some(format!("Failed to connect VPN: {message}"));
        }
    }

    // ---------------------------------------------------------------------
    // Client handling
    // ---------------------------------------------------------------------

    async fn process_client(self: Arc<Self>, stream: TcpStream) {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
        let (reader, mut writer) = stream.into_split();

        let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<String>();
        self.connections.lock().insert(
            conn_id,
            ClientConn {
                client_type: ClientType::Ui,
                authenticated: false,
                outbox: outbox_tx,
            },
        );

        let writer_task = tokio::spawn(async move {
            while let Some(line) = outbox_rx.recv().await {
                if writer.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if writer.write_all(b"\n").await.is_err() {
                    break;
                }
            }
        });

        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let request: ClientRequest = match serde_json::from_str(line) {
                Ok(request) => request,
                Err(e) => {
                    debug!("Unsupported request: {e}");
                    self.send_to(conn_id, &DaemonMessage::ErrorResponse {
                        idx: 0,
                        error_message: format!("unsupported request: {e}"),
                    });
                    continue;
                }
            };

            let authenticated = self
                .connections
                .lock()
                .get(&conn_id)
                .map(|c| c.authenticated)
                .unwrap_or(false);

            // first message must be a valid Hello, else drop the connection
            if !authenticated {
                match request {
                    ClientRequest::Hello {
                        idx,
                        secret,
                        client_type,
                    } => {
                        if secret != self.config.secret {
                            warn!("Client presented a wrong secret; dropping connection");
                            break;
                        }
                        if let Some(conn) = self.connections.lock().get_mut(&conn_id) {
                            conn.authenticated = true;
                            conn.client_type = client_type;
                        }
                        let last_error = self.last_connection_error.lock().take();
                        let prefs = self.prefs.snapshot();
                        self.send_to(conn_id, &DaemonMessage::HelloResponse {
                            idx,
                            daemon_version: env!("CARGO_PKG_VERSION").to_string(),
                            is_logged_in: prefs.session.is_logged_in(),
                            last_connection_error: last_error,
                        });
                        continue;
                    }
                    _ => {
                        warn!("First message was not Hello; dropping connection");
                        break;
                    }
                }
            }

            let response = self.dispatch(request).await;
            self.send_to(conn_id, &response);
        }

        self.connections.lock().remove(&conn_id);
        writer_task.abort();
        debug!("Client connection {conn_id} closed");
    }

    async fn dispatch(&self, request: ClientRequest) -> DaemonMessage {
        let idx = request.idx();
        let result: VpnResult<DaemonMessage> = match request {
            ClientRequest::Hello { .. } => Ok(DaemonMessage::EmptyResponse { idx }),

            ClientRequest::Connect { params, .. } => {
                // processed by the request serializer; state notifications
                // follow asynchronously
                self.register_connection_request(params).await;
                Ok(DaemonMessage::EmptyResponse { idx })
            }

            ClientRequest::Disconnect { .. } => {
                self.disconnect_requested.store(true, Ordering::SeqCst);
                self.supervisor
                    .disconnect()
                    .await
                    .map(|()| DaemonMessage::EmptyResponse { idx })
            }

            ClientRequest::PauseConnection {
                duration_seconds, ..
            } => self
                .supervisor
                .pause(duration_seconds)
                .await
                .map(|()| DaemonMessage::EmptyResponse { idx }),

            ClientRequest::ResumeConnection { .. } => self
                .supervisor
                .resume()
                .await
                .map(|()| DaemonMessage::EmptyResponse { idx }),

            ClientRequest::ConnectSettingsGet { .. } => Ok(DaemonMessage::ConnectSettingsResponse {
                idx,
                params: self.supervisor.get_connection_params(),
            }),

            ClientRequest::ConnectSettingsSet { params, .. } => self
                .supervisor
                .set_connection_params(params)
                .map(|()| DaemonMessage::EmptyResponse { idx }),

            ClientRequest::SessionNew {
                account_id,
                device_name,
                ..
            } => self
                .session_new(&account_id, &device_name)
                .await
                .map(|()| DaemonMessage::EmptyResponse { idx }),

            ClientRequest::SsoLogin {
                sso_token,
                device_name,
                ..
            } => self
                .sso_login(&sso_token, &device_name)
                .await
                .map(|()| DaemonMessage::EmptyResponse { idx }),

            ClientRequest::SessionDelete { .. } => self
                .session_delete(false)
                .await
                .map(|()| DaemonMessage::EmptyResponse { idx }),

            ClientRequest::SessionStatus { .. } => self
                .supervisor
                .request_session_status()
                .await
                .map(|status| DaemonMessage::AccountStatusResponse { idx, status }),

            ClientRequest::KillSwitchGetStatus { .. } => self
                .supervisor
                .kill_switch_state()
                .await
                .map(|status| DaemonMessage::KillSwitchStatusResponse { idx, status }),

            ClientRequest::KillSwitchSetEnabled { enabled, .. } => self
                .supervisor
                .set_kill_switch_state(enabled)
                .await
                .map(|()| DaemonMessage::EmptyResponse { idx }),

            ClientRequest::KillSwitchSetPersistent { persistent, .. } => self
                .supervisor
                .set_kill_switch_persistent(persistent)
                .await
                .map(|()| DaemonMessage::EmptyResponse { idx }),

            ClientRequest::KillSwitchSetAllowLan {
                allow_lan,
                allow_multicast,
                ..
            } => self
                .supervisor
                .set_kill_switch_allow_lan(allow_lan, allow_multicast)
                .await
                .map(|()| DaemonMessage::EmptyResponse { idx }),

            ClientRequest::KillSwitchSetUserExceptions { exceptions, .. } => self
                .supervisor
                .set_kill_switch_user_exceptions(&exceptions)
                .await
                .map(|()| DaemonMessage::EmptyResponse { idx }),

            ClientRequest::SplitTunnelGetStatus { .. } => self
                .supervisor
                .split_tunnel_status()
                .await
                .map(|status| DaemonMessage::SplitTunnelStatusResponse { idx, status }),

            ClientRequest::SplitTunnelSetConfig { config, .. } => self
                .supervisor
                .split_tunnel_set_config(config)
                .await
                .map(|()| DaemonMessage::EmptyResponse { idx }),

            ClientRequest::SplitTunnelAddApp { exec, .. } => self
                .supervisor
                .split_tunnel_add_app(&exec)
                .await
                .map(|()| DaemonMessage::EmptyResponse { idx }),

            ClientRequest::SplitTunnelRemoveApp { exec, .. } => self
                .supervisor
                .split_tunnel_remove_app(&exec)
                .await
                .map(|()| DaemonMessage::EmptyResponse { idx }),
        };

        result.unwrap_or_else(|e| DaemonMessage::ErrorResponse {
            idx,
            error_message: e.to_string(),
        })
    }

    // ---------------------------------------------------------------------
    // Session operations
    // ---------------------------------------------------------------------

    async fn session_new(&self, account_id: &str, device_name: &str) -> VpnResult<()> {
        // delete any previous session first, best effort
        let old_session = self.prefs.snapshot().session.session_token.clone();
        if !old_session.is_empty() {
            if let Err(e) = self.api.session_delete(&old_session).await {
                warn!("Failed to delete previous session: {e}");
            }
        }

        let session = self
            .api
            .session_new(account_id, device_name, &self.prefs.snapshot().session.wg_public_key)
            .await?;

        self.store_session_data(account_id, session)
    }

    /// Log in through a single-sign-on token. The backend resolves the
    /// account; no account id is stored, so a stale-device recovery cannot
    /// silently re-login (the user is asked instead).
    async fn sso_login(&self, sso_token: &str, device_name: &str) -> VpnResult<()> {
        let old_session = self.prefs.snapshot().session.session_token.clone();
        if !old_session.is_empty() {
            if let Err(e) = self.api.session_delete(&old_session).await {
                warn!("Failed to delete previous session: {e}");
            }
        }

        let session = self
            .api
            .sso_login(sso_token, device_name, &self.prefs.snapshot().session.wg_public_key)
            .await?;

        self.store_session_data("", session)
    }

    fn store_session_data(&self, account_id: &str, session: SessionData) -> VpnResult<()> {
        self.prefs.update(|p| {
            p.session.account_id = account_id.to_string();
            p.session.session_token = session.session_token.clone();
            p.session.device_id = session.device_id.clone();
            p.session.device_name = session.device_name.clone();
            if !session.wg_public_key.is_empty() {
                p.session.wg_public_key = session.wg_public_key.clone();
                p.session.wg_private_key = session.wg_private_key.clone();
                p.session.wg_local_ip = session.wg_local_ip.clone();
                p.session.wg_preshared_key = session.wg_preshared_key.clone();
                p.session.wg_keys_generated = chrono::Utc::now().timestamp();
            }
            p.account = session.account.clone();
            if !session.vpn_entry_hosts.is_empty() {
                p.last_connection_params.wireguard.entry_server.hosts =
                    session.vpn_entry_hosts.clone();
                if session.vpn_entry_port != 0 {
                    p.last_connection_params.wireguard.port.port = session.vpn_entry_port;
                }
            }
        })?;

        Ok(())
    }

    /// Log out. `local_only` keeps the server-side session untouched (used
    /// when the server already forgot us).
    async fn session_delete(&self, local_only: bool) -> VpnResult<()> {
        // an active tunnel cannot outlive its session
        self.disconnect_requested.store(true, Ordering::SeqCst);
        if let Err(e) = self.supervisor.disconnect().await {
            warn!("Disconnect on logout failed: {e}");
        }

        let session = self.prefs.snapshot().session.session_token.clone();
        if !local_only && !session.is_empty() {
            if let Err(e) = self.api.session_delete(&session).await {
                warn!("Server-side session delete failed: {e}");
            }
        }

        self.prefs.update(|p| {
            p.session = Default::default();
            p.account = Default::default();
        })?;
        Ok(())
    }

    fn hello_notification(&self) -> DaemonMessage {
        let prefs = self.prefs.snapshot();
        DaemonMessage::HelloResponse {
            idx: 0,
            daemon_version: env!("CARGO_PKG_VERSION").to_string(),
            is_logged_in: prefs.session.is_logged_in(),
            last_connection_error: None,
        }
    }

    // ---------------------------------------------------------------------
    // Notifications
    // ---------------------------------------------------------------------

    fn send_to(&self, conn_id: u64, message: &DaemonMessage) {
        if let Some(conn) = self.connections.lock().get(&conn_id) {
            let _ = conn.outbox.send(message.to_line());
        }
    }

    /// Push a message to all (authenticated) clients.
    fn notify_clients(&self, message: &DaemonMessage, authenticated_only: bool) {
        let line = message.to_line();
        let connections = self.connections.lock();
        for conn in connections.values() {
            if authenticated_only && !conn.authenticated {
                continue;
            }
            let _ = conn.outbox.send(line.clone());
        }
    }

    /// Push a message to authenticated UI clients only. Stats and similar
    /// high-frequency notifications are suppressed for CLI clients.
    fn notify_ui_clients(&self, message: &DaemonMessage) {
        let line = message.to_line();
        let connections = self.connections.lock();
        for conn in connections.values() {
            if conn.authenticated && conn.client_type == ClientType::Ui {
                let _ = conn.outbox.send(line.clone());
            }
        }
    }

    /// Publish tunnel transfer statistics (called by the stats collector).
    pub fn notify_transfer_stats(
        &self,
        bytes_sent: u64,
        bytes_received: u64,
        last_handshake_unix: Option<i64>,
    ) {
        self.notify_ui_clients(&DaemonMessage::TransferStatsNotification {
            idx: 0,
            bytes_sent,
            bytes_received,
            last_handshake_unix,
        });
    }

    /// Publish a WiFi-network-changed notification.
    pub fn notify_wifi_changed(&self, ssid: &str, is_insecure: bool) {
        self.notify_clients(
            &DaemonMessage::WifiChangedNotification {
                idx: 0,
                ssid: ssid.to_string(),
                is_insecure,
            },
            true,
        );
    }

    /// Publish a servers-list-updated notification.
    pub fn notify_servers_updated(&self) {
        self.notify_clients(&DaemonMessage::ServersUpdatedNotification { idx: 0 }, true);
    }

    fn protocol_arc(&self) -> Option<Arc<Protocol>> {
        self.weak_self.upgrade()
    }
}

impl VpnEventSink for Protocol {
    fn on_vpn_state_save_early(&self, state: TunnelStateInfo, save_and_process: bool) {
        *self.last_state.lock() = state;
        if save_and_process {
            self.on_vpn_state_process_saved();
        }
    }

    fn on_vpn_state_process_saved(&self) {
        let state = self.last_state.lock().clone();

        match state.state {
            TunnelState::Connected => {
                self.notify_clients(
                    &DaemonMessage::ConnectedNotification { idx: 0, state },
                    true,
                );
            }
            TunnelState::Disconnected => {
                // suppressed: the terminal Disconnected is sent exactly once
                // by the request processor after the retry loop exits
            }
            _ => {
                self.notify_clients(
                    &DaemonMessage::VpnStateNotification {
                        idx: 0,
                        state: state.state.to_string(),
                        state_additional_info: state.additional_info,
                    },
                    true,
                );
            }
        }
    }

    fn on_kill_switch_state_changed(&self) {
        let Some(protocol) = self.protocol_arc() else { return };
        tokio::spawn(async move {
            match protocol.supervisor.kill_switch_state().await {
                Ok(status) => protocol.notify_clients(
                    &DaemonMessage::KillSwitchStatusResponse { idx: 0, status },
                    true,
                ),
                Err(e) => debug!("Failed to query kill-switch status: {e}"),
            }
        });
    }

    fn on_split_tunnel_status_changed(&self) {
        let Some(protocol) = self.protocol_arc() else { return };
        tokio::spawn(async move {
            match protocol.supervisor.split_tunnel_status().await {
                Ok(status) => protocol.notify_clients(
                    &DaemonMessage::SplitTunnelStatusResponse { idx: 0, status },
                    true,
                ),
                Err(e) => debug!("Failed to query split-tunnel status: {e}"),
            }
        });
    }

    fn on_vpn_pause_changed(&self) {
        self.on_vpn_state_process_saved();
    }

    fn is_client_connected(&self, only_ui: bool) -> bool {
        self.connections
            .lock()
            .values()
            .any(|c| c.authenticated && (!only_ui || c.client_type == ClientType::Ui))
    }
}
