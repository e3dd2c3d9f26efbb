//! A single connect attempt: setup, helper tasks, ordered teardown
//!
//! The attempt owns a stop signal and a task registry. Every helper task
//! spawned for the attempt (firewall watchdogs, state forwarder, route
//! receiver, health monitor) registers its join handle; teardown signals
//! stop and then awaits every handle, so nothing outlives the attempt.

use std::net::IpAddr;
use std::sync::Arc;

use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::{ConnectionSupervisor, VpnSessionInfo};
use crate::dns::{AntiTrackerMetadata, DnsSettings};
use crate::netinfo;
use crate::obfs::{ObfsTransport, OriginalServerInfo};
use crate::vpn::{TunnelProcess, TunnelState, TunnelStateInfo, VpnError, VpnResult};

/// Attempt-scoped stop signal plus the registry of helper tasks.
pub(super) struct AttemptContext {
    stop_tx: watch::Sender<bool>,
    tasks: parking_lot::Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl AttemptContext {
    fn new() -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            stop_tx,
            tasks: parking_lot::Mutex::new(Vec::new()),
        })
    }

    pub(super) fn stop_rx(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    pub(super) fn register(&self, name: &str, handle: JoinHandle<()>) {
        self.tasks.lock().push((name.to_string(), handle));
    }

    fn signal_stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Await every registered task. A panicking task is reported and
    /// swallowed: panics never cross the attempt boundary.
    async fn join_all(&self) {
        loop {
            let next = self.tasks.lock().pop();
            let Some((name, handle)) = next else { break };
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!("Attempt task '{name}' panicked: {e}");
                } else {
                    debug!("Attempt task '{name}' cancelled");
                }
            }
        }
    }
}

impl ConnectionSupervisor {
    /// Run one physical connect attempt: tear down any previous tunnel,
    /// serialize with the connect mutex, run the attempt body and always run
    /// the ordered teardown, then fire the completion signal `disconnect()`
    /// blocks on.
    #[allow(clippy::too_many_arguments)]
    pub(super) async fn run_attempt(
        self: &Arc<Self>,
        original_server: Option<OriginalServerInfo>,
        tunnel: Arc<dyn TunnelProcess>,
        manual_dns: DnsSettings,
        anti_tracker: AntiTrackerMetadata,
        firewall_on: bool,
        firewall_during_connection: bool,
        obfs: Option<Arc<dyn ObfsTransport>>,
        can_reconfigure_other_vpns: bool,
    ) -> VpnResult<()> {
        // stop any active connection first; this makes the attempt safe to
        // enter re-entrantly from the retry loop
        self.disconnect_inner()
            .await
            .map_err(|e| VpnError::Tunnel(format!("unable to stop active connection: {e}")))?;

        let _connect_guard = self.connect_lock.lock().await;

        let (done_tx, done_rx) = watch::channel(false);
        *self.attempt_done.lock() = Some(done_rx);

        let ctx = AttemptContext::new();

        let result = self
            .attempt_body(
                &ctx,
                original_server,
                tunnel.clone(),
                manual_dns,
                anti_tracker,
                firewall_on,
                firewall_during_connection,
                obfs,
                can_reconfigure_other_vpns,
            )
            .await;

        self.attempt_teardown(
            &ctx,
            tunnel,
            firewall_on,
            firewall_during_connection,
        )
        .await;

        // connection stopped: release anyone blocked in disconnect()
        *self.attempt_done.lock() = None;
        let _ = done_tx.send(true);

        // re-check the session status after each disconnection
        {
            let api = self.api.clone();
            let prefs = self.prefs.clone();
            tokio::spawn(async move {
                let session = prefs.snapshot().session.clone();
                if session.is_logged_in() {
                    let _ = api.session_status(&session.session_token).await;
                }
            });
        }

        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt_body(
        self: &Arc<Self>,
        ctx: &Arc<AttemptContext>,
        original_server: Option<OriginalServerInfo>,
        tunnel: Arc<dyn TunnelProcess>,
        manual_dns: DnsSettings,
        anti_tracker: AntiTrackerMetadata,
        firewall_on: bool,
        firewall_during_connection: bool,
        obfs: Option<Arc<dyn ObfsTransport>>,
        can_reconfigure_other_vpns: bool,
    ) -> VpnResult<()> {
        info!("Connecting...");

        *self.tunnel.lock() = Some(tunnel.clone());
        self.set_vpn_session_info(VpnSessionInfo::default());

        // The firewall must be initialized at top OS filtering priority
        // before the tunnel starts: coexistence with other VPN software
        // means winning the priority race before any packets flow. The
        // disable-then-enable cycle also clears out stale rules.
        if firewall_on || firewall_during_connection {
            info!("Initializing firewall");
            self.firewall
                .reenable(can_reconfigure_other_vpns)
                .await
                .map_err(|e| VpnError::Firewall(format!("failed to reenable firewall: {e}")))?;
        }

        let (state_tx, state_rx) = mpsc::channel::<TunnelStateInfo>(1);
        let (routing_change_tx, routing_change_rx) = mpsc::channel::<()>(1);
        let (routing_update_tx, routing_update_rx) = mpsc::channel::<()>(1);

        // tunnel server (and obfuscation proxy) addresses must stay
        // reachable while the firewall blocks everything else
        let mut destination_ips: Vec<IpAddr> = Vec::new();
        if let Some(ip) = tunnel.destination_ip() {
            destination_ips.push(ip);
        }
        if let Some(obfs) = &obfs {
            destination_ips.push(obfs.remote_endpoint().ip());
        }

        for monitor in self.firewall.background_monitors() {
            let stop = ctx.stop_rx();
            let name = monitor.name().to_string();
            debug!("Monitor '{name}' started");
            ctx.register(
                &name,
                tokio::spawn(async move { monitor.run(stop).await }),
            );
        }

        {
            let forwarder = self.clone().state_forwarder(
                ctx.clone(),
                state_rx,
                ctx.stop_rx(),
                tunnel.clone(),
                original_server,
                destination_ips.clone(),
                routing_change_tx,
                routing_update_tx,
                can_reconfigure_other_vpns,
            );
            ctx.register("state-forwarder", tokio::spawn(forwarder));
        }

        {
            let receiver = self.clone().route_change_receiver(
                ctx.stop_rx(),
                routing_change_rx,
                routing_update_rx,
                tunnel.clone(),
                obfs.clone(),
            );
            ctx.register("route-change-receiver", tokio::spawn(receiver));
        }

        // some platforms require the firewall to be demonstrably up before
        // any tunnel traffic
        if self.platform.require_firewall_before_tunnel {
            let status = self
                .firewall
                .status()
                .await
                .map_err(|e| VpnError::Firewall(format!("error checking firewall status: {e}")))?;
            if !status.is_enabled {
                return Err(VpnError::FirewallPrecondition(
                    "firewall must be enabled by now".to_string(),
                ));
            }
        }

        // device registration may have been revoked server-side; the caller
        // handles the recoverable error with a logout/re-login cycle
        {
            let prefs = self.prefs.snapshot();
            match self
                .api
                .check_device_id(&prefs.session.session_token, &prefs.session.wg_public_key)
                .await
            {
                Ok(true) => {}
                Ok(false) => return Err(VpnError::DeviceNotRegistered),
                Err(e) => warn!("Error checking device registration: {e}"), // try to connect anyway
            }
        }

        info!("Initializing connection...");
        tunnel
            .init()
            .await
            .map_err(|e| VpnError::Tunnel(format!("failed to initialize VPN object: {e}")))?;

        // pre-tunnel outbound addresses, needed by split tunnel
        // (important: after tunnel init)
        {
            let mut info = VpnSessionInfo::default();
            match netinfo::outbound_ip(false) {
                Ok(ip) => info.outbound_ipv4 = Some(ip),
                Err(e) => warn!("Failed to detect outbound IPv4 address: {e}"),
            }
            match netinfo::outbound_ip(true) {
                Ok(ip) => info.outbound_ipv6 = Some(ip),
                Err(e) => debug!("Failed to detect outbound IPv6 address: {e}"),
            }
            self.set_vpn_session_info(info);
        }

        self.firewall
            .add_hosts_to_exceptions(&destination_ips, false, false)
            .await
            .map_err(|e| {
                VpnError::Firewall(format!("unable to add hosts to firewall exceptions: {e}"))
            })?;

        info!("Initializing DNS");
        // the DNS management style may have changed since the last connect
        self.dns.apply_user_settings().await?;
        self.set_manual_dns(manual_dns, anti_tracker).await?;

        info!("Starting VPN process");
        // blocks until the tunnel stops; the error kind (including
        // reconnection-required) propagates unchanged to the retry loop
        tunnel.connect(state_tx).await
    }

    /// Ordered teardown, executed unconditionally on every attempt exit
    /// path, in reverse-of-acquisition order.
    async fn attempt_teardown(
        &self,
        ctx: &Arc<AttemptContext>,
        tunnel: Arc<dyn TunnelProcess>,
        firewall_on: bool,
        firewall_during_connection: bool,
    ) {
        // 1. routing-change detection is useless while disconnected
        self.net_change.uninit();

        // 2. remove firewall DNS rules
        if let Err(e) = self.firewall.on_change_dns(None).await {
            error!("(stopping) error removing firewall DNS rules: {e}");
        }

        // 3. coexistence bookkeeping
        if let Err(e) = self.firewall.client_disconnected().await {
            error!("(stopping) error notifying firewall about disconnected client: {e}");
        }

        // 4. stop every helper task of this attempt
        ctx.signal_stop();
        self.health.request_stop();

        // 5. reset manual DNS on the tunnel
        if let Err(e) = tunnel.reset_manual_dns().await {
            error!("(stopping) error resetting manual DNS: {e}");
        }

        // 6. wait for all helper tasks: a firewall watchdog could otherwise
        //    re-enable the firewall after we disable it below
        ctx.join_all().await;

        // 7. firewall was enabled for this connection only and was off
        //    before: disable it back
        if !firewall_on && firewall_during_connection {
            if let Err(e) = self.set_kill_switch_state(false).await {
                error!("(stopping) failed to disable firewall: {e}");
            }
        }

        // 8. forget the tunnel
        *self.tunnel.lock() = None;
        self.set_vpn_session_info(VpnSessionInfo::default());

        // 9. split tunnel now reflects "VPN disconnected"
        if let Err(e) = self.apply_split_tunnel_config().await {
            error!("(stopping) failed to re-apply split-tunnel config: {e}");
        }

        info!("VPN process stopped");
    }

    // ---------------------------------------------------------------------
    // State forwarder
    // ---------------------------------------------------------------------

    /// The single consumer of the tunnel's state channel. Stamps
    /// time/protocol/original-endpoint data, saves the state early so every
    /// reconciliation step observes it, reconciles, then notifies clients.
    #[allow(clippy::too_many_arguments)]
    async fn state_forwarder(
        self: Arc<Self>,
        ctx: Arc<AttemptContext>,
        mut state_rx: mpsc::Receiver<TunnelStateInfo>,
        mut stop: watch::Receiver<bool>,
        tunnel: Arc<dyn TunnelProcess>,
        original_server: Option<OriginalServerInfo>,
        destination_ips: Vec<IpAddr>,
        routing_change_tx: mpsc::Sender<()>,
        routing_update_tx: mpsc::Sender<()>,
        can_reconfigure_other_vpns: bool,
    ) {
        info!("VPN state forwarder started");

        loop {
            tokio::select! {
                maybe_state = state_rx.recv() => {
                    let Some(mut state) = maybe_state else { break };

                    state.time = Some(Utc::now());
                    state.vpn_type = Some(tunnel.vpn_type());

                    // an obfuscation proxy rewrote the endpoint to
                    // 127.0.0.1:<local-port>; report the real server instead
                    if state.state == TunnelState::Connected {
                        if let Some(original) = original_server {
                            state.server_ip = Some(original.ip);
                            state.server_port = original.port;
                            state.is_tcp = original.is_tcp;
                            state.obfs_proxy = original.proxy_type;
                        }
                    }

                    self.handle_tunnel_state(
                        &ctx,
                        state,
                        &tunnel,
                        &destination_ips,
                        &routing_change_tx,
                        &routing_update_tx,
                        can_reconfigure_other_vpns,
                    )
                    .await;
                }
                _ = stop.changed() => break,
            }
        }

        info!("VPN state forwarder stopped");
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_tunnel_state(
        self: &Arc<Self>,
        ctx: &Arc<AttemptContext>,
        state: TunnelStateInfo,
        tunnel: &Arc<dyn TunnelProcess>,
        destination_ips: &[IpAddr],
        routing_change_tx: &mpsc::Sender<()>,
        routing_update_tx: &mpsc::Sender<()>,
        can_reconfigure_other_vpns: bool,
    ) {
        // commit before side effects: a reconciliation step that queries
        // "current state" must see the value it is reconciling
        self.sink_save_early(state.clone(), false);

        info!("State: {} {}", state.state, state.additional_info);

        // another process's VPN state may have changed concurrently;
        // re-notify coexistence status on every transition
        self.sink_on_kill_switch_changed();

        match state.state {
            TunnelState::Reconnecting => {
                // route-change detection restarts on the next Initialised
                self.net_change.uninit();

                // some platforms drop the server exception rules across
                // reconnects; re-add them or the reconnect cannot reach out
                if let Err(e) = self
                    .firewall
                    .add_hosts_to_exceptions(destination_ips, false, false)
                    .await
                {
                    error!("Unable to add host to firewall exceptions: {e}");
                }
            }

            TunnelState::Initialised => {
                if let Err(e) = self.net_change.init(
                    None,
                    routing_change_tx.clone(),
                    routing_update_tx.clone(),
                ) {
                    error!("Failed to init route change detection: {e}");
                } else {
                    info!("Starting route change detection");
                    if let Err(e) = self.net_change.start() {
                        error!("Failed to start route change detection: {e}");
                    }
                }
            }

            TunnelState::Connected => {
                // connected: from now on an unexpected drop must reconnect
                self.required_state.promote_connected();

                if !self.sink_is_client_connected(false) {
                    log::info!(target: "system", "VPN connected");
                }

                if let Err(e) = self
                    .firewall
                    .client_connected(crate::firewall::ClientEndpoints {
                        client_ip: state.client_ip,
                        client_ipv6: state.client_ipv6,
                        client_port: state.client_port,
                        server_ip: state.server_ip,
                        server_port: state.server_port,
                        is_tcp: state.is_tcp,
                    })
                    .await
                {
                    error!("Failed to inform firewall about client endpoints: {e}");
                }

                // firewall should already be configured for a custom DNS;
                // if it still has no rule, allow the tunnel's default DNS
                if !self.firewall.dns_rule_installed() {
                    if let Some(default_dns) = tunnel.default_dns() {
                        if let Err(e) = self.firewall.on_change_dns(Some(default_dns)).await {
                            error!("Failed to install default DNS rule: {e}");
                        }
                    }
                }

                {
                    let mut info = self.vpn_session_info();
                    info.vpn_local_ipv4 = state.client_ip;
                    info.vpn_local_ipv6 = state.client_ipv6;
                    self.set_vpn_session_info(info);
                }

                // split tunnel must learn about the connected state after
                // the session info above is committed
                if let Err(e) = self.apply_split_tunnel_config().await {
                    error!("Failed to apply split-tunnel config: {e}");
                }

                // some rules cannot be applied too soon after the tunnel
                // comes up; deploy them asynchronously
                {
                    let firewall = self.firewall.clone();
                    tokio::spawn(async move {
                        if let Err(e) = firewall
                            .deploy_post_connection_rules(can_reconfigure_other_vpns)
                            .await
                        {
                            error!("Failed to deploy post-connection firewall rules: {e}");
                        }
                    });
                }

                // finally, start connectivity health checks
                {
                    let sup = self.clone();
                    let stop = ctx.stop_rx();
                    ctx.register(
                        "connectivity-healthchecks",
                        tokio::spawn(async move { sup.run_health_monitor(stop).await }),
                    );
                }
            }

            // the terminal Disconnected notification is sent exactly once by
            // the request processor after the retry loop exits
            TunnelState::Disconnected
            | TunnelState::Disconnecting
            | TunnelState::Connecting
            | TunnelState::Exiting => {}
        }

        self.sink_process_saved();
    }

    // ---------------------------------------------------------------------
    // Route-change receiver
    // ---------------------------------------------------------------------

    async fn route_change_receiver(
        self: Arc<Self>,
        mut stop: watch::Receiver<bool>,
        mut routing_change_rx: mpsc::Receiver<()>,
        mut routing_update_rx: mpsc::Receiver<()>,
        tunnel: Arc<dyn TunnelProcess>,
        obfs: Option<Arc<dyn ObfsTransport>>,
    ) {
        info!("Route change receiver started");

        loop {
            tokio::select! {
                // default route moved off the tunnel interface
                Some(()) = routing_change_rx.recv() => {
                    if self.is_paused() {
                        info!("Route change ignored due to Paused state.");
                        continue;
                    }
                    // reconnect from a separate task: disconnect() blocks
                    // until teardown, which awaits this very task
                    let sup = self.clone();
                    tokio::spawn(async move {
                        info!("Route change detected. Reconnecting...");
                        if let Err(e) = sup.reconnect().await {
                            error!("Reconnect after route change failed: {e}");
                        }
                    });
                    break;
                }

                // something changed, tunnel interface still default route
                Some(()) = routing_update_rx.recv() => {
                    if let Some(obfs) = &obfs {
                        // the static route to the proxy follows the gateway
                        if let Err(e) = obfs.update_main_route().await {
                            error!("Failed to update obfuscation proxy route: {e}");
                        }
                    }
                    tunnel.on_routing_changed();

                    let dns = self.dns.clone();
                    tokio::spawn(async move {
                        if let Err(e) = dns.update_if_wrong_settings().await {
                            error!("Failed to update DNS settings: {e}");
                        }
                    });
                }

                _ = stop.changed() => break,
            }
        }

        info!("Route change receiver stopped");
    }
}
