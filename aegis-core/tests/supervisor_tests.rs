//! End-to-end tests of the connection supervisor and the request serializer
//! over mock capability implementations.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::timeout;

use aegis_core::dns::DnsManager;
use aegis_core::firewall::{
    ClientEndpoints, FirewallBackgroundMonitor, FirewallCoordinator, KillSwitchStatus,
};
use aegis_core::netchange::NetChangeDetector;
use aegis_core::preferences::PreferencesStore;
use aegis_core::session::{AccountStatus, RemoteSessionApi, SessionData};
use aegis_core::splittun::{SplitTunnelApplyContext, SplitTunnelCoordinator, SplitTunnelStatus};
use aegis_core::supervisor::VpnEventSink;
use aegis_core::vpn::{
    ConnectionParams, EntryServer, HostInfo, TunnelBuilder, TunnelProcess, TunnelSpec,
    TunnelState, TunnelStateInfo, VpnError, VpnResult, VpnType,
};
use aegis_core::{ConnectionSupervisor, PlatformFlags, Protocol, ProtocolConfig, SupervisorDeps};

// ---------------------------------------------------------------------------
// Mock capabilities
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MockApi {
    device_found: AtomicBool,
}

impl MockApi {
    fn new() -> Arc<Self> {
        let api = Arc::new(Self::default());
        api.device_found.store(true, Ordering::SeqCst);
        api
    }
}

#[async_trait]
impl RemoteSessionApi for MockApi {
    async fn session_new(&self, _: &str, _: &str, _: &str) -> VpnResult<SessionData> {
        Ok(SessionData::default())
    }
    async fn sso_login(&self, _: &str, _: &str, _: &str) -> VpnResult<SessionData> {
        Ok(SessionData::default())
    }
    async fn session_delete(&self, _: &str) -> VpnResult<()> {
        Ok(())
    }
    async fn connect_device(&self, _: &str, _: &str) -> VpnResult<()> {
        Ok(())
    }
    async fn check_device_id(&self, _: &str, _: &str) -> VpnResult<bool> {
        Ok(self.device_found.load(Ordering::SeqCst))
    }
    async fn session_status(&self, _: &str) -> VpnResult<AccountStatus> {
        Ok(active_account())
    }
    async fn ping_internal_api_hosts(&self) -> VpnResult<bool> {
        Ok(true)
    }
}

struct TestMonitor {
    started: AtomicBool,
    stopped: AtomicBool,
}

impl TestMonitor {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl FirewallBackgroundMonitor for TestMonitor {
    fn name(&self) -> &str {
        "test-monitor"
    }
    async fn run(&self, mut stop: watch::Receiver<bool>) {
        self.started.store(true, Ordering::SeqCst);
        let _ = stop.wait_for(|stopped| *stopped).await;
        self.stopped.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct MockFirewall {
    enabled: AtomicBool,
    persistent: AtomicBool,
    calls: Mutex<Vec<String>>,
    monitors: Mutex<Vec<Arc<dyn FirewallBackgroundMonitor>>>,
}

impl MockFirewall {
    fn record(&self, call: &str) {
        self.calls.lock().push(call.to_string());
    }
    fn has_call(&self, call: &str) -> bool {
        self.calls.lock().iter().any(|c| c == call)
    }
}

#[async_trait]
impl FirewallCoordinator for MockFirewall {
    async fn set_enabled(&self, enabled: bool) -> VpnResult<()> {
        self.enabled.store(enabled, Ordering::SeqCst);
        self.record(if enabled { "set_enabled(true)" } else { "set_enabled(false)" });
        Ok(())
    }
    async fn get_enabled(&self) -> VpnResult<bool> {
        Ok(self.enabled.load(Ordering::SeqCst))
    }
    async fn set_persistent(&self, persistent: bool) -> VpnResult<()> {
        self.persistent.store(persistent, Ordering::SeqCst);
        Ok(())
    }
    async fn reenable(&self, _: bool) -> VpnResult<()> {
        self.enabled.store(true, Ordering::SeqCst);
        self.record("reenable");
        Ok(())
    }
    async fn status(&self) -> VpnResult<KillSwitchStatus> {
        Ok(KillSwitchStatus {
            is_enabled: self.enabled.load(Ordering::SeqCst),
            is_persistent: self.persistent.load(Ordering::SeqCst),
            ..Default::default()
        })
    }
    async fn add_hosts_to_exceptions(&self, _: &[IpAddr], _: bool, _: bool) -> VpnResult<()> {
        self.record("add_hosts_to_exceptions");
        Ok(())
    }
    async fn remove_hosts_from_exceptions(&self, _: &[IpAddr]) -> VpnResult<()> {
        Ok(())
    }
    async fn set_allow_lan(&self, _: bool, _: bool) -> VpnResult<()> {
        Ok(())
    }
    async fn set_user_exceptions(&self, _: &str) -> VpnResult<()> {
        Ok(())
    }
    async fn client_connected(&self, _: ClientEndpoints) -> VpnResult<()> {
        self.record("client_connected");
        Ok(())
    }
    async fn client_disconnected(&self) -> VpnResult<()> {
        self.record("client_disconnected");
        Ok(())
    }
    fn client_paused(&self) {
        self.record("client_paused");
    }
    fn client_resumed(&self) {
        self.record("client_resumed");
    }
    async fn try_reregister_at_top_priority(&self, _: bool) -> VpnResult<()> {
        Ok(())
    }
    fn reconfigurable_other_vpns_detected(&self) -> bool {
        false
    }
    async fn apply_full_tunnel(&self) -> VpnResult<()> {
        Ok(())
    }
    async fn on_change_dns(&self, _: Option<IpAddr>) -> VpnResult<()> {
        Ok(())
    }
    fn dns_rule_installed(&self) -> bool {
        false
    }
    fn background_monitors(&self) -> Vec<Arc<dyn FirewallBackgroundMonitor>> {
        self.monitors.lock().clone()
    }
    async fn deploy_post_connection_rules(&self, _: bool) -> VpnResult<()> {
        Ok(())
    }
    async fn cleanup(&self) -> VpnResult<()> {
        Ok(())
    }
}

#[derive(Default)]
struct MockSplitTunnel {
    apply_calls: AtomicUsize,
}

#[async_trait]
impl SplitTunnelCoordinator for MockSplitTunnel {
    async fn apply_config(&self, _: SplitTunnelApplyContext) -> VpnResult<()> {
        self.apply_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    async fn reset(&self) -> VpnResult<()> {
        Ok(())
    }
    async fn status(&self) -> VpnResult<SplitTunnelStatus> {
        Ok(SplitTunnelStatus::default())
    }
    async fn add_app(&self, _: &str) -> VpnResult<()> {
        Ok(())
    }
    async fn remove_app(&self, _: &str) -> VpnResult<()> {
        Ok(())
    }
}

struct MockNetChange;

impl NetChangeDetector for MockNetChange {
    fn init(&self, _: Option<String>, _: mpsc::Sender<()>, _: mpsc::Sender<()>) -> VpnResult<()> {
        Ok(())
    }
    fn start(&self) -> VpnResult<()> {
        Ok(())
    }
    fn stop(&self) {}
    fn uninit(&self) {}
}

struct MockDns;

#[async_trait]
impl DnsManager for MockDns {
    async fn apply_user_settings(&self) -> VpnResult<()> {
        Ok(())
    }
    async fn update_if_wrong_settings(&self) -> VpnResult<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Scripted tunnels
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq)]
enum TunnelBehavior {
    /// Emit Connecting, then fail without ever reaching Connected.
    FailImmediately,
    /// Emit Connecting only, then hold until disconnected (negotiating).
    HoldWithoutConnecting,
    /// Reach Connected, then hold until disconnected.
    ConnectThenHold,
    /// Reach Connected, then fail after a short delay.
    ConnectThenFail,
}

struct ScriptedTunnel {
    behavior: TunnelBehavior,
    server_ip: IpAddr,
    stop_requested: AtomicBool,
    stop_notify: Notify,
    paused: AtomicBool,
}

impl ScriptedTunnel {
    fn new(behavior: TunnelBehavior, server_ip: &str) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            server_ip: server_ip.parse().unwrap(),
            stop_requested: AtomicBool::new(false),
            stop_notify: Notify::new(),
            paused: AtomicBool::new(false),
        })
    }

    async fn wait_for_stop(&self) {
        loop {
            let notified = self.stop_notify.notified();
            if self.stop_requested.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }

    fn connected_state(&self) -> TunnelStateInfo {
        TunnelStateInfo::connected(
            "10.8.0.2".parse().unwrap(),
            None,
            51820,
            self.server_ip,
            2049,
            false,
            "",
        )
    }
}

#[async_trait]
impl TunnelProcess for ScriptedTunnel {
    async fn init(&self) -> VpnResult<()> {
        Ok(())
    }

    async fn connect(&self, state_tx: mpsc::Sender<TunnelStateInfo>) -> VpnResult<()> {
        let _ = state_tx
            .send(TunnelStateInfo::new(TunnelState::Connecting, ""))
            .await;

        match self.behavior {
            TunnelBehavior::FailImmediately => {
                Err(VpnError::Tunnel("handshake failed".to_string()))
            }
            TunnelBehavior::HoldWithoutConnecting => {
                self.wait_for_stop().await;
                let _ = state_tx
                    .send(TunnelStateInfo::new(TunnelState::Disconnected, ""))
                    .await;
                Ok(())
            }
            TunnelBehavior::ConnectThenHold => {
                let _ = state_tx
                    .send(TunnelStateInfo::new(TunnelState::Initialised, ""))
                    .await;
                let _ = state_tx.send(self.connected_state()).await;
                self.wait_for_stop().await;
                let _ = state_tx
                    .send(TunnelStateInfo::new(TunnelState::Disconnected, ""))
                    .await;
                Ok(())
            }
            TunnelBehavior::ConnectThenFail => {
                let _ = state_tx
                    .send(TunnelStateInfo::new(TunnelState::Initialised, ""))
                    .await;
                let _ = state_tx.send(self.connected_state()).await;
                tokio::select! {
                    _ = self.wait_for_stop() => Ok(()),
                    _ = tokio::time::sleep(Duration::from_millis(150)) => {
                        Err(VpnError::Tunnel("link lost".to_string()))
                    }
                }
            }
        }
    }

    async fn disconnect(&self) -> VpnResult<()> {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.stop_notify.notify_waiters();
        Ok(())
    }

    async fn pause(&self) -> VpnResult<()> {
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }
    async fn resume(&self) -> VpnResult<()> {
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }
    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
    async fn set_manual_dns(&self, _: IpAddr) -> VpnResult<()> {
        Ok(())
    }
    async fn reset_manual_dns(&self) -> VpnResult<()> {
        Ok(())
    }
    fn destination_ip(&self) -> Option<IpAddr> {
        Some(self.server_ip)
    }
    fn default_dns(&self) -> Option<IpAddr> {
        None
    }
    fn vpn_type(&self) -> VpnType {
        VpnType::WireGuard
    }
    fn on_routing_changed(&self) {}
}

type BuildFn =
    Box<dyn Fn(usize, &TunnelSpec) -> VpnResult<Arc<dyn TunnelProcess>> + Send + Sync>;

struct ScriptedBuilder {
    build_count: AtomicUsize,
    factory: BuildFn,
}

impl ScriptedBuilder {
    fn new(factory: BuildFn) -> Arc<Self> {
        Arc::new(Self {
            build_count: AtomicUsize::new(0),
            factory,
        })
    }

    fn builds(&self) -> usize {
        self.build_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TunnelBuilder for ScriptedBuilder {
    async fn build(&self, spec: &TunnelSpec) -> VpnResult<Arc<dyn TunnelProcess>> {
        let n = self.build_count.fetch_add(1, Ordering::SeqCst);
        (self.factory)(n, spec)
    }
}

// ---------------------------------------------------------------------------
// Test event sink
// ---------------------------------------------------------------------------

#[derive(Default)]
struct TestSink {
    states: Mutex<Vec<TunnelStateInfo>>,
    state_notify: Notify,
}

impl TestSink {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn count_states(&self, state: TunnelState) -> usize {
        self.states.lock().iter().filter(|s| s.state == state).count()
    }

    async fn wait_for_nth_state(&self, state: TunnelState, n: usize) {
        timeout(Duration::from_secs(10), async {
            loop {
                let notified = self.state_notify.notified();
                if self.count_states(state) >= n {
                    return;
                }
                notified.await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {n}x {state:?}"));
    }
}

impl VpnEventSink for TestSink {
    fn on_vpn_state_save_early(&self, state: TunnelStateInfo, _save_and_process: bool) {
        self.states.lock().push(state);
        self.state_notify.notify_waiters();
    }
    fn on_vpn_state_process_saved(&self) {}
    fn on_kill_switch_state_changed(&self) {}
    fn on_split_tunnel_status_changed(&self) {}
    fn on_vpn_pause_changed(&self) {}
    fn is_client_connected(&self, _only_ui: bool) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Fixture plumbing
// ---------------------------------------------------------------------------

fn active_account() -> AccountStatus {
    AccountStatus {
        active: true,
        active_until: i64::MAX,
        is_can_connect_multihop: true,
        ..Default::default()
    }
}

fn logged_in_prefs() -> Arc<PreferencesStore> {
    let prefs = Arc::new(PreferencesStore::ephemeral());
    prefs
        .update(|p| {
            p.session.account_id = "acct-1".to_string();
            p.session.session_token = "session-token".to_string();
            p.session.wg_public_key = "pubkey".to_string();
            p.session.wg_private_key = "privkey".to_string();
            p.session.wg_local_ip = "10.8.0.2".to_string();
            p.session.wg_keys_generated = chrono::Utc::now().timestamp();
            p.session.wg_rotation_interval = 7 * 24 * 3600;
            p.account = active_account();
        })
        .unwrap();
    prefs
}

fn wg_params(host_ip: &str) -> ConnectionParams {
    ConnectionParams {
        vpn_type: VpnType::WireGuard,
        wireguard: aegis_core::vpn::WireGuardConnectionParams {
            entry_server: EntryServer {
                hosts: vec![HostInfo {
                    hostname: format!("{host_ip}.test"),
                    endpoint_ip: host_ip.to_string(),
                    endpoint_port: 2049,
                    public_key: "c2VydmVyLWtleQ==".to_string(),
                    ..Default::default()
                }],
            },
            ..Default::default()
        },
        ..Default::default()
    }
}

struct Fixture {
    supervisor: Arc<ConnectionSupervisor>,
    firewall: Arc<MockFirewall>,
    split_tunnel: Arc<MockSplitTunnel>,
    builder: Arc<ScriptedBuilder>,
    sink: Arc<TestSink>,
}

fn fixture_with_builder(builder: Arc<ScriptedBuilder>) -> Fixture {
    let firewall = Arc::new(MockFirewall::default());
    let split_tunnel = Arc::new(MockSplitTunnel::default());

    let supervisor = ConnectionSupervisor::new(SupervisorDeps {
        prefs: logged_in_prefs(),
        api: MockApi::new(),
        firewall: firewall.clone(),
        split_tunnel: split_tunnel.clone(),
        net_change: Arc::new(MockNetChange),
        dns: Arc::new(MockDns),
        tunnel_builder: builder.clone(),
        obfs_launcher: None,
        platform: PlatformFlags {
            require_firewall_before_tunnel: false,
        },
    });

    let sink = TestSink::new();
    supervisor.set_event_sink(sink.clone());

    Fixture {
        supervisor,
        firewall,
        split_tunnel,
        builder,
        sink,
    }
}

// ---------------------------------------------------------------------------
// Supervisor property tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_first_attempt_error_is_returned_and_loop_terminates() {
    let builder = ScriptedBuilder::new(Box::new(|_, _| {
        Ok(ScriptedTunnel::new(TunnelBehavior::FailImmediately, "192.0.2.10")
            as Arc<dyn TunnelProcess>)
    }));
    let f = fixture_with_builder(builder);

    let result = f.supervisor.connect(wg_params("192.0.2.10")).await;
    assert!(result.is_err(), "first-attempt error must propagate");

    // no retry: the tunnel never reached Connected
    assert_eq!(f.builder.builds(), 1);
    assert!(!f.supervisor.connected_or_connecting());
}

#[tokio::test]
async fn test_unexpected_drop_after_connected_triggers_automatic_reconnect() {
    let builder = ScriptedBuilder::new(Box::new(|n, _| {
        let behavior = if n == 0 {
            TunnelBehavior::ConnectThenFail
        } else {
            TunnelBehavior::ConnectThenHold
        };
        Ok(ScriptedTunnel::new(behavior, "192.0.2.20") as Arc<dyn TunnelProcess>)
    }));
    let f = fixture_with_builder(builder);

    let supervisor = f.supervisor.clone();
    let connect_task =
        tokio::spawn(async move { supervisor.connect(wg_params("192.0.2.20")).await });

    // first Connected, injected failure, automatic retry, second Connected
    f.sink.wait_for_nth_state(TunnelState::Connected, 2).await;
    assert!(f.builder.builds() >= 2, "loop must not exit after the drop");
    assert!(f.sink.count_states(TunnelState::Reconnecting) >= 1);

    f.supervisor.disconnect().await.unwrap();
    let result = timeout(Duration::from_secs(5), connect_task)
        .await
        .expect("connect must return after disconnect")
        .unwrap();
    assert!(result.is_ok(), "retried attempts never surface errors");
}

#[tokio::test]
async fn test_disconnect_tears_down_all_attempt_tasks() {
    let builder = ScriptedBuilder::new(Box::new(|_, _| {
        Ok(ScriptedTunnel::new(TunnelBehavior::ConnectThenHold, "192.0.2.30")
            as Arc<dyn TunnelProcess>)
    }));
    let f = fixture_with_builder(builder);

    let monitor = TestMonitor::new();
    f.firewall.monitors.lock().push(monitor.clone());

    let supervisor = f.supervisor.clone();
    let connect_task =
        tokio::spawn(async move { supervisor.connect(wg_params("192.0.2.30")).await });

    f.sink.wait_for_nth_state(TunnelState::Connected, 1).await;
    assert!(monitor.started.load(Ordering::SeqCst));

    let applies_before = f.split_tunnel.apply_calls.load(Ordering::SeqCst);
    f.supervisor.disconnect().await.unwrap();

    // disconnect() blocks until full teardown: every attempt task reported
    // stopped, the tunnel handle is gone and split tunnel was re-applied
    assert!(monitor.stopped.load(Ordering::SeqCst));
    assert!(!f.supervisor.connected_or_connecting());
    assert!(f.firewall.has_call("client_disconnected"));
    assert!(f.split_tunnel.apply_calls.load(Ordering::SeqCst) > applies_before);

    timeout(Duration::from_secs(5), connect_task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_pause_restores_non_persistent_firewall_on_expiry() {
    let builder = ScriptedBuilder::new(Box::new(|_, _| {
        Ok(ScriptedTunnel::new(TunnelBehavior::ConnectThenHold, "192.0.2.40")
            as Arc<dyn TunnelProcess>)
    }));
    let f = fixture_with_builder(builder);

    // non-persistent firewall enabled before the pause
    f.firewall.enabled.store(true, Ordering::SeqCst);

    let supervisor = f.supervisor.clone();
    let connect_task =
        tokio::spawn(async move { supervisor.connect(wg_params("192.0.2.40")).await });
    f.sink.wait_for_nth_state(TunnelState::Connected, 1).await;

    f.supervisor.pause(1).await.unwrap();
    assert!(f.supervisor.is_paused());
    // non-persistent and enabled: forced off for the pause
    assert!(!f.firewall.enabled.load(Ordering::SeqCst));
    assert!(f.firewall.has_call("client_paused"));

    // natural expiry: the 1-second resume ticker fires
    timeout(Duration::from_secs(8), async {
        while f.supervisor.is_paused() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("pause must expire on its own");

    // pre-pause state restored
    timeout(Duration::from_secs(2), async {
        while !f.firewall.enabled.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("firewall must be restored after resume");
    assert!(f.firewall.has_call("client_resumed"));

    f.supervisor.disconnect().await.unwrap();
    timeout(Duration::from_secs(5), connect_task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_pause_leaves_persistent_firewall_alone() {
    let builder = ScriptedBuilder::new(Box::new(|_, _| {
        Ok(ScriptedTunnel::new(TunnelBehavior::ConnectThenHold, "192.0.2.41")
            as Arc<dyn TunnelProcess>)
    }));
    let f = fixture_with_builder(builder);

    f.firewall.enabled.store(true, Ordering::SeqCst);
    f.firewall.persistent.store(true, Ordering::SeqCst);

    let supervisor = f.supervisor.clone();
    let connect_task =
        tokio::spawn(async move { supervisor.connect(wg_params("192.0.2.41")).await });
    f.sink.wait_for_nth_state(TunnelState::Connected, 1).await;

    f.supervisor.pause(30).await.unwrap();
    assert!(f.firewall.enabled.load(Ordering::SeqCst), "persistent firewall never toggled");

    f.supervisor.resume().await.unwrap();
    assert!(f.firewall.enabled.load(Ordering::SeqCst));
    assert!(!f.supervisor.is_paused());

    f.supervisor.disconnect().await.unwrap();
    timeout(Duration::from_secs(5), connect_task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_settings_received_while_connected_are_parked() {
    let builder = ScriptedBuilder::new(Box::new(|_, _| {
        Ok(ScriptedTunnel::new(TunnelBehavior::ConnectThenHold, "192.0.2.50")
            as Arc<dyn TunnelProcess>)
    }));
    let f = fixture_with_builder(builder);

    let original = wg_params("192.0.2.50");
    let supervisor = f.supervisor.clone();
    let params = original.clone();
    let connect_task = tokio::spawn(async move { supervisor.connect(params).await });
    f.sink.wait_for_nth_state(TunnelState::Connected, 1).await;

    // live reconfiguration: parked, not applied
    let updated = wg_params("192.0.2.51");
    f.supervisor.set_connection_params(updated.clone()).unwrap();
    assert_eq!(
        f.supervisor.get_connection_params().wireguard.entry_server,
        original.wireguard.entry_server,
        "stored params must describe the actual connection while connected"
    );

    f.supervisor.disconnect().await.unwrap();
    timeout(Duration::from_secs(5), connect_task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    // applied after disconnect
    assert_eq!(
        f.supervisor.get_connection_params().wireguard.entry_server,
        updated.wireguard.entry_server
    );
}

// ---------------------------------------------------------------------------
// Protocol-level tests (request serializer over a real socket)
// ---------------------------------------------------------------------------

const TEST_SECRET: u64 = 0x5eed;

struct TestClient {
    lines: tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl TestClient {
    async fn connect(port: u16) -> Self {
        let stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .expect("failed to connect to protocol server");
        let (reader, writer) = stream.into_split();
        let mut client = Self {
            lines: BufReader::new(reader).lines(),
            writer,
        };

        client
            .send(&format!(
                r#"{{"command":"Hello","idx":1,"secret":{TEST_SECRET}}}"#
            ))
            .await;
        let hello = client.next_message().await;
        assert_eq!(hello["command"], "HelloResponse");
        client
    }

    async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    async fn next_message(&mut self) -> serde_json::Value {
        let line = timeout(Duration::from_secs(10), self.lines.next_line())
            .await
            .expect("timed out waiting for a protocol message")
            .expect("connection error")
            .expect("connection closed");
        serde_json::from_str(&line).expect("daemon sent invalid JSON")
    }

    /// Read messages until `command` arrives, returning (preceding, match).
    async fn wait_for(&mut self, command: &str) -> (Vec<serde_json::Value>, serde_json::Value) {
        let mut preceding = Vec::new();
        loop {
            let message = self.next_message().await;
            if message["command"] == command {
                return (preceding, message);
            }
            preceding.push(message);
        }
    }
}

async fn protocol_fixture(builder: Arc<ScriptedBuilder>) -> (Arc<Protocol>, u16) {
    let firewall = Arc::new(MockFirewall::default());
    let api = MockApi::new();

    let supervisor = ConnectionSupervisor::new(SupervisorDeps {
        prefs: logged_in_prefs(),
        api: api.clone(),
        firewall,
        split_tunnel: Arc::new(MockSplitTunnel::default()),
        net_change: Arc::new(MockNetChange),
        dns: Arc::new(MockDns),
        tunnel_builder: builder,
        obfs_launcher: None,
        platform: PlatformFlags {
            require_firewall_before_tunnel: false,
        },
    });

    let protocol = Protocol::new(
        ProtocolConfig {
            listen_port: 0,
            secret: TEST_SECRET,
        },
        supervisor,
        api,
    );
    let port = protocol.start().await.expect("protocol server must start");
    (protocol, port)
}

fn connect_request_json(host_ip: &str) -> String {
    let params = wg_params(host_ip);
    let params_json = serde_json::to_value(&params).unwrap();
    serde_json::to_string(&serde_json::json!({
        "command": "Connect",
        "idx": 2,
        "params": params_json,
    }))
    .unwrap()
}

#[tokio::test]
async fn test_newer_connect_request_supersedes_older_silently() {
    // 10.0.0.2 never finishes negotiating; 10.0.0.1 connects
    let builder = ScriptedBuilder::new(Box::new(|_, spec| {
        let behavior = if spec.entry_host.endpoint_ip == "10.0.0.2" {
            TunnelBehavior::HoldWithoutConnecting
        } else {
            TunnelBehavior::ConnectThenHold
        };
        Ok(ScriptedTunnel::new(behavior, &spec.entry_host.endpoint_ip)
            as Arc<dyn TunnelProcess>)
    }));

    let (_protocol, port) = protocol_fixture(builder).await;
    let mut client = TestClient::connect(port).await;

    // first request starts negotiating: the first CONNECTING notification
    // comes from the retry loop, the second from the tunnel process itself,
    // so after two of them the attempt is guaranteed to be in flight
    client.send(&connect_request_json("10.0.0.2")).await;
    client.wait_for("VpnStateNotification").await;
    client.wait_for("VpnStateNotification").await;

    // second request supersedes it mid-negotiation
    client.send(&connect_request_json("10.0.0.1")).await;

    let (preceding, connected) = client.wait_for("ConnectedNotification").await;

    // the superseded attempt must not produce a Disconnected notification
    for message in &preceding {
        assert_ne!(
            message["command"], "DisconnectedNotification",
            "superseded request teardown must be silent, got: {message}"
        );
    }

    // the system converged on the newest request
    assert_eq!(connected["state"]["server_ip"], "10.0.0.1");

    // explicit disconnect yields exactly one terminal notification
    client
        .send(r#"{"command":"Disconnect","idx":3}"#)
        .await;
    let (_, disconnected) = client.wait_for("DisconnectedNotification").await;
    assert_eq!(disconnected["reason"], "DisconnectRequested");
}

#[tokio::test]
async fn test_exhausted_retry_reports_single_disconnected_failure() {
    // first tunnel connects then dies; the retry cannot even build a tunnel
    let builder = ScriptedBuilder::new(Box::new(|n, spec| {
        if n == 0 {
            Ok(ScriptedTunnel::new(
                TunnelBehavior::ConnectThenFail,
                &spec.entry_host.endpoint_ip,
            ) as Arc<dyn TunnelProcess>)
        } else {
            Err(VpnError::Tunnel("tunnel binary vanished".to_string()))
        }
    }));

    let (_protocol, port) = protocol_fixture(builder).await;
    let mut client = TestClient::connect(port).await;

    client.send(&connect_request_json("10.0.0.7")).await;
    client.wait_for("ConnectedNotification").await;

    let (_, disconnected) = client.wait_for("DisconnectedNotification").await;
    assert_eq!(disconnected["failure"], true);
    assert_eq!(disconnected["reason"], "Unknown");
    assert!(disconnected["reason_description"]
        .as_str()
        .unwrap()
        .contains("tunnel binary vanished"));

    // exactly one terminal notification: nothing else arrives afterwards
    client
        .send(r#"{"command":"KillSwitchGetStatus","idx":9}"#)
        .await;
    let (preceding, _) = client.wait_for("KillSwitchStatusResponse").await;
    for message in &preceding {
        assert_ne!(message["command"], "DisconnectedNotification");
    }
}

#[tokio::test]
async fn test_wrong_secret_drops_connection() {
    let builder = ScriptedBuilder::new(Box::new(|_, _| {
        Err(VpnError::Tunnel("unused".to_string()))
    }));
    let (_protocol, port) = protocol_fixture(builder).await;

    let stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .unwrap();
    let (reader, mut writer) = stream.into_split();
    writer
        .write_all(b"{\"command\":\"Hello\",\"idx\":1,\"secret\":999}\n")
        .await
        .unwrap();

    let mut lines = BufReader::new(reader).lines();
    let line = timeout(Duration::from_secs(5), lines.next_line())
        .await
        .expect("server must react");
    // server closes without a HelloResponse
    assert!(matches!(line, Ok(None) | Err(_)));
}
