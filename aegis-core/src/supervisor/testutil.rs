//! Mock capability implementations for supervisor unit tests

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::dns::DnsManager;
use crate::firewall::{
    ClientEndpoints, FirewallBackgroundMonitor, FirewallCoordinator, KillSwitchStatus,
};
use crate::netchange::NetChangeDetector;
use crate::session::{AccountStatus, RemoteSessionApi, SessionData};
use crate::splittun::{SplitTunnelApplyContext, SplitTunnelCoordinator, SplitTunnelStatus};
use crate::vpn::{
    TunnelBuilder, TunnelProcess, TunnelSpec, TunnelStateInfo, VpnError, VpnResult, VpnType,
};

#[derive(Default)]
pub(crate) struct MockApi {
    pub ping_results: Mutex<VecDeque<VpnResult<bool>>>,
    pub device_found: AtomicBool,
}

impl MockApi {
    pub fn new() -> Self {
        let api = Self::default();
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
        Ok(AccountStatus {
            active: true,
            active_until: i64::MAX,
            is_can_connect_multihop: true,
            ..Default::default()
        })
    }
    async fn ping_internal_api_hosts(&self) -> VpnResult<bool> {
        self.ping_results
            .lock()
            .pop_front()
            .unwrap_or(Ok(true))
    }
}

#[derive(Default)]
pub(crate) struct MockFirewall {
    pub enabled: AtomicBool,
    pub persistent: AtomicBool,
    pub other_vpns_detected: AtomicBool,
    pub reregister_calls: AtomicUsize,
    pub calls: Mutex<Vec<String>>,
}

impl MockFirewall {
    fn record(&self, call: &str) {
        self.calls.lock().push(call.to_string());
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
        self.reregister_calls.fetch_add(1, Ordering::SeqCst);
        self.record("try_reregister_at_top_priority");
        Ok(())
    }
    fn reconfigurable_other_vpns_detected(&self) -> bool {
        self.other_vpns_detected.load(Ordering::SeqCst)
    }
    async fn apply_full_tunnel(&self) -> VpnResult<()> {
        self.record("apply_full_tunnel");
        Ok(())
    }
    async fn on_change_dns(&self, _: Option<IpAddr>) -> VpnResult<()> {
        self.record("on_change_dns");
        Ok(())
    }
    fn dns_rule_installed(&self) -> bool {
        false
    }
    fn background_monitors(&self) -> Vec<Arc<dyn FirewallBackgroundMonitor>> {
        Vec::new()
    }
    async fn deploy_post_connection_rules(&self, _: bool) -> VpnResult<()> {
        Ok(())
    }
    async fn cleanup(&self) -> VpnResult<()> {
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct MockSplitTunnel {
    pub apply_calls: AtomicUsize,
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

#[derive(Default)]
pub(crate) struct MockNetChange;

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

#[derive(Default)]
pub(crate) struct MockDns;

#[async_trait]
impl DnsManager for MockDns {
    async fn apply_user_settings(&self) -> VpnResult<()> {
        Ok(())
    }
    async fn update_if_wrong_settings(&self) -> VpnResult<()> {
        Ok(())
    }
}

/// A tunnel that does nothing but record disconnects.
#[derive(Default)]
pub(crate) struct IdleTunnel {
    pub disconnect_calls: AtomicUsize,
    pub paused: AtomicBool,
}

#[async_trait]
impl TunnelProcess for IdleTunnel {
    async fn init(&self) -> VpnResult<()> {
        Ok(())
    }
    async fn connect(&self, _: mpsc::Sender<TunnelStateInfo>) -> VpnResult<()> {
        Ok(())
    }
    async fn disconnect(&self) -> VpnResult<()> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
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
        "198.51.100.1".parse().ok()
    }
    fn default_dns(&self) -> Option<IpAddr> {
        None
    }
    fn vpn_type(&self) -> VpnType {
        VpnType::WireGuard
    }
    fn on_routing_changed(&self) {}
}

pub(crate) struct FailingBuilder;

#[async_trait]
impl TunnelBuilder for FailingBuilder {
    async fn build(&self, _: &TunnelSpec) -> VpnResult<Arc<dyn TunnelProcess>> {
        Err(VpnError::Tunnel("no tunnels in unit tests".to_string()))
    }
}
