//! Firewall (kill-switch) coordination interface
//!
//! The supervisor treats the firewall as a capability: enable/disable, host
//! exceptions, coexistence bookkeeping with other vendors' VPN software, and
//! the full-tunnel ("block everything except the VPN") mode. The OS-specific
//! rule programming lives behind this trait.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::vpn::VpnResult;

/// Live kill-switch state plus the coexistence picture.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KillSwitchStatus {
    pub is_enabled: bool,
    pub is_persistent: bool,
    pub is_allow_lan: bool,
    pub is_allow_multicast: bool,
    pub is_allow_api_servers: bool,
    pub user_exceptions: String,

    /// Whether our filtering layer currently holds top OS priority.
    pub has_top_firewall_priority: bool,
    /// Name of the competing VPN product holding priority, if any.
    pub other_vpn_name: String,
    /// Competing VPNs we know how to reconfigure were detected.
    pub reconfigurable_other_vpns_detected: bool,
}

/// Endpoint data handed to the firewall once the tunnel is connected.
#[derive(Debug, Clone, Copy)]
pub struct ClientEndpoints {
    pub client_ip: Option<IpAddr>,
    pub client_ipv6: Option<IpAddr>,
    pub client_port: u16,
    pub server_ip: Option<IpAddr>,
    pub server_port: u16,
    pub is_tcp: bool,
}

/// A platform-provided firewall watchdog that runs for the lifetime of one
/// connect attempt (e.g. re-asserting rules another process keeps flushing).
#[async_trait]
pub trait FirewallBackgroundMonitor: Send + Sync {
    fn name(&self) -> &str;

    /// Run until `stop` flips to true.
    async fn run(&self, stop: watch::Receiver<bool>);
}

/// The firewall capability the connection core drives.
#[async_trait]
pub trait FirewallCoordinator: Send + Sync {
    async fn set_enabled(&self, enabled: bool) -> VpnResult<()>;
    async fn get_enabled(&self) -> VpnResult<bool>;
    async fn set_persistent(&self, persistent: bool) -> VpnResult<()>;

    /// Unconditional disable-then-enable at top OS filtering priority,
    /// clearing out stale rules. Must run before the tunnel starts so the
    /// priority race against other VPN software is won before packets flow.
    async fn reenable(&self, can_reconfigure_other_vpns: bool) -> VpnResult<()>;

    async fn status(&self) -> VpnResult<KillSwitchStatus>;

    async fn add_hosts_to_exceptions(
        &self,
        hosts: &[IpAddr],
        only_icmp: bool,
        persistent: bool,
    ) -> VpnResult<()>;
    async fn remove_hosts_from_exceptions(&self, hosts: &[IpAddr]) -> VpnResult<()>;

    async fn set_allow_lan(&self, allow_lan: bool, allow_multicast: bool) -> VpnResult<()>;
    async fn set_user_exceptions(&self, exceptions: &str) -> VpnResult<()>;

    /// Coexistence bookkeeping: the VPN client's lifecycle as seen by the
    /// firewall layer.
    async fn client_connected(&self, endpoints: ClientEndpoints) -> VpnResult<()>;
    async fn client_disconnected(&self) -> VpnResult<()>;
    fn client_paused(&self);
    fn client_resumed(&self);

    /// Re-register our filtering layer at top OS priority (remediation for
    /// "another VPN took priority" failures).
    async fn try_reregister_at_top_priority(&self, force: bool) -> VpnResult<()>;

    /// Competing VPNs we could reconfigure are present.
    fn reconfigurable_other_vpns_detected(&self) -> bool;

    /// Apply or remove the full-tunnel mode according to current settings.
    async fn apply_full_tunnel(&self) -> VpnResult<()>;

    /// Install (Some) or clear (None) the DNS allow rule.
    async fn on_change_dns(&self, dns: Option<IpAddr>) -> VpnResult<()>;
    /// Whether a DNS allow rule is currently installed.
    fn dns_rule_installed(&self) -> bool;

    /// Platform watchdogs to run for the duration of a connect attempt.
    fn background_monitors(&self) -> Vec<Arc<dyn FirewallBackgroundMonitor>>;

    /// Rules that can only be applied once the tunnel is fully up (some
    /// lookups fail if run too soon after the tunnel connects).
    async fn deploy_post_connection_rules(&self, can_reconfigure_other_vpns: bool)
        -> VpnResult<()>;

    /// Remove everything we ever installed (daemon uninstall/cleanup path).
    async fn cleanup(&self) -> VpnResult<()>;
}
