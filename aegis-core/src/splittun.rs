//! Split-tunnel coordination interface
//!
//! The driver-level packet steering is platform work behind this trait; the
//! core's job is to re-apply the configuration on every transition that
//! changes effective reachability (connect, disconnect, pause, resume).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::preferences::SplitTunnelConfig;
use crate::vpn::VpnResult;

/// Split-tunnel status as reported to clients.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SplitTunnelStatus {
    pub enabled: bool,
    pub inversed: bool,
    pub app_whitelist_enabled: bool,
    pub allow_any_dns: bool,
    pub allow_when_no_vpn: bool,
    pub apps: Vec<String>,
    /// Whether the driver is functional on this platform.
    pub is_functional: bool,
}

/// Inputs the driver needs to program steering rules.
#[derive(Debug, Clone, Default)]
pub struct SplitTunnelApplyContext {
    pub vpn_connected: bool,
    pub vpn_paused: bool,
    pub config: SplitTunnelConfig,
    /// Pre-tunnel outbound addresses (traffic excluded from the tunnel).
    pub outbound_ipv4: Option<std::net::IpAddr>,
    pub outbound_ipv6: Option<std::net::IpAddr>,
    /// VPN-local addresses (traffic steered into the tunnel).
    pub vpn_local_ipv4: Option<std::net::IpAddr>,
    pub vpn_local_ipv6: Option<std::net::IpAddr>,
}

#[async_trait]
pub trait SplitTunnelCoordinator: Send + Sync {
    /// Program the driver for the given connectivity context.
    async fn apply_config(&self, ctx: SplitTunnelApplyContext) -> VpnResult<()>;

    /// Drop all steering rules and forget registered apps.
    async fn reset(&self) -> VpnResult<()>;

    async fn status(&self) -> VpnResult<SplitTunnelStatus>;

    async fn add_app(&self, exec: &str) -> VpnResult<()>;
    async fn remove_app(&self, exec: &str) -> VpnResult<()>;
}
