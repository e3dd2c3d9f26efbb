//! The tunnel-process capability interface
//!
//! A `TunnelProcess` is one attempt's worth of tunnel: the supervisor builds
//! a fresh instance per retry (new keys or ports may be needed), drives it
//! through `connect()` and consumes its state reports from the channel it
//! passes in.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::params::{HostInfo, PortSelection, VpnType};
use super::state::TunnelStateInfo;
use super::VpnResult;
use crate::preferences::SessionCredentials;

/// A running (or about to run) tunnel process.
#[async_trait]
pub trait TunnelProcess: Send + Sync {
    /// Ensure everything is prepared for a new connection (e.g. a previously
    /// started tunnel service is stopped).
    async fn init(&self) -> VpnResult<()>;

    /// Establish the tunnel and block until it stops (failure, explicit
    /// disconnect, or state-channel close). State transitions are reported
    /// on `state_tx` as they happen.
    async fn connect(&self, state_tx: mpsc::Sender<TunnelStateInfo>) -> VpnResult<()>;

    async fn disconnect(&self) -> VpnResult<()>;

    async fn pause(&self) -> VpnResult<()>;
    async fn resume(&self) -> VpnResult<()>;
    fn is_paused(&self) -> bool;

    async fn set_manual_dns(&self, dns: IpAddr) -> VpnResult<()>;
    async fn reset_manual_dns(&self) -> VpnResult<()>;

    /// The tunnel server address this process talks to (for firewall
    /// exceptions).
    fn destination_ip(&self) -> Option<IpAddr>;

    /// Default DNS inside the tunnel, used when no manual DNS rule is active
    /// by the time the tunnel reports Connected.
    fn default_dns(&self) -> Option<IpAddr>;

    fn vpn_type(&self) -> VpnType;

    /// React to OS routing changes that kept the default route on the tunnel
    /// interface (e.g. re-bind sockets).
    fn on_routing_changed(&self);
}

/// Everything needed to build one tunnel process for one attempt.
///
/// Built fresh per retry from the normalized connection parameters and the
/// *current* preferences snapshot (credentials may rotate between attempts).
#[derive(Debug, Clone)]
pub struct TunnelSpec {
    pub vpn_type: VpnType,
    pub entry_host: HostInfo,
    pub exit_host: Option<HostInfo>,
    pub port: PortSelection,
    pub mtu: u32,
    pub ipv6: bool,
    pub credentials: SessionCredentials,
    /// OpenVPN only: local proxy in front of the tunnel.
    pub proxy: super::params::ProxySettings,
}

/// Builds tunnel processes. The daemon wires in the real implementation;
/// tests substitute mocks.
#[async_trait]
pub trait TunnelBuilder: Send + Sync {
    async fn build(&self, spec: &TunnelSpec) -> VpnResult<Arc<dyn TunnelProcess>>;
}
