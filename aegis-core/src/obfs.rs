//! Obfuscation transport capability (V2Ray-style proxy wrapping)
//!
//! When a connection requests an obfuscated transport, the supervisor starts
//! a local proxy via [`ObfsLauncher`] and rewrites the effective tunnel
//! endpoint to `127.0.0.1:<local_port>`. The original endpoint is kept so
//! client-facing Connected notifications report the real server, not the
//! local proxy.

use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::vpn::VpnResult;

/// Which obfuscation transport wraps the tunnel, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ObfsTransportType {
    #[default]
    None,
    Quic,
    Tcp,
}

impl ObfsTransportType {
    pub fn is_active(&self) -> bool {
        !matches!(self, ObfsTransportType::None)
    }
}

/// The real entry server hidden behind a local obfuscation proxy.
/// Used to report truthful endpoint data in Connected notifications.
#[derive(Debug, Clone, Copy)]
pub struct OriginalServerInfo {
    pub ip: IpAddr,
    pub port: u16,
    pub is_tcp: bool,
    pub proxy_type: ObfsTransportType,
}

/// A running obfuscation proxy process.
#[async_trait]
pub trait ObfsTransport: Send + Sync {
    /// Local port the tunnel should connect to instead of the real server.
    fn local_port(&self) -> u16;

    /// Remote endpoint of the proxy (needed for firewall exceptions).
    fn remote_endpoint(&self) -> SocketAddr;

    /// Re-pin the static route to the proxy server after a default-gateway
    /// change.
    async fn update_main_route(&self) -> VpnResult<()>;

    async fn stop(&self) -> VpnResult<()>;
}

/// Starts obfuscation proxies.
#[async_trait]
pub trait ObfsLauncher: Send + Sync {
    async fn start(
        &self,
        transport: ObfsTransportType,
        remote: SocketAddr,
        tls_server_name: &str,
    ) -> VpnResult<std::sync::Arc<dyn ObfsTransport>>;
}
