//! Tunnel state reporting types
//!
//! A tunnel process publishes `TunnelStateInfo` values on the per-attempt
//! state channel. The supervisor is the single consumer: it stamps the
//! wall-clock time and protocol type before fanning the state out, so every
//! downstream observer sees one consistent "current state".

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::params::VpnType;
use crate::obfs::ObfsTransportType;

/// Lifecycle states a tunnel process can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TunnelState {
    Disconnecting,
    Disconnected,
    Connecting,
    /// Tunnel interface is up but traffic is not flowing yet.
    Initialised,
    Reconnecting,
    Connected,
    /// Tunnel process is exiting (possibly due to an authentication failure).
    Exiting,
}

impl TunnelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelState::Disconnecting => "DISCONNECTING",
            TunnelState::Disconnected => "DISCONNECTED",
            TunnelState::Connecting => "CONNECTING",
            TunnelState::Initialised => "INITIALISED",
            TunnelState::Reconnecting => "RECONNECTING",
            TunnelState::Connected => "CONNECTED",
            TunnelState::Exiting => "EXITING",
        }
    }
}

impl std::fmt::Display for TunnelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the tunnel ended up disconnected. Pushed to clients with the terminal
/// `Disconnected` notification so UIs can decide whether to offer their own
/// auto-reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectionReason {
    Unknown,
    AuthenticationError,
    DisconnectRequested,
}

/// A single state report from a tunnel process.
///
/// `time` and `vpn_type` are `None` as produced by the tunnel; the supervisor
/// fills them in before publishing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelStateInfo {
    pub state: TunnelState,
    pub additional_info: String,

    pub time: Option<DateTime<Utc>>,
    pub vpn_type: Option<VpnType>,

    pub client_ip: Option<IpAddr>,
    pub client_ipv6: Option<IpAddr>,
    pub client_port: u16,
    pub server_ip: Option<IpAddr>,
    pub server_port: u16,
    pub is_tcp: bool,
    pub exit_hostname: String,

    /// Meaningful only for `Exiting`: the process died because the server
    /// rejected our credentials.
    pub is_auth_error: bool,

    /// Meaningful only for `Connected`: process alive, traffic suspended.
    pub is_paused: bool,
    pub paused_till: Option<DateTime<Utc>>,

    /// Obfuscation transport in front of the tunnel, if any.
    pub obfs_proxy: ObfsTransportType,
}

impl TunnelStateInfo {
    pub fn new(state: TunnelState, additional_info: impl Into<String>) -> Self {
        Self {
            state,
            additional_info: additional_info.into(),
            time: None,
            vpn_type: None,
            client_ip: None,
            client_ipv6: None,
            client_port: 0,
            server_ip: None,
            server_port: 0,
            is_tcp: false,
            exit_hostname: String::new(),
            is_auth_error: false,
            is_paused: false,
            paused_till: None,
            obfs_proxy: ObfsTransportType::None,
        }
    }

    /// Connected-state report with the negotiated addresses.
    #[allow(clippy::too_many_arguments)]
    pub fn connected(
        client_ip: IpAddr,
        client_ipv6: Option<IpAddr>,
        client_port: u16,
        server_ip: IpAddr,
        server_port: u16,
        is_tcp: bool,
        exit_hostname: impl Into<String>,
    ) -> Self {
        let mut info = Self::new(TunnelState::Connected, "");
        info.client_ip = Some(client_ip);
        info.client_ipv6 = client_ipv6;
        info.client_port = client_port;
        info.server_ip = Some(server_ip);
        info.server_port = server_port;
        info.is_tcp = is_tcp;
        info.exit_hostname = exit_hostname.into();
        info
    }

    pub fn exiting(is_auth_error: bool, additional_info: impl Into<String>) -> Self {
        let mut info = Self::new(TunnelState::Exiting, additional_info);
        info.is_auth_error = is_auth_error;
        info
    }
}

impl Default for TunnelStateInfo {
    fn default() -> Self {
        Self::new(TunnelState::Disconnected, "")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_disconnected() {
        let info = TunnelStateInfo::default();
        assert_eq!(info.state, TunnelState::Disconnected);
        assert!(info.time.is_none());
        assert!(info.vpn_type.is_none());
    }

    #[test]
    fn test_connected_carries_endpoints() {
        let info = TunnelStateInfo::connected(
            "10.8.0.2".parse().unwrap(),
            None,
            51820,
            "198.51.100.7".parse().unwrap(),
            2049,
            false,
            "",
        );
        assert_eq!(info.state, TunnelState::Connected);
        assert_eq!(info.client_port, 51820);
        assert_eq!(info.server_port, 2049);
        assert!(!info.is_tcp);
    }

    #[test]
    fn test_exiting_auth_error_flag() {
        let info = TunnelStateInfo::exiting(true, "auth failed");
        assert_eq!(info.state, TunnelState::Exiting);
        assert!(info.is_auth_error);
    }

    #[test]
    fn test_state_display_names() {
        assert_eq!(TunnelState::Connected.to_string(), "CONNECTED");
        assert_eq!(TunnelState::Initialised.to_string(), "INITIALISED");
        assert_eq!(TunnelState::Reconnecting.to_string(), "RECONNECTING");
    }
}
