//! VPN tunnel types, errors and the tunnel-process capability interface
//!
//! ## Architecture
//!
//! - params.rs: connection parameters, validation and per-attempt
//!   normalization
//! - state.rs: tunnel state reports consumed by the supervisor
//! - tunnel.rs: the `TunnelProcess` capability the supervisor drives
//! - wireguard.rs / openvpn.rs: thin external-process implementations

pub mod openvpn;
pub mod params;
pub mod state;
pub mod tunnel;
pub mod wireguard;

pub use params::{
    ConnectionParams, EntryServer, ExitServer, HostInfo, OpenVpnConnectionParams, PortSelection,
    ProxySettings, VpnType, WireGuardConnectionParams,
};
pub use state::{DisconnectionReason, TunnelState, TunnelStateInfo};
pub use tunnel::{TunnelBuilder, TunnelProcess, TunnelSpec};

/// Errors produced by the connection core.
///
/// The distinguished variants drive control flow:
/// - `DeviceNotRegistered` triggers one automatic logout/re-login retry at
///   the request-serializer layer.
/// - `ReconnectionRequired` makes the retry loop skip its backoff delay.
/// - `Validation` / `NotLoggedIn` / `SubscriptionExpired` are returned
///   synchronously and never retried.
#[derive(Debug, thiserror::Error)]
pub enum VpnError {
    #[error("invalid connection parameters: {0}")]
    Validation(String),

    #[error("not logged in")]
    NotLoggedIn,

    #[error("subscription is not active")]
    SubscriptionNotActive,

    #[error("subscription has expired")]
    SubscriptionExpired,

    /// This device is no longer registered server-side. Recoverable: the
    /// caller may logout, re-login and retry once.
    #[error("device not found")]
    DeviceNotRegistered,

    /// The tunnel layer knows the failure is transient and asks for an
    /// immediate reconnect (no backoff).
    #[error("reconnection required: {0}")]
    ReconnectionRequired(String),

    /// A platform precondition was not met (e.g. top filtering priority not
    /// achieved before tunnel start). Fatal for the current attempt.
    #[error("firewall precondition failed: {0}")]
    FirewallPrecondition(String),

    #[error("tunnel error: {0}")]
    Tunnel(String),

    #[error("firewall error: {0}")]
    Firewall(String),

    #[error("DNS error: {0}")]
    Dns(String),

    #[error("split tunnel error: {0}")]
    SplitTunnel(String),

    #[error("obfuscation transport error: {0}")]
    Obfs(String),

    #[error("session API error: {0}")]
    Api(String),

    #[error("settings storage error: {0}")]
    Preferences(String),

    #[error("{0}")]
    Other(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VpnError {
    /// True for the recoverable session-error class handled by the request
    /// serializer (logout + re-login + one retry).
    pub fn is_recoverable_session_error(&self) -> bool {
        matches!(self, VpnError::DeviceNotRegistered)
    }

    /// True when the tunnel layer requested a zero-delay reconnect.
    pub fn is_reconnection_required(&self) -> bool {
        matches!(self, VpnError::ReconnectionRequired(_))
    }
}

pub type VpnResult<T> = Result<T, VpnError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(VpnError::DeviceNotRegistered.is_recoverable_session_error());
        assert!(!VpnError::NotLoggedIn.is_recoverable_session_error());

        assert!(VpnError::ReconnectionRequired("link flap".into()).is_reconnection_required());
        assert!(!VpnError::Tunnel("died".into()).is_reconnection_required());
    }

    #[test]
    fn test_error_display() {
        let err = VpnError::Validation("no hosts".to_string());
        assert_eq!(err.to_string(), "invalid connection parameters: no hosts");

        let err = VpnError::FirewallPrecondition("not top priority".to_string());
        assert_eq!(
            err.to_string(),
            "firewall precondition failed: not top priority"
        );
    }
}
