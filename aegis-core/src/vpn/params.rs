//! Connection parameters: validation and per-attempt normalization
//!
//! A `ConnectionParams` value describes *what* to connect to. It is built by
//! a client (or by auto-connect logic), validated once, then normalized per
//! attempt: a multi-candidate host list is collapsed to one pseudo-randomly
//! chosen host (re-drawn on every reconnect so retries spread across
//! candidates).

use base64::Engine;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::{VpnError, VpnResult};
use crate::dns::{AntiTrackerMetadata, DnsSettings};
use crate::obfs::ObfsTransportType;
use crate::session::AccountStatus;

/// Supported tunnel protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VpnType {
    #[default]
    WireGuard,
    OpenVpn,
}

impl std::fmt::Display for VpnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VpnType::WireGuard => f.write_str("WireGuard"),
            VpnType::OpenVpn => f.write_str("OpenVPN"),
        }
    }
}

/// One candidate tunnel server host.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HostInfo {
    pub hostname: String,
    pub endpoint_ip: String,
    pub endpoint_port: u16,
    /// WireGuard server public key (base64), empty for OpenVPN hosts.
    pub public_key: String,
    /// Client address inside the tunnel, `a.b.c.d/nn` notation allowed.
    pub local_ip: String,
    pub ipv6_local_ip: String,
    pub dns_servers: String,
    pub allowed_ips: String,
    /// DNS name of the obfuscation endpoint fronting this host, if any.
    pub obfs_host: String,
    pub dns_name: String,
}

/// Entry server descriptor: one or more candidate hosts.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EntryServer {
    pub hosts: Vec<HostInfo>,
}

/// Multi-hop exit server descriptor (optional).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExitServer {
    pub hosts: Vec<HostInfo>,
}

/// Port selection for the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PortSelection {
    pub port: u16,
    pub is_tcp: bool,
}

/// OpenVPN local proxy settings.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProxySettings {
    /// "http", "socks" or empty.
    pub proxy_type: String,
    pub address: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WireGuardConnectionParams {
    pub entry_server: EntryServer,
    pub exit_server: ExitServer,
    pub port: PortSelection,
    pub mtu: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OpenVpnConnectionParams {
    pub entry_server: EntryServer,
    pub exit_server: ExitServer,
    pub port: PortSelection,
    pub proxy: ProxySettings,
}

/// A validated description of what to connect to.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ConnectionParams {
    pub vpn_type: VpnType,
    #[serde(default)]
    pub wireguard: WireGuardConnectionParams,
    #[serde(default)]
    pub openvpn: OpenVpnConnectionParams,

    #[serde(default)]
    pub manual_dns: DnsSettings,
    #[serde(default)]
    pub anti_tracker: AntiTrackerMetadata,

    /// Unconditionally enable the firewall before connecting.
    #[serde(default)]
    pub firewall_on: bool,
    /// Enable the firewall before connecting and disable it after
    /// disconnecting, but only if it was off before.
    #[serde(default)]
    pub firewall_on_during_connection: bool,

    /// One-shot permission to reconfigure competing VPN software that holds
    /// top filtering priority.
    #[serde(default)]
    pub can_reconfigure_other_vpns_once: bool,

    #[serde(default)]
    pub obfs_transport: ObfsTransportType,

    #[serde(default)]
    pub ipv6: bool,
}

impl ConnectionParams {
    fn entry_hosts(&self) -> &Vec<HostInfo> {
        match self.vpn_type {
            VpnType::WireGuard => &self.wireguard.entry_server.hosts,
            VpnType::OpenVpn => &self.openvpn.entry_server.hosts,
        }
    }

    fn exit_hosts(&self) -> &Vec<HostInfo> {
        match self.vpn_type {
            VpnType::WireGuard => &self.wireguard.exit_server.hosts,
            VpnType::OpenVpn => &self.openvpn.exit_server.hosts,
        }
    }

    pub fn is_multihop(&self) -> bool {
        !self.exit_hosts().is_empty()
    }

    /// The (port, is_tcp) pair for the selected protocol.
    pub fn port(&self) -> PortSelection {
        match self.vpn_type {
            VpnType::WireGuard => self.wireguard.port,
            VpnType::OpenVpn => self.openvpn.port,
        }
    }

    /// Whether the parameters describe a usable connection at all.
    /// Used to distinguish "never configured" from "configured" stored params.
    pub fn check_is_defined(&self) -> VpnResult<()> {
        if self.entry_hosts().is_empty() {
            return Err(VpnError::Validation(
                "connection parameters not defined".to_string(),
            ));
        }
        Ok(())
    }

    /// Validate parameters before a connect attempt.
    ///
    /// Exactly one protocol-specific host list must be populated. A multi-hop
    /// request is checked against the account plan; when `can_fix` is set a
    /// disallowed multi-hop is silently downgraded to single-hop instead of
    /// failing.
    pub fn validate(&mut self, can_fix: bool, account: &AccountStatus) -> VpnResult<()> {
        let other_hosts_populated = match self.vpn_type {
            VpnType::WireGuard => !self.openvpn.entry_server.hosts.is_empty(),
            VpnType::OpenVpn => !self.wireguard.entry_server.hosts.is_empty(),
        };
        if other_hosts_populated {
            return Err(VpnError::Validation(format!(
                "hosts defined for a protocol other than the selected one ({:?})",
                self.vpn_type
            )));
        }

        if self.entry_hosts().is_empty() {
            return Err(VpnError::Validation(format!(
                "no hosts defined for {:?} connection",
                self.vpn_type
            )));
        }

        if self.is_multihop() && !account.is_can_connect_multihop() {
            if !can_fix {
                return Err(VpnError::Validation(
                    "multi-hop connection is not allowed for the current subscription plan"
                        .to_string(),
                ));
            }
            log::info!("Multi-Hop connection is not allowed. Using Single-Hop.");
            match self.vpn_type {
                VpnType::WireGuard => self.wireguard.exit_server = ExitServer::default(),
                VpnType::OpenVpn => self.openvpn.exit_server = ExitServer::default(),
            }
        }

        if self.vpn_type == VpnType::WireGuard {
            for host in &self.wireguard.entry_server.hosts {
                validate_wg_public_key(&host.public_key)?;
            }
            for host in &self.wireguard.exit_server.hosts {
                validate_wg_public_key(&host.public_key)?;
            }
        }

        if self.vpn_type == VpnType::OpenVpn {
            // nothing from unsupported proxy types should survive here
            let proxy_type = self.openvpn.proxy.proxy_type.as_str();
            if !proxy_type.is_empty() && proxy_type != "http" && proxy_type != "socks" {
                self.openvpn.proxy.proxy_type = String::new();
            }
            // only one-line values are allowed for credentials
            truncate_at_newline(&mut self.openvpn.proxy.username);
            truncate_at_newline(&mut self.openvpn.proxy.password);
        }

        Ok(())
    }

    /// Collapse multi-candidate host/exit lists down to one pseudo-randomly
    /// chosen host+exit pair for this attempt. Re-run on every reconnect so a
    /// fresh pair is drawn each time.
    pub fn normalize_hosts(&mut self) -> VpnResult<()> {
        fn pick_one(hosts: &mut Vec<HostInfo>) {
            if hosts.len() > 1 {
                let idx = rand::thread_rng().gen_range(0..hosts.len());
                let chosen = hosts.swap_remove(idx);
                hosts.clear();
                hosts.push(chosen);
            }
        }

        if self.entry_hosts().is_empty() {
            return Err(VpnError::Validation(
                "unable to normalize hosts: no hosts defined".to_string(),
            ));
        }

        match self.vpn_type {
            VpnType::WireGuard => {
                pick_one(&mut self.wireguard.entry_server.hosts);
                pick_one(&mut self.wireguard.exit_server.hosts);
            }
            VpnType::OpenVpn => {
                pick_one(&mut self.openvpn.entry_server.hosts);
                pick_one(&mut self.openvpn.exit_server.hosts);
            }
        }
        Ok(())
    }

    /// The single entry host of normalized parameters.
    pub fn entry_host(&self) -> VpnResult<&HostInfo> {
        self.entry_hosts()
            .first()
            .ok_or_else(|| VpnError::Validation("VPN host not defined".to_string()))
    }

    /// The single exit host of normalized multi-hop parameters.
    pub fn exit_host(&self) -> Option<&HostInfo> {
        self.exit_hosts().first()
    }

    /// Mutable entry host access, used when an obfuscation proxy rewrites the
    /// effective endpoint to the local proxy address.
    pub fn entry_host_mut(&mut self) -> VpnResult<&mut HostInfo> {
        let hosts = match self.vpn_type {
            VpnType::WireGuard => &mut self.wireguard.entry_server.hosts,
            VpnType::OpenVpn => &mut self.openvpn.entry_server.hosts,
        };
        hosts
            .first_mut()
            .ok_or_else(|| VpnError::Validation("VPN host not defined".to_string()))
    }

    pub fn set_port(&mut self, port: PortSelection) {
        match self.vpn_type {
            VpnType::WireGuard => self.wireguard.port = port,
            VpnType::OpenVpn => self.openvpn.port = port,
        }
    }
}

fn truncate_at_newline(value: &mut String) {
    if let Some(pos) = value.find('\n') {
        value.truncate(pos);
    }
}

/// Prevent user-defined data injection: ensure nothing except a base64 public
/// key ends up in a rendered tunnel configuration.
fn validate_wg_public_key(key: &str) -> VpnResult<()> {
    if base64::engine::general_purpose::STANDARD.decode(key).is_err() {
        return Err(VpnError::Validation(
            "WireGuard public key is not a base64 string".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(ip: &str) -> HostInfo {
        HostInfo {
            hostname: format!("{ip}.test"),
            endpoint_ip: ip.to_string(),
            endpoint_port: 2049,
            public_key: base64::engine::general_purpose::STANDARD.encode([7u8; 32]),
            local_ip: "10.8.0.2/24".to_string(),
            ..Default::default()
        }
    }

    fn wg_params(hosts: Vec<HostInfo>) -> ConnectionParams {
        ConnectionParams {
            vpn_type: VpnType::WireGuard,
            wireguard: WireGuardConnectionParams {
                entry_server: EntryServer { hosts },
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn account(multihop: bool) -> AccountStatus {
        AccountStatus {
            active: true,
            active_until: i64::MAX,
            is_can_connect_multihop: multihop,
            ..Default::default()
        }
    }

    #[test]
    fn test_validate_rejects_empty_host_list() {
        let mut params = wg_params(vec![]);
        assert!(params.validate(false, &account(true)).is_err());
    }

    #[test]
    fn test_validate_rejects_hosts_for_wrong_protocol() {
        let mut params = wg_params(vec![host("192.0.2.1")]);
        params.openvpn.entry_server.hosts.push(host("192.0.2.2"));
        assert!(params.validate(false, &account(true)).is_err());
    }

    #[test]
    fn test_validate_downgrades_disallowed_multihop_when_can_fix() {
        let mut params = wg_params(vec![host("192.0.2.1")]);
        params.wireguard.exit_server.hosts.push(host("192.0.2.9"));

        // without fixing: rejected
        let mut strict = params.clone();
        assert!(strict.validate(false, &account(false)).is_err());

        // with fixing: exit server dropped
        assert!(params.validate(true, &account(false)).is_ok());
        assert!(!params.is_multihop());
    }

    #[test]
    fn test_validate_rejects_invalid_wg_public_key() {
        let mut bad = host("192.0.2.1");
        bad.public_key = "not@base64!!".to_string();
        let mut params = wg_params(vec![bad]);
        assert!(params.validate(false, &account(true)).is_err());
    }

    #[test]
    fn test_validate_strips_unknown_proxy_type_and_multiline_credentials() {
        let mut params = ConnectionParams {
            vpn_type: VpnType::OpenVpn,
            openvpn: OpenVpnConnectionParams {
                entry_server: EntryServer {
                    hosts: vec![host("192.0.2.3")],
                },
                proxy: ProxySettings {
                    proxy_type: "carrier-pigeon".to_string(),
                    username: "user\ninjected-line".to_string(),
                    password: "pass".to_string(),
                    ..Default::default()
                },
                ..Default::default()
            },
            ..Default::default()
        };
        params.validate(false, &account(true)).unwrap();
        assert!(params.openvpn.proxy.proxy_type.is_empty());
        assert_eq!(params.openvpn.proxy.username, "user");
    }

    #[test]
    fn test_normalize_collapses_to_single_host() {
        let mut params = wg_params(vec![host("192.0.2.1"), host("192.0.2.2"), host("192.0.2.3")]);
        params.normalize_hosts().unwrap();
        assert_eq!(params.wireguard.entry_server.hosts.len(), 1);

        let kept = &params.wireguard.entry_server.hosts[0].endpoint_ip;
        assert!(["192.0.2.1", "192.0.2.2", "192.0.2.3"].contains(&kept.as_str()));
    }

    #[test]
    fn test_normalize_fails_on_empty_hosts() {
        let mut params = wg_params(vec![]);
        assert!(params.normalize_hosts().is_err());
    }

    #[test]
    fn test_check_is_defined() {
        assert!(ConnectionParams::default().check_is_defined().is_err());
        assert!(wg_params(vec![host("192.0.2.1")]).check_is_defined().is_ok());
    }
}
