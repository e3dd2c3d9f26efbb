//! WireGuard tunnel process wrapper
//!
//! Thin external-binary supervision: renders a wg-quick configuration,
//! brings the interface up, watches handshake freshness and tears the
//! interface down on disconnect. The protocol itself is wg-quick's problem.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use super::state::{TunnelState, TunnelStateInfo};
use super::tunnel::{TunnelProcess, TunnelSpec};
use super::{VpnError, VpnResult, VpnType};

/// Keepalive written into the rendered configuration.
const PERSISTENT_KEEPALIVE_SECS: u32 = 25;

/// Handshake freshness checks while connected.
const HANDSHAKE_CHECK_INTERVAL: Duration = Duration::from_secs(15);

/// A handshake older than this (after at least one succeeded) means the
/// link is dead; the retry loop is asked for an immediate reconnect.
const HANDSHAKE_TIMEOUT_SECS: u64 = 180;

pub struct WireGuardTunnel {
    wg_quick_binary: PathBuf,
    wg_binary: PathBuf,
    config_path: PathBuf,
    interface: String,
    spec: TunnelSpec,

    paused: AtomicBool,
    stop_requested: AtomicBool,
    stop_notify: Notify,
    manual_dns: Mutex<Option<IpAddr>>,
}

impl WireGuardTunnel {
    pub fn new(
        wg_quick_binary: PathBuf,
        wg_binary: PathBuf,
        config_path: PathBuf,
        spec: TunnelSpec,
    ) -> VpnResult<Self> {
        let interface = config_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("aegis0")
            .to_string();

        Ok(Self {
            wg_quick_binary,
            wg_binary,
            config_path,
            interface,
            spec,
            paused: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            stop_notify: Notify::new(),
            manual_dns: Mutex::new(None),
        })
    }

    fn render_config(&self) -> String {
        let host = &self.spec.entry_host;
        let creds = &self.spec.credentials;

        let mut config = String::new();
        config.push_str("[Interface]\n");
        config.push_str(&format!("PrivateKey = {}\n", creds.wg_private_key));
        config.push_str(&format!("Address = {}\n", creds.wg_local_ip));
        if let Some(dns) = *self.manual_dns.lock() {
            config.push_str(&format!("DNS = {dns}\n"));
        } else if !host.dns_servers.is_empty() {
            config.push_str(&format!("DNS = {}\n", host.dns_servers));
        }
        if self.spec.mtu > 0 {
            config.push_str(&format!("MTU = {}\n", self.spec.mtu));
        }

        // multi-hop: the exit server terminates the WireGuard session, the
        // entry server only carries the packets
        let (peer, endpoint_ip, endpoint_port) = match &self.spec.exit_host {
            Some(exit) => (exit, &host.endpoint_ip, exit.endpoint_port),
            None => {
                let port = if self.spec.port.port != 0 {
                    self.spec.port.port
                } else {
                    host.endpoint_port
                };
                (host, &host.endpoint_ip, port)
            }
        };

        config.push_str("\n[Peer]\n");
        config.push_str(&format!("PublicKey = {}\n", peer.public_key));
        if !creds.wg_preshared_key.is_empty() {
            config.push_str(&format!("PresharedKey = {}\n", creds.wg_preshared_key));
        }
        config.push_str(&format!("Endpoint = {endpoint_ip}:{endpoint_port}\n"));
        let allowed = if peer.allowed_ips.is_empty() {
            "0.0.0.0/0"
        } else {
            &peer.allowed_ips
        };
        config.push_str(&format!("AllowedIPs = {allowed}\n"));
        config.push_str(&format!(
            "PersistentKeepalive = {PERSISTENT_KEEPALIVE_SECS}\n"
        ));
        config
    }

    async fn wg_quick(&self, action: &str) -> VpnResult<()> {
        let output = tokio::process::Command::new(&self.wg_quick_binary)
            .arg(action)
            .arg(&self.config_path)
            .output()
            .await
            .map_err(|e| VpnError::Tunnel(format!("failed to run wg-quick {action}: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VpnError::Tunnel(format!(
                "wg-quick {action} failed: {}",
                stderr.trim()
            )));
        }
        Ok(())
    }

    /// Seconds since the last peer handshake, if any.
    async fn latest_handshake_age(&self) -> Option<u64> {
        let output = tokio::process::Command::new(&self.wg_binary)
            .args(["show", &self.interface, "latest-handshakes"])
            .output()
            .await
            .ok()?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let ts: i64 = stdout.split_whitespace().last()?.parse().ok()?;
        if ts == 0 {
            return None;
        }
        let age = chrono::Utc::now().timestamp().saturating_sub(ts);
        Some(age.max(0) as u64)
    }

    fn local_ip(&self) -> Option<IpAddr> {
        self.spec
            .credentials
            .wg_local_ip
            .split('/')
            .next()?
            .parse()
            .ok()
    }

    fn connected_state(&self) -> TunnelStateInfo {
        let server_ip = self.destination_ip();
        let mut state = TunnelStateInfo::new(TunnelState::Connected, "");
        state.client_ip = self.local_ip();
        state.server_ip = server_ip;
        state.server_port = self.spec.port.port;
        state.is_tcp = false;
        state.exit_hostname = self
            .spec
            .exit_host
            .as_ref()
            .map(|h| h.hostname.clone())
            .unwrap_or_default();
        state
    }
}

#[async_trait]
impl TunnelProcess for WireGuardTunnel {
    async fn init(&self) -> VpnResult<()> {
        // a leftover interface from a crashed run blocks wg-quick up
        if self.config_path.exists() {
            debug!("Removing stale WireGuard interface (if any)");
            let _ = self.wg_quick("down").await;
        }
        Ok(())
    }

    async fn connect(&self, state_tx: mpsc::Sender<TunnelStateInfo>) -> VpnResult<()> {
        self.stop_requested.store(false, Ordering::SeqCst);

        let _ = state_tx
            .send(TunnelStateInfo::new(TunnelState::Connecting, ""))
            .await;

        let config = self.render_config();
        std::fs::write(&self.config_path, config)
            .map_err(|e| VpnError::Tunnel(format!("failed to write tunnel config: {e}")))?;
        restrict_config_permissions(&self.config_path);

        self.wg_quick("up").await?;
        info!("WireGuard interface '{}' is up", self.interface);

        let _ = state_tx
            .send(TunnelStateInfo::new(TunnelState::Initialised, ""))
            .await;
        let _ = state_tx.send(self.connected_state()).await;

        // supervise: watch handshake freshness until disconnect
        let mut had_handshake = false;
        let result = loop {
            tokio::select! {
                _ = self.stop_notify.notified() => break Ok(()),
                _ = tokio::time::sleep(HANDSHAKE_CHECK_INTERVAL) => {}
            }

            if self.stop_requested.load(Ordering::SeqCst) {
                break Ok(());
            }
            if self.paused.load(Ordering::SeqCst) {
                continue;
            }

            match self.latest_handshake_age().await {
                Some(age) => {
                    had_handshake = true;
                    if age > HANDSHAKE_TIMEOUT_SECS {
                        warn!("No WireGuard handshake for {age}s");
                        break Err(VpnError::ReconnectionRequired(format!(
                            "no handshake for {age}s"
                        )));
                    }
                }
                None if had_handshake => {
                    // peer table reset under us; treat as a dead link
                    break Err(VpnError::ReconnectionRequired(
                        "handshake information lost".to_string(),
                    ));
                }
                None => {}
            }
        };

        if let Err(e) = self.wg_quick("down").await {
            error!("Failed to bring WireGuard interface down: {e}");
        }
        let _ = state_tx
            .send(TunnelStateInfo::new(TunnelState::Disconnected, ""))
            .await;

        result
    }

    async fn disconnect(&self) -> VpnResult<()> {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.stop_notify.notify_waiters();
        Ok(())
    }

    async fn pause(&self) -> VpnResult<()> {
        self.wg_quick("down").await?;
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self) -> VpnResult<()> {
        self.wg_quick("up").await?;
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    async fn set_manual_dns(&self, dns: IpAddr) -> VpnResult<()> {
        *self.manual_dns.lock() = Some(dns);
        Ok(())
    }

    async fn reset_manual_dns(&self) -> VpnResult<()> {
        self.manual_dns.lock().take();
        Ok(())
    }

    fn destination_ip(&self) -> Option<IpAddr> {
        self.spec.entry_host.endpoint_ip.parse().ok()
    }

    fn default_dns(&self) -> Option<IpAddr> {
        self.spec
            .entry_host
            .dns_servers
            .split(',')
            .next()?
            .trim()
            .parse()
            .ok()
    }

    fn vpn_type(&self) -> VpnType {
        VpnType::WireGuard
    }

    fn on_routing_changed(&self) {
        // wg sockets rebind lazily; nothing to do here
    }
}

#[cfg(unix)]
fn restrict_config_permissions(path: &std::path::Path) {
    use std::os::unix::fs::PermissionsExt;
    // the config contains the private key
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
}

#[cfg(not(unix))]
fn restrict_config_permissions(_path: &std::path::Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preferences::SessionCredentials;
    use crate::vpn::params::{HostInfo, PortSelection};

    fn test_spec() -> TunnelSpec {
        TunnelSpec {
            vpn_type: VpnType::WireGuard,
            entry_host: HostInfo {
                hostname: "gw1.example.net".to_string(),
                endpoint_ip: "198.51.100.7".to_string(),
                endpoint_port: 51820,
                public_key: "c2VydmVyLXB1YmxpYy1rZXk=".to_string(),
                dns_servers: "10.8.0.1".to_string(),
                allowed_ips: "0.0.0.0/0".to_string(),
                ..Default::default()
            },
            exit_host: None,
            port: PortSelection {
                port: 51820,
                is_tcp: false,
            },
            mtu: 1380,
            ipv6: false,
            credentials: SessionCredentials {
                wg_private_key: "Y2xpZW50LXByaXZhdGUta2V5".to_string(),
                wg_local_ip: "10.8.0.2/24".to_string(),
                ..Default::default()
            },
            proxy: Default::default(),
        }
    }

    fn test_tunnel(spec: TunnelSpec) -> WireGuardTunnel {
        WireGuardTunnel::new(
            PathBuf::from("/usr/bin/wg-quick"),
            PathBuf::from("/usr/bin/wg"),
            std::env::temp_dir().join("aegis-test-wg0.conf"),
            spec,
        )
        .unwrap()
    }

    #[test]
    fn test_rendered_config_single_hop() {
        let tunnel = test_tunnel(test_spec());
        let config = tunnel.render_config();

        assert!(config.contains("PrivateKey = Y2xpZW50LXByaXZhdGUta2V5"));
        assert!(config.contains("Address = 10.8.0.2/24"));
        assert!(config.contains("DNS = 10.8.0.1"));
        assert!(config.contains("MTU = 1380"));
        assert!(config.contains("Endpoint = 198.51.100.7:51820"));
        assert!(config.contains("AllowedIPs = 0.0.0.0/0"));
        assert!(config.contains("PersistentKeepalive = 25"));
    }

    #[test]
    fn test_rendered_config_multihop_uses_exit_peer() {
        let mut spec = test_spec();
        spec.exit_host = Some(HostInfo {
            hostname: "exit1.example.net".to_string(),
            endpoint_ip: "203.0.113.9".to_string(),
            endpoint_port: 30587,
            public_key: "ZXhpdC1wdWJsaWMta2V5".to_string(),
            ..Default::default()
        });
        let tunnel = test_tunnel(spec);
        let config = tunnel.render_config();

        // entry carries, exit terminates
        assert!(config.contains("PublicKey = ZXhpdC1wdWJsaWMta2V5"));
        assert!(config.contains("Endpoint = 198.51.100.7:30587"));
    }

    #[tokio::test]
    async fn test_manual_dns_overrides_rendered_dns() {
        let tunnel = test_tunnel(test_spec());
        tunnel
            .set_manual_dns("1.1.1.1".parse().unwrap())
            .await
            .unwrap();
        assert!(tunnel.render_config().contains("DNS = 1.1.1.1"));

        tunnel.reset_manual_dns().await.unwrap();
        assert!(tunnel.render_config().contains("DNS = 10.8.0.1"));
    }

    #[test]
    fn test_destination_and_default_dns() {
        let tunnel = test_tunnel(test_spec());
        assert_eq!(
            tunnel.destination_ip(),
            Some("198.51.100.7".parse().unwrap())
        );
        assert_eq!(tunnel.default_dns(), Some("10.8.0.1".parse().unwrap()));
        assert_eq!(tunnel.vpn_type(), VpnType::WireGuard);
    }
}
