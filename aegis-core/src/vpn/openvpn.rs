//! OpenVPN tunnel process wrapper
//!
//! Supervises an external `openvpn` process: renders the configuration,
//! watches the process log for lifecycle markers and kills the process on
//! disconnect.

use std::net::IpAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, Notify};

use super::state::{TunnelState, TunnelStateInfo};
use super::tunnel::{TunnelProcess, TunnelSpec};
use super::{VpnError, VpnResult, VpnType};

pub struct OpenVpnTunnel {
    openvpn_binary: PathBuf,
    config_path: PathBuf,
    spec: TunnelSpec,

    stop_requested: AtomicBool,
    stop_notify: Notify,
    manual_dns: Mutex<Option<IpAddr>>,
}

impl OpenVpnTunnel {
    pub fn new(openvpn_binary: PathBuf, config_path: PathBuf, spec: TunnelSpec) -> Self {
        Self {
            openvpn_binary,
            config_path,
            spec,
            stop_requested: AtomicBool::new(false),
            stop_notify: Notify::new(),
            manual_dns: Mutex::new(None),
        }
    }

    fn render_config(&self) -> String {
        let host = &self.spec.entry_host;
        let proto = if self.spec.port.is_tcp { "tcp" } else { "udp" };
        let port = if self.spec.port.port != 0 {
            self.spec.port.port
        } else {
            host.endpoint_port
        };

        let mut config = String::new();
        config.push_str("client\ndev tun\n");
        config.push_str(&format!("proto {proto}\n"));
        config.push_str(&format!("remote {} {port}\n", host.endpoint_ip));
        config.push_str("nobind\npersist-key\npersist-tun\n");
        config.push_str("resolv-retry infinite\n");
        config.push_str("verb 3\n");

        let proxy = &self.spec.proxy;
        match proxy.proxy_type.as_str() {
            "http" => config.push_str(&format!(
                "http-proxy {} {}\n",
                proxy.address, proxy.port
            )),
            "socks" => config.push_str(&format!(
                "socks-proxy {} {}\n",
                proxy.address, proxy.port
            )),
            _ => {}
        }

        if let Some(exit) = &self.spec.exit_host {
            // multi-hop: the exit host terminates the session
            config.push_str(&format!("route {} 255.255.255.255 net_gateway\n", exit.endpoint_ip));
        }

        config
    }

    async fn run_process(
        &self,
        state_tx: &mpsc::Sender<TunnelStateInfo>,
    ) -> VpnResult<()> {
        let mut child = tokio::process::Command::new(&self.openvpn_binary)
            .arg("--config")
            .arg(&self.config_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| VpnError::Tunnel(format!("failed to start openvpn: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| VpnError::Tunnel("openvpn stdout unavailable".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();

        let mut auth_error = false;
        let mut connected = false;

        loop {
            tokio::select! {
                _ = self.stop_notify.notified() => {
                    debug!("Stopping openvpn process");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    let _ = state_tx
                        .send(TunnelStateInfo::new(TunnelState::Disconnected, ""))
                        .await;
                    return Ok(());
                }

                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            if line.contains("AUTH_FAILED") {
                                warn!("OpenVPN authentication failed");
                                auth_error = true;
                            } else if line.contains("Initialization Sequence Completed")
                                && !connected
                            {
                                connected = true;
                                info!("OpenVPN connection established");
                                let _ = state_tx
                                    .send(TunnelStateInfo::new(TunnelState::Initialised, ""))
                                    .await;

                                let mut state = TunnelStateInfo::new(TunnelState::Connected, "");
                                state.server_ip = self.destination_ip();
                                state.server_port = self.spec.port.port;
                                state.is_tcp = self.spec.port.is_tcp;
                                let _ = state_tx.send(state).await;
                            }
                        }
                        Ok(None) | Err(_) => break, // process closed its output
                    }
                }
            }
        }

        let status = child.wait().await;
        let _ = state_tx
            .send(TunnelStateInfo::exiting(auth_error, "openvpn exited"))
            .await;
        let _ = state_tx
            .send(TunnelStateInfo::new(TunnelState::Disconnected, ""))
            .await;

        if auth_error {
            return Err(VpnError::Tunnel("openvpn authentication failed".to_string()));
        }
        match status {
            Ok(status) if status.success() && self.stop_requested.load(Ordering::SeqCst) => Ok(()),
            Ok(status) => Err(VpnError::Tunnel(format!(
                "openvpn process exited unexpectedly ({status})"
            ))),
            Err(e) => Err(VpnError::Tunnel(format!("openvpn process error: {e}"))),
        }
    }
}

#[async_trait]
impl TunnelProcess for OpenVpnTunnel {
    async fn init(&self) -> VpnResult<()> {
        Ok(())
    }

    async fn connect(&self, state_tx: mpsc::Sender<TunnelStateInfo>) -> VpnResult<()> {
        self.stop_requested.store(false, Ordering::SeqCst);

        let _ = state_tx
            .send(TunnelStateInfo::new(TunnelState::Connecting, ""))
            .await;

        std::fs::write(&self.config_path, self.render_config())
            .map_err(|e| VpnError::Tunnel(format!("failed to write tunnel config: {e}")))?;

        self.run_process(&state_tx).await
    }

    async fn disconnect(&self) -> VpnResult<()> {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.stop_notify.notify_waiters();
        Ok(())
    }

    async fn pause(&self) -> VpnResult<()> {
        // would need the management interface; not worth it for this wrapper
        Err(VpnError::Tunnel(
            "pause is not supported for OpenVPN connections".to_string(),
        ))
    }

    async fn resume(&self) -> VpnResult<()> {
        Err(VpnError::Tunnel(
            "resume is not supported for OpenVPN connections".to_string(),
        ))
    }

    fn is_paused(&self) -> bool {
        false
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
        VpnType::OpenVpn
    }

    fn on_routing_changed(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preferences::SessionCredentials;
    use crate::vpn::params::{HostInfo, PortSelection, ProxySettings};

    fn test_spec(is_tcp: bool) -> TunnelSpec {
        TunnelSpec {
            vpn_type: VpnType::OpenVpn,
            entry_host: HostInfo {
                endpoint_ip: "203.0.113.4".to_string(),
                endpoint_port: 1194,
                ..Default::default()
            },
            exit_host: None,
            port: PortSelection {
                port: 1194,
                is_tcp,
            },
            mtu: 0,
            ipv6: false,
            credentials: SessionCredentials::default(),
            proxy: ProxySettings::default(),
        }
    }

    fn test_tunnel(spec: TunnelSpec) -> OpenVpnTunnel {
        OpenVpnTunnel::new(
            PathBuf::from("/usr/sbin/openvpn"),
            std::env::temp_dir().join("aegis-test-openvpn.conf"),
            spec,
        )
    }

    #[test]
    fn test_rendered_config_udp() {
        let config = test_tunnel(test_spec(false)).render_config();
        assert!(config.contains("proto udp"));
        assert!(config.contains("remote 203.0.113.4 1194"));
        assert!(!config.contains("http-proxy"));
    }

    #[test]
    fn test_rendered_config_with_proxy() {
        let mut spec = test_spec(true);
        spec.proxy = ProxySettings {
            proxy_type: "http".to_string(),
            address: "127.0.0.1".to_string(),
            port: 3128,
            ..Default::default()
        };
        let config = test_tunnel(spec).render_config();
        assert!(config.contains("proto tcp"));
        assert!(config.contains("http-proxy 127.0.0.1 3128"));
    }

    #[tokio::test]
    async fn test_pause_unsupported() {
        let tunnel = test_tunnel(test_spec(false));
        assert!(tunnel.pause().await.is_err());
        assert!(!tunnel.is_paused());
    }
}
