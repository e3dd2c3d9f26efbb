//! Builds tunnel processes from the binaries installed on this system

use std::path::PathBuf;
use std::sync::Arc;

use aegis_core::vpn::openvpn::OpenVpnTunnel;
use aegis_core::vpn::wireguard::WireGuardTunnel;
use aegis_core::vpn::{TunnelBuilder, TunnelProcess, TunnelSpec, VpnError, VpnResult, VpnType};
use async_trait::async_trait;

pub struct PlatformTunnelBuilder {
    config_dir: PathBuf,
}

impl PlatformTunnelBuilder {
    pub fn new(config_dir: PathBuf) -> Self {
        Self { config_dir }
    }

    fn find_binary(candidates: &[&str]) -> VpnResult<PathBuf> {
        for candidate in candidates {
            let path = PathBuf::from(candidate);
            if path.exists() {
                return Ok(path);
            }
        }
        Err(VpnError::Tunnel(format!(
            "required binary not found (looked for {})",
            candidates.join(", ")
        )))
    }
}

#[async_trait]
impl TunnelBuilder for PlatformTunnelBuilder {
    async fn build(&self, spec: &TunnelSpec) -> VpnResult<Arc<dyn TunnelProcess>> {
        match spec.vpn_type {
            VpnType::WireGuard => {
                let wg_quick =
                    Self::find_binary(&["/usr/bin/wg-quick", "/usr/local/bin/wg-quick"])?;
                let wg = Self::find_binary(&["/usr/bin/wg", "/usr/local/bin/wg"])?;
                let tunnel = WireGuardTunnel::new(
                    wg_quick,
                    wg,
                    self.config_dir.join("aegis0.conf"),
                    spec.clone(),
                )?;
                Ok(Arc::new(tunnel))
            }
            VpnType::OpenVpn => {
                let openvpn =
                    Self::find_binary(&["/usr/sbin/openvpn", "/usr/local/sbin/openvpn"])?;
                Ok(Arc::new(OpenVpnTunnel::new(
                    openvpn,
                    self.config_dir.join("openvpn.conf"),
                    spec.clone(),
                )))
            }
        }
    }
}
