//! resolvectl-backed DNS manager

use aegis_core::dns::DnsManager;
use aegis_core::vpn::{VpnError, VpnResult};
use async_trait::async_trait;
use log::debug;

pub struct ResolvectlDnsManager;

impl ResolvectlDnsManager {
    async fn resolvectl(args: &[&str]) -> VpnResult<String> {
        let output = tokio::process::Command::new("resolvectl")
            .args(args)
            .output()
            .await
            .map_err(|e| VpnError::Dns(format!("failed to run resolvectl: {e}")))?;
        if !output.status.success() {
            return Err(VpnError::Dns(format!(
                "resolvectl {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl DnsManager for ResolvectlDnsManager {
    async fn apply_user_settings(&self) -> VpnResult<()> {
        // resolved manages per-link DNS; nothing global to prepare
        Ok(())
    }

    async fn update_if_wrong_settings(&self) -> VpnResult<()> {
        // wg-quick programs the per-link DNS; verify resolved still knows it
        match Self::resolvectl(&["dns", "aegis0"]).await {
            Ok(output) => {
                debug!("Current tunnel DNS: {}", output.trim());
                Ok(())
            }
            // interface gone means disconnected; not an error here
            Err(_) => Ok(()),
        }
    }
}
