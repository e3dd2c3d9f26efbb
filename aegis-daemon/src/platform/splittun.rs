//! cgroup/fwmark split-tunnel coordinator
//!
//! Linux steering by cgroup classid + ip rule: whitelisted apps are started
//! into a net_cls cgroup whose mark routes via (or around) the tunnel. The
//! daemon only maintains the cgroup and routing rule; placing processes into
//! the cgroup is the client's job.

use aegis_core::splittun::{SplitTunnelApplyContext, SplitTunnelCoordinator, SplitTunnelStatus};
use aegis_core::vpn::{VpnError, VpnResult};
use async_trait::async_trait;
use log::{debug, info};
use parking_lot::Mutex;

const CGROUP_DIR: &str = "/sys/fs/cgroup/net_cls/aegis";
const CLASSID: &str = "0x41560001";
const FWMARK: &str = "0x4156";

pub struct CgroupSplitTunnel {
    state: Mutex<SplitTunnelStatus>,
}

impl CgroupSplitTunnel {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SplitTunnelStatus {
                is_functional: std::path::Path::new("/sys/fs/cgroup").exists(),
                ..Default::default()
            }),
        }
    }

    async fn run(cmd: &str, args: &[&str]) -> VpnResult<()> {
        let output = tokio::process::Command::new(cmd)
            .args(args)
            .output()
            .await
            .map_err(|e| VpnError::SplitTunnel(format!("failed to run {cmd}: {e}")))?;
        if !output.status.success() {
            return Err(VpnError::SplitTunnel(format!(
                "{cmd} {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn install_rules(&self, route_outside_tunnel: bool) -> VpnResult<()> {
        if std::fs::create_dir_all(CGROUP_DIR).is_ok() {
            let _ = std::fs::write(format!("{CGROUP_DIR}/net_cls.classid"), CLASSID);
        }
        Self::run(
            "iptables",
            &[
                "-t", "mangle", "-A", "OUTPUT", "-m", "cgroup", "--cgroup", CLASSID, "-j", "MARK",
                "--set-mark", FWMARK,
            ],
        )
        .await?;
        let table = if route_outside_tunnel { "main" } else { "51820" };
        Self::run(
            "ip",
            &["rule", "add", "fwmark", FWMARK, "table", table, "priority", "100"],
        )
        .await
    }

    async fn remove_rules(&self) {
        let _ = Self::run(
            "iptables",
            &[
                "-t", "mangle", "-D", "OUTPUT", "-m", "cgroup", "--cgroup", CLASSID, "-j", "MARK",
                "--set-mark", FWMARK,
            ],
        )
        .await;
        let _ = Self::run("ip", &["rule", "del", "fwmark", FWMARK, "priority", "100"]).await;
    }
}

#[async_trait]
impl SplitTunnelCoordinator for CgroupSplitTunnel {
    async fn apply_config(&self, ctx: SplitTunnelApplyContext) -> VpnResult<()> {
        debug!(
            "Applying split-tunnel config (enabled={}, inversed={}, connected={}, paused={})",
            ctx.config.enabled, ctx.config.inversed, ctx.vpn_connected, ctx.vpn_paused
        );

        {
            let mut state = self.state.lock();
            state.enabled = ctx.config.enabled;
            state.inversed = ctx.config.inversed;
            state.app_whitelist_enabled = ctx.config.app_whitelist_enabled;
            state.allow_any_dns = ctx.config.allow_any_dns;
            state.allow_when_no_vpn = ctx.config.allow_when_no_vpn;
            state.apps = ctx.config.apps.clone();
        }

        self.remove_rules().await;

        if !ctx.config.enabled {
            return Ok(());
        }
        // no tunnel and bypass-disallowed: nothing to steer anywhere
        if !ctx.vpn_connected && !ctx.config.allow_when_no_vpn {
            return Ok(());
        }

        // inverse mode steers marked apps INTO the tunnel, normal mode
        // steers them around it
        let route_outside = !ctx.config.inversed;
        self.install_rules(route_outside).await?;
        info!("Split-tunnel rules applied");
        Ok(())
    }

    async fn reset(&self) -> VpnResult<()> {
        self.remove_rules().await;
        let mut state = self.state.lock();
        *state = SplitTunnelStatus {
            is_functional: state.is_functional,
            ..Default::default()
        };
        Ok(())
    }

    async fn status(&self) -> VpnResult<SplitTunnelStatus> {
        Ok(self.state.lock().clone())
    }

    async fn add_app(&self, exec: &str) -> VpnResult<()> {
        let mut state = self.state.lock();
        if !state.apps.iter().any(|a| a == exec) {
            state.apps.push(exec.to_string());
        }
        Ok(())
    }

    async fn remove_app(&self, exec: &str) -> VpnResult<()> {
        self.state.lock().apps.retain(|a| a != exec);
        Ok(())
    }
}
