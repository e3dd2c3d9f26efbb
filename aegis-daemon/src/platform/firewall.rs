//! iptables-backed firewall coordinator
//!
//! Programs a dedicated chain pair (`AEGIS-IN`/`AEGIS-OUT`) so our rules are
//! isolated from the system ruleset and can be flushed atomically. This is
//! deliberately thin: rule *policy* lives in the core, rule *syntax* here.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use aegis_core::firewall::{
    ClientEndpoints, FirewallBackgroundMonitor, FirewallCoordinator, KillSwitchStatus,
};
use aegis_core::preferences::PreferencesStore;
use aegis_core::vpn::{VpnError, VpnResult};
use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex;

const CHAIN_IN: &str = "AEGIS-IN";
const CHAIN_OUT: &str = "AEGIS-OUT";

pub struct IptablesFirewall {
    prefs: Arc<PreferencesStore>,
    enabled: AtomicBool,
    client_paused: AtomicBool,
    dns_rule: Mutex<Option<IpAddr>>,
    exceptions: Mutex<HashSet<IpAddr>>,
}

impl IptablesFirewall {
    pub fn new(prefs: Arc<PreferencesStore>) -> Self {
        Self {
            prefs,
            enabled: AtomicBool::new(false),
            client_paused: AtomicBool::new(false),
            dns_rule: Mutex::new(None),
            exceptions: Mutex::new(HashSet::new()),
        }
    }

    async fn iptables(&self, args: &[&str]) -> VpnResult<()> {
        let output = tokio::process::Command::new("iptables")
            .args(args)
            .output()
            .await
            .map_err(|e| VpnError::Firewall(format!("failed to run iptables: {e}")))?;
        if !output.status.success() {
            return Err(VpnError::Firewall(format!(
                "iptables {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn iptables_quiet(&self, args: &[&str]) {
        if let Err(e) = self.iptables(args).await {
            debug!("{e}");
        }
    }

    async fn install_chains(&self) -> VpnResult<()> {
        self.iptables_quiet(&["-N", CHAIN_IN]).await;
        self.iptables_quiet(&["-N", CHAIN_OUT]).await;
        self.iptables_quiet(&["-F", CHAIN_IN]).await;
        self.iptables_quiet(&["-F", CHAIN_OUT]).await;

        // jump into our chains first so we win against rules other VPN
        // software appends
        self.iptables_quiet(&["-D", "INPUT", "-j", CHAIN_IN]).await;
        self.iptables_quiet(&["-D", "OUTPUT", "-j", CHAIN_OUT]).await;
        self.iptables(&["-I", "INPUT", "1", "-j", CHAIN_IN]).await?;
        self.iptables(&["-I", "OUTPUT", "1", "-j", CHAIN_OUT]).await?;

        // loopback and established traffic stay usable
        self.iptables(&["-A", CHAIN_IN, "-i", "lo", "-j", "ACCEPT"]).await?;
        self.iptables(&["-A", CHAIN_OUT, "-o", "lo", "-j", "ACCEPT"]).await?;
        self.iptables(&[
            "-A", CHAIN_IN, "-m", "conntrack", "--ctstate", "ESTABLISHED,RELATED", "-j", "ACCEPT",
        ])
        .await?;

        let prefs = self.prefs.snapshot();
        if prefs.kill_switch.allow_lan {
            for net in ["10.0.0.0/8", "172.16.0.0/12", "192.168.0.0/16", "169.254.0.0/16"] {
                self.iptables(&["-A", CHAIN_OUT, "-d", net, "-j", "ACCEPT"]).await?;
            }
        }
        for exception in prefs.kill_switch.user_exceptions.split(',') {
            let exception = exception.trim();
            if !exception.is_empty() {
                self.iptables(&["-A", CHAIN_OUT, "-d", exception, "-j", "ACCEPT"]).await?;
            }
        }

        // host exceptions (tunnel server, obfuscation proxy, API)
        let exceptions: Vec<IpAddr> = self.exceptions.lock().iter().copied().collect();
        for ip in exceptions {
            self.allow_host(ip).await?;
        }
        let dns_rule = *self.dns_rule.lock();
        if let Some(dns) = dns_rule {
            self.allow_dns(dns).await?;
        }

        // tunnel traffic itself is fine
        self.iptables(&["-A", CHAIN_OUT, "-o", "aegis0", "-j", "ACCEPT"]).await?;
        self.iptables(&["-A", CHAIN_IN, "-i", "aegis0", "-j", "ACCEPT"]).await?;

        // fail closed
        self.iptables(&["-A", CHAIN_OUT, "-j", "DROP"]).await?;
        self.iptables(&["-A", CHAIN_IN, "-j", "DROP"]).await?;
        Ok(())
    }

    async fn remove_chains(&self) -> VpnResult<()> {
        self.iptables_quiet(&["-D", "INPUT", "-j", CHAIN_IN]).await;
        self.iptables_quiet(&["-D", "OUTPUT", "-j", CHAIN_OUT]).await;
        self.iptables_quiet(&["-F", CHAIN_IN]).await;
        self.iptables_quiet(&["-F", CHAIN_OUT]).await;
        self.iptables_quiet(&["-X", CHAIN_IN]).await;
        self.iptables_quiet(&["-X", CHAIN_OUT]).await;
        Ok(())
    }

    async fn allow_host(&self, ip: IpAddr) -> VpnResult<()> {
        let ip = ip.to_string();
        self.iptables(&["-I", CHAIN_OUT, "1", "-d", &ip, "-j", "ACCEPT"]).await?;
        self.iptables(&["-I", CHAIN_IN, "1", "-s", &ip, "-j", "ACCEPT"]).await
    }

    async fn allow_dns(&self, dns: IpAddr) -> VpnResult<()> {
        let dns = dns.to_string();
        for proto in ["udp", "tcp"] {
            self.iptables(&[
                "-I", CHAIN_OUT, "1", "-d", &dns, "-p", proto, "--dport", "53", "-j", "ACCEPT",
            ])
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl FirewallCoordinator for IptablesFirewall {
    async fn set_enabled(&self, enabled: bool) -> VpnResult<()> {
        if enabled == self.enabled.load(Ordering::SeqCst) {
            return Ok(());
        }
        if enabled {
            info!("Enabling firewall");
            self.install_chains().await?;
        } else {
            info!("Disabling firewall");
            self.remove_chains().await?;
        }
        self.enabled.store(enabled, Ordering::SeqCst);
        Ok(())
    }

    async fn get_enabled(&self) -> VpnResult<bool> {
        Ok(self.enabled.load(Ordering::SeqCst))
    }

    async fn set_persistent(&self, persistent: bool) -> VpnResult<()> {
        if persistent {
            self.set_enabled(true).await?;
        }
        Ok(())
    }

    async fn reenable(&self, _can_reconfigure_other_vpns: bool) -> VpnResult<()> {
        // unconditional disable-then-enable clears out stale rules
        self.remove_chains().await?;
        self.install_chains().await?;
        self.enabled.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn status(&self) -> VpnResult<KillSwitchStatus> {
        let prefs = self.prefs.snapshot();
        Ok(KillSwitchStatus {
            is_enabled: self.enabled.load(Ordering::SeqCst),
            is_persistent: prefs.kill_switch.persistent,
            // with iptables -I we always sit at the head of the ruleset
            has_top_firewall_priority: true,
            ..Default::default()
        })
    }

    async fn add_hosts_to_exceptions(
        &self,
        hosts: &[IpAddr],
        _only_icmp: bool,
        _persistent: bool,
    ) -> VpnResult<()> {
        for ip in hosts {
            self.exceptions.lock().insert(*ip);
            if self.enabled.load(Ordering::SeqCst) {
                self.allow_host(*ip).await?;
            }
        }
        Ok(())
    }

    async fn remove_hosts_from_exceptions(&self, hosts: &[IpAddr]) -> VpnResult<()> {
        for ip in hosts {
            self.exceptions.lock().remove(ip);
            if self.enabled.load(Ordering::SeqCst) {
                let ip = ip.to_string();
                self.iptables_quiet(&["-D", CHAIN_OUT, "-d", &ip, "-j", "ACCEPT"]).await;
                self.iptables_quiet(&["-D", CHAIN_IN, "-s", &ip, "-j", "ACCEPT"]).await;
            }
        }
        Ok(())
    }

    async fn set_allow_lan(&self, _allow_lan: bool, _allow_multicast: bool) -> VpnResult<()> {
        if self.enabled.load(Ordering::SeqCst) {
            self.reenable(false).await?;
        }
        Ok(())
    }

    async fn set_user_exceptions(&self, _exceptions: &str) -> VpnResult<()> {
        if self.enabled.load(Ordering::SeqCst) {
            self.reenable(false).await?;
        }
        Ok(())
    }

    async fn client_connected(&self, endpoints: ClientEndpoints) -> VpnResult<()> {
        debug!(
            "Firewall: client connected (local {:?}, server {:?})",
            endpoints.client_ip, endpoints.server_ip
        );
        Ok(())
    }

    async fn client_disconnected(&self) -> VpnResult<()> {
        self.client_paused.store(false, Ordering::SeqCst);
        self.exceptions.lock().clear();
        Ok(())
    }

    fn client_paused(&self) {
        self.client_paused.store(true, Ordering::SeqCst);
    }

    fn client_resumed(&self) {
        self.client_paused.store(false, Ordering::SeqCst);
    }

    async fn try_reregister_at_top_priority(&self, force: bool) -> VpnResult<()> {
        // re-inserting the jump rules moves us back to position 1 if some
        // other software prepended its own
        if !force && !self.enabled.load(Ordering::SeqCst) {
            return Ok(());
        }
        info!("Re-registering firewall chains at top priority");
        self.reenable(false).await
    }

    fn reconfigurable_other_vpns_detected(&self) -> bool {
        false
    }

    async fn apply_full_tunnel(&self) -> VpnResult<()> {
        let full_tunnel = self.prefs.snapshot().full_tunnel_enabled;
        if full_tunnel && !self.enabled.load(Ordering::SeqCst) {
            self.set_enabled(true).await?;
        }
        Ok(())
    }

    async fn on_change_dns(&self, dns: Option<IpAddr>) -> VpnResult<()> {
        let previous = std::mem::replace(&mut *self.dns_rule.lock(), dns);
        if !self.enabled.load(Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(previous) = previous {
            let prev = previous.to_string();
            for proto in ["udp", "tcp"] {
                self.iptables_quiet(&[
                    "-D", CHAIN_OUT, "-d", &prev, "-p", proto, "--dport", "53", "-j", "ACCEPT",
                ])
                .await;
            }
        }
        if let Some(dns) = dns {
            self.allow_dns(dns).await?;
        }
        Ok(())
    }

    fn dns_rule_installed(&self) -> bool {
        self.dns_rule.lock().is_some()
    }

    fn background_monitors(&self) -> Vec<Arc<dyn FirewallBackgroundMonitor>> {
        Vec::new()
    }

    async fn deploy_post_connection_rules(
        &self,
        _can_reconfigure_other_vpns: bool,
    ) -> VpnResult<()> {
        Ok(())
    }

    async fn cleanup(&self) -> VpnResult<()> {
        warn!("Removing all firewall rules");
        self.remove_chains().await?;
        self.enabled.store(false, Ordering::SeqCst);
        Ok(())
    }
}
