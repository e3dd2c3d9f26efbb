//! Connectivity health monitor
//!
//! Started only after the tunnel reaches Connected, stopped whenever the
//! attempt tears down. Periodically verifies the tunnel actually reaches
//! backend resources and drives a strictly two-phase remediation when it
//! does not: first re-register the firewall at top OS priority (covers the
//! "another VPN took priority" failure class), then disable full-tunnel
//! mode and force a reconnect.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::sync::watch;

use super::ConnectionSupervisor;
use crate::preferences::HealthcheckKind;

/// Two-phase remediation cursor. Reset to Clean on every successful check
/// or on disconnect; advanced one phase per consecutive failure; wraps back
/// to Clean after the reconnect phase fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendConnectivityCheckState {
    #[default]
    Clean,
    TryReconnect,
}

/// Successful checks re-publish firewall and VPN state to clients (covers a
/// UI stuck showing a stale "blocked" indicator), at most this many times
/// per reconnect episode.
const MAX_NOTIFICATIONS_PER_EPISODE: u32 = 2;

pub(super) struct HealthMonitorState {
    /// Only one monitor instance may run at a time.
    run_lock: tokio::sync::Mutex<()>,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
    phase: Mutex<BackendConnectivityCheckState>,
    episode_notifications: AtomicU32,
}

impl HealthMonitorState {
    pub(super) fn new() -> Self {
        Self {
            run_lock: tokio::sync::Mutex::new(()),
            stop_tx: Mutex::new(None),
            phase: Mutex::new(BackendConnectivityCheckState::Clean),
            episode_notifications: AtomicU32::new(0),
        }
    }

    pub(super) fn request_stop(&self) {
        if let Some(stop) = self.stop_tx.lock().take() {
            let _ = stop.send(true);
        }
    }

    fn phase(&self) -> BackendConnectivityCheckState {
        *self.phase.lock()
    }

    fn set_phase(&self, phase: BackendConnectivityCheckState) {
        *self.phase.lock() = phase;
    }
}

fn check_interval(kind: HealthcheckKind) -> Duration {
    match kind {
        HealthcheckKind::Ping => Duration::from_secs(5),
        HealthcheckKind::RestApiCall => Duration::from_secs(30),
        HealthcheckKind::Disabled => Duration::from_secs(60),
    }
}

impl ConnectionSupervisor {
    /// Body of the health-monitor task. `attempt_stop` is the attempt's stop
    /// signal; an additional per-run stop channel lets `disconnect()` halt
    /// the monitor ahead of the tunnel teardown.
    pub(super) async fn run_health_monitor(
        self: Arc<Self>,
        mut attempt_stop: watch::Receiver<bool>,
    ) {
        let Ok(_run_guard) = self.health.run_lock.try_lock() else {
            debug!("Connectivity health monitor already running");
            return;
        };

        debug!("Connectivity health monitor started");

        let (stop_tx, mut stop_rx) = watch::channel(false);
        *self.health.stop_tx.lock() = Some(stop_tx);

        self.health
            .set_phase(BackendConnectivityCheckState::Clean);
        self.health.episode_notifications.store(0, Ordering::SeqCst);

        loop {
            let kind = self.prefs.snapshot().healthchecks_kind;
            tokio::select! {
                _ = attempt_stop.changed() => break,
                _ = stop_rx.changed() => break,
                _ = tokio::time::sleep(check_interval(kind)) => {}
            }

            if self.is_daemon_stopping() {
                break;
            }
            if kind == HealthcheckKind::Disabled {
                continue;
            }

            if let Err(e) = self.check_connectivity_fix_as_needed().await {
                error!("Connectivity check error: {e}"); // and continue
            }
        }

        self.health.stop_tx.lock().take();
        debug!("Connectivity health monitor stopped");
    }

    /// One connectivity probe plus, on failure, one step of the two-phase
    /// remediation.
    pub(super) async fn check_connectivity_fix_as_needed(
        self: &Arc<Self>,
    ) -> crate::vpn::VpnResult<()> {
        if self.is_daemon_stopping() {
            self.health.set_phase(BackendConnectivityCheckState::Clean);
            return Ok(());
        }

        let reachable = match self.api.ping_internal_api_hosts().await {
            Ok(reachable) => reachable,
            Err(e) => {
                // probe infrastructure failure, not a verdict about the
                // tunnel: skip this iteration
                self.health.set_phase(BackendConnectivityCheckState::Clean);
                return Err(e);
            }
        };

        if reachable {
            self.health.set_phase(BackendConnectivityCheckState::Clean);

            // re-publish state to clients, capped per reconnect episode
            let sent = self.health.episode_notifications.load(Ordering::SeqCst);
            if sent < MAX_NOTIFICATIONS_PER_EPISODE {
                self.health
                    .episode_notifications
                    .fetch_add(1, Ordering::SeqCst);
                self.sink_on_kill_switch_changed();
                self.sink_process_saved();
            }
            return Ok(());
        }

        // the tunnel may have gone away while we probed; not our problem then
        if !self.connected_or_connecting() {
            self.health.set_phase(BackendConnectivityCheckState::Clean);
            return Ok(());
        }

        // remediation may need to reconfigure a competing VPN; without the
        // permission, ask the user instead of acting
        if self.firewall.reconfigurable_other_vpns_detected()
            && !self.prefs.snapshot().permission_reconfigure_other_vpns
        {
            warn!(
                "Backend unreachable and a reconfigurable competing VPN is present; \
                 skipping remediation (no permission)"
            );
            self.sink_on_kill_switch_changed();
            return Ok(());
        }

        match self.health.phase() {
            BackendConnectivityCheckState::Clean => {
                // phase 1: fully redeploy firewall and coexistence rules
                self.health
                    .set_phase(BackendConnectivityCheckState::TryReconnect);
                self.firewall.try_reregister_at_top_priority(true).await?;
            }
            BackendConnectivityCheckState::TryReconnect => {
                // phase 2: disable full-tunnel mode and reconnect
                self.health.set_phase(BackendConnectivityCheckState::Clean);

                let was_full_tunnel = self.prefs.snapshot().full_tunnel_enabled;
                if was_full_tunnel {
                    warn!("Disabling full-tunnel mode to restore backend connectivity");
                    self.prefs.update(|p| p.full_tunnel_enabled = false)?;
                    if let Err(e) = self.firewall.apply_full_tunnel().await {
                        error!("Failed to re-apply full-tunnel rules: {e}");
                    }
                    // never silent: the security posture changed
                    self.sink_on_split_tunnel_changed();
                }

                if self.connected_or_connecting() {
                    info!("Backend still unreachable; forcing a reconnect");
                    self.reconnect().await?;
                }
            }
        }

        Ok(())
    }

    /// Current remediation phase (for tests and diagnostics).
    pub fn backend_connectivity_check_state(&self) -> BackendConnectivityCheckState {
        self.health.phase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    use crate::preferences::PreferencesStore;
    use crate::supervisor::testutil::*;
    use crate::supervisor::{ConnectionSupervisor, PlatformFlags, SupervisorDeps};

    struct Fixture {
        supervisor: Arc<ConnectionSupervisor>,
        api: Arc<MockApi>,
        firewall: Arc<MockFirewall>,
        tunnel: Arc<IdleTunnel>,
    }

    fn fixture() -> Fixture {
        let api = Arc::new(MockApi::new());
        let firewall = Arc::new(MockFirewall::default());
        let supervisor = ConnectionSupervisor::new(SupervisorDeps {
            prefs: Arc::new(PreferencesStore::ephemeral()),
            api: api.clone(),
            firewall: firewall.clone(),
            split_tunnel: Arc::new(MockSplitTunnel::default()),
            net_change: Arc::new(MockNetChange),
            dns: Arc::new(MockDns),
            tunnel_builder: Arc::new(FailingBuilder),
            obfs_launcher: None,
            platform: PlatformFlags {
                require_firewall_before_tunnel: false,
            },
        });

        // simulate an established connection
        let tunnel = Arc::new(IdleTunnel::default());
        *supervisor.tunnel.lock() = Some(tunnel.clone());

        Fixture {
            supervisor,
            api,
            firewall,
            tunnel,
        }
    }

    fn queue_ping(fixture: &Fixture, results: &[bool]) {
        let mut queue = fixture.api.ping_results.lock();
        for r in results {
            queue.push_back(Ok(*r));
        }
    }

    #[tokio::test]
    async fn test_two_failures_drive_reregister_then_reconnect() {
        let f = fixture();
        queue_ping(&f, &[false, false]);

        // failure 1: firewall re-registration, no reconnect
        f.supervisor.check_connectivity_fix_as_needed().await.unwrap();
        assert_eq!(
            f.supervisor.backend_connectivity_check_state(),
            BackendConnectivityCheckState::TryReconnect
        );
        assert_eq!(f.firewall.reregister_calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.tunnel.disconnect_calls.load(Ordering::SeqCst), 0);

        // failure 2: reconnect fires, cursor wraps back to Clean
        f.supervisor.check_connectivity_fix_as_needed().await.unwrap();
        assert_eq!(
            f.supervisor.backend_connectivity_check_state(),
            BackendConnectivityCheckState::Clean
        );
        assert_eq!(f.tunnel.disconnect_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_single_failure_then_success_never_reconnects() {
        let f = fixture();
        queue_ping(&f, &[false, true]);

        f.supervisor.check_connectivity_fix_as_needed().await.unwrap();
        assert_eq!(f.firewall.reregister_calls.load(Ordering::SeqCst), 1);

        f.supervisor.check_connectivity_fix_as_needed().await.unwrap();
        assert_eq!(
            f.supervisor.backend_connectivity_check_state(),
            BackendConnectivityCheckState::Clean
        );
        assert_eq!(f.tunnel.disconnect_calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.firewall.reregister_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_while_disconnected_resets_quietly() {
        let f = fixture();
        *f.supervisor.tunnel.lock() = None;
        queue_ping(&f, &[false]);

        f.supervisor.check_connectivity_fix_as_needed().await.unwrap();
        assert_eq!(
            f.supervisor.backend_connectivity_check_state(),
            BackendConnectivityCheckState::Clean
        );
        assert_eq!(f.firewall.reregister_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_probe_error_resets_cursor_and_skips_iteration() {
        let f = fixture();
        f.api
            .ping_results
            .lock()
            .push_back(Err(crate::vpn::VpnError::Api("probe broke".to_string())));

        assert!(f.supervisor.check_connectivity_fix_as_needed().await.is_err());
        assert_eq!(
            f.supervisor.backend_connectivity_check_state(),
            BackendConnectivityCheckState::Clean
        );
        assert_eq!(f.firewall.reregister_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_remediation_skipped_without_reconfigure_permission() {
        let f = fixture();
        f.firewall.other_vpns_detected.store(true, Ordering::SeqCst);
        queue_ping(&f, &[false, false]);

        f.supervisor.check_connectivity_fix_as_needed().await.unwrap();
        f.supervisor.check_connectivity_fix_as_needed().await.unwrap();

        assert_eq!(f.firewall.reregister_calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.tunnel.disconnect_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_phase2_disables_full_tunnel() {
        let f = fixture();
        f.supervisor
            .prefs
            .update(|p| p.full_tunnel_enabled = true)
            .unwrap();
        queue_ping(&f, &[false, false]);

        f.supervisor.check_connectivity_fix_as_needed().await.unwrap();
        f.supervisor.check_connectivity_fix_as_needed().await.unwrap();

        assert!(!f.supervisor.prefs.snapshot().full_tunnel_enabled);
        let calls = f.firewall.calls.lock().clone();
        assert!(calls.iter().any(|c| c == "apply_full_tunnel"));
    }
}
