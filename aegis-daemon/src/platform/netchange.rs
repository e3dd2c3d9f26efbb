//! Routing-change detector built on `ip monitor route`
//!
//! A blocking reader thread consumes the monitor process output and pushes
//! coarse events over a crossbeam channel; a forwarder task classifies them
//! into "default route left the tunnel interface" vs "route updated".

use std::io::BufRead;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};

use aegis_core::netchange::NetChangeDetector;
use aegis_core::vpn::{VpnError, VpnResult};
use log::{debug, error, info};
use parking_lot::Mutex;
use tokio::sync::mpsc;

const TUNNEL_INTERFACE: &str = "aegis0";

struct DetectorState {
    protected_interface: String,
    routing_change_tx: mpsc::Sender<()>,
    routing_update_tx: mpsc::Sender<()>,
}

pub struct RouteMonitorDetector {
    state: Mutex<Option<DetectorState>>,
    monitor: Mutex<Option<Child>>,
    running: AtomicBool,
}

impl RouteMonitorDetector {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(None),
            monitor: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    /// Interface currently carrying the default route.
    fn default_route_interface() -> Option<String> {
        let output = Command::new("ip")
            .args(["route", "show", "default"])
            .output()
            .ok()?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout.lines().next()?;
        let mut words = line.split_whitespace();
        while let Some(word) = words.next() {
            if word == "dev" {
                return words.next().map(str::to_string);
            }
        }
        None
    }
}

impl NetChangeDetector for RouteMonitorDetector {
    fn init(
        &self,
        protected_interface: Option<String>,
        routing_change_tx: mpsc::Sender<()>,
        routing_update_tx: mpsc::Sender<()>,
    ) -> VpnResult<()> {
        *self.state.lock() = Some(DetectorState {
            protected_interface: protected_interface
                .unwrap_or_else(|| TUNNEL_INTERFACE.to_string()),
            routing_change_tx,
            routing_update_tx,
        });
        Ok(())
    }

    fn start(&self) -> VpnResult<()> {
        let state = self.state.lock();
        let Some(state) = state.as_ref() else {
            return Err(VpnError::Other(
                "route change detector not initialized".to_string(),
            ));
        };

        let mut child = Command::new("ip")
            .args(["-o", "monitor", "route"])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| VpnError::Other(format!("failed to start route monitor: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| VpnError::Other("route monitor stdout unavailable".to_string()))?;

        let (event_tx, event_rx) = crossbeam_channel::bounded::<()>(16);

        // blocking reader thread: one event per monitor output line
        std::thread::Builder::new()
            .name("route-monitor-reader".to_string())
            .spawn(move || {
                let reader = std::io::BufReader::new(stdout);
                for line in reader.lines() {
                    match line {
                        Ok(line) => {
                            debug!("Route event: {line}");
                            if event_tx.send(()).is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
                debug!("Route monitor reader exiting");
            })
            .map_err(|e| VpnError::Other(format!("failed to spawn reader thread: {e}")))?;

        self.running.store(true, Ordering::SeqCst);
        *self.monitor.lock() = Some(child);

        // forwarder: classify each event against the current default route
        let protected = state.protected_interface.clone();
        let change_tx = state.routing_change_tx.clone();
        let update_tx = state.routing_update_tx.clone();
        tokio::task::spawn_blocking(move || {
            while event_rx.recv().is_ok() {
                match Self::default_route_interface() {
                    Some(iface) if iface != protected => {
                        info!("Default route moved to '{iface}'");
                        let _ = change_tx.try_send(());
                        break;
                    }
                    _ => {
                        let _ = update_tx.try_send(());
                    }
                }
            }
            debug!("Route monitor forwarder exiting");
        });

        info!("Route change detection started");
        Ok(())
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(mut child) = self.monitor.lock().take() {
            if let Err(e) = child.kill() {
                error!("Failed to stop route monitor: {e}");
            }
            let _ = child.wait();
        }
    }

    fn uninit(&self) {
        self.stop();
        self.state.lock().take();
    }
}
