//! Aegis VPN daemon launcher
//!
//! Wires the platform capability implementations into the connection core,
//! starts the client protocol server and publishes the port/secret info
//! file UI/CLI clients read to find us.

mod platform;

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use aegis_core::session::RestSessionApi;
use aegis_core::{ConnectionSupervisor, PlatformFlags, PreferencesStore, Protocol, ProtocolConfig, SupervisorDeps};
use anyhow::{Context, Result};
use log::{error, info, warn};
use rand::Rng;

const DEFAULT_API_URL: &str = "https://api.aegisvpn.net";

struct Paths {
    settings_file: PathBuf,
    port_file: PathBuf,
    log_file: PathBuf,
    tunnel_config_dir: PathBuf,
}

fn is_root() -> bool {
    std::process::Command::new("id")
        .arg("-u")
        .output()
        .ok()
        .and_then(|o| String::from_utf8_lossy(&o.stdout).trim().parse::<u32>().ok())
        == Some(0)
}

fn resolve_paths() -> Paths {
    let base = if cfg!(unix) && is_root() {
        PathBuf::from("/etc/aegis-vpn")
    } else {
        dirs::config_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("aegis-vpn")
    };
    let _ = fs::create_dir_all(&base);

    Paths {
        settings_file: base.join("settings.json"),
        port_file: base.join("port.txt"),
        log_file: base.join("aegis-daemon.log"),
        tunnel_config_dir: base.clone(),
    }
}

fn init_logging(log_file: &PathBuf) {
    match fs::OpenOptions::new().create(true).append(true).open(log_file) {
        Ok(file) => {
            env_logger::Builder::from_default_env()
                .filter_level(log::LevelFilter::Info)
                .target(env_logger::Target::Pipe(Box::new(file)))
                .init();
        }
        Err(_) => {
            env_logger::Builder::from_default_env()
                .filter_level(log::LevelFilter::Info)
                .init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let paths = resolve_paths();
    init_logging(&paths.log_file);

    info!("=== Aegis VPN daemon v{} starting ===", env!("CARGO_PKG_VERSION"));

    let listen_port: u16 = std::env::args()
        .nth(1)
        .and_then(|a| a.parse().ok())
        .unwrap_or(0);

    let prefs = Arc::new(PreferencesStore::load(&paths.settings_file));
    let api = Arc::new(RestSessionApi::new(
        std::env::var("AEGIS_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.to_string()),
    ));

    let supervisor = ConnectionSupervisor::new(SupervisorDeps {
        prefs: prefs.clone(),
        api: api.clone(),
        firewall: Arc::new(platform::IptablesFirewall::new(prefs.clone())),
        split_tunnel: Arc::new(platform::CgroupSplitTunnel::new()),
        net_change: Arc::new(platform::RouteMonitorDetector::new()),
        dns: Arc::new(platform::ResolvectlDnsManager),
        tunnel_builder: Arc::new(platform::PlatformTunnelBuilder::new(
            paths.tunnel_config_dir.clone(),
        )),
        obfs_launcher: None,
        platform: PlatformFlags::default(),
    });

    let secret: u64 = rand::thread_rng().gen();
    let protocol = Protocol::new(
        ProtocolConfig {
            listen_port,
            secret,
        },
        supervisor.clone(),
        api,
    );

    let port = protocol
        .start()
        .await
        .context("failed to start the protocol server")?;

    // clients discover us through the port info file
    write_port_file(&paths.port_file, port, secret)
        .context("failed to write the port info file")?;

    info!("Daemon ready (port {port})");

    wait_for_shutdown_signal().await;

    info!("Shutdown requested");
    protocol.stop();
    if let Err(e) = supervisor.disconnect().await {
        error!("Disconnect on shutdown failed: {e}");
    }
    let _ = fs::remove_file(&paths.port_file);

    info!("=== Aegis VPN daemon stopped ===");
    Ok(())
}

fn write_port_file(path: &PathBuf, port: u16, secret: u64) -> Result<()> {
    let mut file = fs::File::create(path)?;
    writeln!(file, "{port}:{secret:x}")?;

    // the secret must not be world-readable
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o600));
    }
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
