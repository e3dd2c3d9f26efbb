//! Durable daemon settings ("preferences")
//!
//! One in-memory copy, swapped atomically. Mutations go through
//! [`PreferencesStore::update`], which merges, compares and persists only
//! when something actually changed — never a partial write: the file is
//! written to a temp path first and renamed into place, and loading falls
//! back to the temp file when the main file is unreadable (crash mid-save).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::Utc;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::vpn::{ConnectionParams, VpnError, VpnResult};

/// How connectivity health checks probe the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HealthcheckKind {
    #[default]
    Ping,
    RestApiCall,
    Disabled,
}

/// Session credentials and key material for the logged-in device.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionCredentials {
    pub account_id: String,
    pub session_token: String,
    pub device_id: String,
    pub device_name: String,

    pub wg_public_key: String,
    pub wg_private_key: String,
    pub wg_local_ip: String,
    pub wg_preshared_key: String,
    /// Unix timestamp of the last WireGuard key generation.
    pub wg_keys_generated: i64,
    /// Seconds between scheduled key rotations.
    pub wg_rotation_interval: i64,
}

impl SessionCredentials {
    pub fn is_logged_in(&self) -> bool {
        !self.session_token.is_empty()
    }

    pub fn is_wg_credentials_ok(&self) -> bool {
        !self.wg_private_key.is_empty() && !self.wg_local_ip.is_empty()
    }

    /// Keys are usable while younger than rotation interval plus a 3-day
    /// grace period; beyond that a failed regeneration blocks connecting.
    pub fn wg_keys_usable(&self) -> bool {
        if self.wg_public_key.is_empty() {
            return false;
        }
        const GRACE_SECS: i64 = 3 * 24 * 3600;
        let deadline = self.wg_keys_generated + self.wg_rotation_interval + GRACE_SECS;
        Utc::now().timestamp() < deadline
    }
}

/// Kill-switch (firewall) configuration, distinct from its live state.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KillSwitchConfig {
    pub persistent: bool,
    pub allow_lan: bool,
    pub allow_lan_multicast: bool,
    pub allow_api_servers: bool,
    /// Comma separated list of IP addresses/masks excluded from blocking.
    pub user_exceptions: String,
}

/// Split-tunnel configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SplitTunnelConfig {
    pub enabled: bool,
    /// Inverse mode: only whitelisted apps go through the tunnel.
    pub inversed: bool,
    pub app_whitelist_enabled: bool,
    pub allow_any_dns: bool,
    pub allow_when_no_vpn: bool,
    pub apps: Vec<String>,
}

/// Free-form user preferences the daemon round-trips for clients.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UserPreferences {
    pub auto_connect_on_launch: bool,
    pub allow_background_clients: bool,
}

/// The complete durable settings record.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Preferences {
    #[serde(default)]
    pub settings_version: u32,

    #[serde(default)]
    pub session: SessionCredentials,
    #[serde(default)]
    pub account: crate::session::AccountStatus,

    #[serde(default)]
    pub last_connection_params: ConnectionParams,

    #[serde(default)]
    pub kill_switch: KillSwitchConfig,
    #[serde(default)]
    pub split_tunnel: SplitTunnelConfig,

    /// Full-tunnel mode: block all traffic except through the VPN.
    #[serde(default)]
    pub full_tunnel_enabled: bool,

    /// Standing permission to reconfigure competing VPN software.
    #[serde(default)]
    pub permission_reconfigure_other_vpns: bool,

    #[serde(default)]
    pub healthchecks_kind: HealthcheckKind,

    #[serde(default)]
    pub user: UserPreferences,
}

const SETTINGS_VERSION: u32 = 2;

/// Atomically-swapped preferences holder with crash-safe persistence.
pub struct PreferencesStore {
    current: ArcSwap<Preferences>,
    path: PathBuf,
    save_lock: parking_lot::Mutex<()>,
}

impl PreferencesStore {
    /// Load preferences from `path`, falling back to the temp file left by an
    /// interrupted save, then to defaults.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let prefs = match read_prefs(&path) {
            Ok(p) => p,
            Err(e) => {
                warn!("Failed to read settings file: {e}. Trying temp file.");
                match read_prefs(&temp_path(&path)) {
                    Ok(p) => p,
                    Err(_) => {
                        info!("No usable settings found, starting with defaults");
                        Preferences {
                            settings_version: SETTINGS_VERSION,
                            ..Default::default()
                        }
                    }
                }
            }
        };

        Self {
            current: ArcSwap::from_pointee(prefs),
            path,
            save_lock: parking_lot::Mutex::new(()),
        }
    }

    /// In-memory store for tests.
    pub fn ephemeral() -> Self {
        Self {
            current: ArcSwap::from_pointee(Preferences {
                settings_version: SETTINGS_VERSION,
                ..Default::default()
            }),
            path: PathBuf::new(),
            save_lock: parking_lot::Mutex::new(()),
        }
    }

    /// Cheap read-mostly snapshot.
    pub fn snapshot(&self) -> Arc<Preferences> {
        self.current.load_full()
    }

    /// Apply `mutate` to a copy of the current preferences; if the copy
    /// differs from the original, swap it in and persist. Returns whether a
    /// change was made.
    pub fn update<F>(&self, mutate: F) -> VpnResult<bool>
    where
        F: FnOnce(&mut Preferences),
    {
        let _guard = self.save_lock.lock();

        let old = self.current.load_full();
        let mut updated = (*old).clone();
        mutate(&mut updated);

        if updated == *old {
            return Ok(false);
        }

        updated.settings_version = SETTINGS_VERSION;
        self.current.store(Arc::new(updated.clone()));
        self.persist(&updated)?;
        Ok(true)
    }

    fn persist(&self, prefs: &Preferences) -> VpnResult<()> {
        if self.path.as_os_str().is_empty() {
            return Ok(()); // ephemeral store
        }

        let data = serde_json::to_vec_pretty(prefs)
            .map_err(|e| VpnError::Preferences(format!("failed to serialize settings: {e}")))?;

        let tmp = temp_path(&self.path);
        std::fs::write(&tmp, &data)
            .map_err(|e| VpnError::Preferences(format!("failed to write settings: {e}")))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| VpnError::Preferences(format!("failed to replace settings: {e}")))?;
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut p = path.as_os_str().to_owned();
    p.push(".tmp");
    PathBuf::from(p)
}

fn read_prefs(path: &Path) -> std::io::Result<Preferences> {
    let data = std::fs::read(path)?;
    serde_json::from_slice(&data).map_err(std::io::Error::other)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_settings_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("aegis-settings-test-{tag}-{}.json", std::process::id()))
    }

    #[test]
    fn test_update_persists_only_on_change() {
        let path = unique_settings_path("change");
        let _ = std::fs::remove_file(&path);

        let store = PreferencesStore::load(&path);
        let changed = store
            .update(|p| p.full_tunnel_enabled = true)
            .expect("update failed");
        assert!(changed);
        assert!(path.exists());

        let mtime = std::fs::metadata(&path).unwrap().modified().unwrap();
        let changed = store.update(|p| p.full_tunnel_enabled = true).unwrap();
        assert!(!changed, "no-op update must not persist");
        assert_eq!(
            std::fs::metadata(&path).unwrap().modified().unwrap(),
            mtime
        );

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_round_trip_load() {
        let path = unique_settings_path("roundtrip");
        let _ = std::fs::remove_file(&path);

        {
            let store = PreferencesStore::load(&path);
            store
                .update(|p| {
                    p.session.account_id = "acct-123".to_string();
                    p.session.session_token = "tok".to_string();
                    p.healthchecks_kind = HealthcheckKind::RestApiCall;
                })
                .unwrap();
        }

        let reloaded = PreferencesStore::load(&path);
        let prefs = reloaded.snapshot();
        assert_eq!(prefs.session.account_id, "acct-123");
        assert!(prefs.session.is_logged_in());
        assert_eq!(prefs.healthchecks_kind, HealthcheckKind::RestApiCall);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_load_falls_back_to_temp_file() {
        let path = unique_settings_path("fallback");
        let _ = std::fs::remove_file(&path);

        let mut prefs = Preferences::default();
        prefs.session.device_name = "laptop".to_string();
        std::fs::write(temp_path(&path), serde_json::to_vec(&prefs).unwrap()).unwrap();

        let store = PreferencesStore::load(&path);
        assert_eq!(store.snapshot().session.device_name, "laptop");

        let _ = std::fs::remove_file(temp_path(&path));
    }

    #[test]
    fn test_wg_key_grace_period() {
        let mut creds = SessionCredentials {
            wg_public_key: "pk".to_string(),
            wg_keys_generated: Utc::now().timestamp(),
            wg_rotation_interval: 24 * 3600,
            ..Default::default()
        };
        assert!(creds.wg_keys_usable());

        // generated far beyond rotation + grace
        creds.wg_keys_generated = Utc::now().timestamp() - 30 * 24 * 3600;
        assert!(!creds.wg_keys_usable());

        creds.wg_public_key = String::new();
        assert!(!creds.wg_keys_usable());
    }
}
