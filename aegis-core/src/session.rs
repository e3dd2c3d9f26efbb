//! Remote session/auth operations
//!
//! The daemon talks to the backend for a small set of session operations:
//! login (session-new), logout (session-delete), device registration checks
//! and account status. Only the fields the connection core inspects are
//! modelled here; everything else passes through opaquely.

use async_trait::async_trait;
use chrono::Utc;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::vpn::{VpnError, VpnResult};

/// Account/subscription status as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AccountStatus {
    pub active: bool,
    /// Unix timestamp after which the subscription is expired.
    pub active_until: i64,
    pub is_can_connect_multihop: bool,
    pub upgradable: bool,
    pub upgrade_to_url: String,
}

impl AccountStatus {
    pub fn is_can_connect_multihop(&self) -> bool {
        self.is_can_connect_multihop
    }

    /// Whether the cached status needs a refresh before connecting.
    pub fn is_stale(&self) -> bool {
        !self.active || Utc::now().timestamp() >= self.active_until
    }
}

/// Credentials issued by a successful session-new call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionData {
    pub session_token: String,
    pub device_id: String,
    pub device_name: String,
    pub wg_public_key: String,
    pub wg_private_key: String,
    pub wg_local_ip: String,
    pub wg_preshared_key: String,
    pub account: AccountStatus,
    /// Entry server data issued with the session, used to refresh connection
    /// parameters after a re-login.
    pub vpn_entry_hosts: Vec<crate::vpn::HostInfo>,
    pub vpn_entry_port: u16,
}

/// The remote session API surface the core needs.
#[async_trait]
pub trait RemoteSessionApi: Send + Sync {
    /// Log in: create a new session for the account, registering this device.
    async fn session_new(
        &self,
        account_id: &str,
        device_name: &str,
        wg_public_key: &str,
    ) -> VpnResult<SessionData>;

    /// Log in with a single-sign-on token instead of an account id.
    async fn sso_login(
        &self,
        sso_token: &str,
        device_name: &str,
        wg_public_key: &str,
    ) -> VpnResult<SessionData>;

    /// Log out: delete the session server-side.
    async fn session_delete(&self, session_token: &str) -> VpnResult<()>;

    /// Bind this device's key material to the session.
    async fn connect_device(&self, session_token: &str, wg_public_key: &str) -> VpnResult<()>;

    /// Whether this device's registration is still active server-side.
    async fn check_device_id(&self, session_token: &str, wg_public_key: &str) -> VpnResult<bool>;

    /// Current account/subscription status.
    async fn session_status(&self, session_token: &str) -> VpnResult<AccountStatus>;

    /// Whether internal backend hosts are reachable through the tunnel.
    /// Used by the connectivity health monitor.
    async fn ping_internal_api_hosts(&self) -> VpnResult<bool>;
}

/// REST implementation of [`RemoteSessionApi`].
pub struct RestSessionApi {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct StatusResponse {
    #[serde(default)]
    active: bool,
    #[serde(default)]
    active_until: i64,
    #[serde(default)]
    is_can_connect_multihop: bool,
    #[serde(default)]
    upgradable: bool,
    #[serde(default)]
    upgrade_to_url: String,
}

impl From<StatusResponse> for AccountStatus {
    fn from(r: StatusResponse) -> Self {
        AccountStatus {
            active: r.active,
            active_until: r.active_until,
            is_can_connect_multihop: r.is_can_connect_multihop,
            upgradable: r.upgradable,
            upgrade_to_url: r.upgrade_to_url,
        }
    }
}

impl RestSessionApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("aegis-daemon/", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("failed to create HTTP client");
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    async fn post_json<B: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> VpnResult<R> {
        let url = format!("{}{}", self.base_url, path);
        debug!("API request: {path}");
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| VpnError::Api(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VpnError::Api(format!("{path}: HTTP {status}: {body}")));
        }
        response
            .json::<R>()
            .await
            .map_err(|e| VpnError::Api(format!("{path}: invalid response: {e}")))
    }
}

#[async_trait]
impl RemoteSessionApi for RestSessionApi {
    async fn session_new(
        &self,
        account_id: &str,
        device_name: &str,
        wg_public_key: &str,
    ) -> VpnResult<SessionData> {
        self.post_json(
            "/v1/session/new",
            &serde_json::json!({
                "account_id": account_id,
                "device_name": device_name,
                "wg_public_key": wg_public_key,
            }),
        )
        .await
    }

    async fn sso_login(
        &self,
        sso_token: &str,
        device_name: &str,
        wg_public_key: &str,
    ) -> VpnResult<SessionData> {
        self.post_json(
            "/v1/session/sso",
            &serde_json::json!({
                "sso_token": sso_token,
                "device_name": device_name,
                "wg_public_key": wg_public_key,
            }),
        )
        .await
    }

    async fn session_delete(&self, session_token: &str) -> VpnResult<()> {
        let _: serde_json::Value = self
            .post_json(
                "/v1/session/delete",
                &serde_json::json!({ "session_token": session_token }),
            )
            .await?;
        Ok(())
    }

    async fn connect_device(&self, session_token: &str, wg_public_key: &str) -> VpnResult<()> {
        let _: serde_json::Value = self
            .post_json(
                "/v1/device/connect",
                &serde_json::json!({
                    "session_token": session_token,
                    "wg_public_key": wg_public_key,
                }),
            )
            .await?;
        Ok(())
    }

    async fn check_device_id(&self, session_token: &str, wg_public_key: &str) -> VpnResult<bool> {
        #[derive(Deserialize)]
        struct DeviceCheckResponse {
            found: bool,
        }
        let resp: DeviceCheckResponse = self
            .post_json(
                "/v1/device/check",
                &serde_json::json!({
                    "session_token": session_token,
                    "wg_public_key": wg_public_key,
                }),
            )
            .await?;
        Ok(resp.found)
    }

    async fn session_status(&self, session_token: &str) -> VpnResult<AccountStatus> {
        let resp: StatusResponse = self
            .post_json(
                "/v1/session/status",
                &serde_json::json!({ "session_token": session_token }),
            )
            .await?;
        Ok(resp.into())
    }

    async fn ping_internal_api_hosts(&self) -> VpnResult<bool> {
        // A cheap authenticated-infrastructure reachability probe: any HTTP
        // response at all means the backend is reachable through the tunnel.
        let url = format!("{}/v1/healthcheck", self.base_url);
        match self.client.get(&url).send().await {
            Ok(_) => Ok(true),
            Err(e) if e.is_timeout() || e.is_connect() => Ok(false),
            Err(e) => Err(VpnError::Api(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_staleness() {
        let fresh = AccountStatus {
            active: true,
            active_until: Utc::now().timestamp() + 3600,
            ..Default::default()
        };
        assert!(!fresh.is_stale());

        let expired = AccountStatus {
            active: true,
            active_until: Utc::now().timestamp() - 1,
            ..Default::default()
        };
        assert!(expired.is_stale());

        let inactive = AccountStatus {
            active: false,
            active_until: Utc::now().timestamp() + 3600,
            ..Default::default()
        };
        assert!(inactive.is_stale());
    }
}
