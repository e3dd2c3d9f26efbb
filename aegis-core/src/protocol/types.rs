//! Client protocol wire types
//!
//! Newline-delimited JSON objects over a local loopback TCP socket. Each
//! request carries an index echoed in its response; notifications use index
//! zero. The first message on a connection must be `Hello` with the shared
//! secret, otherwise the connection is dropped.

use serde::{Deserialize, Serialize};

use crate::firewall::KillSwitchStatus;
use crate::preferences::SplitTunnelConfig;
use crate::session::AccountStatus;
use crate::splittun::SplitTunnelStatus;
use crate::vpn::{ConnectionParams, DisconnectionReason, TunnelStateInfo};

/// Kind of the connected client. Some notifications (stats, handshake info)
/// are suppressed for non-UI clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ClientType {
    #[default]
    Ui,
    Cli,
}

/// Requests a client may send.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "command")]
pub enum ClientRequest {
    Hello {
        #[serde(default)]
        idx: i64,
        secret: u64,
        #[serde(default)]
        client_type: ClientType,
    },
    Connect {
        #[serde(default)]
        idx: i64,
        params: ConnectionParams,
    },
    Disconnect {
        #[serde(default)]
        idx: i64,
    },
    PauseConnection {
        #[serde(default)]
        idx: i64,
        duration_seconds: u32,
    },
    ResumeConnection {
        #[serde(default)]
        idx: i64,
    },
    ConnectSettingsGet {
        #[serde(default)]
        idx: i64,
    },
    ConnectSettingsSet {
        #[serde(default)]
        idx: i64,
        params: ConnectionParams,
    },
    SessionNew {
        #[serde(default)]
        idx: i64,
        account_id: String,
        #[serde(default)]
        device_name: String,
    },
    SsoLogin {
        #[serde(default)]
        idx: i64,
        sso_token: String,
        #[serde(default)]
        device_name: String,
    },
    SessionDelete {
        #[serde(default)]
        idx: i64,
    },
    SessionStatus {
        #[serde(default)]
        idx: i64,
    },
    KillSwitchGetStatus {
        #[serde(default)]
        idx: i64,
    },
    KillSwitchSetEnabled {
        #[serde(default)]
        idx: i64,
        enabled: bool,
    },
    KillSwitchSetPersistent {
        #[serde(default)]
        idx: i64,
        persistent: bool,
    },
    KillSwitchSetAllowLan {
        #[serde(default)]
        idx: i64,
        allow_lan: bool,
        #[serde(default)]
        allow_multicast: bool,
    },
    KillSwitchSetUserExceptions {
        #[serde(default)]
        idx: i64,
        exceptions: String,
    },
    SplitTunnelGetStatus {
        #[serde(default)]
        idx: i64,
    },
    SplitTunnelSetConfig {
        #[serde(default)]
        idx: i64,
        config: SplitTunnelConfig,
    },
    SplitTunnelAddApp {
        #[serde(default)]
        idx: i64,
        exec: String,
    },
    SplitTunnelRemoveApp {
        #[serde(default)]
        idx: i64,
        exec: String,
    },
}

impl ClientRequest {
    pub fn idx(&self) -> i64 {
        match self {
            ClientRequest::Hello { idx, .. }
            | ClientRequest::Connect { idx, .. }
            | ClientRequest::Disconnect { idx }
            | ClientRequest::PauseConnection { idx, .. }
            | ClientRequest::ResumeConnection { idx }
            | ClientRequest::ConnectSettingsGet { idx }
            | ClientRequest::ConnectSettingsSet { idx, .. }
            | ClientRequest::SessionNew { idx, .. }
            | ClientRequest::SsoLogin { idx, .. }
            | ClientRequest::SessionDelete { idx }
            | ClientRequest::SessionStatus { idx }
            | ClientRequest::KillSwitchGetStatus { idx }
            | ClientRequest::KillSwitchSetEnabled { idx, .. }
            | ClientRequest::KillSwitchSetPersistent { idx, .. }
            | ClientRequest::KillSwitchSetAllowLan { idx, .. }
            | ClientRequest::KillSwitchSetUserExceptions { idx, .. }
            | ClientRequest::SplitTunnelGetStatus { idx }
            | ClientRequest::SplitTunnelSetConfig { idx, .. }
            | ClientRequest::SplitTunnelAddApp { idx, .. }
            | ClientRequest::SplitTunnelRemoveApp { idx, .. } => *idx,
        }
    }
}

/// Responses and asynchronous notifications the daemon sends.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "command")]
pub enum DaemonMessage {
    HelloResponse {
        idx: i64,
        daemon_version: String,
        is_logged_in: bool,
        /// Error of an earlier unattended connection attempt, replayed to
        /// the first client that connects.
        #[serde(skip_serializing_if = "Option::is_none")]
        last_connection_error: Option<String>,
    },
    EmptyResponse {
        idx: i64,
    },
    ErrorResponse {
        idx: i64,
        error_message: String,
    },

    ConnectSettingsResponse {
        idx: i64,
        params: ConnectionParams,
    },
    AccountStatusResponse {
        idx: i64,
        status: AccountStatus,
    },
    KillSwitchStatusResponse {
        idx: i64,
        status: KillSwitchStatus,
    },
    SplitTunnelStatusResponse {
        idx: i64,
        status: SplitTunnelStatus,
    },

    /// Notification: tunnel reached Connected.
    ConnectedNotification {
        idx: i64,
        state: TunnelStateInfo,
    },
    /// Notification: intermediate state change (Connecting, Reconnecting...).
    VpnStateNotification {
        idx: i64,
        state: String,
        state_additional_info: String,
    },
    /// Notification: the terminal disconnect of a connection request.
    DisconnectedNotification {
        idx: i64,
        failure: bool,
        reason: DisconnectionReason,
        reason_description: String,
    },
    /// Notification: daemon is shutting down, clients should exit.
    DaemonExitingNotification {
        idx: i64,
    },

    /// Notification (UI clients only): tunnel transfer statistics.
    TransferStatsNotification {
        idx: i64,
        bytes_sent: u64,
        bytes_received: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        last_handshake_unix: Option<i64>,
    },
    /// Notification: the WiFi network changed.
    WifiChangedNotification {
        idx: i64,
        ssid: String,
        is_insecure: bool,
    },
    /// Notification: a fresh servers list is available.
    ServersUpdatedNotification {
        idx: i64,
    },
}

impl DaemonMessage {
    /// Serialize as one protocol line (without the trailing newline).
    pub fn to_line(&self) -> String {
        serde_json::to_string(self).expect("protocol message serialization cannot fail")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_parsing_echoes_idx() {
        let raw = r#"{"command":"Disconnect","idx":42}"#;
        let req: ClientRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(req.idx(), 42);
        assert!(matches!(req, ClientRequest::Disconnect { .. }));
    }

    #[test]
    fn test_hello_parsing() {
        let raw = r#"{"command":"Hello","secret":12345,"client_type":"Cli"}"#;
        let req: ClientRequest = serde_json::from_str(raw).unwrap();
        match req {
            ClientRequest::Hello {
                idx,
                secret,
                client_type,
            } => {
                assert_eq!(idx, 0);
                assert_eq!(secret, 12345);
                assert_eq!(client_type, ClientType::Cli);
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_command_is_rejected() {
        let raw = r#"{"command":"FlushCaches","idx":1}"#;
        assert!(serde_json::from_str::<ClientRequest>(raw).is_err());
    }

    #[test]
    fn test_response_line_has_command_tag() {
        let line = DaemonMessage::EmptyResponse { idx: 7 }.to_line();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["command"], "EmptyResponse");
        assert_eq!(value["idx"], 7);
    }
}
