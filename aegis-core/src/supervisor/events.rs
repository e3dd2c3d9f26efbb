//! Event fan-out interface from the supervisor to the client protocol layer
//!
//! Only the supervisor's state-forwarder publishes VPN state, and always in
//! two steps: save the state early (so any reconciliation step that queries
//! "current state" sees the value being reconciled), then process/notify.

use crate::vpn::TunnelStateInfo;

pub trait VpnEventSink: Send + Sync {
    /// Commit `state` as the last known VPN state. When `save_and_process`
    /// is set, also immediately run the notification step.
    fn on_vpn_state_save_early(&self, state: TunnelStateInfo, save_and_process: bool);

    /// Notify clients about the last saved state.
    fn on_vpn_state_process_saved(&self);

    /// Kill-switch (or VPN coexistence) status changed; re-notify clients.
    fn on_kill_switch_state_changed(&self);

    fn on_split_tunnel_status_changed(&self);

    fn on_vpn_pause_changed(&self);

    /// Whether any client is connected (`only_ui`: count UI clients only).
    fn is_client_connected(&self, only_ui: bool) -> bool;
}
