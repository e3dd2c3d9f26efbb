//! OS routing-change detection interface
//!
//! Two distinct signals:
//! - *routing change*: the default route moved OFF the tunnel interface
//!   (the supervisor reacts by reconnecting);
//! - *routing update*: something changed but the tunnel interface still
//!   carries the default route (the supervisor refreshes proxy routes and
//!   re-validates DNS).

use tokio::sync::mpsc;

use crate::vpn::VpnResult;

pub trait NetChangeDetector: Send + Sync {
    /// Bind the detector to the interface to protect and the two signal
    /// channels. Must be called before `start`.
    fn init(
        &self,
        protected_interface: Option<String>,
        routing_change_tx: mpsc::Sender<()>,
        routing_update_tx: mpsc::Sender<()>,
    ) -> VpnResult<()>;

    fn start(&self) -> VpnResult<()>;

    fn stop(&self);

    /// Stop and unbind; safe to call at any time, including when never
    /// initialized.
    fn uninit(&self);
}
