//! Aegis VPN daemon core
//!
//! The connection-lifecycle state machine and its concurrency coordination:
//! turning a "connect" request into a running tunnel process, keeping the
//! firewall, DNS, split-tunnel and routing subsystems synchronized with the
//! tunnel state through every transition, supervising and auto-recovering
//! from failures, and serializing concurrent control requests from multiple
//! local clients into a single ordered sequence of connection attempts.
//!
//! OS-specific subsystems (firewall rules, DNS plumbing, split-tunnel
//! driver, routing-change detection) are consumed as capability traits; the
//! daemon binary wires in the platform implementations.

pub mod dns;
pub mod firewall;
pub mod netchange;
pub mod netinfo;
pub mod obfs;
pub mod preferences;
pub mod protocol;
pub mod session;
pub mod splittun;
pub mod supervisor;
pub mod vpn;

pub use preferences::{Preferences, PreferencesStore};
pub use protocol::{Protocol, ProtocolConfig};
pub use supervisor::{ConnectionSupervisor, PlatformFlags, SupervisorDeps, VpnEventSink};
pub use vpn::{ConnectionParams, VpnError, VpnResult};
