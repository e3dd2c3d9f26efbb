//! Platform implementations of the core's capability interfaces

pub mod dns;
pub mod firewall;
pub mod netchange;
pub mod splittun;
pub mod tunnel_builder;

pub use dns::ResolvectlDnsManager;
pub use firewall::IptablesFirewall;
pub use netchange::RouteMonitorDetector;
pub use splittun::CgroupSplitTunnel;
pub use tunnel_builder::PlatformTunnelBuilder;
