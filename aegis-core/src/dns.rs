//! DNS configuration types and the DNS-management capability interface
//!
//! The concrete resolver plumbing (resolvectl, resolv.conf, registry, ...)
//! lives behind [`DnsManager`]; the core only decides *which* DNS to apply
//! and when.

use std::net::IpAddr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::vpn::VpnResult;

/// DNS resolver encryption modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DnsEncryption {
    #[default]
    None,
    DnsOverTls,
    DnsOverHttps,
}

/// A manual DNS selection. Empty host means "no manual DNS".
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DnsSettings {
    pub dns_host: String,
    pub encryption: DnsEncryption,
    /// Template URI for encrypted DNS (DoH/DoT), empty otherwise.
    pub doh_template: String,
}

impl DnsSettings {
    pub fn from_ip(ip: IpAddr) -> Self {
        Self {
            dns_host: ip.to_string(),
            encryption: DnsEncryption::None,
            doh_template: String::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.dns_host.trim().is_empty()
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.dns_host.trim().parse().ok()
    }
}

/// Anti-tracking DNS metadata carried with connection parameters.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AntiTrackerMetadata {
    pub enabled: bool,
    /// Hardcore mode blocks first-party trackers too.
    pub hardcore: bool,
    /// DNS host serving the selected block list.
    pub dns_host: String,
    pub block_list: String,
}

impl AntiTrackerMetadata {
    pub fn dns(&self) -> Option<DnsSettings> {
        if !self.enabled || self.dns_host.trim().is_empty() {
            return None;
        }
        Some(DnsSettings {
            dns_host: self.dns_host.clone(),
            encryption: DnsEncryption::None,
            doh_template: String::new(),
        })
    }
}

/// OS DNS management, consumed by the supervisor around each connect attempt.
#[async_trait]
pub trait DnsManager: Send + Sync {
    /// Re-initialize DNS configuration according to user settings (e.g. the
    /// management style changed since the last connection).
    async fn apply_user_settings(&self) -> VpnResult<()>;

    /// Verify the current OS DNS configuration still matches what we applied
    /// and repair it if not. Invoked opportunistically on routing updates.
    async fn update_if_wrong_settings(&self) -> VpnResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_dns_settings() {
        assert!(DnsSettings::default().is_empty());
        assert!(DnsSettings {
            dns_host: "   ".to_string(),
            ..Default::default()
        }
        .is_empty());
        assert!(!DnsSettings::from_ip("1.1.1.1".parse().unwrap()).is_empty());
    }

    #[test]
    fn test_antitracker_dns_only_when_enabled() {
        let mut at = AntiTrackerMetadata {
            enabled: false,
            hardcore: false,
            dns_host: "10.0.254.2".to_string(),
            block_list: "basic".to_string(),
        };
        assert!(at.dns().is_none());

        at.enabled = true;
        let dns = at.dns().expect("enabled anti-tracker must yield DNS");
        assert_eq!(dns.dns_host, "10.0.254.2");
    }
}
