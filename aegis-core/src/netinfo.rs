//! Local network information helpers

use std::net::{IpAddr, SocketAddr, UdpSocket};

use crate::vpn::{VpnError, VpnResult};

/// Detect the local address the OS would use for outbound traffic.
///
/// Opens a UDP socket "towards" a public address; no packets are sent, the
/// OS just resolves the route and binds a source address.
pub fn outbound_ip(ipv6: bool) -> VpnResult<IpAddr> {
    let (bind, probe): (&str, SocketAddr) = if ipv6 {
        ("[::]:0", "[2001:4860:4860::8888]:80".parse().unwrap())
    } else {
        ("0.0.0.0:0", "8.8.8.8:80".parse().unwrap())
    };

    let socket = UdpSocket::bind(bind)?;
    socket.connect(probe).map_err(|e| {
        VpnError::Other(format!(
            "failed to detect outbound IPv{} address: {e}",
            if ipv6 { 6 } else { 4 }
        ))
    })?;
    Ok(socket.local_addr()?.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbound_ipv4_is_not_unspecified() {
        // On hosts without a default route this probe legitimately fails;
        // only assert on the success path.
        if let Ok(ip) = outbound_ip(false) {
            assert!(!ip.is_unspecified());
        }
    }
}
