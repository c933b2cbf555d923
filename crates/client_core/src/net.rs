//! Local address helpers for deciding whether a room endpoint is this machine.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};

const LOOPBACK: Ipv4Addr = Ipv4Addr::LOCALHOST;

/// Primary non-loopback IPv4 of this machine, or `127.0.0.1`.
///
/// Connecting a UDP socket sends nothing; it only asks the OS which local
/// address would route to a public destination.
pub fn local_ipv4() -> Ipv4Addr {
    let probe = || -> std::io::Result<IpAddr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80))?;
        Ok(socket.local_addr()?.ip())
    };
    match probe() {
        Ok(IpAddr::V4(ip)) if !ip.is_loopback() && !ip.is_unspecified() => ip,
        _ => LOOPBACK,
    }
}

pub fn is_local_endpoint(endpoint: &str, local_ip: Ipv4Addr) -> bool {
    let host = endpoint.trim();
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    match host.parse::<IpAddr>() {
        Ok(ip) => ip.is_loopback() || ip == IpAddr::V4(local_ip),
        Err(_) => false,
    }
}

pub fn loopback_endpoint() -> String {
    LOOPBACK.to_string()
}
