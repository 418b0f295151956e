use std::net::IpAddr;
use std::net::SocketAddr;

/// Extract the IP from an address of the form `ip`, `ip:port` or `[ipv6]:port`.
///
/// Returns `None` for anything that is not a literal address, such as a host name.
pub fn ip(addr: &str) -> Option<IpAddr> {
    let addr = addr.trim();
    addr.parse::<SocketAddr>()
        .map(|socket| socket.ip())
        .or_else(|_| addr.parse::<IpAddr>())
        .ok()
}
