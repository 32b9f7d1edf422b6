use std::fmt;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

use crate::error::NetError;

/// A server endpoint. IPv4-mapped IPv6 addresses are stored in their IPv4
/// form so that replies arriving on either socket compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetAddress(SocketAddr);

impl NetAddress {
    pub fn new(addr: SocketAddr) -> Self {
        let ip = match addr.ip() {
            IpAddr::V6(v6) => v6.to_canonical(),
            v4 => v4,
        };
        Self(SocketAddr::new(ip, addr.port()))
    }

    /// Resolves `host:port`, preferring an IPv4 result when both families are
    /// returned.
    pub fn resolve(host: &str, port: u16) -> Result<Self, NetError> {
        let resolve_error = || NetError::Resolve {
            host: host.to_string(),
            port,
        };

        let candidates: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|_| resolve_error())?
            .collect();

        candidates
            .iter()
            .find(|addr| addr.is_ipv4())
            .or_else(|| candidates.first())
            .map(|addr| Self::new(*addr))
            .ok_or_else(resolve_error)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }

    pub fn is_ipv6(&self) -> bool {
        self.0.is_ipv6()
    }
}

impl From<SocketAddr> for NetAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr)
    }
}

impl fmt::Display for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
