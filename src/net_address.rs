//! Network endpoint addressing.
//!
//! Peers are identified by a `tcp://ip:port` endpoint. The canonical string
//! form keys the inbound/outbound peer tables; the bare ip keys the
//! pending-dial table.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use thiserror::Error;

/// Address parsing errors
#[derive(Error, Debug)]
pub enum AddressError {
    #[error("invalid network address: {0}")]
    Invalid(String),
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),
}

/// Transport protocol of a network endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
        }
    }
}

/// A remote (or local) network endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetAddress {
    pub protocol: Protocol,
    pub ip: IpAddr,
    pub port: u16,
}

impl NetAddress {
    /// Create a TCP endpoint
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self {
            protocol: Protocol::Tcp,
            ip,
            port,
        }
    }

    /// Parse an endpoint from its string form.
    ///
    /// Accepts both `tcp://ip:port` and a bare `ip:port` (as produced by a
    /// socket's remote address).
    pub fn parse(s: &str) -> Result<Self, AddressError> {
        let (proto, rest) = match s.split_once("://") {
            Some((p, r)) => (p, r),
            None => ("tcp", s),
        };
        if proto != "tcp" {
            return Err(AddressError::UnsupportedProtocol(proto.to_string()));
        }
        if let Ok(sock) = rest.parse::<SocketAddr>() {
            return Ok(Self::from_socket_addr(sock));
        }
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| AddressError::Invalid(s.to_string()))?;
        let ip: IpAddr = host
            .parse()
            .map_err(|_| AddressError::Invalid(s.to_string()))?;
        let port: u16 = port
            .parse()
            .map_err(|_| AddressError::Invalid(s.to_string()))?;
        Ok(Self::new(ip, port))
    }

    /// Build from an accepted socket address
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }

    /// The dialable socket address
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl fmt::Display for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.protocol, self.ip, self.port)
    }
}

impl FromStr for NetAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_scheme() {
        let addr = NetAddress::parse("tcp://127.0.0.1:8080").unwrap();
        assert_eq!(addr.protocol, Protocol::Tcp);
        assert_eq!(addr.ip, "127.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(addr.port, 8080);
        assert_eq!(addr.to_string(), "tcp://127.0.0.1:8080");
    }

    #[test]
    fn test_parse_bare_socket_addr() {
        let addr = NetAddress::parse("192.168.1.1:8088").unwrap();
        assert_eq!(addr.to_string(), "tcp://192.168.1.1:8088");
    }

    #[test]
    fn test_parse_rejects_unknown_protocol() {
        assert!(matches!(
            NetAddress::parse("udp://127.0.0.1:8080"),
            Err(AddressError::UnsupportedProtocol(_))
        ));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(NetAddress::parse("tcp://not-an-ip:8080").is_err());
        assert!(NetAddress::parse("tcp://127.0.0.1").is_err());
        assert!(NetAddress::parse("tcp://127.0.0.1:99999").is_err());
    }

    #[test]
    fn test_roundtrip_through_display() {
        let addr = NetAddress::parse("tcp://10.0.0.2:9000").unwrap();
        let again = NetAddress::parse(&addr.to_string()).unwrap();
        assert_eq!(addr, again);
    }
}
