//! Canonical remote-endpoint identity.
//!
//! Every table in the client (exchanges, transactions, observers, the
//! duplicate cache) is keyed on the remote endpoint, so two textual spellings
//! of the same address must collapse to the same key. Parsing through
//! `std::net` gives value-level canonicalization for free; the `Display`
//! form writes IPv6 groups fully expanded and zero-padded so that equal
//! endpoints always render identically.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use thiserror::Error;

use crate::DEFAULT_PORT;

/// A canonicalized (address, port) pair identifying a remote CoAP endpoint
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EndpointAddr {
    ip: IpAddr,
    port: u16,
}

impl EndpointAddr {
    /// Construct from an address and an explicit port
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    /// The remote IP address
    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    /// The remote UDP port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The address as a `SocketAddr`, for handing to the host's sockets
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Whether datagrams to this endpoint need an IPv6 socket
    pub fn is_ipv6(&self) -> bool {
        self.ip.is_ipv6()
    }
}

impl From<SocketAddr> for EndpointAddr {
    fn from(addr: SocketAddr) -> Self {
        Self {
            ip: addr.ip(),
            port: addr.port(),
        }
    }
}

impl fmt::Display for EndpointAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip {
            IpAddr::V4(ip) => write!(f, "{}", ip)?,
            IpAddr::V6(ip) => {
                // Expanded form: every group, zero-padded, lower-case
                let groups = ip.segments();
                write!(f, "[")?;
                for (i, group) in groups.iter().enumerate() {
                    if i > 0 {
                        write!(f, ":")?;
                    }
                    write!(f, "{:04x}", group)?;
                }
                write!(f, "]")?;
            }
        }
        if self.port != DEFAULT_PORT {
            write!(f, ":{}", self.port)?;
        }
        Ok(())
    }
}

/// Error produced when a string is not a valid endpoint address
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
#[error("invalid endpoint address")]
pub struct InvalidAddr;

impl FromStr for EndpointAddr {
    type Err = InvalidAddr;

    /// Accepts `addr`, `addr:port`, `[v6addr]` and `[v6addr]:port`; a
    /// missing port means the default CoAP port 5683
    fn from_str(s: &str) -> Result<Self, InvalidAddr> {
        if let Ok(sock) = SocketAddr::from_str(s) {
            return Ok(sock.into());
        }
        if let Ok(ip) = IpAddr::from_str(s) {
            return Ok(Self::new(ip, DEFAULT_PORT));
        }
        // Bracketed v6 without a port
        if let Some(inner) = s.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            if let Ok(ip) = IpAddr::from_str(inner) {
                return Ok(Self::new(ip, DEFAULT_PORT));
            }
        }
        Err(InvalidAddr)
    }
}
