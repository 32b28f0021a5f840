//! Connection identity: the 4-tuple of local and remote addresses.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

/// One side of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub address: IpAddr,
    pub port: u16,
}

impl Endpoint {
    /// The cleared-slot sentinel used for entries on the free list.
    pub const UNSPECIFIED: Endpoint = Endpoint {
        address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        port: 0,
    };

    pub const fn new(address: IpAddr, port: u16) -> Self {
        Self { address, port }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.address {
            IpAddr::V4(ip) => write!(f, "{}:{}", ip, self.port),
            IpAddr::V6(ip) => write!(f, "[{}]:{}", ip, self.port),
        }
    }
}

/// The pair of endpoints that uniquely identifies a TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoints {
    /// Our side of the connection
    pub local: Endpoint,
    /// The scanned target
    pub remote: Endpoint,
}

impl Endpoints {
    pub const UNSPECIFIED: Endpoints = Endpoints {
        local: Endpoint::UNSPECIFIED,
        remote: Endpoint::UNSPECIFIED,
    };

    pub const fn new(local: Endpoint, remote: Endpoint) -> Self {
        Self { local, remote }
    }

    /// Get a matching pair for the remote TCP's view of the connection.
    pub const fn reverse(self) -> Self {
        Self {
            local: self.remote,
            remote: self.local,
        }
    }
}

impl fmt::Display for Endpoints {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} -> {}", self.local, self.remote)
    }
}
