//! Socket addresses as carried on proxy wires
//!
//! A [`Socksaddr`] is an IPv4 address, an IPv6 address or a domain name, plus a
//! port. The byte encoding is not fixed: a [`Serializer`] maps each [`Family`] to
//! a one-byte tag and decides whether the port goes before or after the address.

mod codec;

pub use codec::{
    Serializer, SerializerBuilder, SOCKS_SERIALIZER, UOT_MAGIC_ADDRESS, UOT_SERIALIZER,
};

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Address family, independent of its wire tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    IPv4,
    IPv6,
    Fqdn,
}

/// Host part of a [`Socksaddr`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Host {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    /// Domain name, sent unresolved
    Fqdn(String),
}

impl Host {
    /// Family used on the wire. IPv4-mapped IPv6 addresses count as IPv4.
    pub fn family(&self) -> Family {
        match self {
            Host::Ipv4(_) => Family::IPv4,
            Host::Ipv6(ip) if ip.to_ipv4_mapped().is_some() => Family::IPv4,
            Host::Ipv6(_) => Family::IPv6,
            Host::Fqdn(_) => Family::Fqdn,
        }
    }

    /// Fold IPv4-mapped IPv6 into plain IPv4.
    pub fn canonical(self) -> Self {
        match self {
            Host::Ipv6(ip) => match ip.to_ipv4_mapped() {
                Some(v4) => Host::Ipv4(v4),
                None => Host::Ipv6(ip),
            },
            other => other,
        }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            Host::Ipv4(ip) => Some(IpAddr::V4(*ip)),
            Host::Ipv6(ip) => Some(IpAddr::V6(*ip)),
            Host::Fqdn(_) => None,
        }
    }
}

impl From<IpAddr> for Host {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => Host::Ipv4(v4),
            IpAddr::V6(v6) => Host::Ipv6(v6).canonical(),
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Host::Ipv4(ip) => write!(f, "{}", ip),
            Host::Ipv6(ip) => write!(f, "{}", ip),
            Host::Fqdn(name) => write!(f, "{}", name),
        }
    }
}

/// Destination or source address: host plus port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Socksaddr {
    pub host: Host,
    pub port: u16,
}

impl Socksaddr {
    pub fn new(host: Host, port: u16) -> Self {
        Self { host, port }
    }

    pub fn ipv4(ip: impl Into<Ipv4Addr>, port: u16) -> Self {
        Self::new(Host::Ipv4(ip.into()), port)
    }

    pub fn ipv6(ip: impl Into<Ipv6Addr>, port: u16) -> Self {
        Self::new(Host::Ipv6(ip.into()), port)
    }

    pub fn fqdn(name: impl Into<String>, port: u16) -> Self {
        Self::new(Host::Fqdn(name.into()), port)
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn family(&self) -> Family {
        self.host.family()
    }

    pub fn is_fqdn(&self) -> bool {
        matches!(self.host, Host::Fqdn(_))
    }

    /// Socket address for IP hosts. Domain names are never resolved here.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.host.ip().map(|ip| SocketAddr::new(ip, self.port))
    }
}

impl From<SocketAddr> for Socksaddr {
    fn from(addr: SocketAddr) -> Self {
        Self::new(Host::from(addr.ip()), addr.port())
    }
}

impl fmt::Display for Socksaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Host::Ipv6(ip) => write!(f, "[{}]:{}", ip, self.port),
            host => write!(f, "{}:{}", host, self.port),
        }
    }
}
