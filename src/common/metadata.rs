//! Session metadata

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Network type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp,
    Udp,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => write!(f, "TCP"),
            Network::Udp => write!(f, "UDP"),
        }
    }
}

/// Tunnel protocol negotiated on the first client chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolKind {
    /// VLESS-style framing
    Vless,
    /// Trojan-style framing
    Trojan,
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolKind::Vless => write!(f, "VLESS"),
            ProtocolKind::Trojan => write!(f, "Trojan"),
        }
    }
}

/// Destination requested by the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    /// IPv4 literal, IPv6 literal (unbracketed) or domain
    pub host: String,
    pub port: u16,
}

impl Destination {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Destination {
            host: host.into(),
            port,
        }
    }

    /// Last two labels of a dotted host, or the host itself
    pub fn root_domain(&self) -> String {
        root_domain(&self.host)
    }

    pub fn is_ip(&self) -> bool {
        self.host.parse::<Ipv4Addr>().is_ok() || self.host.parse::<Ipv6Addr>().is_ok()
    }

    pub fn is_dns_query(&self) -> bool {
        self.port == 53
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') && !self.host.starts_with('[') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Last two labels of a dotted name
pub fn root_domain(host: &str) -> String {
    if !host.contains('.') {
        return host.to_string();
    }
    let labels: Vec<&str> = host.split('.').collect();
    labels[labels.len().saturating_sub(2)..].join(".")
}

/// Metadata describing one tunnel session
#[derive(Debug, Clone)]
pub struct Metadata {
    /// Network type (TCP/UDP)
    pub network: Network,

    /// Negotiated protocol
    pub protocol: ProtocolKind,

    /// Client address as reported by the edge
    pub source_ip: String,

    /// Requested destination
    pub destination: Destination,
}

impl Metadata {
    pub fn new(protocol: ProtocolKind, network: Network, destination: Destination) -> Self {
        Metadata {
            network,
            protocol,
            source_ip: String::new(),
            destination,
        }
    }

    pub fn with_source_ip(mut self, source_ip: impl Into<String>) -> Self {
        self.source_ip = source_ip.into();
        self
    }
}
