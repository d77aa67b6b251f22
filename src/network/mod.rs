//! Network primitives shared by the prober and the discovery pipeline

pub mod socket;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Transport protocol, the lowest layer scanned directly
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which transports a scan covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportSelection {
    Tcp,
    Udp,
    #[default]
    Both,
}

impl TransportSelection {
    /// Transports to probe, TCP first
    pub fn transports(&self) -> &'static [Transport] {
        match self {
            TransportSelection::Tcp => &[Transport::Tcp],
            TransportSelection::Udp => &[Transport::Udp],
            TransportSelection::Both => &[Transport::Tcp, Transport::Udp],
        }
    }
}

impl FromStr for TransportSelection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tcp" => Ok(TransportSelection::Tcp),
            "udp" => Ok(TransportSelection::Udp),
            "both" | "all" => Ok(TransportSelection::Both),
            _ => Err(format!("Unknown transport selection: {}", s)),
        }
    }
}

/// One resolved IPv4 address plus the hostname it came from, if any
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScanTarget {
    pub host: Option<String>,
    pub ip: Ipv4Addr,
}

impl ScanTarget {
    pub fn new(ip: Ipv4Addr) -> Self {
        Self { host: None, ip }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Name used when talking to services on this target
    pub fn display_host(&self) -> String {
        self.host.clone().unwrap_or_else(|| self.ip.to_string())
    }
}

impl fmt::Display for ScanTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Some(host) if host != &self.ip.to_string() => write!(f, "{} ({})", host, self.ip),
            _ => write!(f, "{}", self.ip),
        }
    }
}

/// A confirmed-reachable (ip, port, transport)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpenPort {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub transport: Transport,
}

impl OpenPort {
    pub fn new(ip: Ipv4Addr, port: u16, transport: Transport) -> Self {
        Self { ip, port, transport }
    }
}

impl fmt::Display for OpenPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.ip, self.port, self.transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_selection() {
        assert_eq!(TransportSelection::Both.transports(), &[Transport::Tcp, Transport::Udp]);
        assert_eq!(TransportSelection::Udp.transports(), &[Transport::Udp]);
        assert_eq!("TCP".parse::<TransportSelection>(), Ok(TransportSelection::Tcp));
        assert!("sctp".parse::<TransportSelection>().is_err());
    }

    #[test]
    fn test_target_display() {
        let ip = Ipv4Addr::new(10, 0, 0, 1);
        assert_eq!(ScanTarget::new(ip).to_string(), "10.0.0.1");
        assert_eq!(ScanTarget::new(ip).with_host("db.local").to_string(), "db.local (10.0.0.1)");
        assert_eq!(OpenPort::new(ip, 5432, Transport::Tcp).to_string(), "10.0.0.1:5432/tcp");
    }
}
