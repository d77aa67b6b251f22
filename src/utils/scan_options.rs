//! Port set definition and probe ordering

use crate::error::{ScanError, ScanResult};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::str::FromStr;

pub const MAX_PORT: u16 = 65535;

/// Ports to probe: an explicit list, or the full range 1-65535
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortSet {
    #[default]
    All,
    List(Vec<u16>),
}

impl PortSet {
    /// Build an explicit set, dropping repeated ports but keeping first-seen order
    pub fn list(ports: impl IntoIterator<Item = u16>) -> Self {
        let mut seen = HashSet::new();
        PortSet::List(ports.into_iter().filter(|p| seen.insert(*p)).collect())
    }

    /// Parse CLI tokens: `80`, `80,443`, `8000-8100`, in any mix.
    /// No tokens means the full range.
    pub fn parse<S: AsRef<str>>(tokens: &[S]) -> ScanResult<Self> {
        if tokens.is_empty() {
            return Ok(PortSet::All);
        }

        let mut ports = Vec::new();
        for token in tokens {
            for part in token.as_ref().split(',').map(str::trim).filter(|p| !p.is_empty()) {
                match part.split_once('-') {
                    Some((start, end)) => {
                        let start = parse_port(start)?;
                        let end = parse_port(end)?;
                        if start > end {
                            return Err(ScanError::PortRange(format!(
                                "Invalid port range: {}",
                                part
                            )));
                        }
                        ports.extend(start..=end);
                    }
                    None => ports.push(parse_port(part)?),
                }
            }
        }

        if ports.is_empty() {
            return Err(ScanError::PortRange("No ports specified".to_string()));
        }
        Ok(PortSet::list(ports))
    }

    pub fn len(&self) -> usize {
        match self {
            PortSet::All => MAX_PORT as usize,
            PortSet::List(ports) => ports.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Concrete ports in the order they were given
    pub fn to_vec(&self) -> Vec<u16> {
        match self {
            PortSet::All => (1..=MAX_PORT).collect(),
            PortSet::List(ports) => ports.clone(),
        }
    }
}

fn parse_port(s: &str) -> ScanResult<u16> {
    let s = s.trim();
    match s.parse::<u32>() {
        Ok(port) if (1..=MAX_PORT as u32).contains(&port) => Ok(port as u16),
        _ => Err(ScanError::PortRange(format!("Invalid port number: {}", s))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanOrder {
    #[default]
    Serial,
    Random,
}

impl FromStr for ScanOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "serial" | "seq" | "sequential" => Ok(Self::Serial),
            "random" | "rand" | "shuffle" => Ok(Self::Random),
            _ => Err(format!("Unknown scan order: {}", s)),
        }
    }
}

/// Order ports according to scan strategy
pub fn order_ports(ports: Vec<u16>, scan_order: ScanOrder) -> Vec<u16> {
    match scan_order {
        ScanOrder::Serial => ports,
        ScanOrder::Random => {
            let mut rng = rand::thread_rng();
            let mut shuffled = ports;
            shuffled.shuffle(&mut rng);
            shuffled
        }
    }
}
