//! Target expansion: hostname, single IPv4 address, `start-end` range or CIDR
//! into an ordered list of scan targets. IPv4 only.

use crate::error::{ScanError, ScanResult};
use crate::network::ScanTarget;
use ipnetwork::Ipv4Network;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, ToSocketAddrs};
use std::str::FromStr;

/// Type of target being scanned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetType {
    SingleIpv4,
    Ipv4Range,
    Ipv4Cidr,
    Hostname,
}

/// Represents a parsed target with its type and addresses
#[derive(Debug, Clone)]
pub struct ParsedTarget {
    pub original: String,
    pub target_type: TargetType,
    pub targets: Vec<ScanTarget>,
}

/// Target parser for IPv4 addresses, ranges, CIDR blocks and hostnames
#[derive(Debug, Clone)]
pub struct TargetParser {
    max_addresses: u64,
}

impl Default for TargetParser {
    fn default() -> Self {
        Self {
            max_addresses: 65536,
        }
    }
}

impl TargetParser {
    pub fn new(max_addresses: u64) -> Self {
        Self { max_addresses }
    }

    /// Parse a target string into a ParsedTarget
    pub fn parse_target(&self, target: &str) -> ScanResult<ParsedTarget> {
        let target = target.trim();
        if target.is_empty() {
            return Err(ScanError::Usage("Target cannot be empty".to_string()));
        }

        if Ipv6Addr::from_str(target).is_ok() {
            return Err(ScanError::InvalidTarget(format!(
                "IPv6 address not supported: {}",
                target
            )));
        }

        if let Ok(ip) = Ipv4Addr::from_str(target) {
            return Ok(ParsedTarget {
                original: target.to_string(),
                target_type: TargetType::SingleIpv4,
                targets: vec![ScanTarget::new(ip)],
            });
        }

        if target.contains('/') {
            return self.parse_cidr(target);
        }

        if let Some((start, end)) = target.split_once('-') {
            if let (Ok(start_ip), Ok(end_ip)) = (
                IpAddr::from_str(start.trim()),
                IpAddr::from_str(end.trim()),
            ) {
                return self.parse_range(target, start_ip, end_ip);
            }
            if IpAddr::from_str(start.trim()).is_ok() || IpAddr::from_str(end.trim()).is_ok() {
                return Err(ScanError::InvalidTarget(format!(
                    "Invalid IP address range: {}",
                    target
                )));
            }
            // Fall through: hostnames may contain dashes
        }

        self.resolve_hostname(target)
    }

    fn parse_range(&self, original: &str, start: IpAddr, end: IpAddr) -> ScanResult<ParsedTarget> {
        let (start, end) = match (start, end) {
            (IpAddr::V4(start), IpAddr::V4(end)) => (start, end),
            _ => {
                return Err(ScanError::InvalidTarget(format!(
                    "IPv6 address not supported: {}",
                    original
                )))
            }
        };

        let (first, last) = (u32::from(start), u32::from(end));
        if first > last {
            return Err(ScanError::InvalidTarget(format!(
                "Range start {} is after range end {}",
                start, end
            )));
        }

        let total = u64::from(last - first) + 1;
        self.check_size(original, total)?;

        let targets = (first..=last)
            .map(|ip| ScanTarget::new(Ipv4Addr::from(ip)))
            .collect();

        Ok(ParsedTarget {
            original: original.to_string(),
            target_type: TargetType::Ipv4Range,
            targets,
        })
    }

    fn parse_cidr(&self, target: &str) -> ScanResult<ParsedTarget> {
        let network = Ipv4Network::from_str(target)
            .map_err(|e| ScanError::InvalidTarget(format!("Invalid CIDR {}: {}", target, e)))?;

        self.check_size(target, 1u64 << (32 - u32::from(network.prefix())))?;

        let targets = network.iter().map(ScanTarget::new).collect();
        Ok(ParsedTarget {
            original: target.to_string(),
            target_type: TargetType::Ipv4Cidr,
            targets,
        })
    }

    fn check_size(&self, target: &str, total: u64) -> ScanResult<()> {
        if total > self.max_addresses {
            return Err(ScanError::InvalidTarget(format!(
                "{} expands to {} addresses (max: {})",
                target, total, self.max_addresses
            )));
        }
        Ok(())
    }

    /// Resolve hostname, keeping the first IPv4 address
    fn resolve_hostname(&self, hostname: &str) -> ScanResult<ParsedTarget> {
        let addrs: Vec<IpAddr> = format!("{}:0", hostname)
            .to_socket_addrs()
            .map_err(|_| ScanError::Resolution(hostname.to_string()))?
            .map(|addr| addr.ip())
            .collect();

        if addrs.is_empty() {
            return Err(ScanError::Resolution(hostname.to_string()));
        }

        let ip = addrs
            .iter()
            .find_map(|ip| match ip {
                IpAddr::V4(v4) => Some(*v4),
                IpAddr::V6(_) => None,
            })
            .ok_or_else(|| {
                ScanError::InvalidTarget(format!(
                    "IPv6 address not supported: {} resolves only to IPv6",
                    hostname
                ))
            })?;

        log::debug!("Resolved {} to {}", hostname, ip);
        Ok(ParsedTarget {
            original: hostname.to_string(),
            target_type: TargetType::Hostname,
            targets: vec![ScanTarget::new(ip).with_host(hostname)],
        })
    }
}

/// Expand the raw target string into an ordered, de-duplicated target list
pub fn expand_target(raw: &str) -> ScanResult<Vec<ScanTarget>> {
    let parsed = TargetParser::default().parse_target(raw)?;
    let mut seen = HashSet::new();
    Ok(parsed
        .targets
        .into_iter()
        .filter(|target| seen.insert(target.ip))
        .collect())
}

/// Expand on the blocking pool, since hostname lookups block the calling thread
pub async fn resolve_targets(raw: &str) -> ScanResult<Vec<ScanTarget>> {
    let raw = raw.to_string();
    tokio::task::spawn_blocking(move || expand_target(&raw))
        .await
        .map_err(|e| ScanError::Resolution(format!("lookup task failed: {}", e)))?
}
