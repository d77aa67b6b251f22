//! Configuration module for the strata scanner

use crate::discovery::application::PostgresCredentials;
use crate::discovery::corroborate::{Corroboration, ProbeSet};
use crate::discovery::{DiscoveryOptions, MatchPolicies};
use crate::network::TransportSelection;
use crate::scanner::ProbeOptions;
use crate::utils::scan_options::{PortSet, ScanOrder};
use crate::ScanError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the per-user config file in the home directory
pub const DEFAULT_CONFIG_FILE: &str = ".strata.toml";

/// Main configuration structure for scanning operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Raw target: hostname, IPv4 address, range or CIDR block
    pub target: String,

    pub ports: PortSet,

    /// Per-attempt connect timeout for port probing, in milliseconds
    pub timeout_ms: u64,

    /// Connect, handshake, read and write timeout during protocol discovery,
    /// in milliseconds
    pub io_timeout_ms: u64,

    /// Maximum probe attempts in flight at once
    pub concurrency: usize,

    pub transport: TransportSelection,

    pub scan_order: ScanOrder,

    /// Run the layered discovery pipeline on open ports
    pub discovery: bool,

    pub policies: MatchPolicies,

    pub corroboration: Corroboration,

    pub postgres: PostgresCredentials,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            target: String::new(),
            ports: PortSet::All,
            timeout_ms: 100,
            io_timeout_ms: 2000,
            concurrency: 100,
            transport: TransportSelection::Both,
            scan_order: ScanOrder::Serial,
            discovery: true,
            policies: MatchPolicies::default(),
            corroboration: Corroboration::Http,
            postgres: PostgresCredentials::default(),
        }
    }
}

impl ScanConfig {
    /// Create a new scan configuration
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            ..Default::default()
        }
    }

    pub fn with_ports(mut self, ports: PortSet) -> Self {
        self.ports = ports;
        self
    }

    pub fn with_transport(mut self, transport: TransportSelection) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_io_timeout(mut self, io_timeout_ms: u64) -> Self {
        self.io_timeout_ms = io_timeout_ms;
        self
    }

    pub fn with_discovery(mut self, discovery: bool) -> Self {
        self.discovery = discovery;
        self
    }

    pub fn with_policies(mut self, policies: MatchPolicies) -> Self {
        self.policies = policies;
        self
    }

    pub fn with_corroboration(mut self, corroboration: Corroboration) -> Self {
        self.corroboration = corroboration;
        self
    }

    /// Get timeout as Duration
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn io_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn probe_options(&self) -> ProbeOptions {
        ProbeOptions {
            timeout: self.timeout_duration(),
            concurrency: self.concurrency,
            transport: self.transport,
            scan_order: self.scan_order,
        }
    }

    /// Settings for the standard plugin registry, including collaborator
    /// probes for the configured corroboration mode
    pub fn discovery_options(&self) -> crate::Result<DiscoveryOptions> {
        let probes = ProbeSet::for_mode(self.corroboration, self.io_timeout_duration())
            .map_err(|e| {
                ScanError::Config(format!("Failed to build corroboration probes: {}", e))
            })?;
        Ok(DiscoveryOptions {
            io_timeout: self.io_timeout_duration(),
            probes,
            postgres: self.postgres.clone(),
        })
    }

    /// Load configuration from TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            ScanError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        toml::from_str(&content).map_err(|e| {
            ScanError::Config(format!("Failed to parse TOML in {}: {}", path.display(), e))
        })
    }

    /// `~/.strata.toml`, if a home directory is known
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(DEFAULT_CONFIG_FILE))
    }

    /// Load an explicit config file, or the per-user file when present, or
    /// the defaults. A broken per-user file is logged and skipped; a broken
    /// explicit file is an error.
    pub fn load(explicit: Option<&Path>) -> crate::Result<Self> {
        if let Some(path) = explicit {
            let config = Self::from_toml_file(path)?;
            log::info!("Loaded config from {}", path.display());
            return Ok(config);
        }

        match Self::default_config_path() {
            Some(path) if path.exists() => match Self::from_toml_file(&path) {
                Ok(config) => {
                    log::info!("Loaded config from {}", path.display());
                    Ok(config)
                }
                Err(e) => {
                    log::warn!("Ignoring {}: {}", path.display(), e);
                    Ok(Self::default())
                }
            },
            _ => Ok(Self::default()),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.concurrency == 0 {
            return Err(ScanError::Config("Concurrency must be greater than 0".to_string()));
        }

        if self.timeout_ms == 0 {
            return Err(ScanError::Config("Timeout must be greater than 0".to_string()));
        }

        if self.io_timeout_ms < self.timeout_ms {
            return Err(ScanError::Config(format!(
                "I/O timeout ({}ms) must not be shorter than the connect timeout ({}ms)",
                self.io_timeout_ms, self.timeout_ms
            )));
        }

        if let PortSet::List(ports) = &self.ports {
            if ports.is_empty() {
                return Err(ScanError::PortRange("No ports specified".to_string()));
            }
            if ports.contains(&0) {
                return Err(ScanError::PortRange("Port 0 is not scannable".to_string()));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::MatchPolicy;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = ScanConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.timeout_duration(), Duration::from_millis(100));
        assert_eq!(config.probe_options().concurrency, 100);
        assert!(config.discovery);
    }

    #[test]
    fn test_validation_failures() {
        assert!(ScanConfig::default().with_concurrency(0).validate().is_err());
        assert!(ScanConfig::default().with_timeout(0).validate().is_err());
        assert!(ScanConfig::default()
            .with_timeout(3000)
            .with_io_timeout(1000)
            .validate()
            .is_err());
        let empty = ScanConfig::default().with_ports(PortSet::List(Vec::new()));
        assert!(matches!(empty.validate(), Err(ScanError::PortRange(_))));
    }

    #[test]
    fn test_partial_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
timeout_ms = 250
io_timeout_ms = 4000
concurrency = 32
transport = "tcp"
corroboration = "none"

[policies]
application = "first-match"

[postgres]
user = "admin"
password = "admin123"
"#
        )
        .unwrap();

        let config = ScanConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.timeout_ms, 250);
        assert_eq!(config.concurrency, 32);
        assert_eq!(config.transport, TransportSelection::Tcp);
        assert_eq!(config.corroboration, Corroboration::None);
        assert_eq!(config.policies.application, MatchPolicy::FirstMatch);
        assert_eq!(config.policies.session, MatchPolicy::FirstMatch);
        assert_eq!(config.postgres.password.as_deref(), Some("admin123"));
        assert_eq!(config.scan_order, ScanOrder::Serial);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_broken_explicit_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "timeout_ms = \"soon\"").unwrap();
        assert!(matches!(ScanConfig::load(Some(file.path())), Err(ScanError::Config(_))));
        assert!(matches!(
            ScanConfig::from_toml_file("/nonexistent/strata.toml"),
            Err(ScanError::Config(_))
        ));
    }

    #[test]
    fn test_discovery_options_follow_config() {
        let config = ScanConfig::default()
            .with_io_timeout(1500)
            .with_corroboration(Corroboration::None);
        let options = config.discovery_options().unwrap();
        assert_eq!(options.io_timeout, Duration::from_millis(1500));
        assert!(options.probes.etcd.is_none());
    }
}
