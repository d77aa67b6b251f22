//! Strata - layered service discovery for open ports
//!
//! Probes TCP and UDP ports on IPv4 targets, then runs every open port
//! through a session, presentation and application discovery pipeline.

pub mod config;
pub mod discovery;
pub mod error;
pub mod network;
pub mod output;
pub mod scanner;
pub mod session;
pub mod utils;

// Re-export commonly used types
pub use config::ScanConfig;
pub use discovery::{DiscoveryOrchestrator, DiscoveryRegistry, PortReport};
pub use error::{DiscoveryError, ScanError, ScanResult};
pub use network::{OpenPort, ScanTarget, Transport};
pub use scanner::{PortProber, ScanEngine, TargetReport};

pub type Result<T> = std::result::Result<T, ScanError>;
