//! Error handling for the strata scanner
//!
//! Three layers of errors exist. `ScanError` is what the caller of the crate
//! sees and is fatal for a scan or a single target. `DiscoveryError` is raised
//! by session handles and discovery plugins and never escapes a pipeline run:
//! the orchestrator downgrades it to a "not detected" verdict.
//! `CollaboratorError` comes from exposure probes and is downgraded further to
//! an uncorroborated annotation.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Main error type for scanning operations
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Usage error: {0}")]
    Usage(String),

    #[error("Failed to resolve hostname: {0}")]
    Resolution(String),

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Port range error: {0}")]
    PortRange(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Output error: {0}")]
    Output(String),
}

impl ScanError {
    /// Whether the error was caused by operator input rather than the network
    pub fn is_usage(&self) -> bool {
        matches!(
            self,
            ScanError::Usage(_) | ScanError::InvalidTarget(_) | ScanError::PortRange(_)
        )
    }
}

/// Result type alias for scan operations
pub type ScanResult<T> = Result<T, ScanError>;

/// Errors raised while talking to a service through a session handle
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("connection to {addr} failed: {source}")]
    Connection {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),

    #[error("session is not connected")]
    NotConnected,
}

impl DiscoveryError {
    pub fn mismatch(reason: impl Into<String>) -> Self {
        DiscoveryError::ProtocolMismatch(reason.into())
    }

    pub fn timeout(operation: &'static str, timeout: Duration) -> Self {
        DiscoveryError::Timeout { operation, timeout }
    }

    /// Connection failures and timeouts mean "nothing there", everything else
    /// means "something there, but not what we expected"
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            DiscoveryError::Connection { .. } | DiscoveryError::Timeout { .. }
        )
    }
}

impl From<openssl::error::ErrorStack> for DiscoveryError {
    fn from(err: openssl::error::ErrorStack) -> Self {
        DiscoveryError::Tls(err.to_string())
    }
}

/// Result type alias for session and plugin operations
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Errors raised by vulnerability corroboration probes
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("command failed: {0}")]
    Command(#[source] io::Error),

    #[error("unexpected response: {0}")]
    Unexpected(String),
}
