//! Session-layer plugins: plain TCP and TLS

use super::{SessionDiscovery, SessionOutcome, Verdict};
use crate::error::DiscoveryResult;
use crate::session::{SessionHandle, SessionProtocol, TcpSession, TlsConfig, TlsSession};
use async_trait::async_trait;
use std::time::Duration;

/// Detected whenever a TCP connect succeeds
#[derive(Debug, Clone)]
pub struct PlainDiscovery {
    timeout: Duration,
}

impl PlainDiscovery {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl SessionDiscovery for PlainDiscovery {
    fn protocol(&self) -> SessionProtocol {
        SessionProtocol::Plain
    }

    async fn discover(&self, host: &str, port: u16) -> DiscoveryResult<SessionOutcome> {
        let mut handle = TcpSession::new(host, port, self.timeout);
        if let Err(e) = handle.connect().await {
            log::debug!("{}:{} plain connect failed: {}", host, port, e);
            return Ok(SessionOutcome::not_detected(SessionProtocol::Plain));
        }
        handle.close();
        Ok(SessionOutcome::detected(
            Verdict::detected(SessionProtocol::Plain),
            Box::new(handle),
        ))
    }
}

/// Detected only when a TLS handshake completes.
///
/// Properties: `tls_version`, `cipher`, `subject`, `issuer`.
pub struct TlsDiscovery {
    timeout: Duration,
    config: TlsConfig,
}

impl TlsDiscovery {
    pub fn new(timeout: Duration, config: TlsConfig) -> Self {
        Self { timeout, config }
    }
}

#[async_trait]
impl SessionDiscovery for TlsDiscovery {
    fn protocol(&self) -> SessionProtocol {
        SessionProtocol::Tls
    }

    async fn discover(&self, host: &str, port: u16) -> DiscoveryResult<SessionOutcome> {
        let mut handle = TlsSession::new(host, port, self.timeout, self.config.clone());
        if let Err(e) = handle.connect().await {
            log::debug!("{}:{} TLS handshake failed: {}", host, port, e);
            return Ok(SessionOutcome::not_detected(SessionProtocol::Tls));
        }
        let details = handle.details().cloned().unwrap_or_default();
        handle.close();

        let mut verdict =
            Verdict::detected(SessionProtocol::Tls).with("tls_version", details.version);
        if let Some(cipher) = details.cipher {
            verdict.set("cipher", cipher);
        }
        if let Some(subject) = details.subject {
            verdict.set("subject", subject);
        }
        if let Some(issuer) = details.issuer {
            verdict.set("issuer", issuer);
        }
        Ok(SessionOutcome::detected(verdict, Box::new(handle)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_plain_detects_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let outcome = PlainDiscovery::new(Duration::from_secs(1))
            .discover("127.0.0.1", port)
            .await
            .unwrap();
        assert!(outcome.is_detected());
        let (_, handle) = outcome.into_parts();
        let handle = handle.unwrap();
        assert_eq!(handle.port(), port);
        assert!(!handle.is_connected());
    }

    #[tokio::test]
    async fn test_plain_not_detected_without_listener() {
        let port = {
            let tmp = TcpListener::bind("127.0.0.1:0").await.unwrap();
            tmp.local_addr().unwrap().port()
        };
        let outcome = PlainDiscovery::new(Duration::from_millis(300))
            .discover("127.0.0.1", port)
            .await
            .unwrap();
        assert!(!outcome.is_detected());
        assert_eq!(outcome.protocol(), SessionProtocol::Plain);
    }
}
