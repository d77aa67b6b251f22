//! TLS session handle.
//!
//! Certificates are never verified: the handle exists to identify what speaks
//! TLS, not to decide whether to trust it. The negotiated parameters and the
//! peer certificate subject are kept so the session verdict can report them.

use super::tcp::dial;
use super::{stream_read, stream_write, SessionHandle, SessionProtocol};
use crate::error::{DiscoveryError, DiscoveryResult};
use async_trait::async_trait;
use openssl::nid::Nid;
use openssl::ssl::{SslConnector, SslMethod, SslRef, SslVerifyMode};
use openssl::x509::X509NameRef;
use std::net::IpAddr;
use std::pin::Pin;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_openssl::SslStream;

/// Shared client context, built once per scan
#[derive(Clone)]
pub struct TlsConfig {
    connector: SslConnector,
}

impl TlsConfig {
    /// Client context that accepts any certificate
    pub fn insecure() -> DiscoveryResult<Self> {
        let mut builder = SslConnector::builder(SslMethod::tls())?;
        builder.set_verify(SslVerifyMode::NONE);
        Ok(Self {
            connector: builder.build(),
        })
    }
}

/// Parameters recorded after a completed handshake
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TlsDetails {
    pub version: String,
    pub cipher: Option<String>,
    pub subject: Option<String>,
    pub issuer: Option<String>,
}

impl TlsDetails {
    fn from_ssl(ssl: &SslRef) -> Self {
        let certificate = ssl.peer_certificate();
        Self {
            version: ssl.version_str().to_string(),
            cipher: ssl.current_cipher().map(|c| c.name().to_string()),
            subject: certificate.as_ref().and_then(|c| common_name(c.subject_name())),
            issuer: certificate.as_ref().and_then(|c| common_name(c.issuer_name())),
        }
    }
}

fn common_name(name: &X509NameRef) -> Option<String> {
    name.entries_by_nid(Nid::COMMONNAME)
        .next()
        .and_then(|entry| entry.data().as_utf8().ok())
        .map(|cn| cn.to_string())
}

pub struct TlsSession {
    host: String,
    port: u16,
    timeout: Duration,
    config: TlsConfig,
    stream: Option<SslStream<TcpStream>>,
    details: Option<TlsDetails>,
}

impl TlsSession {
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration, config: TlsConfig) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
            config,
            stream: None,
            details: None,
        }
    }

    /// Details of the last completed handshake
    pub fn details(&self) -> Option<&TlsDetails> {
        self.details.as_ref()
    }

    async fn handshake(&self, tcp: TcpStream) -> DiscoveryResult<SslStream<TcpStream>> {
        let use_sni = self.host.parse::<IpAddr>().is_err();
        let ssl = self
            .config
            .connector
            .configure()?
            .verify_hostname(false)
            .use_server_name_indication(use_sni)
            .into_ssl(&self.host)?;
        let mut stream = SslStream::new(ssl, tcp)?;

        match tokio::time::timeout(self.timeout, Pin::new(&mut stream).connect()).await {
            Ok(Ok(())) => Ok(stream),
            Ok(Err(e)) => Err(DiscoveryError::Tls(e.to_string())),
            Err(_) => Err(DiscoveryError::timeout("TLS handshake", self.timeout)),
        }
    }
}

#[async_trait]
impl SessionHandle for TlsSession {
    fn protocol(&self) -> SessionProtocol {
        SessionProtocol::Tls
    }

    fn host(&self) -> &str {
        &self.host
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn connect(&mut self) -> DiscoveryResult<()> {
        self.close();
        let tcp = dial(&self.host, self.port, self.timeout).await?;
        let stream = self.handshake(tcp).await?;
        self.details = Some(TlsDetails::from_ssl(stream.ssl()));
        self.stream = Some(stream);
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> DiscoveryResult<usize> {
        stream_read(self.stream.as_mut(), buf, self.timeout).await
    }

    async fn write(&mut self, buf: &[u8]) -> DiscoveryResult<usize> {
        stream_write(self.stream.as_mut(), buf, self.timeout).await
    }

    fn close(&mut self) {
        self.stream = None;
    }
}
