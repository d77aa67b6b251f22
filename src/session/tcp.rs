//! Plaintext session handle over a TCP stream

use super::{stream_read, stream_write, SessionHandle, SessionProtocol};
use crate::error::{DiscoveryError, DiscoveryResult};
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;

/// Open a TCP stream to `host:port` within `limit`
pub(crate) async fn dial(host: &str, port: u16, limit: Duration) -> DiscoveryResult<TcpStream> {
    match tokio::time::timeout(limit, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Ok(Err(source)) => Err(DiscoveryError::Connection {
            addr: format!("{}:{}", host, port),
            source,
        }),
        Err(_) => Err(DiscoveryError::timeout("connect", limit)),
    }
}

#[derive(Debug)]
pub struct TcpSession {
    host: String,
    port: u16,
    timeout: Duration,
    stream: Option<TcpStream>,
}

impl TcpSession {
    /// `timeout` bounds the connect and every read or write
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
            stream: None,
        }
    }
}

#[async_trait]
impl SessionHandle for TcpSession {
    fn protocol(&self) -> SessionProtocol {
        SessionProtocol::Plain
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
        self.stream = Some(dial(&self.host, self.port, self.timeout).await?);
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

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_echo_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let mut session = TcpSession::new("127.0.0.1", port, Duration::from_secs(1));
        assert_eq!(session.protocol(), SessionProtocol::Plain);
        assert_eq!(session.host(), "127.0.0.1");
        assert_eq!(session.port(), port);

        session.connect().await.unwrap();
        session.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        session.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        session.close();
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn test_refused_connect() {
        let port = {
            let tmp = TcpListener::bind("127.0.0.1:0").await.unwrap();
            tmp.local_addr().unwrap().port()
        };
        let mut session = TcpSession::new("127.0.0.1", port, Duration::from_millis(300));
        let err = session.connect().await.unwrap_err();
        assert!(err.is_connection_level());
        assert!(!session.is_connected());
        session.close();
    }

    #[tokio::test]
    async fn test_reconnect_replaces_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut sockets = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                sockets.push(socket);
            }
        });

        let mut session = TcpSession::new("127.0.0.1", port, Duration::from_secs(1));
        session.connect().await.unwrap();
        session.connect().await.unwrap();
        assert!(session.is_connected());
    }
}
