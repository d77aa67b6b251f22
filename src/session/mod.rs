//! Session handles: a uniform connect/read/write/close surface over one
//! socket, plain or TLS-wrapped.
//!
//! Upper layers only ever see `dyn SessionHandle`, so a presentation or
//! application probe behaves the same over both transports. A handle owns at
//! most one live connection; `connect` on a connected handle replaces the old
//! connection, and `close` is always safe to call.

pub mod tcp;
pub mod tls;

use crate::error::{DiscoveryError, DiscoveryResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub use tcp::TcpSession;
pub use tls::{TlsConfig, TlsSession};

/// Chunk size for bounded reads
const READ_CHUNK: usize = 4096;

/// Session-layer protocol carried by a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionProtocol {
    /// Plaintext byte stream
    Plain,
    Tls,
}

impl SessionProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionProtocol::Plain => "plain",
            SessionProtocol::Tls => "tls",
        }
    }
}

impl fmt::Display for SessionProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Uniform connection abstraction passed between layers of the pipeline
#[async_trait]
pub trait SessionHandle: Send + Sync {
    fn protocol(&self) -> SessionProtocol;

    fn host(&self) -> &str;

    fn port(&self) -> u16;

    fn is_connected(&self) -> bool;

    /// Open the underlying connection, dropping any previous one
    async fn connect(&mut self) -> DiscoveryResult<()>;

    async fn read(&mut self, buf: &mut [u8]) -> DiscoveryResult<usize>;

    async fn write(&mut self, buf: &[u8]) -> DiscoveryResult<usize>;

    /// Release the connection. Idempotent; a no-op when never connected.
    fn close(&mut self);

    async fn write_all(&mut self, mut buf: &[u8]) -> DiscoveryResult<()> {
        while !buf.is_empty() {
            let n = self.write(buf).await?;
            if n == 0 {
                return Err(DiscoveryError::Transport(std::io::ErrorKind::WriteZero.into()));
            }
            buf = &buf[n..];
        }
        Ok(())
    }

    /// Fill `buf` completely; a peer that closes early is a transport error
    async fn read_exact(&mut self, buf: &mut [u8]) -> DiscoveryResult<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(DiscoveryError::Transport(
                    std::io::ErrorKind::UnexpectedEof.into(),
                ));
            }
            filled += n;
        }
        Ok(())
    }

    /// Read until `done` accepts the buffer, the peer closes, or `limit`
    /// bytes have arrived. A timeout or reset after some data returns what
    /// was read.
    async fn read_bounded(
        &mut self,
        limit: usize,
        done: &(dyn for<'b> Fn(&'b [u8]) -> bool + Send + Sync),
    ) -> DiscoveryResult<Vec<u8>> {
        let mut data = Vec::with_capacity(limit.min(READ_CHUNK));
        let mut chunk = [0u8; READ_CHUNK];
        while data.len() < limit {
            let want = (limit - data.len()).min(READ_CHUNK);
            match self.read(&mut chunk[..want]).await {
                Ok(0) => break,
                Ok(n) => {
                    data.extend_from_slice(&chunk[..n]);
                    if done(&data) {
                        break;
                    }
                }
                Err(DiscoveryError::Timeout { .. } | DiscoveryError::Transport(_))
                    if !data.is_empty() =>
                {
                    break
                }
                Err(e) => return Err(e),
            }
        }
        Ok(data)
    }
}

/// A connected handle that is closed when dropped.
///
/// Plugins open connections through [`open`], so every exit path (early
/// return, `?`, panic unwinding) releases the socket.
pub struct Connected<'a> {
    handle: &'a mut dyn SessionHandle,
}

impl<'a> Deref for Connected<'a> {
    type Target = dyn SessionHandle + 'a;

    fn deref(&self) -> &Self::Target {
        &*self.handle
    }
}

impl<'a> DerefMut for Connected<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.handle
    }
}

impl Drop for Connected<'_> {
    fn drop(&mut self) {
        self.handle.close();
    }
}

/// Connect `handle` and return a guard that closes it again
pub async fn open(handle: &mut dyn SessionHandle) -> DiscoveryResult<Connected<'_>> {
    handle.connect().await?;
    Ok(Connected { handle })
}

/// Run an I/O future under a timeout, mapping expiry to `DiscoveryError::Timeout`
pub(crate) async fn with_timeout<T, F>(
    operation: &'static str,
    limit: Duration,
    fut: F,
) -> DiscoveryResult<T>
where
    F: Future<Output = std::io::Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(DiscoveryError::Transport),
        Err(_) => Err(DiscoveryError::timeout(operation, limit)),
    }
}

/// Read from a stream if one is open
pub(crate) async fn stream_read<S>(
    stream: Option<&mut S>,
    buf: &mut [u8],
    limit: Duration,
) -> DiscoveryResult<usize>
where
    S: AsyncRead + Unpin + Send,
{
    let stream = stream.ok_or(DiscoveryError::NotConnected)?;
    with_timeout("read", limit, stream.read(buf)).await
}

/// Write to a stream if one is open
pub(crate) async fn stream_write<S>(
    stream: Option<&mut S>,
    buf: &[u8],
    limit: Duration,
) -> DiscoveryResult<usize>
where
    S: AsyncWrite + Unpin + Send,
{
    let stream = stream.ok_or(DiscoveryError::NotConnected)?;
    let n = with_timeout("write", limit, stream.write(buf)).await?;
    with_timeout("flush", limit, stream.flush()).await?;
    Ok(n)
}
