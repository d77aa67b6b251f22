//! Single-attempt connect probes for TCP and UDP

use super::Transport;
use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

/// One probe attempt against one (address, transport) pair.
///
/// Implementations answer "open" or "not open" and never fail: refused,
/// reset and timed-out attempts are all just closed ports.
#[async_trait]
pub trait PortScanner: Send + Sync {
    async fn probe(&self, addr: SocketAddrV4, transport: Transport) -> bool;

    /// Get scanner name
    fn name(&self) -> &str;
}

/// Connect-based scanner, needs no privileges
#[derive(Debug, Clone)]
pub struct ConnectScanner {
    timeout: Duration,
    payloads: UdpPayloads,
}

impl ConnectScanner {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            payloads: UdpPayloads::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Perform a TCP connect probe on a single port
    pub async fn probe_tcp(&self, addr: SocketAddrV4) -> bool {
        match timeout(self.timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                // On loopback the kernel can pick the destination port as the
                // source port and complete a simultaneous open with itself.
                !is_self_connect(&stream)
            }
            Ok(Err(e)) => {
                log::trace!("{} closed: {}", addr, e);
                false
            }
            Err(_) => false,
        }
    }

    /// Perform a UDP probe on a single port.
    ///
    /// UDP has no handshake, so silence within the timeout counts as open.
    /// Only an explicit rejection (ICMP port unreachable, surfaced on a
    /// connected socket as `ConnectionRefused`) marks the port closed.
    pub async fn probe_udp(&self, addr: SocketAddrV4) -> bool {
        match self.udp_exchange(addr).await {
            Ok(_) => true,
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => false,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => true,
            Err(e) => {
                log::trace!("{}/udp probe error: {}", addr, e);
                false
            }
        }
    }

    async fn udp_exchange(&self, addr: SocketAddrV4) -> io::Result<usize> {
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.connect(addr).await?;
        socket.send(self.payloads.get_payload(addr.port())).await?;

        let mut buffer = [0u8; 1024];
        match timeout(self.timeout, socket.recv(&mut buffer)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::from(io::ErrorKind::TimedOut)),
        }
    }
}

#[async_trait]
impl PortScanner for ConnectScanner {
    async fn probe(&self, addr: SocketAddrV4, transport: Transport) -> bool {
        match transport {
            Transport::Tcp => self.probe_tcp(addr).await,
            Transport::Udp => self.probe_udp(addr).await,
        }
    }

    fn name(&self) -> &str {
        "Connect"
    }
}

fn is_self_connect(stream: &TcpStream) -> bool {
    match (stream.local_addr(), stream.peer_addr()) {
        (Ok(local), Ok(peer)) => local == peer,
        _ => false,
    }
}

/// Service-specific UDP payloads; services ignore malformed datagrams, so a
/// well-formed request raises the chance of a reply
#[derive(Debug, Clone)]
struct UdpPayloads {
    payloads: HashMap<u16, Vec<u8>>,
}

const GENERIC_UDP_PAYLOAD: &[u8] = b"\r\n\r\n";

impl UdpPayloads {
    fn new() -> Self {
        let mut payloads = HashMap::new();

        // DNS
        payloads.insert(53, vec![
            0x12, 0x34, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x07, 0x65, 0x78, 0x61, 0x6d, 0x70, 0x6c, 0x65, 0x03, 0x63, 0x6f, 0x6d,
            0x00, 0x00, 0x01, 0x00, 0x01,
        ]);

        // NTP client request, version 4
        let mut ntp = vec![0u8; 48];
        ntp[0] = 0x23;
        payloads.insert(123, ntp);

        // SNMP v1 get-request, community "public"
        payloads.insert(161, vec![
            0x30, 0x26, 0x02, 0x01, 0x00, 0x04, 0x06, 0x70, 0x75, 0x62, 0x6c, 0x69, 0x63,
            0xa0, 0x19, 0x02, 0x04, 0x12, 0x34, 0x56, 0x78, 0x02, 0x01, 0x00, 0x02, 0x01,
            0x00, 0x30, 0x0b, 0x30, 0x09, 0x06, 0x05, 0x2b, 0x06, 0x01, 0x02, 0x01, 0x05, 0x00,
        ]);

        // SIP
        payloads.insert(
            5060,
            b"OPTIONS sip:nm SIP/2.0\r\nVia: SIP/2.0/UDP nm;branch=z9hG4bK\r\nMax-Forwards: 70\r\nContent-Length: 0\r\n\r\n"
                .to_vec(),
        );

        Self { payloads }
    }

    fn get_payload(&self, port: u16) -> &[u8] {
        self.payloads
            .get(&port)
            .map(Vec::as_slice)
            .unwrap_or(GENERIC_UDP_PAYLOAD)
    }
}
