//! Port prober and the scan engine built on top of it

pub mod engine;

use crate::network::socket::{ConnectScanner, PortScanner};
use crate::network::{OpenPort, Transport, TransportSelection};
use crate::utils::scan_options::{order_ports, PortSet, ScanOrder};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};

pub use engine::{ScanEngine, TargetReport};

/// Progress callback invoked once per completed probe
pub type ProgressHook = Arc<dyn Fn(ProbeEvent) + Send + Sync>;

/// What a single probe observed, passed to progress hooks
#[derive(Debug, Clone, Copy)]
pub struct ProbeEvent {
    pub port: u16,
    pub transport: Transport,
    pub open: bool,
}

/// Settings for one prober
#[derive(Debug, Clone)]
pub struct ProbeOptions {
    /// Per-attempt timeout
    pub timeout: Duration,
    /// Admission gate size: probes in flight at once
    pub concurrency: usize,
    pub transport: TransportSelection,
    pub scan_order: ScanOrder,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(100),
            concurrency: 100,
            transport: TransportSelection::Both,
            scan_order: ScanOrder::Serial,
        }
    }
}

/// Result of probing one address
#[derive(Debug, Clone, Default)]
pub struct ProbeReport {
    /// Open (port, transport) pairs, sorted by port then transport
    pub open: Vec<OpenPort>,
    /// Number of probe attempts made
    pub attempted: usize,
    pub duration: Duration,
}

impl ProbeReport {
    pub fn ports(&self, transport: Transport) -> Vec<u16> {
        self.open
            .iter()
            .filter(|p| p.transport == transport)
            .map(|p| p.port)
            .collect()
    }
}

/// Bounded-concurrency prober.
///
/// Every (port, transport) pair gets exactly one attempt. A counting
/// semaphore admits at most `concurrency` attempts at a time, so a full
/// 65535-port sweep never holds more than that many sockets.
#[derive(Clone)]
pub struct PortProber {
    options: ProbeOptions,
    scanner: Arc<dyn PortScanner>,
    progress: Option<ProgressHook>,
}

impl PortProber {
    pub fn new(options: ProbeOptions) -> Self {
        let scanner = Arc::new(ConnectScanner::new(options.timeout));
        Self::with_scanner(options, scanner)
    }

    /// Use a custom probe implementation
    pub fn with_scanner(options: ProbeOptions, scanner: Arc<dyn PortScanner>) -> Self {
        Self {
            options,
            scanner,
            progress: None,
        }
    }

    pub fn with_progress(mut self, hook: ProgressHook) -> Self {
        self.progress = Some(hook);
        self
    }

    /// Total attempts a probe of `ports` will make
    pub fn attempts_for(&self, ports: &PortSet) -> usize {
        ports.len() * self.options.transport.transports().len()
    }

    /// Probe every requested pair on `ip` and return once all attempts have
    /// completed or timed out
    pub async fn probe(&self, ip: Ipv4Addr, ports: &PortSet) -> ProbeReport {
        let start = Instant::now();
        let semaphore = Arc::new(Semaphore::new(self.options.concurrency.max(1)));
        let (tx, mut rx) = mpsc::unbounded_channel::<ProbeEvent>();

        let ordered = order_ports(ports.to_vec(), self.options.scan_order);
        let collector = tokio::spawn(async move {
            let mut open = Vec::new();
            let mut attempted = 0usize;
            while let Some(result) = rx.recv().await {
                attempted += 1;
                if result.open {
                    open.push(OpenPort::new(ip, result.port, result.transport));
                }
            }
            (open, attempted)
        });

        let mut handles = Vec::with_capacity(ordered.len() * 2);
        for &transport in self.options.transport.transports() {
            for &port in &ordered {
                let permit = match semaphore.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let scanner = self.scanner.clone();
                let sender = tx.clone();
                let progress = self.progress.clone();

                handles.push(tokio::spawn(async move {
                    let _permit = permit;
                    let open = scanner.probe(SocketAddrV4::new(ip, port), transport).await;
                    if open {
                        log::info!("{}:{}/{} is open", ip, port, transport);
                    }
                    let result = ProbeEvent { port, transport, open };
                    if let Some(hook) = progress {
                        hook(result);
                    }
                    let _ = sender.send(result);
                }));
            }
        }
        drop(tx);

        for handle in handles {
            if let Err(e) = handle.await {
                log::error!("Probe task failed: {}", e);
            }
        }

        let (mut open, attempted) = match collector.await {
            Ok(collected) => collected,
            Err(e) => {
                log::error!("Probe collector failed: {}", e);
                (Vec::new(), 0)
            }
        };
        open.sort();

        ProbeReport {
            open,
            attempted,
            duration: start.elapsed(),
        }
    }
}
