//! Main scanning engine: probe each target, then run discovery on every open
//! port

use super::{PortProber, ProgressHook};
use crate::config::ScanConfig;
use crate::discovery::{DiscoveryOrchestrator, DiscoveryRegistry, PortReport};
use crate::network::socket::PortScanner;
use crate::network::{ScanTarget, Transport};
use crate::ScanError;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// Everything learned about one target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetReport {
    pub target: ScanTarget,
    pub open_tcp: Vec<u16>,
    pub open_udp: Vec<u16>,
    /// One entry per open port when discovery ran, sorted by port
    pub services: Vec<PortReport>,
    pub attempted: usize,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl TargetReport {
    pub fn has_open_ports(&self) -> bool {
        !self.open_tcp.is_empty() || !self.open_udp.is_empty()
    }

    pub fn service(&self, port: u16, transport: Transport) -> Option<&PortReport> {
        self.services
            .iter()
            .find(|s| s.port == port && s.transport == transport)
    }
}

/// Main scanning engine
#[derive(Clone)]
pub struct ScanEngine {
    config: ScanConfig,
    prober: PortProber,
    orchestrator: Option<DiscoveryOrchestrator>,
}

impl ScanEngine {
    /// Create a new scan engine with the given configuration
    pub fn new(config: ScanConfig) -> crate::Result<Self> {
        config.validate()?;

        let orchestrator = if config.discovery {
            let registry = DiscoveryRegistry::standard(&config.discovery_options()?)
                .map_err(|e| ScanError::Config(format!("Failed to build plugin registry: {}", e)))?;
            let (session, presentation, application) = registry.counts();
            log::debug!(
                "Registered {} session, {} presentation, {} application plugins",
                session,
                presentation,
                application
            );
            Some(DiscoveryOrchestrator::new(Arc::new(registry)).with_policies(config.policies))
        } else {
            None
        };

        Ok(Self {
            prober: PortProber::new(config.probe_options()),
            config,
            orchestrator,
        })
    }

    /// Replace the plugin registry, enabling discovery if it was off
    pub fn with_registry(mut self, registry: DiscoveryRegistry) -> Self {
        self.orchestrator = Some(
            DiscoveryOrchestrator::new(Arc::new(registry)).with_policies(self.config.policies),
        );
        self
    }

    /// Use a custom probe implementation
    pub fn with_scanner(mut self, scanner: Arc<dyn PortScanner>) -> Self {
        self.prober = PortProber::with_scanner(self.config.probe_options(), scanner);
        self
    }

    pub fn with_progress(mut self, hook: ProgressHook) -> Self {
        self.prober = self.prober.with_progress(hook);
        self
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Probe attempts a full scan of `targets` makes
    pub fn total_attempts(&self, targets: &[ScanTarget]) -> usize {
        targets.len() * self.prober.attempts_for(&self.config.ports)
    }

    /// Scan every target concurrently; reports come back in target order
    pub async fn scan(&self, targets: Vec<ScanTarget>) -> Vec<TargetReport> {
        let handles: Vec<_> = targets
            .into_iter()
            .map(|target| {
                let engine = self.clone();
                tokio::spawn(async move { engine.scan_target(target).await })
            })
            .collect();

        join_all(handles)
            .await
            .into_iter()
            .filter_map(|joined| match joined {
                Ok(report) => Some(report),
                Err(e) => {
                    log::error!("Target scan task failed: {}", e);
                    None
                }
            })
            .collect()
    }

    /// Probe one target, then run the discovery pipeline once per open port
    pub async fn scan_target(&self, target: ScanTarget) -> TargetReport {
        let start = Instant::now();
        let timestamp = Utc::now();
        log::info!("Scanning {} ({} ports)", target, self.config.ports.len());

        let probe = self.prober.probe(target.ip, &self.config.ports).await;
        log::info!(
            "{}: {} open of {} probed in {:?}",
            target,
            probe.open.len(),
            probe.attempted,
            probe.duration
        );

        let mut services = Vec::new();
        if let Some(orchestrator) = &self.orchestrator {
            let host = target.display_host();
            let runs: Vec<_> = probe
                .open
                .iter()
                .map(|open| {
                    let orchestrator = orchestrator.clone();
                    let host = host.clone();
                    let open = *open;
                    tokio::spawn(async move { orchestrator.run(&host, &open).await })
                })
                .collect();

            for joined in join_all(runs).await {
                match joined {
                    Ok(report) => services.push(report),
                    Err(e) => log::error!("Discovery task for {} failed: {}", target, e),
                }
            }
            services.sort_by_key(|s| (s.port, s.transport));
        }

        TargetReport {
            open_tcp: probe.ports(Transport::Tcp),
            open_udp: probe.ports(Transport::Udp),
            target,
            services,
            attempted: probe.attempted,
            duration_ms: start.elapsed().as_millis() as u64,
            timestamp,
        }
    }
}
