//! Plugin registry.
//!
//! Built once before scanning through [`RegistryBuilder`] and read-only
//! afterwards; the orchestrator shares it across every pipeline run.

use super::application::{
    EtcdDiscovery, KubeApiserverDiscovery, KubeletDiscovery, PostgresCredentials,
    PostgresDiscovery, RedisDiscovery,
};
use super::corroborate::ProbeSet;
use super::presentation::HttpDiscovery;
use super::session::{PlainDiscovery, TlsDiscovery};
use super::{ApplicationDiscovery, PresentationDiscovery, SessionDiscovery};
use crate::error::DiscoveryResult;
use crate::network::Transport;
use crate::session::TlsConfig;
use std::sync::Arc;
use std::time::Duration;

/// One registered plugin and the transport it requires
pub struct Registered<T: ?Sized> {
    pub transport: Transport,
    pub plugin: Arc<T>,
}

impl<T: ?Sized> Clone for Registered<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport,
            plugin: self.plugin.clone(),
        }
    }
}

/// Settings the standard plugins are built from
#[derive(Clone)]
pub struct DiscoveryOptions {
    /// Bound on connect, handshake, read and write during protocol probing
    pub io_timeout: Duration,
    pub probes: ProbeSet,
    pub postgres: PostgresCredentials,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            io_timeout: Duration::from_secs(2),
            probes: ProbeSet::default(),
            postgres: PostgresCredentials::default(),
        }
    }
}

#[derive(Clone, Default)]
pub struct DiscoveryRegistry {
    session: Vec<Registered<dyn SessionDiscovery>>,
    presentation: Vec<Registered<dyn PresentationDiscovery>>,
    application: Vec<Registered<dyn ApplicationDiscovery>>,
}

impl DiscoveryRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// The stock plugin set, TLS ahead of plain TCP so encrypted services are
    /// not misreported as plaintext
    pub fn standard(options: &DiscoveryOptions) -> DiscoveryResult<Self> {
        let timeout = options.io_timeout;
        let tls = TlsConfig::insecure()?;
        Ok(Self::builder()
            .session(Transport::Tcp, TlsDiscovery::new(timeout, tls))
            .session(Transport::Tcp, PlainDiscovery::new(timeout))
            .presentation(Transport::Tcp, HttpDiscovery::new())
            .application(Transport::Tcp, EtcdDiscovery::new(options.probes.etcd.clone()))
            .application(Transport::Tcp, KubeApiserverDiscovery::new())
            .application(Transport::Tcp, KubeletDiscovery::new(options.probes.kubelet.clone()))
            .application(Transport::Tcp, PostgresDiscovery::new(options.postgres.clone()))
            .application(Transport::Tcp, RedisDiscovery::new())
            .build())
    }

    /// Session plugins for `transport`, in registration order
    pub fn session_plugins(
        &self,
        transport: Transport,
    ) -> impl Iterator<Item = &Arc<dyn SessionDiscovery>> {
        self.session
            .iter()
            .filter(move |entry| entry.transport == transport)
            .map(|entry| &entry.plugin)
    }

    pub fn presentation_plugins(
        &self,
        transport: Transport,
    ) -> impl Iterator<Item = &Arc<dyn PresentationDiscovery>> {
        self.presentation
            .iter()
            .filter(move |entry| entry.transport == transport)
            .map(|entry| &entry.plugin)
    }

    pub fn application_plugins(
        &self,
        transport: Transport,
    ) -> impl Iterator<Item = &Arc<dyn ApplicationDiscovery>> {
        self.application
            .iter()
            .filter(move |entry| entry.transport == transport)
            .map(|entry| &entry.plugin)
    }

    /// Whether any session plugin accepts `transport`
    pub fn handles(&self, transport: Transport) -> bool {
        self.session.iter().any(|entry| entry.transport == transport)
    }

    /// Registered plugin counts: (session, presentation, application)
    pub fn counts(&self) -> (usize, usize, usize) {
        (self.session.len(), self.presentation.len(), self.application.len())
    }
}

#[derive(Default)]
pub struct RegistryBuilder {
    registry: DiscoveryRegistry,
}

impl RegistryBuilder {
    pub fn session(
        mut self,
        transport: Transport,
        plugin: impl SessionDiscovery + 'static,
    ) -> Self {
        self.registry.session.push(Registered {
            transport,
            plugin: Arc::new(plugin),
        });
        self
    }

    pub fn presentation(
        mut self,
        transport: Transport,
        plugin: impl PresentationDiscovery + 'static,
    ) -> Self {
        self.registry.presentation.push(Registered {
            transport,
            plugin: Arc::new(plugin),
        });
        self
    }

    pub fn application(
        mut self,
        transport: Transport,
        plugin: impl ApplicationDiscovery + 'static,
    ) -> Self {
        self.registry.application.push(Registered {
            transport,
            plugin: Arc::new(plugin),
        });
        self
    }

    pub fn build(self) -> DiscoveryRegistry {
        self.registry
    }
}
