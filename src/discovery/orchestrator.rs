//! Drives one open port through the session, presentation and application
//! layers.
//!
//! ```text
//! START -> SESSION -> (skip if undetected) -> PRESENTATION
//!       -> APPLICATION (with or without a presentation verdict) -> DONE
//! ```
//!
//! Plugin errors never leave a run: each one becomes a "not detected"
//! verdict for that plugin. Nothing is retried.

use super::registry::DiscoveryRegistry;
use super::{
    ApplicationVerdict, MatchPolicies, MatchPolicy, PresentationVerdict, SessionVerdict,
};
use crate::network::{OpenPort, Transport};
use crate::session::SessionHandle;
use serde::{Deserialize, Serialize};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Per-port discovery result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortReport {
    pub port: u16,
    pub transport: Transport,
    /// `None` when no session plugin detected anything
    pub session: Option<SessionVerdict>,
    pub presentation: Option<PresentationVerdict>,
    /// Detected services; empty means unknown
    pub applications: Vec<ApplicationVerdict>,
}

impl PortReport {
    fn new(open: &OpenPort) -> Self {
        Self {
            port: open.port,
            transport: open.transport,
            session: None,
            presentation: None,
            applications: Vec::new(),
        }
    }

    pub fn is_identified(&self) -> bool {
        !self.applications.is_empty()
    }
}

/// Owns the run's handle and closes it however the run ends
struct OwnedHandle(Box<dyn SessionHandle>);

impl Deref for OwnedHandle {
    type Target = dyn SessionHandle;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl DerefMut for OwnedHandle {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.0.as_mut()
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        self.0.close();
    }
}

#[derive(Clone)]
pub struct DiscoveryOrchestrator {
    registry: Arc<DiscoveryRegistry>,
    policies: MatchPolicies,
}

impl DiscoveryOrchestrator {
    pub fn new(registry: Arc<DiscoveryRegistry>) -> Self {
        Self {
            registry,
            policies: MatchPolicies::default(),
        }
    }

    pub fn with_policies(mut self, policies: MatchPolicies) -> Self {
        self.policies = policies;
        self
    }

    pub fn policies(&self) -> MatchPolicies {
        self.policies
    }

    /// Run the pipeline for one open port on `host`
    pub async fn run(&self, host: &str, open: &OpenPort) -> PortReport {
        let mut report = PortReport::new(open);
        log::debug!("{}:{} START", host, open.port);

        let Some((verdict, handle)) = self.session_layer(host, open).await else {
            log::debug!("{}:{} DONE (no session layer)", host, open.port);
            return report;
        };
        let mut handle = OwnedHandle(handle);
        log::info!("{}:{} session {}", host, open.port, verdict.protocol);
        report.session = Some(verdict);

        log::debug!("{}:{} PRESENTATION", host, open.port);
        report.presentation = self.presentation_layer(&mut handle, open.transport).await;
        match &report.presentation {
            Some(p) => log::info!("{}:{} presentation {}", host, open.port, p.protocol),
            None => log::debug!("{}:{} no presentation layer, using raw session", host, open.port),
        }

        log::debug!("{}:{} APPLICATION", host, open.port);
        report.applications = self
            .application_layer(&mut handle, open.transport, report.presentation.as_ref())
            .await;

        handle.close();
        log::debug!("{}:{} DONE", host, open.port);
        report
    }

    async fn session_layer(
        &self,
        host: &str,
        open: &OpenPort,
    ) -> Option<(SessionVerdict, Box<dyn SessionHandle>)> {
        log::debug!("{}:{} SESSION", host, open.port);
        let mut chosen: Option<(SessionVerdict, Box<dyn SessionHandle>)> = None;

        for plugin in self.registry.session_plugins(open.transport) {
            let outcome = match plugin.discover(host, open.port).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    log::debug!(
                        "{}:{} {} session plugin failed: {}",
                        host,
                        open.port,
                        plugin.protocol(),
                        e
                    );
                    continue;
                }
            };
            if !outcome.is_detected() {
                continue;
            }
            let (verdict, handle) = outcome.into_parts();
            let Some(mut handle) = handle else {
                continue;
            };
            if chosen.is_none() {
                chosen = Some((verdict, handle));
            } else {
                // Later matches under all-matching are only logged
                log::debug!("{}:{} also answers {}", host, open.port, verdict.protocol);
                handle.close();
            }
            if self.policies.session == MatchPolicy::FirstMatch {
                break;
            }
        }
        chosen
    }

    async fn presentation_layer(
        &self,
        handle: &mut OwnedHandle,
        transport: Transport,
    ) -> Option<PresentationVerdict> {
        let mut chosen = None;
        for plugin in self.registry.presentation_plugins(transport) {
            match plugin.discover(&mut **handle).await {
                Ok(verdict) if verdict.detected => {
                    if chosen.is_none() {
                        chosen = Some(verdict);
                    }
                    if self.policies.presentation == MatchPolicy::FirstMatch {
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => log::debug!(
                    "{}:{} {} presentation plugin failed: {}",
                    handle.host(),
                    handle.port(),
                    plugin.protocol(),
                    e
                ),
            }
        }
        handle.close();
        chosen
    }

    async fn application_layer(
        &self,
        handle: &mut OwnedHandle,
        transport: Transport,
        presentation: Option<&PresentationVerdict>,
    ) -> Vec<ApplicationVerdict> {
        let mut detected = Vec::new();
        for plugin in self.registry.application_plugins(transport) {
            let result = plugin.discover(&mut **handle, presentation).await;
            handle.close();
            match result {
                Ok(verdict) if verdict.detected => {
                    log::info!(
                        "{}:{} application {}",
                        handle.host(),
                        handle.port(),
                        verdict.protocol
                    );
                    detected.push(verdict);
                    if self.policies.application == MatchPolicy::FirstMatch {
                        break;
                    }
                }
                Ok(verdict) => log::debug!(
                    "{}:{} not {} {:?}",
                    handle.host(),
                    handle.port(),
                    verdict.protocol,
                    verdict.properties
                ),
                Err(e) => log::debug!(
                    "{}:{} {} application plugin failed: {}",
                    handle.host(),
                    handle.port(),
                    plugin.protocol(),
                    e
                ),
            }
        }
        detected
    }
}
