//! etcd, identified by its `/version` reply.
//!
//! Properties: `version`, `cluster_version`. Finding:
//! `unauthenticated-key-listing`, corroborated by the configured probe.

use super::service_context;
use crate::discovery::corroborate::{corroborate, ExposureProbe};
use crate::discovery::presentation;
use crate::discovery::{
    ApplicationDiscovery, ApplicationProtocol, ApplicationVerdict, Finding, PresentationVerdict,
    Verdict,
};
use crate::error::DiscoveryResult;
use crate::session::SessionHandle;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

const SIGNATURE: &str = "etcdserver";

#[derive(Clone, Default)]
pub struct EtcdDiscovery {
    probe: Option<Arc<dyn ExposureProbe>>,
}

impl EtcdDiscovery {
    pub fn new(probe: Option<Arc<dyn ExposureProbe>>) -> Self {
        Self { probe }
    }
}

#[async_trait]
impl ApplicationDiscovery for EtcdDiscovery {
    fn protocol(&self) -> ApplicationProtocol {
        ApplicationProtocol::Etcd
    }

    async fn discover(
        &self,
        handle: &mut dyn SessionHandle,
        _presentation: Option<&PresentationVerdict>,
    ) -> DiscoveryResult<ApplicationVerdict> {
        let response = presentation::get(handle, "/version").await?;
        if !response.body_text().contains(SIGNATURE) {
            return Ok(Verdict::not_detected(ApplicationProtocol::Etcd));
        }

        let mut verdict = Verdict::detected(ApplicationProtocol::Etcd);
        if let Some(json) = response.json() {
            if let Some(version) = json.get("etcdserver").and_then(Value::as_str) {
                verdict.set("version", version);
            }
            if let Some(cluster) = json.get("etcdcluster").and_then(Value::as_str) {
                verdict.set("cluster_version", cluster);
            }
        }

        let context = service_context(handle, ApplicationProtocol::Etcd);
        let exposure = corroborate(self.probe.as_ref(), &context).await;
        Ok(verdict.with_finding(Finding::new("unauthenticated-key-listing", exposure)))
    }
}
