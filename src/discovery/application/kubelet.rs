//! Kubelet node agent, identified by a healthy `/healthz`.
//!
//! The API server answers `/healthz` the same way but always sets an
//! `Audit-Id` header, which the kubelet never does. Finding:
//! `unauthenticated-pod-listing`, checked on the two kubelet API ports.

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
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct KubeletDiscovery {
    probe: Option<Arc<dyn ExposureProbe>>,
}

impl KubeletDiscovery {
    pub fn new(probe: Option<Arc<dyn ExposureProbe>>) -> Self {
        Self { probe }
    }
}

#[async_trait]
impl ApplicationDiscovery for KubeletDiscovery {
    fn protocol(&self) -> ApplicationProtocol {
        ApplicationProtocol::Kubelet
    }

    async fn discover(
        &self,
        handle: &mut dyn SessionHandle,
        _presentation: Option<&PresentationVerdict>,
    ) -> DiscoveryResult<ApplicationVerdict> {
        let response = presentation::get(handle, "/healthz").await?;
        let healthy = response.status == 200 && response.body_text().trim() == "ok";
        if !healthy || response.has_header("audit-id") {
            return Ok(Verdict::not_detected(ApplicationProtocol::Kubelet));
        }

        let verdict = Verdict::detected(ApplicationProtocol::Kubelet).with("health", "ok");
        let context = service_context(handle, ApplicationProtocol::Kubelet);
        let exposure = corroborate(self.probe.as_ref(), &context).await;
        Ok(verdict.with_finding(Finding::new("unauthenticated-pod-listing", exposure)))
    }
}
