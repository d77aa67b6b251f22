//! Kubernetes API server, identified through `/version`.
//!
//! Signatures, any of: a `Server` header naming Kubernetes, an `Audit-Id`
//! header together with a `gitVersion` field or an authorization refusal, or a
//! body that mentions Kubernetes or minikube.
//!
//! Properties: `version`, `platform`, `go_version`, `distribution`,
//! `anonymous_auth`. Finding: `anonymous-namespace-listing`, checked in band.

use crate::discovery::presentation::{self, HttpResponse};
use crate::discovery::{
    ApplicationDiscovery, ApplicationProtocol, ApplicationVerdict, Exposure, Finding,
    PresentationVerdict, Verdict,
};
use crate::error::DiscoveryResult;
use crate::session::SessionHandle;
use async_trait::async_trait;
use serde_json::Value;

const NAMESPACES_PATH: &str = "/api/v1/namespaces";

#[derive(Debug, Clone, Default)]
pub struct KubeApiserverDiscovery;

impl KubeApiserverDiscovery {
    pub fn new() -> Self {
        Self
    }
}

fn is_refusal(status: u16) -> bool {
    matches!(status, 401 | 403)
}

/// Whether a `/version` response came from the API server
pub fn identifies_apiserver(response: &HttpResponse) -> bool {
    let server = response
        .header("server")
        .map(|s| s.to_ascii_lowercase().contains("kubernetes"))
        .unwrap_or(false);
    let audited = response.has_header("audit-id");
    let git_version = response
        .json()
        .map(|j| j.get("gitVersion").is_some())
        .unwrap_or(false);
    let body = response.body_text().to_ascii_lowercase();

    server
        || (audited && (git_version || is_refusal(response.status)))
        || body.contains("kubernetes")
        || body.contains("minikube")
}

fn namespace_exposure(result: DiscoveryResult<HttpResponse>) -> Exposure {
    match result {
        Ok(response) if response.status == 200 => {
            let listed = response.json().and_then(|json| {
                if json.get("kind").and_then(Value::as_str) != Some("NamespaceList") {
                    return None;
                }
                Some(json.get("items").and_then(Value::as_array).map(Vec::len).unwrap_or(0))
            });
            match listed {
                Some(count) => Exposure::Vulnerable {
                    evidence: format!("listed {} namespaces anonymously", count),
                },
                None => Exposure::NotVulnerable {
                    evidence: "no namespace list returned".to_string(),
                },
            }
        }
        Ok(response) => Exposure::NotVulnerable {
            evidence: format!("namespace listing refused with status {}", response.status),
        },
        Err(e) => Exposure::uncorroborated(e.to_string()),
    }
}

#[async_trait]
impl ApplicationDiscovery for KubeApiserverDiscovery {
    fn protocol(&self) -> ApplicationProtocol {
        ApplicationProtocol::KubeApiserver
    }

    async fn discover(
        &self,
        handle: &mut dyn SessionHandle,
        _presentation: Option<&PresentationVerdict>,
    ) -> DiscoveryResult<ApplicationVerdict> {
        let response = presentation::get(handle, "/version").await?;
        if !identifies_apiserver(&response) {
            return Ok(Verdict::not_detected(ApplicationProtocol::KubeApiserver));
        }

        let mut verdict = Verdict::detected(ApplicationProtocol::KubeApiserver);
        if let Some(json) = response.json() {
            for (field, key) in [
                ("gitVersion", "version"),
                ("platform", "platform"),
                ("goVersion", "go_version"),
            ] {
                if let Some(value) = json.get(field).and_then(Value::as_str) {
                    verdict.set(key, value);
                }
            }
        }
        if response.body_text().to_ascii_lowercase().contains("minikube") {
            verdict.set("distribution", "minikube");
        }

        if is_refusal(response.status) {
            verdict.set("anonymous_auth", false);
            let exposure = Exposure::NotVulnerable {
                evidence: format!("anonymous requests refused with status {}", response.status),
            };
            return Ok(verdict.with_finding(Finding::new("anonymous-namespace-listing", exposure)));
        }

        verdict.set("anonymous_auth", true);
        let exposure = namespace_exposure(presentation::get(handle, NAMESPACES_PATH).await);
        Ok(verdict.with_finding(Finding::new("anonymous-namespace-listing", exposure)))
    }
}
