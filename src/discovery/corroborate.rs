//! Exposure corroboration: confirming that an unauthenticated administrative
//! operation succeeds once a service has been identified.
//!
//! Probes are optional collaborators. A missing probe or a failing one leaves
//! the finding uncorroborated and never fails the plugin that asked.

use super::{ApplicationProtocol, Exposure};
use crate::error::CollaboratorError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

/// Kubelet authenticated API port
pub const KUBELET_PORT: u16 = 10250;
/// Kubelet read-only API port
pub const KUBELET_READ_ONLY_PORT: u16 = 10255;

/// The service being corroborated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceContext {
    pub host: String,
    pub port: u16,
    pub protocol: ApplicationProtocol,
    pub tls: bool,
}

impl ServiceContext {
    pub fn base_url(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub vulnerable: bool,
    pub evidence: String,
}

#[async_trait]
pub trait ExposureProbe: Send + Sync {
    fn name(&self) -> &str;

    async fn probe(&self, context: &ServiceContext) -> Result<ProbeOutcome, CollaboratorError>;
}

/// Run `probe` if one is configured and fold the result into an exposure
pub async fn corroborate(
    probe: Option<&Arc<dyn ExposureProbe>>,
    context: &ServiceContext,
) -> Exposure {
    let Some(probe) = probe else {
        return Exposure::uncorroborated("no probe configured");
    };

    match probe.probe(context).await {
        Ok(ProbeOutcome {
            vulnerable: true,
            evidence,
        }) => Exposure::Vulnerable { evidence },
        Ok(ProbeOutcome { evidence, .. }) => Exposure::NotVulnerable { evidence },
        Err(e) => {
            log::warn!(
                "{} probe against {}:{} failed: {}",
                probe.name(),
                context.host,
                context.port,
                e
            );
            Exposure::uncorroborated(e.to_string())
        }
    }
}

/// Which collaborators back the exposure checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Corroboration {
    /// Direct API requests
    #[default]
    Http,
    /// External administrative clients (`etcdctl`, `kubectl`)
    Command,
    None,
}

impl FromStr for Corroboration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "http" | "api" => Ok(Corroboration::Http),
            "command" | "cmd" => Ok(Corroboration::Command),
            "none" | "off" => Ok(Corroboration::None),
            _ => Err(format!("Unknown corroboration mode: {}", s)),
        }
    }
}

impl fmt::Display for Corroboration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Corroboration::Http => f.write_str("http"),
            Corroboration::Command => f.write_str("command"),
            Corroboration::None => f.write_str("none"),
        }
    }
}

/// Probes handed to the application plugins that corroborate
#[derive(Clone, Default)]
pub struct ProbeSet {
    pub etcd: Option<Arc<dyn ExposureProbe>>,
    pub kubelet: Option<Arc<dyn ExposureProbe>>,
}

impl ProbeSet {
    pub fn for_mode(mode: Corroboration, timeout: Duration) -> Result<Self, CollaboratorError> {
        Ok(match mode {
            Corroboration::Http => {
                let client = insecure_client(timeout)?;
                Self {
                    etcd: Some(Arc::new(EtcdKeyListingProbe::new(client.clone()))),
                    kubelet: Some(Arc::new(KubeletReadOnlyProbe::new(client))),
                }
            }
            Corroboration::Command => {
                let probe: Arc<dyn ExposureProbe> = Arc::new(CommandProbe::new(timeout));
                Self {
                    etcd: Some(probe.clone()),
                    kubelet: Some(probe),
                }
            }
            Corroboration::None => Self::default(),
        })
    }
}

/// HTTP client that skips certificate validation
pub fn insecure_client(timeout: Duration) -> Result<reqwest::Client, CollaboratorError> {
    Ok(reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .timeout(timeout)
        .user_agent("strata")
        .build()?)
}

/// Lists keys through the etcd v3 JSON gateway
pub struct EtcdKeyListingProbe {
    client: reqwest::Client,
}

impl EtcdKeyListingProbe {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

/// Interpret a `/v3/kv/range` response body
fn key_listing_outcome(status: u16, body: &Value) -> ProbeOutcome {
    if let Some(error) = body.get("error").and_then(Value::as_str) {
        return ProbeOutcome {
            vulnerable: false,
            evidence: format!("key listing refused: {}", error),
        };
    }
    if status != 200 || body.get("header").is_none() {
        return ProbeOutcome {
            vulnerable: false,
            evidence: format!("key listing refused with status {}", status),
        };
    }

    let count = body
        .get("count")
        .and_then(|c| c.as_str().and_then(|s| s.parse::<u64>().ok()).or_else(|| c.as_u64()))
        .unwrap_or(0);
    ProbeOutcome {
        vulnerable: true,
        evidence: format!("listed keyspace without credentials ({} keys)", count),
    }
}

#[async_trait]
impl ExposureProbe for EtcdKeyListingProbe {
    fn name(&self) -> &str {
        "etcd-key-listing"
    }

    async fn probe(&self, context: &ServiceContext) -> Result<ProbeOutcome, CollaboratorError> {
        // key and range_end of "\0" select the whole keyspace
        let request = json!({
            "key": "AA==",
            "range_end": "AA==",
            "keys_only": true,
            "limit": 10,
        });
        let response = self
            .client
            .post(format!("{}/v3/kv/range", context.base_url()))
            .json(&request)
            .send()
            .await?;
        let status = response.status().as_u16();
        let body: Value = response
            .json()
            .await
            .map_err(|e| CollaboratorError::Unexpected(format!("non-JSON range reply: {}", e)))?;
        Ok(key_listing_outcome(status, &body))
    }
}

/// Lists pods on both kubelet API ports
pub struct KubeletReadOnlyProbe {
    client: reqwest::Client,
    api_port: u16,
    read_only_port: u16,
}

impl KubeletReadOnlyProbe {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            api_port: KUBELET_PORT,
            read_only_port: KUBELET_READ_ONLY_PORT,
        }
    }

    /// Target a kubelet listening on non-standard ports
    pub fn with_ports(mut self, api_port: u16, read_only_port: u16) -> Self {
        self.api_port = api_port;
        self.read_only_port = read_only_port;
        self
    }

    /// Pod count if `url` serves a PodList, otherwise a reason
    async fn list_pods(&self, url: &str) -> Result<Result<usize, String>, reqwest::Error> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Ok(Err(format!("status {}", status.as_u16())));
        }
        let body: Value = match response.json().await {
            Ok(body) => body,
            Err(_) => return Ok(Err("non-JSON reply".to_string())),
        };
        if body.get("kind").and_then(Value::as_str) != Some("PodList") {
            return Ok(Err("no pod list".to_string()));
        }
        Ok(Ok(body
            .get("items")
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(0)))
    }
}

#[async_trait]
impl ExposureProbe for KubeletReadOnlyProbe {
    fn name(&self) -> &str {
        "kubelet-pod-listing"
    }

    async fn probe(&self, context: &ServiceContext) -> Result<ProbeOutcome, CollaboratorError> {
        let targets = [
            format!("https://{}:{}/pods", context.host, self.api_port),
            format!("http://{}:{}/pods", context.host, self.read_only_port),
        ];

        let mut evidence = Vec::new();
        let mut vulnerable = false;
        let mut last_error = None;
        for url in &targets {
            match self.list_pods(url).await {
                Ok(Ok(pods)) => {
                    vulnerable = true;
                    evidence.push(format!("{} listed {} pods", url, pods));
                }
                Ok(Err(reason)) => evidence.push(format!("{} refused: {}", url, reason)),
                Err(e) => {
                    evidence.push(format!("{} unreachable", url));
                    last_error = Some(e);
                }
            }
        }

        if evidence.iter().all(|e| e.ends_with("unreachable")) {
            if let Some(e) = last_error {
                return Err(CollaboratorError::Request(e));
            }
        }

        let spec_url = format!("http://{}:{}/spec", context.host, self.read_only_port);
        if let Ok(response) = self.client.get(&spec_url).send().await {
            if response.status().is_success() {
                vulnerable = true;
                evidence.push(format!("{} exposes node state", spec_url));
            }
        }

        Ok(ProbeOutcome {
            vulnerable,
            evidence: evidence.join("; "),
        })
    }
}

/// Runs the administrative client for the service, if it is installed
pub struct CommandProbe {
    timeout: Duration,
}

impl CommandProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn command_for(context: &ServiceContext) -> Option<(&'static str, Vec<String>)> {
        match context.protocol {
            ApplicationProtocol::Etcd => Some((
                "etcdctl",
                vec![
                    format!("--endpoints={}", context.base_url()),
                    "get".into(),
                    "/".into(),
                    "--prefix".into(),
                    "--keys-only".into(),
                ],
            )),
            ApplicationProtocol::Kubelet => Some((
                "kubectl",
                vec![
                    "--insecure-skip-tls-verify".into(),
                    format!("--server=https://{}:{}", context.host, KUBELET_PORT),
                    "get".into(),
                    "pods".into(),
                    "--all-namespaces".into(),
                ],
            )),
            _ => None,
        }
    }
}

/// Authentication errors in client output mean access was denied
fn denied(output: &str) -> bool {
    let lower = output.to_lowercase();
    [
        "unauthorized",
        "authentication required",
        "authorization failed",
        "permission denied",
        "forbidden",
    ]
    .iter()
    .any(|marker| lower.contains(marker))
}

#[async_trait]
impl ExposureProbe for CommandProbe {
    fn name(&self) -> &str {
        "command"
    }

    async fn probe(&self, context: &ServiceContext) -> Result<ProbeOutcome, CollaboratorError> {
        let (program, args) = Self::command_for(context).ok_or_else(|| {
            CollaboratorError::Unavailable(format!("no client for {}", context.protocol))
        })?;

        let run = Command::new(program).args(&args).kill_on_drop(true).output();
        let output = match tokio::time::timeout(self.timeout, run).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CollaboratorError::Unavailable(format!("{} is not installed", program)))
            }
            Ok(Err(e)) => return Err(CollaboratorError::Command(e)),
            Err(_) => {
                return Err(CollaboratorError::Unavailable(format!("{} timed out", program)))
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if denied(&stdout) || denied(&stderr) {
            return Ok(ProbeOutcome {
                vulnerable: false,
                evidence: format!("{} was denied", program),
            });
        }
        if !output.status.success() {
            return Err(CollaboratorError::Unexpected(format!(
                "{} exited with {}: {}",
                program,
                output.status,
                stderr.trim()
            )));
        }

        let lines = stdout.lines().filter(|l| !l.trim().is_empty()).count();
        Ok(ProbeOutcome {
            vulnerable: lines > 0,
            evidence: format!("{} returned {} lines without credentials", program, lines),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingProbe;

    #[async_trait]
    impl ExposureProbe for FailingProbe {
        fn name(&self) -> &str {
            "failing"
        }

        async fn probe(&self, _: &ServiceContext) -> Result<ProbeOutcome, CollaboratorError> {
            Err(CollaboratorError::Unavailable("offline".into()))
        }
    }

    fn context() -> ServiceContext {
        ServiceContext {
            host: "127.0.0.1".into(),
            port: 2379,
            protocol: ApplicationProtocol::Etcd,
            tls: false,
        }
    }

    #[tokio::test]
    async fn test_missing_and_failing_probes_are_uncorroborated() {
        let exposure = corroborate(None, &context()).await;
        assert_eq!(exposure, Exposure::uncorroborated("no probe configured"));

        let probe: Arc<dyn ExposureProbe> = Arc::new(FailingProbe);
        let exposure = corroborate(Some(&probe), &context()).await;
        assert!(
            matches!(exposure, Exposure::Uncorroborated { reason } if reason.contains("offline"))
        );
    }

    #[test]
    fn test_key_listing_outcome() {
        let open = json!({"header": {"revision": "4"}, "kvs": [{"key": "Zm9v"}], "count": "3"});
        let outcome = key_listing_outcome(200, &open);
        assert!(outcome.vulnerable);
        assert!(outcome.evidence.contains("3 keys"));

        let denied = json!({"error": "etcdserver: user name is empty", "code": 2});
        assert!(!key_listing_outcome(200, &denied).vulnerable);
        assert!(!key_listing_outcome(401, &json!({})).vulnerable);
    }

    #[test]
    fn test_client_denial_markers() {
        assert!(denied("Error: etcdserver: authorization failed"));
        assert!(denied("error: You must be logged in to the server (Unauthorized)"));
        assert!(!denied("/registry/pods/default/nginx"));
    }

    #[test]
    fn test_base_url_and_modes() {
        let mut ctx = context();
        assert_eq!(ctx.base_url(), "http://127.0.0.1:2379");
        ctx.tls = true;
        assert_eq!(ctx.base_url(), "https://127.0.0.1:2379");
        assert_eq!("none".parse::<Corroboration>(), Ok(Corroboration::None));
        assert!(ProbeSet::for_mode(Corroboration::None, Duration::from_secs(1))
            .unwrap()
            .etcd
            .is_none());
    }

    #[tokio::test]
    async fn test_command_probe_without_client_binary() {
        let probe = CommandProbe::new(Duration::from_secs(1));
        let ctx = ServiceContext {
            protocol: ApplicationProtocol::Redis,
            ..context()
        };
        assert!(matches!(probe.probe(&ctx).await, Err(CollaboratorError::Unavailable(_))));
    }
}
