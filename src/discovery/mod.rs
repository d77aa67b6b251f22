//! Layered protocol discovery: session, presentation and application plugins
//! with typed verdicts, an immutable registry, and the per-port orchestrator.

pub mod application;
pub mod corroborate;
pub mod orchestrator;
pub mod presentation;
pub mod registry;
pub mod session;

use crate::error::DiscoveryResult;
use crate::session::{SessionHandle, SessionProtocol};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub use orchestrator::{DiscoveryOrchestrator, PortReport};
pub use registry::{DiscoveryOptions, DiscoveryRegistry, RegistryBuilder};

/// Presentation-layer protocols
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresentationProtocol {
    Http,
}

impl PresentationProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresentationProtocol::Http => "http",
        }
    }
}

impl fmt::Display for PresentationProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Application services the registry knows how to identify
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApplicationProtocol {
    Etcd,
    KubeApiserver,
    Kubelet,
    Postgres,
    Redis,
}

impl ApplicationProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplicationProtocol::Etcd => "etcd",
            ApplicationProtocol::KubeApiserver => "kube-apiserver",
            ApplicationProtocol::Kubelet => "kubelet",
            ApplicationProtocol::Postgres => "postgres",
            ApplicationProtocol::Redis => "redis",
        }
    }
}

impl fmt::Display for ApplicationProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed property value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Flag(bool),
    Number(i64),
    Text(String),
    List(Vec<String>),
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Flag(v) => write!(f, "{}", v),
            PropertyValue::Number(v) => write!(f, "{}", v),
            PropertyValue::Text(v) => f.write_str(v),
            PropertyValue::List(v) => f.write_str(&v.join(",")),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::Text(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::Text(v)
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Flag(v)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Number(v)
    }
}

impl From<u16> for PropertyValue {
    fn from(v: u16) -> Self {
        PropertyValue::Number(i64::from(v))
    }
}

impl From<Vec<String>> for PropertyValue {
    fn from(v: Vec<String>) -> Self {
        PropertyValue::List(v)
    }
}

/// Property keys are fixed per plugin; see each plugin's module docs
pub type Properties = BTreeMap<String, PropertyValue>;

/// Outcome of an exposure check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Exposure {
    Vulnerable { evidence: String },
    NotVulnerable { evidence: String },
    /// The check could not be run or did not complete
    Uncorroborated { reason: String },
}

impl Exposure {
    pub fn uncorroborated(reason: impl Into<String>) -> Self {
        Exposure::Uncorroborated {
            reason: reason.into(),
        }
    }

    pub fn is_vulnerable(&self) -> bool {
        matches!(self, Exposure::Vulnerable { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    /// Short identifier of the check, e.g. `unauthenticated-key-listing`
    pub check: String,
    #[serde(flatten)]
    pub exposure: Exposure,
}

impl Finding {
    pub fn new(check: impl Into<String>, exposure: Exposure) -> Self {
        Self {
            check: check.into(),
            exposure,
        }
    }
}

/// The verdict of one plugin invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict<P> {
    pub protocol: P,
    pub detected: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: Properties,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub findings: Vec<Finding>,
}

impl<P> Verdict<P> {
    pub fn detected(protocol: P) -> Self {
        Self {
            protocol,
            detected: true,
            properties: Properties::new(),
            findings: Vec::new(),
        }
    }

    pub fn not_detected(protocol: P) -> Self {
        Self {
            protocol,
            detected: false,
            properties: Properties::new(),
            findings: Vec::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }

    pub fn set(&mut self, key: &str, value: impl Into<PropertyValue>) {
        self.properties.insert(key.to_string(), value.into());
    }

    pub fn with_finding(mut self, finding: Finding) -> Self {
        self.findings.push(finding);
        self
    }

    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.properties.get(key)
    }

    /// Text property, if present and textual
    pub fn text(&self, key: &str) -> Option<&str> {
        match self.properties.get(key) {
            Some(PropertyValue::Text(v)) => Some(v),
            _ => None,
        }
    }

    pub fn version(&self) -> Option<&str> {
        self.text("version")
    }
}

pub type SessionVerdict = Verdict<SessionProtocol>;
pub type PresentationVerdict = Verdict<PresentationProtocol>;
pub type ApplicationVerdict = Verdict<ApplicationProtocol>;

/// What a session plugin hands back. A handle is present only when the
/// session layer was detected.
pub struct SessionOutcome {
    pub verdict: SessionVerdict,
    handle: Option<Box<dyn SessionHandle>>,
}

impl SessionOutcome {
    pub fn detected(verdict: SessionVerdict, handle: Box<dyn SessionHandle>) -> Self {
        Self {
            verdict,
            handle: Some(handle),
        }
    }

    pub fn not_detected(protocol: SessionProtocol) -> Self {
        Self {
            verdict: Verdict::not_detected(protocol),
            handle: None,
        }
    }

    pub fn is_detected(&self) -> bool {
        self.verdict.detected && self.handle.is_some()
    }

    pub fn protocol(&self) -> SessionProtocol {
        self.verdict.protocol
    }

    pub fn into_parts(self) -> (SessionVerdict, Option<Box<dyn SessionHandle>>) {
        (self.verdict, self.handle)
    }
}

/// Probes a (host, port) pair for a session-layer protocol
#[async_trait]
pub trait SessionDiscovery: Send + Sync {
    fn protocol(&self) -> SessionProtocol;

    async fn discover(&self, host: &str, port: u16) -> DiscoveryResult<SessionOutcome>;
}

/// Classifies the framing spoken over an established session
#[async_trait]
pub trait PresentationDiscovery: Send + Sync {
    fn protocol(&self) -> PresentationProtocol;

    async fn discover(
        &self,
        handle: &mut dyn SessionHandle,
    ) -> DiscoveryResult<PresentationVerdict>;
}

/// Identifies a specific service, with the presentation verdict when one was
/// detected
#[async_trait]
pub trait ApplicationDiscovery: Send + Sync {
    fn protocol(&self) -> ApplicationProtocol;

    async fn discover(
        &self,
        handle: &mut dyn SessionHandle,
        presentation: Option<&PresentationVerdict>,
    ) -> DiscoveryResult<ApplicationVerdict>;
}

/// How a layer picks among its registered plugins
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchPolicy {
    /// Stop at the first plugin that reports a detection
    FirstMatch,
    /// Run every plugin whose transport matches
    AllMatching,
}

impl FromStr for MatchPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "first-match" | "first" => Ok(MatchPolicy::FirstMatch),
            "all-matching" | "all" => Ok(MatchPolicy::AllMatching),
            _ => Err(format!("Unknown match policy: {}", s)),
        }
    }
}

impl fmt::Display for MatchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchPolicy::FirstMatch => f.write_str("first-match"),
            MatchPolicy::AllMatching => f.write_str("all-matching"),
        }
    }
}

/// Matching policy per layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchPolicies {
    pub session: MatchPolicy,
    pub presentation: MatchPolicy,
    pub application: MatchPolicy,
}

impl Default for MatchPolicies {
    fn default() -> Self {
        Self {
            session: MatchPolicy::FirstMatch,
            presentation: MatchPolicy::FirstMatch,
            application: MatchPolicy::AllMatching,
        }
    }
}
