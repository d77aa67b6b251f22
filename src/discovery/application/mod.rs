//! Application-layer plugins

pub mod etcd;
pub mod kube_apiserver;
pub mod kubelet;
pub mod postgres;
pub mod redis;

use super::corroborate::ServiceContext;
use super::{ApplicationProtocol, PresentationProtocol, PresentationVerdict};
use crate::session::{SessionHandle, SessionProtocol};

pub use etcd::EtcdDiscovery;
pub use kube_apiserver::KubeApiserverDiscovery;
pub use kubelet::KubeletDiscovery;
pub use postgres::{PostgresCredentials, PostgresDiscovery};
pub use redis::RedisDiscovery;

/// Whether the presentation layer already identified HTTP framing
pub(crate) fn speaks_http(presentation: Option<&PresentationVerdict>) -> bool {
    presentation
        .map(|p| p.detected && p.protocol == PresentationProtocol::Http)
        .unwrap_or(false)
}

pub(crate) fn service_context(
    handle: &dyn SessionHandle,
    protocol: ApplicationProtocol,
) -> ServiceContext {
    ServiceContext {
        host: handle.host().to_string(),
        port: handle.port(),
        protocol,
        tls: handle.protocol() == SessionProtocol::Tls,
    }
}
