use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::error::Error;

/// Label marking a deployment as managed by this proxy (`k8sticket=true`)
pub const LABEL_MANAGED: &str = "k8sticket";
/// Label carried by every pod belonging to an application
pub const LABEL_APP_NAME: &str = "k8sticket.deployment.app.name";
/// Label marking pods created by the autoscaler (eligible for reaping)
pub const LABEL_SCALED: &str = "k8sTicket.scaled";

/// Deployment annotations driving the per-application configuration
pub const ANNOTATION_PORT: &str = "k8sticket.deployment.port";
pub const ANNOTATION_APP_NAME: &str = "k8sticket.deployment.app.name";
pub const ANNOTATION_MAX_TICKETS: &str = "k8sticket.deployment.tickets.max";
pub const ANNOTATION_SPARE_TICKETS: &str = "k8sticket.deployment.tickets.spare";
pub const ANNOTATION_MAX_PODS: &str = "k8sticket.deployment.pods.max";
pub const ANNOTATION_COOLDOWN: &str = "k8sticket.deployment.pods.cooldown";
pub const ANNOTATION_DNS_MODE: &str = "k8sticket.ingress.dns";

/// Pod annotations driving backend routing
pub const ANNOTATION_BACKEND_PATH: &str = "k8sTicket.path";
pub const ANNOTATION_BACKEND_PORT: &str = "k8sTicket.port";

pub const DEFAULT_LISTEN_PORT: u16 = 9001;
pub const DEFAULT_MAX_TICKETS: usize = 1;
pub const DEFAULT_SPARE_TICKETS: usize = 2;
pub const DEFAULT_MAX_PODS: usize = 1;
pub const DEFAULT_COOLDOWN_SECS: u64 = 10;
pub const DEFAULT_BACKEND_PORT: u16 = 80;
pub const DEFAULT_BACKEND_PATH: &str = "/";

/// Parse an annotation value leniently: a missing or malformed value falls
/// back to the documented default, malformed values are logged.
fn parse_annotation<T>(
    annotations: &BTreeMap<String, String>,
    owner: &str,
    key: &str,
    default: T,
) -> T
where
    T: FromStr + Debug,
    T::Err: std::fmt::Display,
{
    match annotations.get(key) {
        None => default,
        Some(raw) => match raw.parse() {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    owner,
                    key,
                    value = %raw,
                    error = %e,
                    fallback = ?default,
                    "Malformed annotation, using default"
                );
                default
            }
        },
    }
}

/// Configuration snapshot of one application, derived from its deployment's
/// annotations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppSettings {
    /// URL prefix and pod label-selector value
    pub prefix: String,
    /// Listener port for this application's proxy
    pub port: u16,
    /// Route by subdomain instead of path
    pub dns_mode: bool,
    /// Maximum concurrent tickets per backend
    pub max_tickets: usize,
    /// Target free-ticket headroom
    pub spare_tickets: usize,
    /// Maximum number of autoscaled pods
    pub max_pods: usize,
    /// Idle time before an autoscaled pod is reaped; also the reaper period
    pub cooldown: Duration,
}

impl AppSettings {
    /// Read the settings from a deployment's annotations, falling back to
    /// the documented defaults for anything missing or malformed.
    pub fn from_deployment(deployment: &Deployment) -> Self {
        let name = deployment.name_any();
        let empty = BTreeMap::new();
        let annotations = deployment.metadata.annotations.as_ref().unwrap_or(&empty);

        let prefix = annotations
            .get(ANNOTATION_APP_NAME)
            .cloned()
            .unwrap_or_else(|| name.clone());

        Self {
            prefix,
            port: parse_annotation(annotations, &name, ANNOTATION_PORT, DEFAULT_LISTEN_PORT),
            dns_mode: parse_annotation(annotations, &name, ANNOTATION_DNS_MODE, false),
            max_tickets: parse_annotation(
                annotations,
                &name,
                ANNOTATION_MAX_TICKETS,
                DEFAULT_MAX_TICKETS,
            ),
            spare_tickets: parse_annotation(
                annotations,
                &name,
                ANNOTATION_SPARE_TICKETS,
                DEFAULT_SPARE_TICKETS,
            ),
            max_pods: parse_annotation(annotations, &name, ANNOTATION_MAX_PODS, DEFAULT_MAX_PODS),
            cooldown: Duration::from_secs(parse_annotation(
                annotations,
                &name,
                ANNOTATION_COOLDOWN,
                DEFAULT_COOLDOWN_SECS,
            )),
        }
    }

    /// A structural change cannot be applied to a running proxy: the
    /// application has to be torn down and recreated, dropping live sessions.
    pub fn requires_restart(&self, other: &AppSettings) -> bool {
        self.prefix != other.prefix || self.port != other.port || self.dns_mode != other.dns_mode
    }
}

/// Frozen routing configuration of one backend. Any change requires the
/// backend to be destroyed and recreated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    /// Upstream address, `ip:port`
    pub host: String,
    /// Path prefix prepended to every proxied request path
    pub path: String,
}

impl BackendConfig {
    /// Derive the routing configuration from a pod's IP and annotations.
    ///
    /// Fails with [`Error::NoIp`] when the pod has not been assigned an IP
    /// yet; the caller skips the pod until the next update event.
    pub fn from_pod(pod: &Pod) -> Result<Self, Error> {
        let name = pod.name_any();
        let ip = pod
            .status
            .as_ref()
            .and_then(|s| s.pod_ip.clone())
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| Error::NoIp(name.clone()))?;

        let empty = BTreeMap::new();
        let annotations = pod.metadata.annotations.as_ref().unwrap_or(&empty);
        let path = annotations
            .get(ANNOTATION_BACKEND_PATH)
            .cloned()
            .unwrap_or_else(|| DEFAULT_BACKEND_PATH.to_string());
        let port = parse_annotation(
            annotations,
            &name,
            ANNOTATION_BACKEND_PORT,
            DEFAULT_BACKEND_PORT,
        );

        Ok(Self {
            host: format!("{}:{}", ip, port),
            path,
        })
    }

    /// Join the frozen path prefix with the remaining request path.
    pub fn upstream_path(&self, rest: &str) -> String {
        let prefix = self.path.trim_end_matches('/');
        if rest.is_empty() {
            format!("{}/", prefix)
        } else {
            format!("{}{}", prefix, rest)
        }
    }
}

/// Discover the namespace this instance runs in: the downward-API env var
/// first, then the service-account namespace file, then `default`.
pub fn namespace() -> String {
    if let Ok(ns) = std::env::var("POD_NAMESPACE") {
        return ns;
    }

    if let Ok(data) =
        std::fs::read_to_string("/var/run/secrets/kubernetes.io/serviceaccount/namespace")
    {
        let ns = data.trim();
        if !ns.is_empty() {
            return ns.to_string();
        }
    }

    "default".to_string()
}
