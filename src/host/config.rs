//! Host configuration and provisioned reachability

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

/// Host identifier, unique within a deployment
pub type HostId = usize;

/// Kind of compute target a host represents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostKind {
    /// The machine running the deployment
    Localhost,
    /// A cloud virtual machine
    CloudVm(CloudVmParams),
    /// A container pod
    Pod(PodParams),
}

impl HostKind {
    /// Short label used in logs
    pub fn label(&self) -> &'static str {
        match self {
            HostKind::Localhost => "localhost",
            HostKind::CloudVm(_) => "cloud-vm",
            HostKind::Pod(_) => "pod",
        }
    }
}

/// Cloud VM provisioning parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudVmParams {
    /// Cloud provider (gcp, azure, ...)
    pub provider: String,
    /// Provider project or subscription
    pub project: String,
    /// Region or zone
    #[serde(default)]
    pub region: String,
    /// Machine type
    #[serde(default)]
    pub machine_type: String,
    /// Boot image
    #[serde(default)]
    pub image: String,
    /// Login user for the VM
    #[serde(default)]
    pub user: Option<String>,
}

impl CloudVmParams {
    /// Create VM parameters for a provider and project
    pub fn new(provider: &str, project: &str) -> Self {
        Self {
            provider: provider.to_string(),
            project: project.to_string(),
            region: String::new(),
            machine_type: String::new(),
            image: String::new(),
            user: None,
        }
    }

    /// Set the region
    pub fn region(mut self, region: &str) -> Self {
        self.region = region.to_string();
        self
    }

    /// Set the machine type
    pub fn machine_type(mut self, machine_type: &str) -> Self {
        self.machine_type = machine_type.to_string();
        self
    }

    /// Set the boot image
    pub fn image(mut self, image: &str) -> Self {
        self.image = image.to_string();
        self
    }

    /// Set the login user
    pub fn user(mut self, user: &str) -> Self {
        self.user = Some(user.to_string());
        self
    }
}

/// Container pod parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodParams {
    /// Namespace the pod is created in
    pub namespace: String,
    /// Container image
    pub image: String,
}

impl Default for PodParams {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            image: "ubuntu:22.04".to_string(),
        }
    }
}

/// Credentials needed to reach a provisioned host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthMaterial {
    /// Login user
    pub user: String,
    /// Private key file
    pub key_path: Option<PathBuf>,
}

/// Resolved addresses of a provisioned host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reachability {
    /// Address reachable from hosts in the same network
    pub internal_address: IpAddr,
    /// Address reachable from outside the host's network
    pub external_address: Option<IpAddr>,
    /// Credentials, if any
    pub auth: Option<AuthMaterial>,
    /// Host name reported by the target
    pub hostname: Option<String>,
    /// Ports opened to the outside during provisioning
    #[serde(default)]
    pub open_ports: Vec<u16>,
    /// When provisioning completed
    pub provisioned_at: DateTime<Utc>,
}

impl Reachability {
    /// Reachability for a host with a single address
    pub fn new(internal_address: IpAddr) -> Self {
        Self {
            internal_address,
            external_address: None,
            auth: None,
            hostname: None,
            open_ports: Vec::new(),
            provisioned_at: Utc::now(),
        }
    }

    /// Set the external address
    pub fn external(mut self, addr: IpAddr) -> Self {
        self.external_address = Some(addr);
        self
    }

    /// Set credentials
    pub fn auth(mut self, auth: AuthMaterial) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Set the reported host name
    pub fn hostname(mut self, hostname: &str) -> Self {
        self.hostname = Some(hostname.to_string());
        self
    }

    /// Set the ports opened to the outside
    pub fn open_ports(mut self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.open_ports = ports.into_iter().collect();
        self
    }
}

/// Network zone a host lives in. Hosts in the same zone talk over internal
/// addresses.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NetworkZone {
    /// The local machine
    Local,
    /// A cloud provider project
    Cloud { provider: String, project: String },
    /// A pod namespace
    Cluster(String),
}

/// State shared between a host and its client-only projections
#[derive(Debug, Default)]
struct HostShared {
    reachability: OnceLock<Reachability>,
    /// Ports services on this host need opened to the outside
    requested_ports: Mutex<BTreeSet<u16>>,
}

/// A provisionable compute target
#[derive(Debug, Clone)]
pub struct Host {
    id: HostId,
    name: String,
    kind: HostKind,
    client_only: bool,
    deployment_id: String,
    shared: Arc<HostShared>,
}

impl Host {
    pub(crate) fn new(id: HostId, name: &str, kind: HostKind, deployment_id: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            kind,
            client_only: false,
            deployment_id: deployment_id.to_string(),
            shared: Arc::new(HostShared::default()),
        }
    }

    /// Host ID
    pub fn id(&self) -> HostId {
        self.id
    }

    /// Host name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Host kind and provisioning parameters
    pub fn kind(&self) -> &HostKind {
        &self.kind
    }

    pub(crate) fn deployment_id(&self) -> &str {
        &self.deployment_id
    }

    /// A projection of this host that only dials out and never binds a
    /// listening port. Shares provisioning state with the original.
    pub fn client_only(&self) -> Host {
        Host {
            client_only: true,
            ..self.clone()
        }
    }

    /// Whether this host may only act as the dialing side of a connection
    pub fn is_client_only(&self) -> bool {
        self.client_only
    }

    /// Reachability, once provisioned
    pub fn reachability(&self) -> Option<&Reachability> {
        self.shared.reachability.get()
    }

    /// Whether provisioning has completed
    pub fn is_provisioned(&self) -> bool {
        self.shared.reachability.get().is_some()
    }

    /// Record the provisioning result. Later results for an already
    /// provisioned host are ignored.
    pub(crate) fn set_reachability(&self, reachability: Reachability) -> bool {
        self.shared.reachability.set(reachability).is_ok()
    }

    /// Ask provisioning to expose `port` on this host
    pub(crate) fn request_port(&self, port: u16) {
        let mut ports = self
            .shared
            .requested_ports
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        ports.insert(port);
    }

    /// Ports requested by services on this host, in ascending order
    pub fn requested_ports(&self) -> Vec<u16> {
        let ports = self
            .shared
            .requested_ports
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        ports.iter().copied().collect()
    }

    /// Network zone used to pick internal or external addresses
    pub fn zone(&self) -> NetworkZone {
        match &self.kind {
            HostKind::Localhost => NetworkZone::Local,
            HostKind::CloudVm(params) => NetworkZone::Cloud {
                provider: params.provider.clone(),
                project: params.project.clone(),
            },
            HostKind::Pod(params) => NetworkZone::Cluster(params.namespace.clone()),
        }
    }

    /// Whether `other` is the same underlying host (ignoring projections)
    pub fn same_host(&self, other: &Host) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.kind.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_client_only_shares_state() {
        let host = Host::new(0, "local", HostKind::Localhost, "dep");
        let client = host.client_only();

        assert!(!host.is_client_only());
        assert!(client.is_client_only());
        assert!(host.same_host(&client));

        assert!(host.set_reachability(Reachability::new(IpAddr::V4(Ipv4Addr::LOCALHOST))));
        assert!(client.is_provisioned());
        assert!(!client.set_reachability(Reachability::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED))));
        assert_eq!(
            client.reachability().map(|r| r.internal_address),
            Some(IpAddr::V4(Ipv4Addr::LOCALHOST))
        );
    }

    #[test]
    fn test_requested_ports_shared_with_projection() {
        let host = Host::new(0, "vm", HostKind::CloudVm(CloudVmParams::new("gcp", "p")), "dep");
        let client = host.client_only();
        client.request_port(8081);
        host.request_port(8080);
        host.request_port(8081);
        assert_eq!(host.requested_ports(), vec![8080, 8081]);
        assert_eq!(client.requested_ports(), vec![8080, 8081]);
    }

    #[test]
    fn test_zones() {
        let a = Host::new(0, "a", HostKind::CloudVm(CloudVmParams::new("gcp", "p1")), "dep");
        let b = Host::new(
            1,
            "b",
            HostKind::CloudVm(CloudVmParams::new("gcp", "p1").region("us-west1")),
            "dep",
        );
        let c = Host::new(2, "c", HostKind::CloudVm(CloudVmParams::new("azure", "p1")), "dep");

        assert_eq!(a.zone(), b.zone());
        assert_ne!(a.zone(), c.zone());
        assert_eq!(Host::new(3, "l", HostKind::Localhost, "dep").zone(), NetworkZone::Local);
    }

    #[test]
    fn test_host_kind_yaml() {
        let kind: HostKind = serde_yaml::from_str("type: pod\nnamespace: test\nimage: alpine").unwrap();
        assert_eq!(
            kind,
            HostKind::Pod(PodParams {
                namespace: "test".to_string(),
                image: "alpine".to_string(),
            })
        );
    }
}
