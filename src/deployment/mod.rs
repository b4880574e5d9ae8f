//! Deployments: the graph of hosts, services and connections
//!
//! A deployment is built while in [`DeploymentState::Building`], then driven
//! through `deploy`, `start` and `stop` (see [`lifecycle`]).

pub mod config;
pub mod lifecycle;
pub mod plan;
pub mod state;

pub use config::DeploymentConfig;
pub use plan::{choose_listener, dial_address, LinkPlan, Listener};
pub use state::{DeploymentState, StartReport};

use crate::error::{DeployError, Result};
use crate::host::{Host, HostKind, LocalProvisioner, Provisioner};
use crate::launch::local::LocalLauncher;
use crate::launch::Launcher;
use crate::network::Network;
use crate::port::{Connection, ConnectionSet, Sink, Source};
use crate::scheduler::Scheduler;
use crate::service::{Service, ServiceKind};
use std::sync::Arc;
use uuid::Uuid;

/// Name of the host every deployment starts with
pub const LOCALHOST: &str = "localhost";

/// A deployment graph and its lifecycle state
pub struct Deployment {
    id: String,
    config: DeploymentConfig,
    state: DeploymentState,
    hosts: Vec<Host>,
    services: Vec<Arc<Service>>,
    connections: ConnectionSet,
    provisioner: Arc<dyn Provisioner>,
    launcher: Arc<dyn Launcher>,
    network: Arc<dyn Network>,
    scheduler: Scheduler,
}

impl Deployment {
    /// Create an empty deployment with default settings
    pub fn new() -> Self {
        Self::with_config(DeploymentConfig::default())
    }

    /// Create an empty deployment
    pub fn with_config(config: DeploymentConfig) -> Self {
        let id = Uuid::new_v4().to_string();
        let localhost = Host::new(0, LOCALHOST, HostKind::Localhost, &id);
        let network = Arc::new(config.tcp_network());

        Self {
            id,
            state: DeploymentState::Building,
            hosts: vec![localhost],
            services: Vec::new(),
            connections: ConnectionSet::new(),
            provisioner: Arc::new(LocalProvisioner),
            launcher: Arc::new(LocalLauncher::new()),
            network,
            scheduler: Scheduler::new(),
            config,
        }
    }

    /// Use a different provisioner
    pub fn with_provisioner(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.provisioner = provisioner;
        self
    }

    /// Use a different launcher
    pub fn with_launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = launcher;
        self
    }

    /// Use a different network
    pub fn with_network(mut self, network: Arc<dyn Network>) -> Self {
        self.network = network;
        self
    }

    /// Deployment ID
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Settings
    pub fn config(&self) -> &DeploymentConfig {
        &self.config
    }

    /// Lifecycle state
    pub fn state(&self) -> DeploymentState {
        self.state
    }

    /// Task scheduler owning every background task of this deployment
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// The machine running the deployment
    pub fn localhost(&self) -> &Host {
        &self.hosts[0]
    }

    /// Hosts in insertion order
    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    /// Host by name
    pub fn host(&self, name: &str) -> Result<&Host> {
        self.hosts
            .iter()
            .find(|h| h.name() == name)
            .ok_or_else(|| DeployError::HostNotFound(name.to_string()))
    }

    /// Services in insertion order
    pub fn services(&self) -> &[Arc<Service>] {
        &self.services
    }

    /// Service by name
    pub fn service(&self, name: &str) -> Result<&Arc<Service>> {
        self.services
            .iter()
            .find(|s| s.name() == name)
            .ok_or_else(|| DeployError::ServiceNotFound(name.to_string()))
    }

    /// Declared connections
    pub fn connections(&self) -> &ConnectionSet {
        &self.connections
    }

    /// Bind plan for every declared link, without provisioning anything
    pub fn plan(&self) -> Result<Vec<LinkPlan>> {
        plan::plan_links(&self.connections, &self.services)
    }

    fn require_building(&self, operation: &str) -> Result<()> {
        if self.state != DeploymentState::Building {
            return Err(DeployError::InvalidPhase {
                operation: operation.to_string(),
                state: self.state.to_string(),
            });
        }
        Ok(())
    }

    /// Add a host
    pub fn add_host(&mut self, name: &str, kind: HostKind) -> Result<Host> {
        self.require_building("add host")?;
        if self.hosts.iter().any(|h| h.name() == name) {
            return Err(DeployError::Topology(format!("host {} already exists", name)));
        }

        let host = Host::new(self.hosts.len(), name, kind, &self.id);
        tracing::debug!("Added host {}", host);
        self.hosts.push(host.clone());
        Ok(host)
    }

    /// Add a service placed on `host`
    pub fn add_service(&mut self, name: &str, host: &Host, kind: impl Into<ServiceKind>) -> Result<Arc<Service>> {
        self.require_building("add service")?;
        if host.deployment_id() != self.id {
            return Err(DeployError::HostNotFound(format!(
                "{} belongs to another deployment",
                host.name()
            )));
        }
        if self.services.iter().any(|s| s.name() == name) {
            return Err(DeployError::Topology(format!("service {} already exists", name)));
        }

        let kind = kind.into();
        if let ServiceKind::External(spec) = &kind {
            for port in &spec.external_ports {
                host.request_port(*port);
            }
        }

        let service = Arc::new(Service::new(
            self.services.len(),
            name,
            host.clone(),
            kind,
            &self.id,
            self.config.service_settings(),
        ));
        tracing::debug!("Added service {}", service);
        self.services.push(service.clone());
        Ok(service)
    }

    /// Declare a connection from `source` to `sink`
    pub fn connect(&mut self, source: impl Into<Source>, sink: impl Into<Sink>) -> Result<()> {
        self.require_building("connect")?;
        let connection = Connection::new(source, sink);

        let foreign = connection
            .source
            .port()
            .into_iter()
            .chain(connection.sink.ports().into_iter().map(|(port, _)| port))
            .find(|port| port.deployment_id() != self.id);
        if let Some(port) = foreign {
            return Err(DeployError::InvalidConnection(format!(
                "port {} belongs to another deployment",
                port
            )));
        }

        tracing::debug!("Connecting {}", connection);
        self.connections.add(connection)
    }
}

impl Default for Deployment {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Deployment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deployment")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("hosts", &self.hosts.len())
            .field("services", &self.services.len())
            .field("connections", &self.connections.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::CloudVmParams;
    use crate::service::{CrateSpec, ExternalSpec};

    #[test]
    fn test_new_deployment() {
        let deployment = Deployment::new();
        assert_eq!(deployment.state(), DeploymentState::Building);
        assert_eq!(deployment.hosts().len(), 1);
        assert_eq!(deployment.localhost().name(), LOCALHOST);
        assert_ne!(deployment.id(), Deployment::new().id());
    }

    #[test]
    fn test_add_host_and_service() {
        let mut deployment = Deployment::new();
        let vm = deployment
            .add_host("vm", HostKind::CloudVm(CloudVmParams::new("gcp", "p")))
            .unwrap();
        assert_eq!(vm.id(), 1);
        assert!(deployment.add_host("vm", HostKind::Localhost).is_err());

        let svc = deployment.add_service("worker", &vm, CrateSpec::new(".")).unwrap();
        assert_eq!(svc.host().name(), "vm");
        assert!(deployment.add_service("worker", &vm, ExternalSpec::new()).is_err());
        assert_eq!(deployment.service("worker").unwrap().id(), 0);
        assert!(matches!(deployment.service("missing"), Err(DeployError::ServiceNotFound(_))));
        assert!(matches!(deployment.host("missing"), Err(DeployError::HostNotFound(_))));
    }

    #[test]
    fn test_foreign_ports_rejected() {
        let mut a = Deployment::new();
        let mut b = Deployment::new();
        let local_a = a.localhost().clone();
        let local_b = b.localhost().clone();

        let sender = a.add_service("sender", &local_a, ExternalSpec::new()).unwrap();
        let receiver = b.add_service("receiver", &local_b, ExternalSpec::new()).unwrap();

        assert!(a.add_service("x", &local_b, ExternalSpec::new()).is_err());
        assert!(matches!(
            a.connect(sender.port("out"), receiver.port("in")),
            Err(DeployError::InvalidConnection(_))
        ));
    }

    #[test]
    fn test_duplicate_source_rejected() {
        let mut deployment = Deployment::new();
        let local = deployment.localhost().clone();
        let a = deployment.add_service("a", &local, ExternalSpec::new()).unwrap();
        let b = deployment.add_service("b", &local, ExternalSpec::new()).unwrap();
        let c = deployment.add_service("c", &local, ExternalSpec::new()).unwrap();

        deployment.connect(a.port("out"), b.port("in")).unwrap();
        assert!(deployment.connect(a.port("out"), c.port("in")).is_err());
        assert_eq!(deployment.connections().len(), 1);
    }

    #[test]
    fn test_plan() {
        let mut deployment = Deployment::new();
        let local = deployment.localhost().clone();
        let leader = deployment.add_service("leader", &local, CrateSpec::new(".")).unwrap();
        let f0 = deployment.add_service("f0", &local, CrateSpec::new(".")).unwrap();
        let f1 = deployment
            .add_service("f1", &local.client_only(), CrateSpec::new("."))
            .unwrap();

        deployment
            .connect(
                leader.port("out"),
                Sink::demux([(0, f0.port("in")), (1, f1.port("in"))]),
            )
            .unwrap();

        let plan = deployment.plan().unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].listener, Some(Listener::Destination));
        assert_eq!(plan[1].listener, Some(Listener::Source));
        assert_eq!(plan[1].route, vec![1]);
    }
}
