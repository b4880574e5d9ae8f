//! Ports: named message endpoints owned by services
//!
//! A port is a pure graph node until deploy resolves it to a [`PortConfig`].
//! Ports of external services are opened in-process with
//! [`Port::connect`]; ports of managed crates are opened by the launched
//! process from its launch configuration.

pub mod combinator;
pub mod connection;

pub use combinator::{Sink, Source};
pub use connection::{Connection, ConnectionSet};

use crate::error::{DeployError, Result};
use crate::network::{ConnectedPort, HeldServers, Network, PortConfig};
use crate::service::ServiceId;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::OnceCell;

/// Identity of a port within a deployment
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortKey {
    /// Owning service
    pub service: ServiceId,
    /// Port name
    pub name: String,
}

/// What deploy resolved a port to
struct ResolvedPort {
    config: PortConfig,
    servers: HeldServers,
    network: Arc<dyn Network>,
}

/// A named endpoint of a service
pub struct Port {
    key: PortKey,
    service_name: String,
    managed: bool,
    deployment_id: String,
    /// Set once the owning deployment has been deployed
    deployed: Arc<AtomicBool>,
    resolved: OnceLock<ResolvedPort>,
    connected: OnceCell<Arc<ConnectedPort>>,
}

impl Port {
    pub(crate) fn new(service: ServiceId, service_name: &str, name: &str, managed: bool, deployment_id: &str) -> Self {
        Self {
            key: PortKey {
                service,
                name: name.to_string(),
            },
            service_name: service_name.to_string(),
            managed,
            deployment_id: deployment_id.to_string(),
            deployed: Arc::new(AtomicBool::new(false)),
            resolved: OnceLock::new(),
            connected: OnceCell::new(),
        }
    }

    /// Share the owning service's deployed flag
    pub(crate) fn deployed_flag(mut self, deployed: Arc<AtomicBool>) -> Self {
        self.deployed = deployed;
        self
    }

    /// Port identity
    pub fn key(&self) -> &PortKey {
        &self.key
    }

    /// Owning service
    pub fn service(&self) -> ServiceId {
        self.key.service
    }

    /// Name of the owning service
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Port name
    pub fn name(&self) -> &str {
        &self.key.name
    }

    pub(crate) fn deployment_id(&self) -> &str {
        &self.deployment_id
    }

    /// Resolved configuration, once deployed
    pub fn config(&self) -> Option<&PortConfig> {
        self.resolved.get().map(|r| &r.config)
    }

    /// Whether deploy resolved this port
    pub fn is_resolved(&self) -> bool {
        self.resolved.get().is_some()
    }

    pub(crate) fn resolve(&self, config: PortConfig, servers: HeldServers, network: Arc<dyn Network>) -> bool {
        self.resolved
            .set(ResolvedPort {
                config,
                servers,
                network,
            })
            .is_ok()
    }

    /// Close listeners held for this port so the launched process can bind
    /// them itself
    pub(crate) fn release_servers(&self) -> Result<usize> {
        let Some(resolved) = self.resolved.get() else {
            return Ok(0);
        };

        let mut released = 0;
        for server in resolved.servers.values() {
            if server.release()? {
                released += 1;
            }
        }
        Ok(released)
    }

    /// Open this port in-process. Resolves once; later calls return the same
    /// connected port.
    pub async fn connect(&self) -> Result<Arc<ConnectedPort>> {
        if self.managed {
            return Err(DeployError::InvalidConnection(format!(
                "port {} belongs to a managed service and is opened by that service",
                self
            )));
        }

        let resolved = match self.resolved.get() {
            Some(resolved) => resolved,
            None if self.deployed.load(Ordering::Acquire) => {
                return Err(DeployError::InvalidConnection(format!(
                    "port {} has no connection",
                    self
                )));
            }
            None => {
                return Err(DeployError::InvalidPhase {
                    operation: format!("connect port {}", self),
                    state: "not deployed".to_string(),
                });
            }
        };

        self.connected
            .get_or_try_init(|| async {
                tracing::debug!("Connecting port {} ({})", self, resolved.config);
                let port =
                    ConnectedPort::open(&resolved.config, resolved.network.as_ref(), &resolved.servers).await?;
                Ok::<_, DeployError>(Arc::new(port))
            })
            .await
            .cloned()
    }

    /// Source that prefixes every frame sent from this port with `tag`
    pub fn tagged(self: &Arc<Self>, tag: u32) -> Source {
        Source::Port(self.clone()).tagged(tag)
    }

    /// Destination that accepts more than one inbound connection
    pub fn merge(self: &Arc<Self>) -> Sink {
        Sink::Merge(self.clone())
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.service_name, self.key.name)
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port")
            .field("key", &self.key)
            .field("service_name", &self.service_name)
            .field("config", &self.config())
            .finish()
    }
}
