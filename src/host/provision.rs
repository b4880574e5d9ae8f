//! Host provisioning capability

use super::config::{Host, HostKind, Reachability};
use crate::error::{DeployError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};

/// Acquires a reachable address (and credentials) for a host
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Provision `host` and return how to reach it
    async fn provision(&self, host: &Host) -> Result<Reachability>;
}

/// Provisions the local machine. Any other host kind is an error.
#[derive(Debug, Clone, Default)]
pub struct LocalProvisioner;

#[async_trait]
impl Provisioner for LocalProvisioner {
    async fn provision(&self, host: &Host) -> Result<Reachability> {
        match host.kind() {
            HostKind::Localhost => {
                let hostname = gethostname::gethostname().to_string_lossy().to_string();
                Ok(Reachability::new(IpAddr::V4(Ipv4Addr::LOCALHOST))
                    .hostname(&hostname)
                    .open_ports(host.requested_ports()))
            }
            other => Err(DeployError::Provisioning {
                host: host.name().to_string(),
                message: format!("no provisioner configured for {} hosts", other.label()),
            }),
        }
    }
}

/// Provisions hosts from a fixed table of already-running machines, keyed by
/// host name. Localhost hosts fall through to [`LocalProvisioner`].
#[derive(Debug, Clone, Default)]
pub struct StaticProvisioner {
    table: HashMap<String, Reachability>,
}

impl StaticProvisioner {
    /// Create an empty provisioner
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the reachability of a named host
    pub fn with_host(mut self, name: &str, reachability: Reachability) -> Self {
        self.table.insert(name.to_string(), reachability);
        self
    }

    /// Register the reachability of a named host in place
    pub fn insert(&mut self, name: &str, reachability: Reachability) {
        self.table.insert(name.to_string(), reachability);
    }

    /// Number of registered hosts
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Whether no host is registered
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

#[async_trait]
impl Provisioner for StaticProvisioner {
    async fn provision(&self, host: &Host) -> Result<Reachability> {
        if let Some(reachability) = self.table.get(host.name()) {
            let ports = host.requested_ports();
            tracing::debug!(
                "Host {} resolved to {}, exposing ports {:?}",
                host.name(),
                reachability.internal_address,
                ports
            );
            return Ok(reachability.clone().open_ports(ports));
        }

        if *host.kind() == HostKind::Localhost {
            return LocalProvisioner.provision(host).await;
        }

        Err(DeployError::Provisioning {
            host: host.name().to_string(),
            message: "host is not listed in the static host table".to_string(),
        })
    }
}
