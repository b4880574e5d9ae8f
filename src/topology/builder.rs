//! Building a deployment from a topology

use super::config::{parse_port_ref, SinkConfig, SourceConfig, TopologyConfig};
use super::parser::TopologyParser;
use crate::deployment::{Deployment, DeploymentConfig};
use crate::error::{DeployError, Result};
use crate::host::{Host, StaticProvisioner};
use crate::port::{Port, Sink, Source};
use std::collections::HashMap;
use std::sync::Arc;

/// Turns a validated topology into a deployment in the building state
pub struct TopologyBuilder<'a> {
    config: &'a TopologyConfig,
    base: DeploymentConfig,
}

impl<'a> TopologyBuilder<'a> {
    /// Create a builder with default deployment settings
    pub fn new(config: &'a TopologyConfig) -> Self {
        Self {
            config,
            base: DeploymentConfig::default(),
        }
    }

    /// Settings the topology's own settings are applied on top of
    pub fn base_config(mut self, base: DeploymentConfig) -> Self {
        self.base = base;
        self
    }

    /// Build the deployment. Hosts declared with an address are provisioned
    /// from that address.
    pub fn build(self) -> Result<Deployment> {
        for warning in TopologyParser::validate(self.config)? {
            tracing::warn!("{}", warning);
        }

        let mut provisioner = StaticProvisioner::new();
        for (name, host) in &self.config.hosts {
            if let Some(reachability) = host.reachability() {
                provisioner.insert(name, reachability);
            }
        }

        let settings = self.config.settings.apply(self.base.clone());
        let mut deployment = Deployment::with_config(settings).with_provisioner(Arc::new(provisioner));

        let mut hosts: HashMap<String, Host> = HashMap::new();
        hosts.insert(deployment.localhost().name().to_string(), deployment.localhost().clone());
        for (name, host) in &self.config.hosts {
            let added = deployment.add_host(name, host.kind.clone())?;
            hosts.insert(name.clone(), added);
        }

        for (name, service) in &self.config.services {
            let host = hosts
                .get(service.host_name())
                .ok_or_else(|| DeployError::HostNotFound(service.host_name().to_string()))?;
            let host = if service.client_only {
                host.client_only()
            } else {
                host.clone()
            };
            deployment.add_service(name, &host, service.kind(name)?)?;
        }

        for connection in &self.config.connections {
            let source = match &connection.from {
                Some(source) => source_of(&deployment, source)?,
                None => Source::Null,
            };
            let sink = match &connection.to {
                Some(sink) => sink_of(&deployment, sink)?,
                None => Sink::Null,
            };
            deployment.connect(source, sink)?;
        }

        tracing::info!(
            "Built deployment {} from topology {}",
            deployment.id(),
            self.config.name.as_deref().unwrap_or("(unnamed)")
        );
        Ok(deployment)
    }
}

fn port_of(deployment: &Deployment, reference: &str) -> Result<Arc<Port>> {
    let (service, port) = parse_port_ref(reference)?;
    Ok(deployment.service(service)?.port(port))
}

fn source_of(deployment: &Deployment, source: &SourceConfig) -> Result<Source> {
    match source {
        SourceConfig::Port(reference) => Ok(Source::Port(port_of(deployment, reference)?)),
        SourceConfig::Tagged { tagged, tag } => Ok(source_of(deployment, tagged)?.tagged(*tag)),
    }
}

fn sink_of(deployment: &Deployment, sink: &SinkConfig) -> Result<Sink> {
    match sink {
        SinkConfig::Port(reference) => Ok(Sink::Port(port_of(deployment, reference)?)),
        SinkConfig::Merge { merge } => Ok(Sink::Merge(port_of(deployment, merge)?)),
        SinkConfig::Demux { demux } => {
            let mut routes = Vec::with_capacity(demux.len());
            for (tag, route) in demux {
                let route = match route {
                    Some(route) => sink_of(deployment, route)?,
                    None => Sink::Null,
                };
                routes.push((*tag, route));
            }
            Ok(Sink::demux(routes))
        }
    }
}
