//! Bind planning and port materialization
//!
//! For every link between a source port and a destination port one side
//! listens and the other dials. The destination listens unless its host is
//! client-only, or it is an external service fed by a managed crate.

use crate::error::{DeployError, Result};
use crate::host::{Host, HostKind};
use crate::network::{BindHint, HeldServers, Network, PortConfig, ServerDescriptor};
use crate::port::{Connection, ConnectionSet, Port, PortKey, Sink, Source};
use crate::service::{Service, ServiceKind};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

/// Side of a link that binds the listening socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Listener {
    /// The emitting port listens, the destination dials
    Source,
    /// The destination port listens, the source dials
    Destination,
}

/// Decide which side of a link listens
pub fn choose_listener(source: &Service, destination: &Service) -> Result<Listener> {
    let source_may_listen = !source.host().is_client_only();
    let destination_may_listen = !destination.host().is_client_only();
    let prefer_source = !destination_may_listen
        || (matches!(destination.kind(), ServiceKind::External(_)) && source.kind().is_managed());

    match (prefer_source, source_may_listen, destination_may_listen) {
        (true, true, _) => Ok(Listener::Source),
        (_, _, true) => Ok(Listener::Destination),
        (false, true, false) => Ok(Listener::Source),
        _ => Err(DeployError::PortBind(format!(
            "neither {} nor {} may listen: both are on client-only hosts",
            source.name(),
            destination.name()
        ))),
    }
}

/// Address a dialer on `dialer` uses to reach a listener bound at `addr` on
/// `listener`
pub fn dial_address(listener: &Host, addr: SocketAddr, dialer: &Host) -> Result<SocketAddr> {
    if listener.same_host(dialer) || listener.zone() == dialer.zone() {
        return Ok(addr);
    }

    listener
        .reachability()
        .and_then(|r| r.external_address)
        .map(|ip| SocketAddr::new(ip, addr.port()))
        .ok_or_else(|| {
            DeployError::PortBind(format!(
                "peer unresolved: {} has no external address reachable from {}",
                listener, dialer
            ))
        })
}

/// One source-to-destination link of a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkPlan {
    /// Emitting port, `None` for a null source
    pub source: Option<String>,
    /// Demux tags leading to the destination
    pub route: Vec<u32>,
    /// Receiving port, `None` for a null sink
    pub destination: Option<String>,
    /// Whether the destination accepts merged input
    pub merge: bool,
    /// Listening side, when both ends are ports
    pub listener: Option<Listener>,
}

impl fmt::Display for LinkPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let source = self.source.as_deref().unwrap_or("null");
        let destination = self.destination.as_deref().unwrap_or("null");
        write!(f, "{}", source)?;
        for tag in &self.route {
            write!(f, " [{}]", tag)?;
        }
        write!(f, " -> {}", destination)?;
        if self.merge {
            write!(f, " (merge)")?;
        }
        match self.listener {
            Some(Listener::Source) => write!(f, ", {} listens", source),
            Some(Listener::Destination) => write!(f, ", {} listens", destination),
            None => Ok(()),
        }
    }
}

fn service_of<'a>(services: &'a [Arc<Service>], port: &Port) -> Result<&'a Arc<Service>> {
    services
        .get(port.service())
        .filter(|s| s.id() == port.service())
        .ok_or_else(|| DeployError::ServiceNotFound(port.service_name().to_string()))
}

/// Plan every link of every connection without touching the network
pub fn plan_links(connections: &ConnectionSet, services: &[Arc<Service>]) -> Result<Vec<LinkPlan>> {
    let mut links = Vec::new();
    for connection in connections.iter() {
        let source = connection.source.port();
        collect_links(services, source, &connection.sink, &mut Vec::new(), &mut links)?;
    }
    Ok(links)
}

fn collect_links(
    services: &[Arc<Service>],
    source: Option<&Arc<Port>>,
    sink: &Sink,
    route: &mut Vec<u32>,
    out: &mut Vec<LinkPlan>,
) -> Result<()> {
    let (destination, merge) = match sink {
        Sink::Demux(routes) => {
            for (tag, inner) in routes {
                route.push(*tag);
                collect_links(services, source, inner, route, out)?;
                route.pop();
            }
            return Ok(());
        }
        Sink::Port(port) => (Some(port), false),
        Sink::Merge(port) => (Some(port), true),
        Sink::Null => (None, false),
    };

    let listener = match (source, destination) {
        (Some(source), Some(destination)) => Some(choose_listener(
            service_of(services, source)?,
            service_of(services, destination)?,
        )?),
        _ => None,
    };

    out.push(LinkPlan {
        source: source.map(|p| p.to_string()),
        route: route.clone(),
        destination: destination.map(|p| p.to_string()),
        merge,
        listener,
    });
    Ok(())
}

/// Inbound configurations collected for a destination port
struct Inbound {
    port: Arc<Port>,
    merge: bool,
    configs: Vec<PortConfig>,
}

/// Materializes declared connections into resolved port configurations
pub(crate) struct Materializer<'a> {
    services: &'a [Arc<Service>],
    network: Arc<dyn Network>,
    sources: HashMap<PortKey, (Arc<Port>, PortConfig)>,
    inbound: BTreeMap<PortKey, Inbound>,
    servers: HashMap<PortKey, HeldServers>,
}

impl<'a> Materializer<'a> {
    pub(crate) fn new(services: &'a [Arc<Service>], network: Arc<dyn Network>) -> Self {
        Self {
            services,
            network,
            sources: HashMap::new(),
            inbound: BTreeMap::new(),
            servers: HashMap::new(),
        }
    }

    /// Bind the endpoints of one connection
    pub(crate) async fn connection(&mut self, connection: &Connection) -> Result<()> {
        let source = connection.source.port().cloned();
        let config = self.sink(source.as_ref(), &connection.sink).await?;

        if let Some(port) = source {
            let config = connection
                .source
                .tags()
                .into_iter()
                .fold(config, |inner, tag| PortConfig::Tagged(Box::new(inner), tag));
            self.sources.insert(port.key().clone(), (port, config));
        }

        if matches!(connection.source, Source::Null) {
            tracing::debug!("Null source for {}", connection.sink);
        }
        Ok(())
    }

    fn sink<'b>(&'b mut self, source: Option<&'b Arc<Port>>, sink: &'b Sink) -> BoxFuture<'b, Result<PortConfig>>
    where
        'a: 'b,
    {
        async move {
            match sink {
                Sink::Null => Ok(PortConfig::Null),
                Sink::Port(destination) => self.link(source, destination, false).await,
                Sink::Merge(destination) => self.link(source, destination, true).await,
                Sink::Demux(routes) => {
                    let mut configs = BTreeMap::new();
                    for (tag, route) in routes {
                        configs.insert(*tag, self.sink(source, route).await?);
                    }
                    Ok(PortConfig::Demux(configs))
                }
            }
        }
        .boxed()
    }

    /// Bind one link, record the destination side and return the source side
    async fn link(&mut self, source: Option<&Arc<Port>>, destination: &Arc<Port>, merge: bool) -> Result<PortConfig> {
        let destination_service = service_of(self.services, destination)?.clone();

        let (source_config, destination_config) = match source {
            None => (PortConfig::Null, PortConfig::Null),
            Some(source) => {
                let source_service = service_of(self.services, source)?.clone();
                match choose_listener(&source_service, &destination_service)? {
                    Listener::Destination => {
                        let server = self.listen(&destination_service).await?;
                        self.hold(destination, &server);
                        let addr = dial_address(destination_service.host(), server.addr(), source_service.host())?;
                        (PortConfig::Dial(addr), PortConfig::Listen(server.addr()))
                    }
                    Listener::Source => {
                        let server = self.listen(&source_service).await?;
                        self.hold(source, &server);
                        let addr = dial_address(source_service.host(), server.addr(), destination_service.host())?;
                        (PortConfig::Listen(server.addr()), PortConfig::Dial(addr))
                    }
                }
            }
        };

        let inbound = self
            .inbound
            .entry(destination.key().clone())
            .or_insert_with(|| Inbound {
                port: destination.clone(),
                merge,
                configs: Vec::new(),
            });
        if destination_config != PortConfig::Null {
            inbound.configs.push(destination_config);
        }

        Ok(source_config)
    }

    async fn listen(&self, service: &Service) -> Result<Arc<ServerDescriptor>> {
        let host = service.host();
        let reachability = host.reachability().ok_or_else(|| {
            DeployError::PortBind(format!("host {} is not provisioned", host))
        })?;

        let hint = BindHint {
            host: host.id(),
            address: reachability.internal_address,
            local: *host.kind() == HostKind::Localhost,
        };
        self.network.listen(&hint).await
    }

    fn hold(&mut self, port: &Arc<Port>, server: &Arc<ServerDescriptor>) {
        self.servers
            .entry(port.key().clone())
            .or_default()
            .insert(server.addr(), server.clone());
    }

    /// Store the resolved configuration on every port. Returns the number of
    /// ports resolved.
    pub(crate) fn finish(mut self) -> usize {
        let mut resolved = 0;

        for (key, (port, config)) in self.sources.drain() {
            let servers = self.servers.remove(&key).unwrap_or_default();
            tracing::debug!("Port {} resolved to {}", port, config);
            if port.resolve(config, servers, self.network.clone()) {
                resolved += 1;
            }
        }

        for (key, inbound) in std::mem::take(&mut self.inbound) {
            let servers = self.servers.remove(&key).unwrap_or_default();
            let mut configs = inbound.configs;
            let config = match configs.len() {
                0 if !inbound.merge => PortConfig::Null,
                1 if !inbound.merge => configs.remove(0),
                _ => PortConfig::Merge(configs),
            };
            tracing::debug!("Port {} resolved to {}", inbound.port, config);
            if inbound.port.resolve(config, servers, self.network.clone()) {
                resolved += 1;
            }
        }

        resolved
    }
}
