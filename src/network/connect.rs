//! Turning a resolved [`PortConfig`] into live byte endpoints

use super::config::PortConfig;
use super::routing::{framed_source, merge_sources, null_source, DeliveryErrors, FrameSink, FrameSource};
use super::transport::{Network, ServerDescriptor, TcpNetwork};
use crate::error::{DeployError, Result};
use bytes::Bytes;
use futures::future::{try_join_all, BoxFuture};
use futures::{FutureExt, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};

/// Listening endpoints the engine already holds, keyed by address
pub type HeldServers = HashMap<SocketAddr, Arc<ServerDescriptor>>;

/// A port with its network endpoints open: a framed byte sink and a framed
/// byte source
pub struct ConnectedPort {
    sink: Mutex<FrameSink>,
    source: Mutex<FrameSource>,
    errors: Mutex<mpsc::UnboundedReceiver<DeployError>>,
}

impl ConnectedPort {
    /// Open every endpoint described by `config`
    pub async fn open(config: &PortConfig, network: &dyn Network, servers: &HeldServers) -> Result<Self> {
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        let (sink, source) = open_tree(config, network, servers, &errors_tx).await?;

        Ok(Self {
            sink: Mutex::new(sink),
            source: Mutex::new(source),
            errors: Mutex::new(errors_rx),
        })
    }

    /// Send one frame
    pub async fn send(&self, payload: impl Into<Bytes>) -> Result<()> {
        self.sink.lock().await.send(payload.into()).await
    }

    /// Receive the next frame, or `None` once every peer has closed
    pub async fn recv(&self) -> Result<Option<Bytes>> {
        self.source.lock().await.next().await.transpose()
    }

    /// Next frame that could not be routed, such as a demux tag with no
    /// destination
    pub async fn next_delivery_error(&self) -> Option<DeployError> {
        self.errors.lock().await.recv().await
    }

    /// Flush and close the sending side
    pub async fn close(&self) -> Result<()> {
        self.sink.lock().await.close().await
    }

    /// Split into the sink and source halves
    pub fn into_split(self) -> (FrameSink, FrameSource) {
        (self.sink.into_inner(), self.source.into_inner())
    }
}

impl std::fmt::Debug for ConnectedPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectedPort").finish_non_exhaustive()
    }
}

impl PortConfig {
    /// Open this port from inside a deployed service
    pub async fn connect(&self) -> Result<ConnectedPort> {
        ConnectedPort::open(self, &TcpNetwork::new(), &HeldServers::new()).await
    }

    /// Open this port through a specific network
    pub async fn connect_with(&self, network: &dyn Network) -> Result<ConnectedPort> {
        ConnectedPort::open(self, network, &HeldServers::new()).await
    }
}

fn split_stream(stream: TcpStream) -> (FrameSink, FrameSource) {
    let (read, write) = stream.into_split();
    (FrameSink::framed(write), framed_source(read))
}

fn open_tree<'a>(
    config: &'a PortConfig,
    network: &'a dyn Network,
    servers: &'a HeldServers,
    errors: &'a DeliveryErrors,
) -> BoxFuture<'a, Result<(FrameSink, FrameSource)>> {
    async move {
        match config {
            PortConfig::Dial(addr) => Ok(split_stream(network.dial(*addr).await?)),
            PortConfig::Listen(addr) => {
                let server = servers
                    .get(addr)
                    .cloned()
                    .unwrap_or_else(|| Arc::new(ServerDescriptor::new(*addr)));
                Ok(split_stream(network.accept(&server).await?))
            }
            PortConfig::Merge(children) => {
                // A null child never yields and would keep the merge open forever
                let opened = try_join_all(
                    children
                        .iter()
                        .filter(|child| !matches!(child, PortConfig::Null))
                        .map(|child| open_tree(child, network, servers, errors)),
                )
                .await?;
                let sources = opened.into_iter().map(|(_, source)| source).collect();
                Ok((
                    FrameSink::Closed("merged port has no single peer to send to".to_string()),
                    merge_sources(sources),
                ))
            }
            PortConfig::Demux(children) => {
                let opened = try_join_all(children.iter().map(|(tag, child)| async move {
                    let endpoint = open_tree(child, network, servers, errors).await?;
                    Ok::<_, DeployError>((*tag, endpoint))
                }))
                .await?;

                let mut routes = BTreeMap::new();
                let mut sources = Vec::with_capacity(opened.len());
                for (tag, (sink, source)) in opened {
                    routes.insert(tag, sink);
                    sources.push(source);
                }
                Ok((FrameSink::Demux(routes, errors.clone()), merge_sources(sources)))
            }
            PortConfig::Tagged(inner, tag) => {
                let (sink, source) = open_tree(inner, network, servers, errors).await?;
                Ok((FrameSink::Tagged(Box::new(sink), *tag), source))
            }
            PortConfig::Null => Ok((FrameSink::Null, null_source())),
        }
    }
    .boxed()
}
