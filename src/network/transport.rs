//! Network bind/dial capability and its TCP implementation

use super::config::PortAllocator;
use crate::error::{DeployError, Result};
use crate::host::HostId;
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, warn};

/// Where a listening endpoint should be created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindHint {
    /// Host the endpoint lives on
    pub host: HostId,
    /// Address the endpoint binds to
    pub address: IpAddr,
    /// Whether the host is the machine running the engine, so the listener
    /// can be bound right away and held
    pub local: bool,
}

/// A listening endpoint created during deploy
#[derive(Debug)]
pub struct ServerDescriptor {
    addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
}

impl ServerDescriptor {
    /// Descriptor for an address nobody has bound yet
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            listener: Mutex::new(None),
        }
    }

    /// Descriptor owning an already bound listener
    pub fn held(listener: TcpListener, addr: SocketAddr) -> Self {
        Self {
            addr,
            listener: Mutex::new(Some(listener)),
        }
    }

    /// Listening address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Whether a bound listener is still held
    pub fn is_held(&self) -> bool {
        self.listener.lock().map(|l| l.is_some()).unwrap_or(false)
    }

    /// Take the bound listener. Succeeds at most once.
    pub fn take_listener(&self) -> Result<Option<TcpListener>> {
        let mut listener = self
            .listener
            .lock()
            .map_err(|_| DeployError::Lock("Failed to acquire listener lock".to_string()))?;
        Ok(listener.take())
    }

    /// Close the held listener so another process can bind the address
    pub fn release(&self) -> Result<bool> {
        Ok(self.take_listener()?.is_some())
    }
}

/// How dialing retries while the peer is not listening yet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DialPolicy {
    /// Connection attempts before giving up
    pub attempts: u32,
    /// Delay between attempts
    pub delay: Duration,
}

impl Default for DialPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            delay: Duration::from_secs(1),
        }
    }
}

/// Network bind/dial capability
#[async_trait]
pub trait Network: Send + Sync {
    /// Create a listening endpoint on the hinted host
    async fn listen(&self, hint: &BindHint) -> Result<Arc<ServerDescriptor>>;

    /// Accept one peer connection on a listening endpoint
    async fn accept(&self, server: &ServerDescriptor) -> Result<TcpStream>;

    /// Connect to a listening peer
    async fn dial(&self, addr: SocketAddr) -> Result<TcpStream>;
}

/// TCP networking. Local listeners are bound and held by the engine; remote
/// endpoints get ports reserved from a per-host allocator.
#[derive(Debug)]
pub struct TcpNetwork {
    dial_policy: DialPolicy,
    port_range: RangeInclusive<u16>,
    allocators: Mutex<HashMap<HostId, PortAllocator>>,
}

impl Default for TcpNetwork {
    fn default() -> Self {
        Self {
            dial_policy: DialPolicy::default(),
            port_range: 20000..=29999,
            allocators: Mutex::new(HashMap::new()),
        }
    }
}

impl TcpNetwork {
    /// Create a TCP network with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the dial retry policy
    pub fn dial_policy(mut self, policy: DialPolicy) -> Self {
        self.dial_policy = policy;
        self
    }

    /// Set the port range reserved on remote hosts
    pub fn port_range(mut self, range: RangeInclusive<u16>) -> Self {
        self.port_range = range;
        self
    }

    fn reserve(&self, host: HostId) -> Result<u16> {
        let mut allocators = self
            .allocators
            .lock()
            .map_err(|_| DeployError::Lock("Failed to acquire allocator lock".to_string()))?;

        if !allocators.contains_key(&host) {
            allocators.insert(host, PortAllocator::new(self.port_range.clone())?);
        }

        match allocators.get_mut(&host) {
            Some(allocator) => allocator.allocate(),
            None => Err(DeployError::Internal("allocator missing".to_string())),
        }
    }

    async fn bind_with_retry(addr: SocketAddr) -> Result<TcpListener> {
        let mut attempts = 0u32;
        loop {
            match TcpListener::bind(addr).await {
                Ok(listener) => return Ok(listener),
                Err(e) if attempts < 5 => {
                    attempts += 1;
                    let delay = 50 * attempts;
                    warn!(%addr, attempts, delay_ms = delay, error = %e, "Port binding retry");
                    tokio::time::sleep(Duration::from_millis(delay as u64)).await;
                }
                Err(e) => {
                    error!(%addr, error = %e, "Failed to bind port after retries");
                    return Err(DeployError::PortBind(format!("{}: {}", addr, e)));
                }
            }
        }
    }
}

#[async_trait]
impl Network for TcpNetwork {
    async fn listen(&self, hint: &BindHint) -> Result<Arc<ServerDescriptor>> {
        if hint.local {
            let listener = TcpListener::bind((hint.address, 0))
                .await
                .map_err(|e| DeployError::PortBind(format!("{}: {}", hint.address, e)))?;
            let addr = listener.local_addr()?;
            debug!(%addr, host = hint.host, "Bound local listener");
            return Ok(Arc::new(ServerDescriptor::held(listener, addr)));
        }

        let port = self.reserve(hint.host)?;
        let addr = SocketAddr::new(hint.address, port);
        debug!(%addr, host = hint.host, "Reserved remote port");
        Ok(Arc::new(ServerDescriptor::new(addr)))
    }

    async fn accept(&self, server: &ServerDescriptor) -> Result<TcpStream> {
        let listener = match server.take_listener()? {
            Some(listener) => listener,
            None => Self::bind_with_retry(server.addr()).await?,
        };

        let (stream, peer) = listener.accept().await?;
        stream.set_nodelay(true)?;
        debug!(addr = %server.addr(), %peer, "Accepted connection");
        Ok(stream)
    }

    async fn dial(&self, addr: SocketAddr) -> Result<TcpStream> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    debug!(%addr, attempt, "Connected");
                    return Ok(stream);
                }
                Err(e) if attempt < self.dial_policy.attempts => {
                    debug!(%addr, attempt, error = %e, "Dial retry");
                    tokio::time::sleep(self.dial_policy.delay).await;
                }
                Err(e) => {
                    error!(%addr, attempts = attempt, error = %e, "Failed to connect");
                    return Err(DeployError::PortBind(format!(
                        "could not connect to {} after {} attempts: {}",
                        addr, attempt, e
                    )));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn local_hint() -> BindHint {
        BindHint {
            host: 0,
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            local: true,
        }
    }

    #[tokio::test]
    async fn test_local_listen_accept_dial() {
        let network = TcpNetwork::new();
        let server = network.listen(&local_hint()).await.unwrap();
        assert!(server.is_held());
        assert_ne!(server.addr().port(), 0);

        let addr = server.addr();
        let (accepted, dialed) = tokio::join!(network.accept(&server), network.dial(addr));
        assert!(accepted.is_ok());
        assert!(dialed.is_ok());
        assert!(!server.is_held());
    }

    #[tokio::test]
    async fn test_remote_listen_reserves_ports() {
        let network = TcpNetwork::new().port_range(5000..=5001);
        let hint = BindHint {
            host: 3,
            address: "10.0.0.2".parse().unwrap(),
            local: false,
        };

        let a = network.listen(&hint).await.unwrap();
        let b = network.listen(&hint).await.unwrap();
        assert!(!a.is_held());
        assert_eq!(a.addr().port(), 5000);
        assert_eq!(b.addr().port(), 5001);
        assert!(network.listen(&hint).await.is_err());

        let other = BindHint { host: 4, ..hint };
        assert_eq!(network.listen(&other).await.unwrap().addr().port(), 5000);
    }

    #[tokio::test]
    async fn test_dial_gives_up() {
        let network = TcpNetwork::new().dial_policy(DialPolicy {
            attempts: 2,
            delay: Duration::from_millis(10),
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = network.dial(addr).await.unwrap_err();
        assert!(matches!(err, DeployError::PortBind(_)));
    }

    #[test]
    fn test_release() {
        let server = ServerDescriptor::new("127.0.0.1:1".parse().unwrap());
        assert!(!server.release().unwrap());
    }
}
