//! Resolved port configuration and port allocation

use crate::error::{DeployError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::SocketAddr;
use std::ops::RangeInclusive;

/// Resolved endpoint description of one port, pushed to the service that owns
/// it as part of its launch configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortConfig {
    /// Connect to a peer listening at this address
    Dial(SocketAddr),
    /// Accept one peer connection on this address
    Listen(SocketAddr),
    /// Several inbound connections read as one stream
    Merge(Vec<PortConfig>),
    /// Outgoing frames carry a leading tag selecting the endpoint
    Demux(BTreeMap<u32, PortConfig>),
    /// Every outgoing frame is prefixed with the tag
    Tagged(Box<PortConfig>, u32),
    /// Discards sends, never yields
    Null,
}

impl PortConfig {
    /// Addresses this side listens on, in tree order
    pub fn listen_addrs(&self) -> Vec<SocketAddr> {
        let mut addrs = Vec::new();
        self.collect_listen(&mut addrs);
        addrs
    }

    fn collect_listen(&self, out: &mut Vec<SocketAddr>) {
        match self {
            PortConfig::Listen(addr) => out.push(*addr),
            PortConfig::Dial(_) | PortConfig::Null => {}
            PortConfig::Merge(children) => children.iter().for_each(|c| c.collect_listen(out)),
            PortConfig::Demux(children) => children.values().for_each(|c| c.collect_listen(out)),
            PortConfig::Tagged(inner, _) => inner.collect_listen(out),
        }
    }

    /// Number of network endpoints (dial or listen) in this config
    pub fn endpoint_count(&self) -> usize {
        match self {
            PortConfig::Dial(_) | PortConfig::Listen(_) => 1,
            PortConfig::Null => 0,
            PortConfig::Merge(children) => children.iter().map(|c| c.endpoint_count()).sum(),
            PortConfig::Demux(children) => children.values().map(|c| c.endpoint_count()).sum(),
            PortConfig::Tagged(inner, _) => inner.endpoint_count(),
        }
    }
}

impl fmt::Display for PortConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortConfig::Dial(addr) => write!(f, "dial {}", addr),
            PortConfig::Listen(addr) => write!(f, "listen {}", addr),
            PortConfig::Merge(children) => {
                write!(f, "merge[")?;
                for (i, child) in children.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", child)?;
                }
                write!(f, "]")
            }
            PortConfig::Demux(children) => {
                write!(f, "demux{{")?;
                for (i, (tag, child)) in children.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", tag, child)?;
                }
                write!(f, "}}")
            }
            PortConfig::Tagged(inner, tag) => write!(f, "tagged({}, {})", inner, tag),
            PortConfig::Null => write!(f, "null"),
        }
    }
}

/// TCP port allocator for one remote host
#[derive(Debug, Clone)]
pub struct PortAllocator {
    /// Ports handed out by this allocator
    range: RangeInclusive<u16>,
    /// Allocated ports
    allocated: BTreeSet<u16>,
    /// Next candidate port
    next: u16,
}

impl PortAllocator {
    /// Create an allocator over an inclusive port range
    pub fn new(range: RangeInclusive<u16>) -> Result<Self> {
        if range.is_empty() || *range.start() == 0 {
            return Err(DeployError::PortBind(format!(
                "Invalid port range: {}-{}",
                range.start(),
                range.end()
            )));
        }

        Ok(Self {
            next: *range.start(),
            range,
            allocated: BTreeSet::new(),
        })
    }

    /// Allocate a port
    pub fn allocate(&mut self) -> Result<u16> {
        let start = *self.range.start();
        let end = *self.range.end();
        let size = (end - start) as usize + 1;

        if self.allocated.len() >= size {
            return Err(DeployError::PortBind(format!(
                "No free ports left in {}-{}",
                start, end
            )));
        }

        let mut candidate = self.next;
        while self.allocated.contains(&candidate) {
            candidate = if candidate == end { start } else { candidate + 1 };
        }

        self.allocated.insert(candidate);
        self.next = if candidate == end { start } else { candidate + 1 };

        Ok(candidate)
    }

    /// Release a port
    pub fn release(&mut self, port: u16) {
        self.allocated.remove(&port);
    }

    /// Whether `port` is currently allocated
    pub fn is_allocated(&self, port: u16) -> bool {
        self.allocated.contains(&port)
    }
}
