//! Declared connections and graph validity rules

use super::combinator::{Sink, Source};
use super::PortKey;
use crate::error::{DeployError, Result};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// A directed edge from a source to a sink
#[derive(Debug, Clone)]
pub struct Connection {
    /// Emitting end
    pub source: Source,
    /// Receiving end
    pub sink: Sink,
}

impl Connection {
    /// Create a connection
    pub fn new(source: impl Into<Source>, sink: impl Into<Sink>) -> Self {
        Self {
            source: source.into(),
            sink: sink.into(),
        }
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.source, self.sink)
    }
}

/// How a port receives
#[derive(Debug, Clone, Copy)]
struct Inbound {
    count: usize,
    merge: bool,
}

/// Connections of a deployment, in declaration order
#[derive(Debug, Default)]
pub struct ConnectionSet {
    connections: Vec<Connection>,
    sources: HashSet<PortKey>,
    inbound: HashMap<PortKey, Inbound>,
}

impl ConnectionSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and record a connection. A port is the source of at most
    /// one connection, never both a source and a destination, and receives
    /// more than one connection only if every one of them goes through
    /// merge.
    pub fn add(&mut self, connection: Connection) -> Result<()> {
        let invalid = |message: String| Err(DeployError::InvalidConnection(message));

        if matches!(connection.source, Source::Null) && matches!(connection.sink, Sink::Null) {
            return invalid("a connection needs a port on at least one end".to_string());
        }
        if connection.sink.has_empty_demux() {
            return invalid(format!("{}: demux without destinations", connection));
        }

        let source_key = connection.source.port().map(|p| p.key().clone());
        if let Some(port) = connection.source.port() {
            if self.sources.contains(port.key()) {
                return invalid(format!("port {} is already the source of a connection", port));
            }
            if self.inbound.contains_key(port.key()) {
                return invalid(format!("port {} already receives and cannot also send", port));
            }
        }

        let mut seen = HashSet::new();
        for (port, merge) in connection.sink.ports() {
            let key = port.key();
            if source_key.as_ref() == Some(key) {
                return invalid(format!("port {} cannot send to itself", port));
            }
            if !seen.insert(key.clone()) {
                return invalid(format!("port {} appears twice in {}", port, connection.sink));
            }
            if self.sources.contains(key) {
                return invalid(format!("port {} already sends and cannot also receive", port));
            }
            if let Some(existing) = self.inbound.get(key) {
                if !(existing.merge && merge) {
                    return invalid(format!(
                        "port {} already has an inbound connection; wrap every inbound use in merge to accept several",
                        port
                    ));
                }
            }
        }

        if let Some(key) = source_key {
            self.sources.insert(key);
        }
        for (port, merge) in connection.sink.ports() {
            let entry = self
                .inbound
                .entry(port.key().clone())
                .or_insert(Inbound { count: 0, merge });
            entry.count += 1;
            entry.merge &= merge;
        }

        tracing::debug!("Declared connection {}", connection);
        self.connections.push(connection);
        Ok(())
    }

    /// Connections in declaration order
    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.iter()
    }

    /// Number of connections
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no connection was declared
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Number of inbound connections of a port
    pub fn inbound_count(&self, key: &PortKey) -> usize {
        self.inbound.get(key).map(|i| i.count).unwrap_or(0)
    }

    /// Whether a port receives through merge
    pub fn is_merged(&self, key: &PortKey) -> bool {
        self.inbound.get(key).map(|i| i.merge).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::Port;
    use std::sync::Arc;

    fn port(service: usize, name: &str) -> Arc<Port> {
        Arc::new(Port::new(service, &format!("s{}", service), name, false, "dep"))
    }

    #[test]
    fn test_duplicate_source_rejected() {
        let mut set = ConnectionSet::new();
        let out = port(0, "out");
        set.add(Connection::new(&out, &port(1, "in"))).unwrap();

        let err = set.add(Connection::new(&out, &port(2, "in"))).unwrap_err();
        assert!(matches!(err, DeployError::InvalidConnection(_)));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_merge_allows_many_writers() {
        let mut set = ConnectionSet::new();
        let sink = port(9, "in");
        for i in 0..3 {
            set.add(Connection::new(&port(i, "out"), sink.merge())).unwrap();
        }
        assert_eq!(set.inbound_count(sink.key()), 3);
        assert!(set.is_merged(sink.key()));

        assert!(set.add(Connection::new(&port(5, "out"), &sink)).is_err());
    }

    #[test]
    fn test_plain_sink_single_writer() {
        let mut set = ConnectionSet::new();
        let sink = port(9, "in");
        set.add(Connection::new(&port(0, "out"), &sink)).unwrap();
        assert!(set.add(Connection::new(&port(1, "out"), sink.merge())).is_err());
        assert!(!set.is_merged(sink.key()));
    }

    #[test]
    fn test_direction_conflicts() {
        let mut set = ConnectionSet::new();
        let a = port(0, "p");
        let b = port(1, "p");
        set.add(Connection::new(&a, &b)).unwrap();

        assert!(set.add(Connection::new(&b, &port(2, "p"))).is_err());
        assert!(set.add(Connection::new(&port(3, "p"), &a)).is_err());

        let c = port(4, "p");
        assert!(set.add(Connection::new(&c, &c)).is_err());
    }

    #[test]
    fn test_demux_rules() {
        let mut set = ConnectionSet::new();
        let f0 = port(1, "in");
        let demux = Sink::demux([(0, Sink::from(&f0)), (1, Sink::from(&f0))]);
        assert!(set.add(Connection::new(&port(0, "out"), demux)).is_err());

        let empty = Sink::demux(Vec::<(u32, Sink)>::new());
        assert!(set.add(Connection::new(&port(0, "out"), empty)).is_err());

        assert!(set.add(Connection::new(Source::Null, Sink::Null)).is_err());
        assert!(set.add(Connection::new(Source::Null, &f0)).is_ok());
        assert!(!set.is_empty());
    }
}
