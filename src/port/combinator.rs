//! Routing combinators over ports

use super::Port;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Emitting end of a connection
#[derive(Debug, Clone)]
pub enum Source {
    /// A port
    Port(Arc<Port>),
    /// Every frame is prefixed with the tag before transmission
    Tagged(Box<Source>, u32),
    /// Never emits
    Null,
}

impl Source {
    /// Prefix every frame from this source with `tag`
    pub fn tagged(self, tag: u32) -> Source {
        Source::Tagged(Box::new(self), tag)
    }

    /// Underlying port, if any
    pub fn port(&self) -> Option<&Arc<Port>> {
        match self {
            Source::Port(port) => Some(port),
            Source::Tagged(inner, _) => inner.port(),
            Source::Null => None,
        }
    }

    /// Tags applied from the innermost outwards
    pub fn tags(&self) -> Vec<u32> {
        match self {
            Source::Port(_) | Source::Null => Vec::new(),
            Source::Tagged(inner, tag) => {
                let mut tags = inner.tags();
                tags.push(*tag);
                tags
            }
        }
    }
}

impl From<Arc<Port>> for Source {
    fn from(port: Arc<Port>) -> Self {
        Source::Port(port)
    }
}

impl From<&Arc<Port>> for Source {
    fn from(port: &Arc<Port>) -> Self {
        Source::Port(port.clone())
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Port(port) => write!(f, "{}", port),
            Source::Tagged(inner, tag) => write!(f, "tagged({}, {})", inner, tag),
            Source::Null => write!(f, "null"),
        }
    }
}

/// Receiving end of a connection
#[derive(Debug, Clone)]
pub enum Sink {
    /// A port accepting a single inbound connection
    Port(Arc<Port>),
    /// A port accepting any number of inbound connections
    Merge(Arc<Port>),
    /// Frames carry a leading tag selecting the destination; the tag is
    /// stripped before delivery
    Demux(BTreeMap<u32, Sink>),
    /// Discards everything
    Null,
}

impl Sink {
    /// Demux over `(tag, destination)` pairs
    pub fn demux<I, S>(routes: I) -> Sink
    where
        I: IntoIterator<Item = (u32, S)>,
        S: Into<Sink>,
    {
        Sink::Demux(routes.into_iter().map(|(tag, sink)| (tag, sink.into())).collect())
    }

    /// Every destination port with whether it was declared through merge
    pub fn ports(&self) -> Vec<(&Arc<Port>, bool)> {
        let mut out = Vec::new();
        self.collect_ports(&mut out);
        out
    }

    fn collect_ports<'a>(&'a self, out: &mut Vec<(&'a Arc<Port>, bool)>) {
        match self {
            Sink::Port(port) => out.push((port, false)),
            Sink::Merge(port) => out.push((port, true)),
            Sink::Demux(routes) => routes.values().for_each(|r| r.collect_ports(out)),
            Sink::Null => {}
        }
    }

    /// Whether a demux anywhere in this sink has no destinations
    pub fn has_empty_demux(&self) -> bool {
        match self {
            Sink::Demux(routes) => routes.is_empty() || routes.values().any(|r| r.has_empty_demux()),
            _ => false,
        }
    }
}

impl From<Arc<Port>> for Sink {
    fn from(port: Arc<Port>) -> Self {
        Sink::Port(port)
    }
}

impl From<&Arc<Port>> for Sink {
    fn from(port: &Arc<Port>) -> Self {
        Sink::Port(port.clone())
    }
}

impl fmt::Display for Sink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sink::Port(port) => write!(f, "{}", port),
            Sink::Merge(port) => write!(f, "merge({})", port),
            Sink::Demux(routes) => {
                write!(f, "demux{{")?;
                for (i, (tag, sink)) in routes.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", tag, sink)?;
                }
                write!(f, "}}")
            }
            Sink::Null => write!(f, "null"),
        }
    }
}
