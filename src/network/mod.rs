//! Networking for deployed ports
//!
//! Ports resolve to a [`PortConfig`] during deploy. Opening a config yields a
//! [`ConnectedPort`]: length-delimited frames over TCP, with demux, tagging,
//! merging and null endpoints applied on top.

pub mod config;
pub mod connect;
pub mod routing;
pub mod transport;

pub use config::{PortAllocator, PortConfig};
pub use connect::{ConnectedPort, HeldServers};
pub use routing::{prefix_tag, split_tag, FrameSink, FrameSource};
pub use transport::{BindHint, DialPolicy, Network, ServerDescriptor, TcpNetwork};
